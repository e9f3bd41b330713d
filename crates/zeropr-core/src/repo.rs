//! Repository Info - Which repo and branch this workspace is on
//!
//! Peers advertise a short BLAKE3 hash of their `origin` URL so two
//! checkouts of the same project recognise each other without leaking the URL.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Repository identity advertised over discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoInfo {
    pub repo_hash: String,
    pub branch: String,
}

impl RepoInfo {
    /// Inspect `root/.git`; empty info when the workspace is not a git checkout
    pub fn detect(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let Some(git_dir) = find_git_dir(root) else {
            debug!("No git repository at {:?}", root);
            return Self::default();
        };

        let branch = fs::read_to_string(git_dir.join("HEAD"))
            .map(|head| parse_head(&head))
            .unwrap_or_default();

        let identity = fs::read_to_string(git_dir.join("config"))
            .ok()
            .and_then(|config| origin_url(&config))
            .unwrap_or_else(|| {
                root.canonicalize()
                    .unwrap_or_else(|_| root.to_path_buf())
                    .to_string_lossy()
                    .to_string()
            });

        Self {
            repo_hash: short_hash(&identity),
            branch,
        }
    }
}

/// First 16 hex chars of the BLAKE3 hash
pub fn short_hash(input: &str) -> String {
    let hash = blake3::hash(input.as_bytes()).to_hex();
    hash.as_str()[..16].to_string()
}

/// `.git` is a directory, or a `gitdir: <path>` file for worktrees
fn find_git_dir(root: &Path) -> Option<PathBuf> {
    let dot_git = root.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git);
    }

    let content = fs::read_to_string(&dot_git).ok()?;
    let target = content.trim().strip_prefix("gitdir:")?.trim();
    let path = PathBuf::from(target);
    let path = if path.is_absolute() { path } else { root.join(path) };
    path.is_dir().then_some(path)
}

fn parse_head(head: &str) -> String {
    let head = head.trim();
    match head.strip_prefix("ref:") {
        Some(reference) => {
            let reference = reference.trim();
            reference
                .strip_prefix("refs/heads/")
                .unwrap_or(reference)
                .to_string()
        }
        // Detached HEAD: abbreviated commit
        None => head.chars().take(7).collect(),
    }
}

fn origin_url(config: &str) -> Option<String> {
    let mut in_origin = false;
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_origin = line == "[remote \"origin\"]";
            continue;
        }
        if !in_origin {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "url" {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}
