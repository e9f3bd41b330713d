//! Shared files - read workspace files for peers
//!
//! Requested paths are always relative to the workspace root; anything that
//! could leave it (absolute paths, `..`) is refused.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Map a request path onto the workspace
pub fn resolve(root: &Path, requested: &str) -> Result<PathBuf, FileError> {
    let requested = requested.trim();
    if requested.is_empty() {
        return Err(FileError::InvalidPath("missing path".to_string()));
    }

    let relative = Path::new(requested);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FileError::InvalidPath(requested.to_string()));
            }
        }
    }

    Ok(root.join(relative))
}

/// Read a workspace file as UTF-8 text
pub async fn read_shared(root: &Path, requested: &str) -> Result<String, FileError> {
    let path = resolve(root, requested)?;

    match tokio::fs::read_to_string(&path).await {
        Ok(content) => {
            debug!("Serving file: {} ({} bytes)", requested, content.len());
            Ok(content)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(FileError::NotFound(requested.to_string()))
        }
        Err(e) => Err(FileError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_rejects_escapes() {
        let root = Path::new("/work");

        assert_eq!(resolve(root, "src/app.ts").unwrap(), root.join("src/app.ts"));
        assert_eq!(resolve(root, "./README.md").unwrap(), root.join("./README.md"));

        assert!(matches!(resolve(root, "../etc/passwd"), Err(FileError::InvalidPath(_))));
        assert!(matches!(resolve(root, "src/../../x"), Err(FileError::InvalidPath(_))));
        assert!(matches!(resolve(root, "/etc/passwd"), Err(FileError::InvalidPath(_))));
        assert!(matches!(resolve(root, "  "), Err(FileError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_read_shared() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/app.ts"), "export const x = 1;\n").unwrap();

        let content = read_shared(dir.path(), "src/app.ts").await.unwrap();
        assert_eq!(content, "export const x = 1;\n");

        let missing = read_shared(dir.path(), "src/missing.ts").await;
        assert!(matches!(missing, Err(FileError::NotFound(_))));
    }
}
