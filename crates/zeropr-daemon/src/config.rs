//! Daemon Configuration
//!
//! Features:
//! - Stored in ~/.zeropr/config.json, every field optional
//! - CLI flags override the file
//! - Device name defaults to `zeropr-agent-<hostname>`

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DEVICE_NAME: &str = "zeropr-agent";

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    /// mDNS instance name
    pub device_name: String,
    /// HTTP API and WebSocket port, also the advertised port
    pub http_port: u16,
    pub bind_addr: String,
    /// Root for shared files and repository detection
    pub workspace: PathBuf,
    pub browse_window_secs: u64,
    pub cycle_delay_secs: u64,
    pub peer_ttl_secs: u64,
    pub presence_refresh_secs: u64,
    pub relay_queue_capacity: usize,
    pub relay_leave_grace_secs: u64,
    pub broadcast_on_start: bool,
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            http_port: 8080,
            bind_addr: "0.0.0.0".to_string(),
            workspace: PathBuf::from("."),
            browse_window_secs: 5,
            cycle_delay_secs: 5,
            peer_ttl_secs: 300,
            presence_refresh_secs: 15,
            relay_queue_capacity: 256,
            relay_leave_grace_secs: 30,
            broadcast_on_start: false,
            shutdown_grace_secs: 5,
        }
    }
}

impl DaemonConfig {
    pub fn browse_window(&self) -> Duration {
        Duration::from_secs(self.browse_window_secs)
    }

    pub fn cycle_delay(&self) -> Duration {
        Duration::from_secs(self.cycle_delay_secs)
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_ttl_secs)
    }

    pub fn presence_refresh(&self) -> Duration {
        Duration::from_secs(self.presence_refresh_secs)
    }

    pub fn relay_leave_grace(&self) -> Duration {
        Duration::from_secs(self.relay_leave_grace_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Load from the default location, or defaults if the file does not exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = serde_json::from_str(&content)?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }
}

/// Get config file path (~/.zeropr/config.json)
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".zeropr")
        .join("config.json")
}

/// Custom names are kept as-is; the default name gets the hostname appended
pub fn resolve_device_name(name: &str) -> String {
    let base = name.trim();
    if !base.is_empty() && base != DEFAULT_DEVICE_NAME {
        return base.to_string();
    }

    let host = gethostname::gethostname().to_string_lossy().to_string();
    let sanitized = sanitize_hostname(&host);
    if sanitized.is_empty() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        return format!("{}-{}", DEFAULT_DEVICE_NAME, nanos);
    }

    format!("{}-{}", DEFAULT_DEVICE_NAME, sanitized)
}

/// Lowercase alphanumerics, with runs of `-`, `_` and spaces collapsed to one dash
pub fn sanitize_hostname(host: &str) -> String {
    let mut out = String::with_capacity(host.len());
    let mut last_dash = false;

    for c in host.to_lowercase().chars() {
        match c {
            'a'..='z' | '0'..='9' => {
                out.push(c);
                last_dash = false;
            }
            '-' | '_' | ' ' => {
                if !last_dash {
                    out.push('-');
                    last_dash = true;
                }
            }
            _ => {}
        }
    }

    out.trim_matches('-').to_string()
}
