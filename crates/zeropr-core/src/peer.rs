//! Peer Model - What we know about another workstation
//!
//! A peer is built from a discovery record and lives in the
//! [`PeerRegistry`](crate::registry::PeerRegistry) until it is evicted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Editing activity of a workstation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Editing,
    #[default]
    Idle,
    Away,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Editing => "editing",
            PresenceStatus::Idle => "idle",
            PresenceStatus::Away => "away",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "editing" => Ok(PresenceStatus::Editing),
            "idle" => Ok(PresenceStatus::Idle),
            "away" => Ok(PresenceStatus::Away),
            _ => Err(()),
        }
    }
}

/// Cursor location inside the active file (1-based, editor convention)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    /// Encode as `line:column` for a TXT record
    pub fn to_txt(&self) -> String {
        format!("{}:{}", self.line, self.column)
    }

    /// Parse the `line:column` TXT encoding
    pub fn from_txt(value: &str) -> Option<Self> {
        let (line, column) = value.trim().split_once(':')?;
        Some(Self {
            line: line.trim().parse().ok()?,
            column: column.trim().parse().ok()?,
        })
    }
}

/// A workstation discovered on the LAN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    /// `<instance>@<address>:<port>`, stable across sightings
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub repo_hash: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    pub status: PresenceStatus,
    /// Unix millis, stamped by the registry on every upsert
    pub last_seen: u64,
    pub trusted: bool,
}

impl Peer {
    /// Build the stable identifier for a sighting
    pub fn make_id(name: &str, address: &str, port: u16) -> String {
        format!("{}@{}:{}", name, address, port)
    }
}

/// Wall clock in unix milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
