//! Presence Tracker - Local editing status from activity timestamps
//!
//! Editing below 30s of inactivity, Idle below 5 minutes, Away after that.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::peer::{CursorPosition, PresenceStatus};

pub const EDITING_THRESHOLD: Duration = Duration::from_secs(30);
pub const AWAY_THRESHOLD: Duration = Duration::from_secs(300);

/// Status for a given time since the last local activity
pub fn status_for(elapsed: Duration) -> PresenceStatus {
    if elapsed < EDITING_THRESHOLD {
        PresenceStatus::Editing
    } else if elapsed < AWAY_THRESHOLD {
        PresenceStatus::Idle
    } else {
        PresenceStatus::Away
    }
}

/// Snapshot of what this host advertises about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
}

/// Tracks the last local activity plus the active file and cursor
#[derive(Debug)]
pub struct PresenceTracker {
    last_activity: Instant,
    active_file: Option<String>,
    cursor: Option<CursorPosition>,
}

impl PresenceTracker {
    /// Starts in Editing: daemon start counts as activity
    pub fn new() -> Self {
        Self {
            last_activity: Instant::now(),
            active_file: None,
            cursor: None,
        }
    }

    /// Record a file focus change, cursor move or edit
    pub fn record_activity(&mut self, active_file: Option<String>, cursor: Option<CursorPosition>) {
        self.last_activity = Instant::now();
        self.active_file = active_file;
        self.cursor = cursor;
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity)
    }

    pub fn status(&self) -> PresenceStatus {
        status_for(self.elapsed())
    }

    pub fn presence(&self) -> Presence {
        Presence {
            status: self.status(),
            active_file: self.active_file.clone(),
            cursor: self.cursor,
        }
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
