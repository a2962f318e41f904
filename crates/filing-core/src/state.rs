use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sync state of a single path.
///
/// A path without a record is a `Draft`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Local only, never synced
    #[default]
    Draft,
    /// Edited since the last sync
    Modified,
    /// Matches the remote
    Clean,
    /// Locked by the querying identity
    LockedLocal,
    /// Locked by someone else
    LockedRemote,
    /// Remote changed while locally locked
    Conflict,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Draft => "draft",
            FileState::Modified => "modified",
            FileState::Clean => "clean",
            FileState::LockedLocal => "locked_local",
            FileState::LockedRemote => "locked_remote",
            FileState::Conflict => "conflict",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An advisory lock on a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub user_id: String,
    #[serde(default)]
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(user_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Persisted per-path record owned by the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    #[serde(default)]
    pub state: FileState,
    #[serde(default)]
    pub lock: Option<LockRecord>,
    /// When the path was last pushed to or pulled from the remote
    #[serde(default)]
    pub remote_timestamp: Option<String>,
    pub last_modified: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            state: FileState::Draft,
            lock: None,
            remote_timestamp: None,
            last_modified: Utc::now(),
        }
    }

    /// Bump `last_modified` after a mutation.
    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

/// Known paths partitioned by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub draft: Vec<String>,
    pub clean: Vec<String>,
    pub modified: Vec<String>,
    pub locked_local: Vec<String>,
    pub locked_remote: Vec<String>,
    pub conflict: Vec<String>,
}

impl SyncStatus {
    /// File a path into the group matching `state`.
    pub fn push(&mut self, state: FileState, path: String) {
        match state {
            FileState::Draft => self.draft.push(path),
            FileState::Modified => self.modified.push(path),
            FileState::Clean => self.clean.push(path),
            FileState::LockedLocal => self.locked_local.push(path),
            FileState::LockedRemote => self.locked_remote.push(path),
            FileState::Conflict => self.conflict.push(path),
        }
    }

    /// Total number of paths across all groups.
    pub fn total(&self) -> usize {
        self.draft.len()
            + self.clean.len()
            + self.modified.len()
            + self.locked_local.len()
            + self.locked_remote.len()
            + self.conflict.len()
    }
}
