use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hints attached to a pending commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetadata {
    /// Operation that staged the change (create, update, delete)
    #[serde(default)]
    pub operation: Option<String>,
    /// Size of the written content in bytes
    #[serde(default)]
    pub size: Option<u64>,
    /// Set when the entry was re-added after a failed commit
    #[serde(default)]
    pub retry: bool,
    /// Number of failed commit attempts so far
    #[serde(default)]
    pub attempts: u32,
}

impl CommitMetadata {
    pub fn operation(operation: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            operation: Some(operation.into()),
            size,
            ..Default::default()
        }
    }
}

/// A staged change set awaiting a human commit message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCommit {
    pub id: String,
    pub files: Vec<String>,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: CommitMetadata,
}

/// A pending commit handed to the caller for the actual version-control commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedCommit {
    pub id: String,
    pub files: Vec<String>,
    pub commit_message: String,
    pub user_id: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: CommitMetadata,
}

/// Aggregate view of the commit queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub by_user: HashMap<String, usize>,
    pub files_touched: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
}
