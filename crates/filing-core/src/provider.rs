use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FilingError;

/// A directory entry in a working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Outcome of a batch synchronization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSummary {
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
    /// (path, error message) for every failed item
    pub errors: Vec<(String, String)>,
}

impl SyncSummary {
    pub fn record_error(&mut self, path: &str, error: &FilingError) {
        self.failed += 1;
        self.errors.push((path.to_string(), error.to_string()));
    }
}

/// Capability interface shared by every provider variant.
///
/// Paths are relative to the provider's working root.
#[async_trait]
pub trait FilingProvider: Send + Sync {
    /// Returns the provider identifier (e.g., "local", "sync", "git").
    fn provider_name(&self) -> &'static str;

    /// Prepare on-disk state (directories, clones, persisted documents).
    async fn initialize(&self) -> Result<(), FilingError>;

    // =========================================================================
    // File Operations
    // =========================================================================

    async fn create(&self, path: &str, content: &[u8]) -> Result<(), FilingError>;

    async fn read(&self, path: &str) -> Result<Vec<u8>, FilingError>;

    async fn update(&self, path: &str, content: &[u8]) -> Result<(), FilingError>;

    async fn delete(&self, path: &str) -> Result<(), FilingError>;

    async fn list(&self, dir_path: &str) -> Result<Vec<EntryInfo>, FilingError>;

    async fn exists(&self, path: &str) -> Result<bool, FilingError>;

    // =========================================================================
    // Lock Operations
    // =========================================================================

    async fn lock_file(&self, path: &str, reason: &str) -> Result<(), FilingError>;

    async fn unlock_file(&self, path: &str) -> Result<(), FilingError>;

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// One synchronization pass (sync all, or fetch + push for git).
    async fn synchronize(&self) -> Result<SyncSummary, FilingError>;
}
