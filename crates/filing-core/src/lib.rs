//! Core traits and types for filing-sync providers.
//!
//! This crate defines the abstractions shared between the local, sync and git providers:
//! - `RemoteProvider`: minimal create/read/delete/list contract of a remote store
//! - `FilingProvider`: the capability interface every provider variant exposes
//! - `LockManager`: advisory per-path locking
//! - `EventBus`: typed notifications for logging and telemetry collaborators

mod commit;
mod error;
mod events;
mod lock;
mod provider;
mod remote;
mod state;

pub use commit::{CommitMetadata, CompletedCommit, PendingCommit, QueueStats};
pub use error::{FilingError, FilingResult};
pub use events::{EventBus, FilingEvent};
pub use lock::{LockAcquireResult, LockManager, LockReleaseResult};
pub use provider::{EntryInfo, FilingProvider, SyncSummary};
pub use remote::RemoteProvider;
pub use state::{FileRecord, FileState, LockRecord, SyncStatus};
