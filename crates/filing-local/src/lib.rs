//! Filing providers backed by the local filesystem.
//!
//! Three variants share the `FilingProvider` interface:
//! - `LocalFilingProvider`: a plain working copy
//! - `SyncFilingProvider`: a working copy reconciled with a `RemoteProvider`
//!   (shared directory or S3) through per-path sync states
//! - `GitFilingProvider`: a clone whose mutations wait in a commit queue
//!   until a human supplies the message

pub mod config;
pub mod factory;
pub mod git;
pub mod lock;
pub mod metadata;
pub mod queue;
pub mod remote;
pub mod scheduler;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use factory::{build_backend, build_remote, FilingBackend, ProviderKind, RemoteKind};
pub use git::{GitFilingProvider, GitOptions};
pub use lock::MemoryLockManager;
pub use metadata::MetadataStore;
pub use queue::CommitQueue;
pub use remote::DirectoryRemote;
pub use scheduler::PeriodicTask;
pub use storage::{LocalFilingProvider, LocalWorkingStore};
pub use sync::{SyncFilingProvider, SyncOptions};
