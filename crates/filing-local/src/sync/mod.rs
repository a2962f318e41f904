//! Remote synchronization over a working copy and its metadata.

mod provider;

pub use provider::{PullOutcome, Resolution, SyncFilingProvider, SyncOptions, SyncOutcome};
