//! Git working tree with a deferred commit queue.

mod provider;
mod repo;

pub use provider::{GitFilingProvider, GitOptions, GitPhase, GitProviderStatus};
pub use repo::{authenticated_url, FetchAction, FetchReport, GitStatus};
