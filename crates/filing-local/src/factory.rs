//! Builds the configured provider variant.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use filing_core::{EntryInfo, EventBus, FilingError, FilingProvider, RemoteProvider, SyncSummary};
use tracing::info;

use crate::config::Config;
use crate::git::GitFilingProvider;
use crate::metadata::MetadataStore;
use crate::queue::CommitQueue;
use crate::remote::DirectoryRemote;
use crate::storage::{LocalFilingProvider, LocalWorkingStore};
use crate::sync::SyncFilingProvider;

/// Provider variant selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// Working copy only
    Local,
    /// Working copy reconciled with a remote store
    Sync,
    /// Git clone with a deferred commit queue
    Git,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Local => write!(f, "local"),
            ProviderKind::Sync => write!(f, "sync"),
            ProviderKind::Git => write!(f, "git"),
        }
    }
}

/// Remote store behind the sync provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RemoteKind {
    /// Shared directory (network mount) with a lock registry
    Directory,
    /// S3-compatible bucket
    S3,
}

impl fmt::Display for RemoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteKind::Directory => write!(f, "directory"),
            RemoteKind::S3 => write!(f, "s3"),
        }
    }
}

/// The running provider, with access to variant-specific operations.
#[derive(Clone)]
pub enum FilingBackend {
    Local(Arc<LocalFilingProvider>),
    Sync(Arc<SyncFilingProvider>),
    Git(Arc<GitFilingProvider>),
}

impl FilingBackend {
    pub fn kind(&self) -> ProviderKind {
        match self {
            FilingBackend::Local(_) => ProviderKind::Local,
            FilingBackend::Sync(_) => ProviderKind::Sync,
            FilingBackend::Git(_) => ProviderKind::Git,
        }
    }

    fn provider(&self) -> &dyn FilingProvider {
        match self {
            FilingBackend::Local(p) => p.as_ref(),
            FilingBackend::Sync(p) => p.as_ref(),
            FilingBackend::Git(p) => p.as_ref(),
        }
    }

    /// Start auto-sync or auto-fetch. Returns false when the variant has no
    /// background work or it is already running.
    pub async fn start_background(&self) -> bool {
        match self {
            FilingBackend::Local(_) => false,
            FilingBackend::Sync(p) => p.start_auto_sync().await,
            FilingBackend::Git(p) => p.start_auto_fetch().await,
        }
    }

    pub async fn stop_background(&self) {
        match self {
            FilingBackend::Local(_) => {}
            FilingBackend::Sync(p) => p.stop_auto_sync().await,
            FilingBackend::Git(p) => p.stop_auto_fetch().await,
        }
    }
}

#[async_trait]
impl FilingProvider for FilingBackend {
    fn provider_name(&self) -> &'static str {
        self.provider().provider_name()
    }

    async fn initialize(&self) -> Result<(), FilingError> {
        self.provider().initialize().await
    }

    async fn create(&self, path: &str, content: &[u8]) -> Result<(), FilingError> {
        self.provider().create(path, content).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, FilingError> {
        self.provider().read(path).await
    }

    async fn update(&self, path: &str, content: &[u8]) -> Result<(), FilingError> {
        self.provider().update(path, content).await
    }

    async fn delete(&self, path: &str) -> Result<(), FilingError> {
        self.provider().delete(path).await
    }

    async fn list(&self, dir_path: &str) -> Result<Vec<EntryInfo>, FilingError> {
        self.provider().list(dir_path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, FilingError> {
        self.provider().exists(path).await
    }

    async fn lock_file(&self, path: &str, reason: &str) -> Result<(), FilingError> {
        self.provider().lock_file(path, reason).await
    }

    async fn unlock_file(&self, path: &str) -> Result<(), FilingError> {
        self.provider().unlock_file(path).await
    }

    async fn synchronize(&self) -> Result<SyncSummary, FilingError> {
        self.provider().synchronize().await
    }
}

/// Create the remote store used by the sync provider.
pub async fn build_remote(config: &Config) -> Result<Arc<dyn RemoteProvider>, FilingError> {
    match config.remote {
        RemoteKind::Directory => {
            let dir = config.effective_remote_dir();
            info!("Directory remote at {}", dir.display());
            Ok(Arc::new(DirectoryRemote::new(dir, config.lock_ttl())))
        }
        #[cfg(feature = "s3")]
        RemoteKind::S3 => {
            let settings = filing_s3::S3Settings {
                bucket: config.s3_bucket.clone().unwrap_or_default(),
                prefix: config.s3_prefix.clone(),
                endpoint: config.s3_endpoint.clone(),
                region: config.s3_region.clone(),
                access_key_id: config.s3_access_key_id.clone(),
                secret_access_key: config.s3_secret_access_key.clone(),
            };
            Ok(Arc::new(filing_s3::S3Remote::connect(&settings).await?))
        }
        #[cfg(not(feature = "s3"))]
        RemoteKind::S3 => Err(FilingError::Unsupported(
            "built without the s3 feature".to_string(),
        )),
    }
}

/// Build (but do not initialize) the provider selected by `config`.
pub async fn build_backend(config: &Config, events: EventBus) -> Result<FilingBackend, FilingError> {
    let user_id = config.effective_user_id();
    let store = Arc::new(LocalWorkingStore::new(config.effective_working_dir()));

    let backend = match config.provider {
        ProviderKind::Local => {
            FilingBackend::Local(Arc::new(LocalFilingProvider::new(store, user_id, events)))
        }
        ProviderKind::Sync => {
            let metadata = Arc::new(MetadataStore::new(config.effective_metadata_dir(), user_id));
            let remote = build_remote(config).await?;
            FilingBackend::Sync(Arc::new(SyncFilingProvider::new(
                store,
                metadata,
                remote,
                events,
                config.sync_options(),
            )))
        }
        ProviderKind::Git => {
            let options = config.git_options()?;
            let queue = Arc::new(CommitQueue::new(config.effective_queue_dir()));
            FilingBackend::Git(Arc::new(GitFilingProvider::new(
                options,
                config.effective_working_dir(),
                queue,
                events,
            )))
        }
    };

    info!(
        "Built {} provider for user {}",
        backend.kind(),
        config.effective_user_id()
    );
    Ok(backend)
}
