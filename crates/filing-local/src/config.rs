use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use filing_core::FilingError;

use crate::factory::{ProviderKind, RemoteKind};
use crate::git::GitOptions;
use crate::sync::SyncOptions;

/// Configuration for the filing-syncd daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "filing-syncd")]
#[command(about = "File synchronization and deferred-commit daemon")]
pub struct Config {
    /// Provider variant: local, sync or git
    #[arg(long, default_value = "sync", env = "FILING_PROVIDER")]
    pub provider: ProviderKind,

    /// Working copy directory (git: the clone)
    #[arg(long, env = "FILING_WORKING_DIR")]
    pub working_dir: Option<PathBuf>,

    /// Directory holding metadata.json
    #[arg(long, env = "FILING_METADATA_DIR")]
    pub metadata_dir: Option<PathBuf>,

    /// Directory holding pending-commits.json
    #[arg(long, env = "FILING_QUEUE_DIR")]
    pub queue_dir: Option<PathBuf>,

    /// Identity used for locks and pending commits
    #[arg(long, env = "FILING_USER_ID")]
    pub user_id: Option<String>,

    /// Remote used by the sync provider: directory or s3
    #[arg(long, default_value = "directory", env = "FILING_REMOTE")]
    pub remote: RemoteKind,

    /// Shared directory for the directory remote
    #[arg(long, env = "FILING_REMOTE_DIR")]
    pub remote_dir: Option<PathBuf>,

    /// How long a lock on the directory remote lives (seconds)
    #[arg(long, default_value = "3600", env = "FILING_LOCK_TTL")]
    pub lock_ttl_secs: u64,

    /// S3 bucket for the s3 remote
    #[arg(long, env = "FILING_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Key prefix inside the bucket
    #[arg(long, env = "FILING_S3_PREFIX")]
    pub s3_prefix: Option<String>,

    /// Endpoint of an S3-compatible store
    #[arg(long, env = "FILING_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, env = "FILING_S3_REGION")]
    pub s3_region: Option<String>,

    #[arg(long, env = "FILING_S3_ACCESS_KEY_ID")]
    pub s3_access_key_id: Option<String>,

    #[arg(long, env = "FILING_S3_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub s3_secret_access_key: Option<String>,

    /// Git remote URL for the git provider
    #[arg(long, env = "FILING_GIT_URL")]
    pub git_url: Option<String>,

    #[arg(long, default_value = "main", env = "FILING_GIT_BRANCH")]
    pub git_branch: String,

    #[arg(long, env = "FILING_GIT_USERNAME")]
    pub git_username: Option<String>,

    /// Access token embedded for https remotes
    #[arg(long, env = "FILING_GIT_TOKEN", hide_env_values = true)]
    pub git_token: Option<String>,

    /// Commit author name (defaults to the user id)
    #[arg(long, env = "FILING_AUTHOR_NAME")]
    pub author_name: Option<String>,

    #[arg(long, env = "FILING_AUTHOR_EMAIL")]
    pub author_email: Option<String>,

    /// Auto-sync interval (seconds)
    #[arg(long, default_value = "30", env = "FILING_SYNC_INTERVAL")]
    pub sync_interval_secs: u64,

    /// Auto-fetch interval (seconds)
    #[arg(long, default_value = "60", env = "FILING_FETCH_INTERVAL")]
    pub fetch_interval_secs: u64,

    /// Timeout for remote and git network calls (seconds)
    #[arg(long, default_value = "30", env = "FILING_OP_TIMEOUT")]
    pub op_timeout_secs: u64,
}

impl Config {
    fn data_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("filing-sync")
    }

    /// Get the effective working copy directory.
    pub fn effective_working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .unwrap_or_else(|| Self::data_root().join("work"))
    }

    pub fn effective_metadata_dir(&self) -> PathBuf {
        self.metadata_dir
            .clone()
            .unwrap_or_else(|| Self::data_root().join("metadata"))
    }

    pub fn effective_queue_dir(&self) -> PathBuf {
        self.queue_dir
            .clone()
            .unwrap_or_else(|| Self::data_root().join("queue"))
    }

    pub fn effective_remote_dir(&self) -> PathBuf {
        self.remote_dir
            .clone()
            .unwrap_or_else(|| Self::data_root().join("remote"))
    }

    /// Configured user id, else the login name.
    pub fn effective_user_id(&self) -> String {
        self.user_id
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "local-user".to_string())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            sync_interval: Duration::from_secs(self.sync_interval_secs.max(1)),
            op_timeout: Duration::from_secs(self.op_timeout_secs.max(1)),
        }
    }

    pub fn git_options(&self) -> Result<GitOptions, FilingError> {
        let url = self.git_url.clone().ok_or_else(|| {
            FilingError::InvalidArgument("git provider needs --git-url".to_string())
        })?;
        let mut options = GitOptions::new(url, self.effective_user_id());
        options.branch = self.git_branch.clone();
        options.username = self.git_username.clone();
        options.token = self.git_token.clone();
        if let Some(name) = &self.author_name {
            options.author_name = name.clone();
        }
        if let Some(email) = &self.author_email {
            options.author_email = email.clone();
        }
        options.fetch_interval = Duration::from_secs(self.fetch_interval_secs.max(1));
        options.op_timeout = Duration::from_secs(self.op_timeout_secs.max(1));
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["filing-syncd", "--user-id", "alice"]).unwrap();
        assert_eq!(config.provider, ProviderKind::Sync);
        assert_eq!(config.remote, RemoteKind::Directory);
        assert_eq!(config.effective_user_id(), "alice");
        assert!(config.effective_working_dir().ends_with("filing-sync/work"));
        assert_eq!(config.sync_options().sync_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_git_options() {
        let config = Config::try_parse_from([
            "filing-syncd",
            "--provider",
            "git",
            "--user-id",
            "alice",
            "--git-url",
            "https://host/repo.git",
            "--git-branch",
            "dev",
            "--author-email",
            "alice@example.com",
        ])
        .unwrap();
        let options = config.git_options().unwrap();
        assert_eq!(options.branch, "dev");
        assert_eq!(options.author_name, "alice");
        assert_eq!(options.author_email, "alice@example.com");
    }

    #[test]
    fn test_git_options_need_url() {
        let config = Config::try_parse_from(["filing-syncd", "--provider", "git"]).unwrap();
        assert!(matches!(
            config.git_options().unwrap_err(),
            FilingError::InvalidArgument(_)
        ));
    }
}
