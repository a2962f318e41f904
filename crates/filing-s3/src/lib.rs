//! S3-compatible remote for filing-sync.
//!
//! Works against AWS S3 and S3-compatible stores (R2, MinIO) through
//! `aws-sdk-s3`.

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{BehaviorVersion, Credentials};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use filing_core::{FilingError, RemoteProvider};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

/// Object metadata key carrying the SHA-256 of the uploaded content.
pub const DIGEST_METADATA_KEY: &str = "sha256";

/// Connection settings for `S3Remote::connect`.
#[derive(Clone, Default)]
pub struct S3Settings {
    pub bucket: String,
    /// Key prefix all paths live under (e.g. `team-a/docs`)
    pub prefix: Option<String>,
    /// Custom endpoint for S3-compatible stores
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// Static credentials; the default provider chain is used when absent
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Hex SHA-256 of `content`.
pub fn content_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Normalize a relative path into `/`-joined segments, rejecting `..`.
fn clean_segments(path: &str) -> Result<Vec<&str>, FilingError> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(FilingError::InvalidArgument(format!(
                    "Path escapes the remote prefix: {}",
                    path
                )))
            }
            s => segments.push(s),
        }
    }
    Ok(segments)
}

/// Object key for `path` under `prefix`.
pub fn object_key(prefix: &str, path: &str) -> Result<String, FilingError> {
    let mut segments = clean_segments(prefix)?;
    let path_segments = clean_segments(path)?;
    if path_segments.is_empty() {
        return Err(FilingError::InvalidArgument(format!(
            "Path does not name an object: {:?}",
            path
        )));
    }
    segments.extend(path_segments);
    Ok(segments.join("/"))
}

/// Listing prefix (with trailing `/`) for directory `dir` under `prefix`.
pub fn list_prefix(prefix: &str, dir: &str) -> Result<String, FilingError> {
    let mut segments = clean_segments(prefix)?;
    segments.extend(clean_segments(dir)?);
    if segments.is_empty() {
        Ok(String::new())
    } else {
        Ok(format!("{}/", segments.join("/")))
    }
}

/// Remote backed by an S3 bucket.
///
/// Layout:
/// ```text
/// {bucket}/
///   {prefix}/
///     docs/report.md      # x-amz-meta-sha256: <hex digest>
/// ```
/// S3 has no lock registry, so locks stay local to each provider.
#[derive(Clone)]
pub struct S3Remote {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3Remote {
    pub fn new(client: S3Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Build a client from `settings`.
    pub async fn connect(settings: &S3Settings) -> Result<Self, FilingError> {
        if settings.bucket.trim().is_empty() {
            return Err(FilingError::InvalidArgument(
                "S3 remote needs a bucket".to_string(),
            ));
        }
        let region = Region::new(
            settings
                .region
                .clone()
                .unwrap_or_else(|| "us-east-1".to_string()),
        );

        let s3_config = match (&settings.access_key_id, &settings.secret_access_key) {
            (Some(key_id), Some(secret)) => {
                let credentials = Credentials::new(key_id, secret, None, None, "filing");
                let mut builder = aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(region);
                if let Some(endpoint) = &settings.endpoint {
                    builder = builder.endpoint_url(endpoint).force_path_style(true);
                }
                builder.build()
            }
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                let mut builder = aws_sdk_s3::config::Builder::from(&shared);
                if let Some(endpoint) = &settings.endpoint {
                    builder = builder.endpoint_url(endpoint).force_path_style(true);
                }
                builder.build()
            }
        };

        info!(
            "S3 remote: bucket {} prefix {:?} endpoint {:?}",
            settings.bucket, settings.prefix, settings.endpoint
        );
        Ok(Self::new(
            S3Client::from_conf(s3_config),
            settings.bucket.clone(),
            settings.prefix.clone().unwrap_or_default(),
        ))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl RemoteProvider for S3Remote {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self, content), level = "debug", fields(content_len = content.len()))]
    async fn create(&self, path: &str, content: &[u8]) -> Result<(), FilingError> {
        let key = object_key(&self.prefix, path)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .metadata(DIGEST_METADATA_KEY, content_digest(content))
            .body(ByteStream::from(content.to_vec()))
            .send()
            .await
            .map_err(|e| FilingError::Remote(format!("S3 put_object error: {}", e)))?;
        debug!("Uploaded s3://{}/{}", self.bucket, key);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn read(&self, path: &str) -> Result<Vec<u8>, FilingError> {
        let key = object_key(&self.prefix, path)?;
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| {
                        FilingError::Remote(format!("Failed to read S3 object body: {}", e))
                    })?
                    .into_bytes();
                Ok(bytes.to_vec())
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    Err(FilingError::NotFound(format!("s3://{}/{}", self.bucket, key)))
                } else {
                    Err(FilingError::Remote(format!(
                        "S3 get_object error: {}",
                        service_error
                    )))
                }
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, path: &str) -> Result<(), FilingError> {
        let key = object_key(&self.prefix, path)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| FilingError::Remote(format!("S3 delete_object error: {}", e)))?;
        Ok(())
    }

    /// Immediate children of `dir_path`: object names and sub-"directories".
    async fn list(&self, dir_path: &str) -> Result<Vec<String>, FilingError> {
        let prefix = list_prefix(&self.prefix, dir_path)?;
        let mut names = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/");

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|e| FilingError::Remote(format!("S3 list_objects error: {}", e)))?;

            if let Some(contents) = output.contents {
                for obj in contents {
                    if let Some(name) = obj.key.as_deref().and_then(|k| k.strip_prefix(&prefix)) {
                        names.push(name.to_string());
                    }
                }
            }
            if let Some(dirs) = output.common_prefixes {
                for dir in dirs {
                    if let Some(name) = dir.prefix.as_deref().and_then(|p| p.strip_prefix(&prefix)) {
                        names.push(name.trim_end_matches('/').to_string());
                    }
                }
            }

            if output.is_truncated.unwrap_or(false) {
                continuation_token = output.next_continuation_token;
            } else {
                break;
            }
        }

        names.sort();
        Ok(names)
    }
}

impl std::fmt::Debug for S3Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Remote")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}
