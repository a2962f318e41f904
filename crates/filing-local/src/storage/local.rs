use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use filing_core::{EntryInfo, FilingError};
use tokio::fs;
use tracing::{debug, instrument};

/// Suffix of the temp files used for atomic writes.
const TEMP_SUFFIX: &str = ".filing.tmp";

/// Normalize a caller-supplied relative path into its `/`-joined key.
///
/// Rejects absolute paths and `..` components so nothing escapes the root.
/// An empty path (or `.`) normalizes to the empty key, meaning the root itself.
pub fn normalize_path(path: &str) -> Result<String, FilingError> {
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    FilingError::InvalidArgument(format!("Path is not valid UTF-8: {}", path))
                })?;
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FilingError::InvalidArgument(format!(
                    "Path escapes the working root: {}",
                    path
                )));
            }
        }
    }
    Ok(parts.join("/"))
}

/// Like `normalize_path` but refuses the root itself.
pub fn normalize_file_path(path: &str) -> Result<String, FilingError> {
    let key = normalize_path(path)?;
    if key.is_empty() {
        return Err(FilingError::InvalidArgument(format!(
            "Path does not name a file: {:?}",
            path
        )));
    }
    Ok(key)
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> FilingError {
    if e.kind() == std::io::ErrorKind::NotFound {
        FilingError::NotFound(path.display().to_string())
    } else {
        FilingError::Io(format!("Failed to {} {}: {}", action, path.display(), e))
    }
}

fn entry_info(name: String, metadata: &std::fs::Metadata) -> EntryInfo {
    EntryInfo {
        name,
        is_dir: metadata.is_dir(),
        size_bytes: if metadata.is_dir() { 0 } else { metadata.len() },
        modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
    }
}

/// Sandboxed on-disk working copy.
///
/// Every path is resolved below `root`:
/// ```text
/// {root}/
///   docs/report.md
///   notes.txt
/// ```
/// No state-machine logic lives here; callers decide what a write means.
#[derive(Debug, Clone)]
pub struct LocalWorkingStore {
    root: PathBuf,
}

impl LocalWorkingStore {
    /// Create a new LocalWorkingStore rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path to its location under the root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, FilingError> {
        let key = normalize_path(path)?;
        if key.is_empty() {
            return Ok(self.root.clone());
        }
        Ok(self.root.join(key))
    }

    /// Ensure the root directory exists.
    pub async fn ensure_root(&self) -> Result<(), FilingError> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            FilingError::Io(format!(
                "Failed to create working root {}: {}",
                self.root.display(),
                e
            ))
        })
    }

    /// Write `content` at `path`, creating parent directories.
    #[instrument(skip(self, content), level = "debug", fields(content_len = content.len()))]
    pub async fn create(&self, path: &str, content: &[u8]) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        let full = self.root.join(&key);

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                FilingError::Io(format!("Failed to create dir {}: {}", parent.display(), e))
            })?;
        }

        // Write atomically via temp file
        let file_name = full
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = full.with_file_name(format!(".{}{}", file_name, TEMP_SUFFIX));
        fs::write(&temp_path, content)
            .await
            .map_err(|e| io_error("write", &temp_path, e))?;
        fs::rename(&temp_path, &full)
            .await
            .map_err(|e| io_error("rename to", &full, e))?;

        debug!("Wrote {} ({} bytes)", key, content.len());
        Ok(())
    }

    /// Same as `create`: the last write wins.
    pub async fn update(&self, path: &str, content: &[u8]) -> Result<(), FilingError> {
        self.create(path, content).await
    }

    /// Read raw bytes.
    #[instrument(skip(self), level = "debug")]
    pub async fn read(&self, path: &str) -> Result<Vec<u8>, FilingError> {
        let full = self.root.join(normalize_file_path(path)?);
        fs::read(&full).await.map_err(|e| io_error("read", &full, e))
    }

    /// Read and decode as UTF-8.
    pub async fn read_to_string(&self, path: &str) -> Result<String, FilingError> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes).map_err(|e| {
            FilingError::Serialization(format!("{} is not valid UTF-8: {}", path, e))
        })
    }

    /// Remove the file at `path`.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, path: &str) -> Result<(), FilingError> {
        let full = self.root.join(normalize_file_path(path)?);
        fs::remove_file(&full)
            .await
            .map_err(|e| io_error("delete", &full, e))?;
        debug!("Deleted {}", full.display());
        Ok(())
    }

    /// Enumerate entries of `dir_path`; a missing directory lists as empty.
    #[instrument(skip(self), level = "debug")]
    pub async fn list(&self, dir_path: &str) -> Result<Vec<EntryInfo>, FilingError> {
        let dir = self.resolve(dir_path)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_error("read dir", &dir, e)),
        };

        let mut result = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FilingError::Io(format!("Failed to read dir entry: {}", e)))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| FilingError::Io(format!("Failed to get metadata: {}", e)))?;
            result.push(entry_info(name, &metadata));
        }
        result.sort_by(|a, b| a.name.cmp(&b.name));

        debug!("Listed {} entries in {}", result.len(), dir.display());
        Ok(result)
    }

    pub async fn exists(&self, path: &str) -> Result<bool, FilingError> {
        let full = self.resolve(path)?;
        fs::try_exists(&full)
            .await
            .map_err(|e| io_error("stat", &full, e))
    }

    /// File metadata; `NotFound` when missing.
    pub async fn stat(&self, path: &str) -> Result<EntryInfo, FilingError> {
        let full = self.resolve(path)?;
        let metadata = fs::metadata(&full)
            .await
            .map_err(|e| io_error("stat", &full, e))?;
        let name = full
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(entry_info(name, &metadata))
    }

    pub async fn get_mod_time(&self, path: &str) -> Result<DateTime<Utc>, FilingError> {
        self.stat(path).await?.modified_at.ok_or_else(|| {
            FilingError::Unsupported(format!("No modification time available for {}", path))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (LocalWorkingStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalWorkingStore::new(temp_dir.path());
        (store, temp_dir)
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(normalize_path("./a//b.txt").unwrap(), "a/b.txt");
        assert_eq!(normalize_path("").unwrap(), "");
        assert!(normalize_path("../etc/passwd").is_err());
        assert!(normalize_path("a/../../b").is_err());
        assert!(normalize_path("/etc/passwd").is_err());
        assert!(normalize_file_path(".").is_err());
    }

    #[tokio::test]
    async fn test_create_read_delete() {
        let (store, _temp) = setup().await;

        assert!(!store.exists("docs/a.txt").await.unwrap());
        store.create("docs/a.txt", b"hello").await.unwrap();
        assert!(store.exists("docs/a.txt").await.unwrap());
        assert_eq!(store.read("docs/a.txt").await.unwrap(), b"hello");
        assert_eq!(store.read_to_string("docs/a.txt").await.unwrap(), "hello");

        store.update("docs/a.txt", b"bye").await.unwrap();
        assert_eq!(store.read("docs/a.txt").await.unwrap(), b"bye");

        store.delete("docs/a.txt").await.unwrap();
        assert!(!store.exists("docs/a.txt").await.unwrap());
        assert!(store.read("docs/a.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let (store, _temp) = setup().await;
        assert!(store.list("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_entries() {
        let (store, _temp) = setup().await;
        store.create("b.txt", b"12").await.unwrap();
        store.create("a/c.txt", b"1").await.unwrap();

        let entries = store.list("").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b.txt"]);
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].size_bytes, 2);
    }

    #[tokio::test]
    async fn test_stat_and_mod_time() {
        let (store, _temp) = setup().await;
        store.create("x.bin", &[0u8; 16]).await.unwrap();
        let info = store.stat("x.bin").await.unwrap();
        assert_eq!(info.size_bytes, 16);
        assert!(!info.is_dir);
        assert!(store.get_mod_time("x.bin").await.is_ok());
        assert!(store.stat("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_sandbox_rejects_escape() {
        let (store, _temp) = setup().await;
        let err = store.create("../escape.txt", b"x").await.unwrap_err();
        assert!(matches!(err, FilingError::InvalidArgument(_)));
    }
}
