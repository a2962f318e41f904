use thiserror::Error;

/// Errors that can occur in the filing layer.
#[derive(Error, Debug)]
pub enum FilingError {
    #[error("File {path} is locked by {holder}")]
    LockConflict { path: String, holder: String },

    #[error("Ownership error: {0}")]
    Ownership(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Provider not initialized: {0}")]
    NotInitialized(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FilingError {
    /// Whether this error is the benign "nothing there yet" signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FilingError::NotFound(_))
    }

    /// Whether this error is a lock held by somebody else.
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, FilingError::LockConflict { .. })
    }
}

pub type FilingResult<T> = Result<T, FilingError>;
