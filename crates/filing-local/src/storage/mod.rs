mod local;
mod provider;

pub use local::{normalize_file_path, normalize_path, LocalWorkingStore};
pub use provider::LocalFilingProvider;
