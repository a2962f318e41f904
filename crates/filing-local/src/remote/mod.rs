//! Bundled `RemoteProvider` implementations.

mod directory;

pub use directory::DirectoryRemote;
