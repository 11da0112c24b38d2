//! File repositories over local disk, FTP, SFTP and S3-compatible storage,
//! addressed by key or by `bnrepo://repoId/path` URI.

pub mod backend;
pub mod download_url;
pub mod file;
pub mod linker;
pub mod manager;
pub mod repository;

pub use bnrepo_common::{
    BackendAdapter, BackendType, Capabilities, Capability, RepositoryConfig, Result, StorageError,
    UrlOptions,
};
pub use file::{File, FileMetadata};
pub use linker::{RepositoryLinker, RepositoryUri, DEFAULT_SCHEME};
pub use manager::RepositoryManager;
pub use repository::{Download, Repository};
