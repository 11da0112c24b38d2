//! Backend-agnostic building blocks shared by the bnrepo crates: the adapter
//! contract, key normalization, prefix listing, content sniffing, errors and
//! repository configuration.

pub mod backend;
pub mod config;
pub mod content_type;
pub mod error;
pub mod key;
pub mod listing;

pub use backend::{BackendAdapter, Capabilities, Capability, UrlOptions};
pub use config::{BackendType, RepositoryConfig};
pub use error::{Result, StorageError};
pub use key::KeyQuery;
pub use listing::DirEntry;
