use std::fmt;

use crate::backend::Capability;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("The {backend} adapter does not support {capability}")]
    Unsupported {
        backend: &'static str,
        capability: Capability,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("'{found}' is not a valid linker scheme - need '{expected}'")]
    InvalidScheme { found: String, expected: String },
    #[error("Invalid repository URI: {0}")]
    InvalidUri(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl StorageError {
    /// Wrap an error reported by a backend client library.
    pub fn backend(context: impl fmt::Display, err: impl fmt::Display) -> Self {
        StorageError::Backend(format!("{}: {}", context, err))
    }

    pub fn unsupported(backend: &'static str, capability: Capability) -> Self {
        StorageError::Unsupported { backend, capability }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, StorageError::Unsupported { .. })
    }

    /// True for failures reported by the underlying storage rather than by a
    /// precondition check.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_) | StorageError::Http(_) | StorageError::Backend(_)
        )
    }
}
