use std::fmt;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Result, StorageError};

/// Optional operations an adapter may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Direct URL generation (`url`).
    UrlAware,
    /// Native local-file upload (`upload_file`).
    Uploadable,
    /// Native local-file download (`download_file`).
    Downloadable,
    /// Native append without reading the existing content back.
    Appendable,
    /// `ctime` / `atime`.
    TimeAware,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::UrlAware => "URL generation",
            Capability::Uploadable => "native uploads",
            Capability::Downloadable => "native downloads",
            Capability::Appendable => "native appends",
            Capability::TimeAware => "creation/access times",
        };
        f.write_str(s)
    }
}

/// Capability flags advertised by an adapter at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub url_aware: bool,
    pub uploadable: bool,
    pub downloadable: bool,
    pub appendable: bool,
    pub time_aware: bool,
}

impl Capabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::UrlAware => self.url_aware,
            Capability::Uploadable => self.uploadable,
            Capability::Downloadable => self.downloadable,
            Capability::Appendable => self.appendable,
            Capability::TimeAware => self.time_aware,
        }
    }
}

/// Per-call options for URL generation.
#[derive(Debug, Clone, Default)]
pub struct UrlOptions {
    /// How long a signed URL stays valid. Backends apply their own default.
    pub validity: Option<Duration>,
    /// Ask the backend to serve the object as an attachment with this name.
    pub filename: Option<String>,
    /// Override the content type the backend serves.
    pub content_type: Option<String>,
    /// Force `{SCHEME}` to `https` (true) or `http` (false) instead of
    /// inferring it from the environment.
    pub secure: Option<bool>,
    /// Repository-wide public URL, already expanded for the key. URL-aware
    /// adapters return it instead of computing their own URL.
    pub download_url: Option<String>,
}

/// Trait implemented by all storage backend adapters.
///
/// Keys passed in are repository-relative; each adapter joins them with its
/// configured root through [`crate::key::normalize_path`]. Adapters perform
/// writes unconditionally; overwrite and existence guards belong to the
/// repository layer.
///
/// Optional operations have default implementations that fail with
/// [`StorageError::Unsupported`]. Callers check [`BackendAdapter::capabilities`]
/// before invoking them and pick a fallback path.
pub trait BackendAdapter: Send + Sync {
    /// Short backend name used in logs and errors (`"local"`, `"s3"`, ...).
    fn backend_name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Whether a file (or, on hierarchical backends, a directory) exists.
    fn exists(&self, key: &str) -> Result<bool>;

    /// Read the whole object. Fails with `NotFound` if absent.
    fn read(&self, key: &str) -> Result<Bytes>;

    /// Write the whole object, replacing any existing content.
    /// Returns the number of bytes written.
    fn write(&self, key: &str, data: &[u8]) -> Result<u64>;

    /// Delete a file or directory key.
    fn delete(&self, key: &str) -> Result<()>;

    fn rename(&self, key: &str, new_key: &str) -> Result<()>;

    fn mtime(&self, key: &str) -> Result<DateTime<Utc>>;

    fn size(&self, key: &str) -> Result<u64>;

    fn is_directory(&self, key: &str) -> Result<bool>;

    fn content_type(&self, key: &str) -> Result<String>;

    /// List keys under `prefix`, sorted. See [`crate::key::KeyQuery`] for the
    /// prefix semantics.
    fn list_keys(&self, prefix: Option<&str>, include_directories: bool) -> Result<Vec<String>>;

    /// Append to an object. The default reads the existing content back and
    /// rewrites the concatenation; an absent key is treated as empty.
    fn append(&self, key: &str, data: &[u8]) -> Result<u64> {
        let mut content = if self.exists(key)? {
            self.read(key)?.to_vec()
        } else {
            Vec::new()
        };
        content.extend_from_slice(data);
        self.write(key, &content)?;
        Ok(data.len() as u64)
    }

    fn url(&self, key: &str, options: &UrlOptions) -> Result<String> {
        let _ = (key, options);
        Err(StorageError::unsupported(self.backend_name(), Capability::UrlAware))
    }

    fn ctime(&self, key: &str) -> Result<DateTime<Utc>> {
        let _ = key;
        Err(StorageError::unsupported(self.backend_name(), Capability::TimeAware))
    }

    fn atime(&self, key: &str) -> Result<DateTime<Utc>> {
        let _ = key;
        Err(StorageError::unsupported(self.backend_name(), Capability::TimeAware))
    }

    /// Copy a local file into the backend without buffering it in memory.
    fn upload_file(&self, local: &Path, key: &str) -> Result<()> {
        let _ = (local, key);
        Err(StorageError::unsupported(self.backend_name(), Capability::Uploadable))
    }

    /// Copy an object to a local file without buffering it in memory.
    fn download_file(&self, key: &str, local: &Path) -> Result<()> {
        let _ = (key, local);
        Err(StorageError::unsupported(self.backend_name(), Capability::Downloadable))
    }
}
