//! Cross-repository file operations addressed by `scheme://repoId/path` URIs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use bnrepo_common::backend::UrlOptions;
use bnrepo_common::error::{Result, StorageError};
use bnrepo_common::key::{basename, dirname, normalize_key};

use crate::file::File;
use crate::manager::RepositoryManager;
use crate::repository::Repository;

pub const DEFAULT_SCHEME: &str = "bnrepo";

/// Parsed URIs kept before the cache is emptied and starts over.
pub const URI_CACHE_LIMIT: usize = 1024;

/// A parsed repository URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryUri {
    pub scheme: String,
    pub repository_id: String,
    /// Path exactly as given after the repository id. A trailing slash is
    /// kept because listing treats it as significant.
    pub path: String,
}

impl RepositoryUri {
    pub fn filename(&self) -> &str {
        basename(&self.path)
    }

    pub fn directory(&self) -> &str {
        dirname(&self.path)
    }
}

pub struct RepositoryLinker {
    manager: Arc<RepositoryManager>,
    scheme: String,
    uri_cache: Mutex<HashMap<String, RepositoryUri>>,
}

impl RepositoryLinker {
    pub fn new(manager: Arc<RepositoryManager>) -> Self {
        Self::with_scheme(manager, DEFAULT_SCHEME)
    }

    pub fn with_scheme(manager: Arc<RepositoryManager>, scheme: impl Into<String>) -> Self {
        Self {
            manager,
            scheme: scheme.into(),
            uri_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn manager(&self) -> &Arc<RepositoryManager> {
        &self.manager
    }

    /// Parse `uri`, caching the result by the literal string. The scheme is
    /// compared case-insensitively.
    pub fn parse_uri(&self, uri: &str) -> Result<RepositoryUri> {
        if let Some(parsed) = self.uri_cache.lock().unwrap().get(uri) {
            return Ok(parsed.clone());
        }

        let (scheme, rest) = uri.split_once("://").ok_or_else(|| StorageError::InvalidScheme {
            found: String::new(),
            expected: self.scheme.clone(),
        })?;
        if !scheme.eq_ignore_ascii_case(&self.scheme) {
            return Err(StorageError::InvalidScheme {
                found: scheme.to_string(),
                expected: self.scheme.clone(),
            });
        }
        let (repository_id, path) = rest.split_once('/').unwrap_or((rest, ""));
        if repository_id.is_empty() {
            return Err(StorageError::InvalidUri(format!("{} has no repository id", uri)));
        }

        let parsed = RepositoryUri {
            scheme: scheme.to_string(),
            repository_id: repository_id.to_string(),
            path: path.to_string(),
        };
        let mut cache = self.uri_cache.lock().unwrap();
        if cache.len() >= URI_CACHE_LIMIT {
            debug!(entries = cache.len(), "URI cache full, clearing");
            cache.clear();
        }
        cache.insert(uri.to_string(), parsed.clone());
        Ok(parsed)
    }

    /// Forget every parsed URI.
    pub fn clear_cache(&self) {
        self.uri_cache.lock().unwrap().clear();
    }

    /// Repository and key a URI points at.
    pub fn resolve(&self, uri: &str) -> Result<(Arc<Repository>, String)> {
        let parsed = self.parse_uri(uri)?;
        let repo = self.manager.get_repository(&parsed.repository_id)?;
        Ok((repo, parsed.path))
    }

    /// `scheme://repository_id/key` using this linker's scheme.
    pub fn uri_for(&self, repository_id: &str, key: &str) -> String {
        format!("{}://{}/{}", self.scheme, repository_id, normalize_key(key))
    }

    pub fn has(&self, uri: &str) -> Result<bool> {
        let (repo, key) = self.resolve(uri)?;
        repo.has(&key)
    }

    pub fn read(&self, uri: &str) -> Result<Bytes> {
        let (repo, key) = self.resolve(uri)?;
        repo.read(&key)
    }

    pub fn write(&self, uri: &str, data: &[u8], overwrite: bool) -> Result<u64> {
        let (repo, key) = self.resolve(uri)?;
        repo.write(&key, data, overwrite)
    }

    pub fn delete(&self, uri: &str) -> Result<()> {
        let (repo, key) = self.resolve(uri)?;
        repo.delete(&key)
    }

    pub fn mtime(&self, uri: &str) -> Result<DateTime<Utc>> {
        let (repo, key) = self.resolve(uri)?;
        repo.mtime(&key)
    }

    pub fn checksum(&self, uri: &str) -> Result<String> {
        let (repo, key) = self.resolve(uri)?;
        repo.checksum(&key)
    }

    pub fn size(&self, uri: &str) -> Result<u64> {
        let (repo, key) = self.resolve(uri)?;
        repo.size(&key)
    }

    pub fn content_type(&self, uri: &str) -> Result<String> {
        let (repo, key) = self.resolve(uri)?;
        repo.content_type(&key)
    }

    pub fn url(&self, uri: &str, template: Option<&str>, options: UrlOptions) -> Result<String> {
        let (repo, key) = self.resolve(uri)?;
        repo.url(&key, template, options)
    }

    pub fn append(&self, uri: &str, data: &[u8]) -> Result<u64> {
        let (repo, key) = self.resolve(uri)?;
        repo.append(&key, data)
    }

    pub fn file(&self, uri: &str) -> Result<File> {
        let (repo, key) = self.resolve(uri)?;
        repo.file(&key)
    }

    /// List the keys under the URI's path (see `Repository::keys`).
    pub fn keys(&self, uri: &str, include_directories: bool) -> Result<Vec<String>> {
        let (repo, path) = self.resolve(uri)?;
        let prefix = if path.is_empty() { None } else { Some(path.as_str()) };
        repo.keys(prefix, include_directories)
    }

    pub fn upload(&self, local: &Path, uri: &str, overwrite: bool) -> Result<()> {
        let (repo, key) = self.resolve(uri)?;
        repo.upload(local, &key, overwrite)
    }

    pub fn download(&self, uri: &str, local: &Path, overwrite: bool) -> Result<()> {
        let (repo, key) = self.resolve(uri)?;
        repo.download(&key, local, overwrite)
    }

    /// Read the source and write it to the destination, which must not
    /// exist yet. Works across repositories of any backend type.
    pub fn copy(&self, source: &str, target: &str) -> Result<()> {
        let (target_repo, target_key) = self.resolve(target)?;
        let content = self.read(source)?;
        target_repo.write(&target_key, &content, false)?;
        debug!(from = %source, to = %target, bytes = content.len(), "Copy complete");
        Ok(())
    }

    /// Copy, then delete the source. A failed copy leaves the source alone;
    /// a failure between the two steps leaves both copies in place.
    pub fn move_file(&self, source: &str, target: &str) -> Result<()> {
        if let Err(e) = self.copy(source, target) {
            warn!(from = %source, to = %target, error = %e, "Move aborted, source kept");
            return Err(e);
        }
        self.delete(source)?;
        debug!(from = %source, to = %target, "Move complete");
        Ok(())
    }

    /// Native rename when both URIs name the same repository, otherwise a
    /// move.
    pub fn rename(&self, source: &str, target: &str) -> Result<()> {
        let source_uri = self.parse_uri(source)?;
        let target_uri = self.parse_uri(target)?;
        if source_uri.repository_id == target_uri.repository_id {
            let repo = self.manager.get_repository(&source_uri.repository_id)?;
            return repo.rename(&source_uri.path, &target_uri.path);
        }
        self.move_file(source, target)
    }
}
