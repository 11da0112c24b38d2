//! Per-backend facade that enforces existence and overwrite guards before
//! delegating to the adapter.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use bnrepo_common::backend::{BackendAdapter, Capabilities, Capability, UrlOptions};
use bnrepo_common::config::RepositoryConfig;
use bnrepo_common::error::{Result, StorageError};
use bnrepo_common::key::{is_root_key, normalize_key};

use crate::backend::{self, local::write_atomic};
use crate::download_url;
use crate::file::File;

/// What to send back to a client asking to download a file.
#[derive(Debug, Clone, PartialEq)]
pub enum Download {
    /// The backend serves the file itself; redirect the client here.
    Redirect { location: String },
    /// Stream `body` with `headers`.
    Content {
        headers: Vec<(String, String)>,
        body: Bytes,
    },
}

pub struct Repository {
    config: RepositoryConfig,
    adapter: Box<dyn BackendAdapter>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Build the adapter described by `config`.
    pub fn new(config: RepositoryConfig) -> Result<Self> {
        let adapter = backend::from_config(&config)?;
        info!(repository = %config.id, backend = %config.backend, "Repository initialized");
        Ok(Self { config, adapter })
    }

    /// Wrap an already constructed adapter.
    pub fn with_adapter(config: RepositoryConfig, adapter: Box<dyn BackendAdapter>) -> Self {
        Self { config, adapter }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn adapter(&self) -> &dyn BackendAdapter {
        self.adapter.as_ref()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.adapter.capabilities()
    }

    /// Keys that collapse to the repository root name no file.
    fn check_key(&self, key: &str) -> Result<()> {
        if is_root_key(key) {
            return Err(StorageError::InvalidUri(format!(
                "{}://{} does not name a file",
                self.config.id, key
            )));
        }
        Ok(())
    }

    fn assert_has(&self, key: &str) -> Result<()> {
        self.check_key(key)?;
        if !self.adapter.exists(key)? {
            return Err(StorageError::NotFound(format!("{}://{}", self.config.id, key)));
        }
        Ok(())
    }

    fn require(&self, capability: Capability) -> Result<()> {
        if !self.capabilities().supports(capability) {
            return Err(StorageError::unsupported(self.adapter.backend_name(), capability));
        }
        Ok(())
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        self.check_key(key)?;
        self.adapter.exists(key)
    }

    pub fn read(&self, key: &str) -> Result<Bytes> {
        self.check_key(key)?;
        self.adapter.read(key)
    }

    /// Write `data` to `key`. Fails with `AlreadyExists` when the key exists
    /// and `overwrite` is false.
    pub fn write(&self, key: &str, data: &[u8], overwrite: bool) -> Result<u64> {
        self.check_key(key)?;
        if !overwrite && self.adapter.exists(key)? {
            return Err(StorageError::AlreadyExists(format!("{}://{}", self.config.id, key)));
        }
        self.adapter.write(key, data)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.assert_has(key)?;
        self.adapter.delete(key)
    }

    pub fn rename(&self, key: &str, new_key: &str) -> Result<()> {
        self.assert_has(key)?;
        self.check_key(new_key)?;
        if self.adapter.exists(new_key)? {
            return Err(StorageError::AlreadyExists(format!(
                "{}://{}",
                self.config.id, new_key
            )));
        }
        self.adapter.rename(key, new_key)
    }

    pub fn mtime(&self, key: &str) -> Result<DateTime<Utc>> {
        self.assert_has(key)?;
        self.adapter.mtime(key)
    }

    pub fn ctime(&self, key: &str) -> Result<DateTime<Utc>> {
        self.require(Capability::TimeAware)?;
        self.assert_has(key)?;
        self.adapter.ctime(key)
    }

    pub fn atime(&self, key: &str) -> Result<DateTime<Utc>> {
        self.require(Capability::TimeAware)?;
        self.assert_has(key)?;
        self.adapter.atime(key)
    }

    pub fn size(&self, key: &str) -> Result<u64> {
        self.assert_has(key)?;
        self.adapter.size(key)
    }

    /// Hex SHA-256 of the content.
    pub fn checksum(&self, key: &str) -> Result<String> {
        self.assert_has(key)?;
        let content = self.adapter.read(key)?;
        Ok(hex::encode(Sha256::digest(&content)))
    }

    pub fn content_type(&self, key: &str) -> Result<String> {
        self.check_key(key)?;
        self.adapter.content_type(key)
    }

    pub fn is_directory(&self, key: &str) -> Result<bool> {
        self.adapter.is_directory(key)
    }

    /// List keys, sorted. A prefix ending in `/` lists that directory; any
    /// other prefix searches its parent for names containing the last segment.
    pub fn keys(&self, prefix: Option<&str>, include_directories: bool) -> Result<Vec<String>> {
        self.adapter.list_keys(prefix, include_directories)
    }

    pub fn append(&self, key: &str, data: &[u8]) -> Result<u64> {
        self.check_key(key)?;
        self.adapter.append(key, data)
    }

    /// Copy a local file into the repository.
    pub fn upload(&self, local: &Path, key: &str, overwrite: bool) -> Result<()> {
        self.check_key(key)?;
        if !local.is_file() {
            return Err(StorageError::NotFound(local.display().to_string()));
        }
        if !overwrite && self.adapter.exists(key)? {
            return Err(StorageError::AlreadyExists(format!("{}://{}", self.config.id, key)));
        }
        if self.capabilities().uploadable {
            self.adapter.upload_file(local, key)?;
        } else {
            let data = fs::read(local)?;
            self.adapter.write(key, &data)?;
        }
        debug!(repository = %self.config.id, key = %key, local = %local.display(), "Upload complete");
        Ok(())
    }

    /// Copy a file out of the repository. The local file only appears once
    /// the transfer is complete.
    pub fn download(&self, key: &str, local: &Path, overwrite: bool) -> Result<()> {
        self.assert_has(key)?;
        if !overwrite && local.exists() {
            return Err(StorageError::AlreadyExists(local.display().to_string()));
        }
        if self.capabilities().downloadable {
            self.adapter.download_file(key, local)?;
        } else {
            let data = self.adapter.read(key)?;
            write_atomic(local, &data)?;
        }
        debug!(repository = %self.config.id, key = %key, local = %local.display(), "Download complete");
        Ok(())
    }

    /// URL for `key`.
    ///
    /// URL-capable backends produce the URL themselves (returning the
    /// expanded download template when one is configured). Other backends
    /// need a template, from `template` or the repository's `download_url`.
    /// Placeholders are expanded exactly once, so key text that looks like a
    /// placeholder is left alone.
    pub fn url(&self, key: &str, template: Option<&str>, mut options: UrlOptions) -> Result<String> {
        self.check_key(key)?;
        let template = template.or(self.config.download_url.as_deref());
        let secure = options.secure;

        if self.capabilities().url_aware {
            if options.download_url.is_none() {
                options.download_url = template.map(|t| download_url::expand(t, key, secure));
            }
            return self.adapter.url(key, &options);
        }

        match template {
            Some(t) if !t.is_empty() => Ok(download_url::expand(t, key, secure)),
            _ => Err(StorageError::Configuration(format!(
                "the {} adapter of repository '{}' cannot generate URLs - a download_url is needed",
                self.adapter.backend_name(),
                self.config.id
            ))),
        }
    }

    /// Redirect to the backend URL when there is one, otherwise return the
    /// content with download headers.
    pub fn stream_download(
        &self,
        key: &str,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<Download> {
        if self.capabilities().url_aware {
            let options = UrlOptions {
                filename: filename.map(str::to_string),
                content_type: content_type.map(str::to_string),
                ..Default::default()
            };
            return Ok(Download::Redirect {
                location: self.url(key, None, options)?,
            });
        }

        self.assert_has(key)?;
        let content_type = match content_type {
            Some(ct) => ct.to_string(),
            None => self.adapter.content_type(key)?,
        };
        let body = self.adapter.read(key)?;

        let mut headers = vec![
            ("Pragma".to_string(), "private".to_string()),
            ("Cache-Control".to_string(), "private, must-revalidate".to_string()),
            ("Content-Type".to_string(), content_type),
            ("Content-Length".to_string(), body.len().to_string()),
        ];
        if let Some(name) = filename.filter(|n| !n.is_empty()) {
            headers.push((
                "Content-Disposition".to_string(),
                format!("attachment; filename=\"{}\"", name),
            ));
        }
        headers.push(("Content-Transfer-Encoding".to_string(), "binary".to_string()));
        Ok(Download::Content { headers, body })
    }

    /// Handle on an existing file.
    pub fn file(self: &Arc<Self>, key: &str) -> Result<File> {
        self.assert_has(key)?;
        Ok(File::new(Arc::clone(self), normalize_key(key)))
    }

    /// `scheme://id/key` for this repository.
    pub fn uri_for_key(&self, key: &str, scheme: &str) -> String {
        format!("{}://{}/{}", scheme, self.config.id, normalize_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RepositoryConfig::local("files", dir.path().to_string_lossy());
        let repo = Repository::new(cfg).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_write_guard() {
        let (_dir, repo) = local_repo();
        repo.write("a.txt", b"one", false).unwrap();
        let err = repo.write("a.txt", b"two", false).unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(repo.read("a.txt").unwrap(), Bytes::from_static(b"one"));

        repo.write("a.txt", b"two", true).unwrap();
        assert_eq!(repo.read("a.txt").unwrap(), Bytes::from_static(b"two"));
    }

    #[test]
    fn test_missing_key_errors() {
        let (_dir, repo) = local_repo();
        assert!(repo.delete("nope.txt").unwrap_err().is_not_found());
        assert!(repo.mtime("nope.txt").unwrap_err().is_not_found());
        assert!(repo.size("nope.txt").unwrap_err().is_not_found());
        assert!(repo.checksum("nope.txt").unwrap_err().is_not_found());
        assert!(repo.rename("nope.txt", "b.txt").unwrap_err().is_not_found());
    }

    #[test]
    fn test_rename_refuses_existing_target() {
        let (_dir, repo) = local_repo();
        repo.write("a.txt", b"a", false).unwrap();
        repo.write("b.txt", b"b", false).unwrap();
        assert!(repo.rename("a.txt", "b.txt").unwrap_err().is_already_exists());
        assert_eq!(repo.read("b.txt").unwrap(), Bytes::from_static(b"b"));
    }

    #[test]
    fn test_checksum_is_sha256() {
        let (_dir, repo) = local_repo();
        repo.write("abc.txt", b"abc", false).unwrap();
        assert_eq!(
            repo.checksum("abc.txt").unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_url_requires_template_without_url_support() {
        let (_dir, repo) = local_repo();
        let err = repo.url("sub/file.txt", None, UrlOptions::default()).unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));

        let url = repo
            .url("sub/file.txt", Some("http://x/{PATH}/{FILENAME}"), UrlOptions::default())
            .unwrap();
        assert_eq!(url, "http://x/sub/file.txt");
    }

    #[test]
    fn test_stream_download_headers() {
        let (_dir, repo) = local_repo();
        repo.write("docs/readme.txt", b"hello", false).unwrap();
        match repo.stream_download("docs/readme.txt", Some("readme.txt"), None).unwrap() {
            Download::Content { headers, body } => {
                assert_eq!(body, Bytes::from_static(b"hello"));
                assert!(headers.contains(&("Content-Type".to_string(), "text/plain".to_string())));
                assert!(headers.contains(&("Content-Length".to_string(), "5".to_string())));
                assert!(headers.contains(&(
                    "Content-Disposition".to_string(),
                    "attachment; filename=\"readme.txt\"".to_string()
                )));
                assert!(headers.contains(&("Pragma".to_string(), "private".to_string())));
            }
            other => panic!("expected content, got {:?}", other),
        }
    }

    #[test]
    fn test_stream_download_redirects_for_url_backends() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RepositoryConfig::local("pub", dir.path().to_string_lossy())
            .with_option("url_aware", serde_json::Value::Bool(true))
            .with_download_url("https://files.example.com/{FULL_PATH}");
        let repo = Repository::new(cfg).unwrap();
        repo.write("img/logo.png", b"png", false).unwrap();
        assert_eq!(
            repo.stream_download("img/logo.png", None, None).unwrap(),
            Download::Redirect {
                location: "https://files.example.com/img/logo.png".to_string()
            }
        );
    }

    #[test]
    fn test_uri_for_key() {
        let (_dir, repo) = local_repo();
        assert_eq!(repo.uri_for_key("/sub//a.txt", "bnrepo"), "bnrepo://files/sub/a.txt");
    }
}
