use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Local,
    /// Local disk with `file://` URL generation.
    #[serde(alias = "localUrlAware")]
    LocalUrlAware,
    Ftp,
    Sftp,
    S3,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendType::Local => "local",
            BackendType::LocalUrlAware => "localurlaware",
            BackendType::Ftp => "ftp",
            BackendType::Sftp => "sftp",
            BackendType::S3 => "s3",
        };
        f.write_str(s)
    }
}

impl FromStr for BackendType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendType::Local),
            "localurlaware" => Ok(BackendType::LocalUrlAware),
            "ftp" => Ok(BackendType::Ftp),
            "sftp" => Ok(BackendType::Sftp),
            "s3" => Ok(BackendType::S3),
            other => Err(StorageError::Configuration(format!(
                "unknown repository type '{}'",
                other
            ))),
        }
    }
}

/// Configuration of one repository. Immutable once a repository is built
/// from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Unique repository id. When loaded from a table keyed by id this may be
    /// left out and is filled in from the key.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub backend: BackendType,
    /// Root directory inside the backend (path prefix for object storage).
    #[serde(default, alias = "directory", skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// Create the root directory / bucket if it is missing.
    #[serde(default)]
    pub create: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, alias = "aws_region", skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, alias = "aws_key", skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, alias = "aws_secret", skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Template with `{FILENAME}`, `{PATH}`, `{FULL_PATH}` and `{SCHEME}`
    /// placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Backend-specific options (`default_acl`, `storage_class`, `methods`,
    /// `url_aware`, `passive`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl RepositoryConfig {
    pub fn new(id: impl Into<String>, backend: BackendType) -> Self {
        Self {
            id: id.into(),
            backend,
            dir: None,
            create: false,
            host: None,
            port: None,
            username: None,
            password: None,
            public_key: None,
            private_key: None,
            bucket: None,
            region: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            download_url: None,
            options: BTreeMap::new(),
        }
    }

    /// Local repository rooted at `dir`.
    pub fn local(id: impl Into<String>, dir: impl Into<String>) -> Self {
        let mut cfg = Self::new(id, BackendType::Local);
        cfg.dir = Some(dir.into());
        cfg
    }

    pub fn with_create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn with_download_url(mut self, template: impl Into<String>) -> Self {
        self.download_url = Some(template.into());
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(name.into(), value);
        self
    }

    /// Root directory, `"/"` when unset.
    pub fn root_dir(&self) -> &str {
        match self.dir.as_deref() {
            Some(d) if !d.is_empty() => d,
            _ => "/",
        }
    }

    pub fn option_str(&self, name: &str) -> Option<&str> {
        self.options.get(name).and_then(|v| v.as_str())
    }

    pub fn option_bool(&self, name: &str) -> Option<bool> {
        self.options.get(name).and_then(|v| v.as_bool())
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(StorageError::Configuration(
                "repository id must not be empty".to_string(),
            ));
        }
        match self.backend {
            BackendType::Local | BackendType::LocalUrlAware => {
                self.require(self.dir.as_deref(), "dir")?;
            }
            BackendType::Ftp => {
                self.require(self.host.as_deref(), "host")?;
            }
            BackendType::Sftp => {
                self.require(self.host.as_deref(), "host")?;
                self.require(self.username.as_deref(), "username")?;
            }
            BackendType::S3 => {
                self.require(self.bucket.as_deref(), "bucket")?;
                self.require(self.region.as_deref(), "region")?;
            }
        }
        Ok(())
    }

    fn require(&self, value: Option<&str>, field: &str) -> Result<()> {
        match value {
            Some(v) if !v.is_empty() => Ok(()),
            _ => Err(StorageError::Configuration(format!(
                "param {} in {}-repo '{}' not set",
                field, self.backend, self.id
            ))),
        }
    }
}
