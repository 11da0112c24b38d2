use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use bnrepo_common::backend::UrlOptions;
use bnrepo_common::error::Result;
use bnrepo_common::key::basename;

use crate::repository::Repository;

/// Metadata snapshot of one file. `ctime`/`atime` are only filled in for
/// backends that record them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileMetadata {
    pub key: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctime: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atime: Option<DateTime<Utc>>,
    pub content_type: String,
}

/// Handle on a file in a repository. Every accessor goes to the backend;
/// nothing is cached.
#[derive(Clone)]
pub struct File {
    repository: Arc<Repository>,
    key: String,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl File {
    pub(crate) fn new(repository: Arc<Repository>, key: String) -> Self {
        Self { repository, key }
    }

    /// Basename of the key.
    pub fn name(&self) -> &str {
        basename(&self.key)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    pub fn size(&self) -> Result<u64> {
        self.repository.size(&self.key)
    }

    /// Size as `N bytes`, `N KB` or `N.N MB`.
    pub fn human_size(&self) -> Result<String> {
        Ok(human_size(self.size()?))
    }

    pub fn mtime(&self) -> Result<DateTime<Utc>> {
        self.repository.mtime(&self.key)
    }

    pub fn ctime(&self) -> Result<DateTime<Utc>> {
        self.repository.ctime(&self.key)
    }

    pub fn atime(&self) -> Result<DateTime<Utc>> {
        self.repository.atime(&self.key)
    }

    pub fn content_type(&self) -> Result<String> {
        self.repository.content_type(&self.key)
    }

    pub fn url(&self, template: Option<&str>, options: UrlOptions) -> Result<String> {
        self.repository.url(&self.key, template, options)
    }

    pub fn content(&self) -> Result<Bytes> {
        self.repository.read(&self.key)
    }

    pub fn metadata(&self) -> Result<FileMetadata> {
        let time_aware = self.repository.capabilities().time_aware;
        Ok(FileMetadata {
            key: self.key.clone(),
            size: self.size()?,
            mtime: self.mtime()?,
            ctime: if time_aware { Some(self.ctime()?) } else { None },
            atime: if time_aware { Some(self.atime()?) } else { None },
            content_type: self.content_type()?,
        })
    }
}

pub fn human_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    if bytes < KB {
        format!("{} bytes", bytes)
    } else if bytes < MB {
        format!("{:.0} KB", bytes as f64 / KB as f64)
    } else {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    }
}
