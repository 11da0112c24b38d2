//! Test helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use bnrepo::{BackendAdapter, Capabilities, Repository, RepositoryConfig, Result, StorageError};
use bnrepo_common::content_type::guess_from_key;
use bnrepo_common::key::{normalize_key, KeyQuery};
use bnrepo_common::listing::synthesize_flat;

/// Flat in-memory store that refuses writes once `quota` bytes are stored.
pub struct QuotaAdapter {
    objects: Mutex<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
    quota: usize,
}

impl QuotaAdapter {
    pub fn new(quota: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            quota,
        }
    }

    fn used(&self) -> usize {
        self.objects.lock().unwrap().values().map(|(d, _)| d.len()).sum()
    }
}

impl BackendAdapter for QuotaAdapter {
    fn backend_name(&self) -> &'static str {
        "quota"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(&normalize_key(key)))
    }

    fn read(&self, key: &str) -> Result<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(&normalize_key(key))
            .map(|(d, _)| Bytes::from(d.clone()))
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<u64> {
        if self.used() + data.len() > self.quota {
            return Err(StorageError::Backend(format!("quota exceeded writing {}", key)));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(normalize_key(key), (data.to_vec(), Utc::now()));
        Ok(data.len() as u64)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(&normalize_key(key));
        Ok(())
    }

    fn rename(&self, key: &str, new_key: &str) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let entry = objects
            .remove(&normalize_key(key))
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        objects.insert(normalize_key(new_key), entry);
        Ok(())
    }

    fn mtime(&self, key: &str) -> Result<DateTime<Utc>> {
        self.objects
            .lock()
            .unwrap()
            .get(&normalize_key(key))
            .map(|(_, t)| *t)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn size(&self, key: &str) -> Result<u64> {
        Ok(self.read(key)?.len() as u64)
    }

    fn is_directory(&self, key: &str) -> Result<bool> {
        Ok(!self.exists(key)?)
    }

    fn content_type(&self, key: &str) -> Result<String> {
        Ok(guess_from_key(key))
    }

    fn list_keys(&self, prefix: Option<&str>, include_directories: bool) -> Result<Vec<String>> {
        let query = KeyQuery::parse(prefix);
        let base = if query.directory.is_empty() {
            String::new()
        } else {
            format!("{}/", query.directory)
        };
        let keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&base))
            .cloned()
            .collect();
        Ok(synthesize_flat(&base, &query, keys, include_directories))
    }
}

pub fn local_config(id: &str, dir: &Path) -> RepositoryConfig {
    RepositoryConfig::local(id, dir.to_string_lossy())
}

pub fn quota_repository(id: &str, quota: usize) -> Repository {
    // the config only names the repository; the adapter is supplied directly
    let config = RepositoryConfig::local(id, "/nonexistent");
    Repository::with_adapter(config, Box::new(QuotaAdapter::new(quota)))
}

/// Files from the listing examples: a.txt, sub/b.txt, sub/c.txt, sub/deep/d.txt.
pub fn populate(repo: &Repository) {
    for key in ["a.txt", "sub/b.txt", "sub/c.txt", "sub/deep/d.txt"] {
        repo.write(key, key.as_bytes(), false).unwrap();
    }
}
