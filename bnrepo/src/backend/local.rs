//! Local disk backend adapter.
//!
//! Stores files below a root directory. Whole-file writes, uploads and
//! downloads go through a temp file in the destination directory followed by
//! an fsync and a rename, so a failed transfer never leaves a partial file
//! behind under the final name.

use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use bnrepo_common::backend::{BackendAdapter, Capabilities, UrlOptions};
use bnrepo_common::content_type::{self, SNIFF_LEN};
use bnrepo_common::error::{Result, StorageError};
use bnrepo_common::key::{is_root_key, normalize_key, KeyQuery};
use bnrepo_common::listing::{walk_hierarchy, DirEntry};

pub struct LocalAdapter {
    base_path: PathBuf,
    create: bool,
    url_aware: bool,
    ready: AtomicBool,
}

impl LocalAdapter {
    pub fn new(base_path: impl Into<PathBuf>, create: bool) -> Self {
        Self {
            base_path: base_path.into(),
            create,
            url_aware: false,
            ready: AtomicBool::new(false),
        }
    }

    /// Enable `file://` URL generation.
    pub fn with_urls(mut self, enabled: bool) -> Self {
        self.url_aware = enabled;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn ensure_directory(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.base_path.is_dir() {
            if !self.create {
                return Err(StorageError::Backend(format!(
                    "The directory \"{}\" does not exist",
                    self.base_path.display()
                )));
            }
            fs::create_dir_all(&self.base_path)?;
            info!(path = %self.base_path.display(), "Created repository directory");
        }
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Path for a key inside the root. `.` and `..` segments are dropped so a
    /// key can never point outside the root. Listing uses this directly since
    /// the root itself is a valid directory to walk.
    fn full_path(&self, key: &str) -> PathBuf {
        let normalized = normalize_key(key);
        let mut path = self.base_path.clone();
        for segment in normalized.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                continue;
            }
            path.push(segment);
        }
        path
    }

    /// Path for a key naming a file or directory below the root. Keys that
    /// collapse to the root itself are rejected.
    fn file_path(&self, key: &str) -> Result<PathBuf> {
        if is_root_key(key) {
            return Err(StorageError::InvalidUri(format!(
                "\"{}\" does not name a file below {}",
                key,
                self.base_path.display()
            )));
        }
        Ok(self.full_path(key))
    }

    fn existing_path(&self, key: &str) -> Result<PathBuf> {
        self.ensure_directory()?;
        let path = self.file_path(key)?;
        if !path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(path)
    }

    fn list_dir(&self, relative: &str) -> Result<Option<Vec<DirEntry>>> {
        let dir = self.full_path(relative);
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let name = entry.file_name().to_string_lossy().to_string();
            if file_type.is_symlink() && entry.path().is_dir() {
                debug!(path = %entry.path().display(), "Skipping symlinked directory");
                continue;
            }
            entries.push(DirEntry { name, is_dir: file_type.is_dir() });
        }
        Ok(Some(entries))
    }
}

impl BackendAdapter for LocalAdapter {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            url_aware: self.url_aware,
            uploadable: true,
            downloadable: true,
            appendable: true,
            time_aware: true,
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_directory()?;
        Ok(self.file_path(key)?.exists())
    }

    fn read(&self, key: &str) -> Result<Bytes> {
        let path = self.existing_path(key)?;
        let data = fs::read(&path)?;
        Ok(Bytes::from(data))
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<u64> {
        self.ensure_directory()?;
        let dest = self.file_path(key)?;
        write_atomic(&dest, data)?;
        debug!(key = %key, bytes = data.len(), "Local write complete");
        Ok(data.len() as u64)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.existing_path(key)?;
        if path.is_dir() {
            fs::remove_dir(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        debug!(key = %key, "Local delete complete");
        Ok(())
    }

    fn rename(&self, key: &str, new_key: &str) -> Result<()> {
        let src = self.existing_path(key)?;
        let dest = self.file_path(new_key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dest)?;
        debug!(from = %key, to = %new_key, "Local rename complete");
        Ok(())
    }

    fn mtime(&self, key: &str) -> Result<DateTime<Utc>> {
        let meta = fs::metadata(self.existing_path(key)?)?;
        Ok(DateTime::<Utc>::from(meta.modified()?))
    }

    fn size(&self, key: &str) -> Result<u64> {
        Ok(fs::metadata(self.existing_path(key)?)?.len())
    }

    fn is_directory(&self, key: &str) -> Result<bool> {
        self.ensure_directory()?;
        Ok(self.full_path(key).is_dir())
    }

    fn content_type(&self, key: &str) -> Result<String> {
        let path = self.existing_path(key)?;
        let mut head = Vec::with_capacity(SNIFF_LEN);
        fs::File::open(&path)?
            .take(SNIFF_LEN as u64)
            .read_to_end(&mut head)?;
        Ok(content_type::sniff(key, &head))
    }

    fn list_keys(&self, prefix: Option<&str>, include_directories: bool) -> Result<Vec<String>> {
        self.ensure_directory()?;
        let query = KeyQuery::parse(prefix);
        walk_hierarchy(&query, include_directories, |relative| self.list_dir(relative))
    }

    fn append(&self, key: &str, data: &[u8]) -> Result<u64> {
        self.ensure_directory()?;
        let path = self.file_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(data)?;
        Ok(data.len() as u64)
    }

    fn url(&self, key: &str, options: &UrlOptions) -> Result<String> {
        if !self.url_aware {
            return Err(StorageError::unsupported(
                self.backend_name(),
                bnrepo_common::Capability::UrlAware,
            ));
        }
        if let Some(public) = &options.download_url {
            return Ok(public.clone());
        }
        Ok(format!("file://{}", self.file_path(key)?.display()))
    }

    fn ctime(&self, key: &str) -> Result<DateTime<Utc>> {
        let meta = fs::metadata(self.existing_path(key)?)?;
        change_time(&meta).ok_or_else(|| {
            StorageError::Backend(format!("no change time recorded for {}", key))
        })
    }

    fn atime(&self, key: &str) -> Result<DateTime<Utc>> {
        let meta = fs::metadata(self.existing_path(key)?)?;
        Ok(DateTime::<Utc>::from(meta.accessed()?))
    }

    fn upload_file(&self, local: &Path, key: &str) -> Result<()> {
        self.ensure_directory()?;
        let dest = self.file_path(key)?;
        copy_atomic(local, &dest)?;
        debug!(key = %key, local = %local.display(), "Local upload complete");
        Ok(())
    }

    fn download_file(&self, key: &str, local: &Path) -> Result<()> {
        let src = self.existing_path(key)?;
        copy_atomic(&src, local)?;
        debug!(key = %key, local = %local.display(), "Local download complete");
        Ok(())
    }
}

#[cfg(unix)]
fn change_time(meta: &fs::Metadata) -> Option<DateTime<Utc>> {
    use std::os::unix::fs::MetadataExt;
    DateTime::from_timestamp(meta.ctime(), meta.ctime_nsec() as u32)
}

#[cfg(not(unix))]
fn change_time(meta: &fs::Metadata) -> Option<DateTime<Utc>> {
    meta.created().ok().map(DateTime::<Utc>::from)
}

fn staging_dir(dest: &Path) -> std::io::Result<&Path> {
    let parent = match dest.parent() {
        Some(p) if p.components().next().is_some() => p,
        _ => Path::new(Component::CurDir.as_os_str()),
    };
    fs::create_dir_all(parent)?;
    Ok(parent)
}

/// Write `data` to `dest` through a synced temp file in the same directory.
pub(crate) fn write_atomic(dest: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(staging_dir(dest)?)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Drain `reader` into `dest` through a synced temp file. Returns the number
/// of bytes copied.
pub(crate) fn stream_atomic<R: Read + ?Sized>(dest: &Path, reader: &mut R) -> std::io::Result<u64> {
    let mut tmp = tempfile::NamedTempFile::new_in(staging_dir(dest)?)?;
    let copied = std::io::copy(reader, &mut tmp)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(copied)
}

/// Copy `src` to `dest` through a synced temp file in the destination directory.
pub(crate) fn copy_atomic(src: &Path, dest: &Path) -> std::io::Result<()> {
    let tmp = tempfile::NamedTempFile::new_in(staging_dir(dest)?)?;
    fs::copy(src, tmp.path())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}
