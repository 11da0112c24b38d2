//! FTP backend adapter.
//!
//! One control connection per adapter, opened on first use and reopened after
//! a connection-level failure. Transfers run in binary mode; passive mode is
//! the default.

use std::io::{Cursor, Read};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use suppaftp::list::File as ListEntry;
use suppaftp::types::{FileType, FtpError, Mode};
use suppaftp::{FtpStream, Status};
use tracing::{debug, info, warn};

use bnrepo_common::backend::{BackendAdapter, Capabilities};
use bnrepo_common::content_type::{self, SNIFF_LEN};
use bnrepo_common::error::{Result, StorageError};
use bnrepo_common::key::{ancestors, basename, dirname, normalize_path, KeyQuery};
use bnrepo_common::listing::{walk_hierarchy, DirEntry};

use super::local::stream_atomic;
use super::{parent_path, remote_path};

pub const DEFAULT_PORT: u16 = 21;

#[derive(Clone, Debug)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub root: String,
    pub create: bool,
    pub passive: bool,
}

pub struct FtpAdapter {
    config: FtpConfig,
    conn: Mutex<Option<FtpStream>>,
    root_ready: AtomicBool,
}

impl FtpAdapter {
    pub fn new(config: FtpConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
            root_ready: AtomicBool::new(false),
        }
    }

    fn connect(&self) -> std::result::Result<FtpStream, FtpError> {
        let address = format!("{}:{}", self.config.host, self.config.port);
        let mut stream = FtpStream::connect(address.as_str())?;
        stream.login(&self.config.username, &self.config.password)?;
        stream.transfer_type(FileType::Binary)?;
        if !self.config.passive {
            stream.set_mode(Mode::Active);
        }
        info!(host = %self.config.host, port = self.config.port, "Connected to FTP server");
        Ok(stream)
    }

    /// Run `f` on the shared connection, opening it if needed.
    fn with_conn<T, F>(&self, context: &str, key: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut FtpStream) -> std::result::Result<T, FtpError>,
    {
        let mut guard = self.conn.lock().unwrap();
        if guard.is_none() {
            let stream = self
                .connect()
                .map_err(|e| StorageError::backend(format!("FTP connect {}", self.config.host), e))?;
            *guard = Some(stream);
        }
        let stream = match guard.as_mut() {
            Some(stream) => stream,
            None => return Err(StorageError::Backend("FTP connection unavailable".to_string())),
        };
        match f(stream) {
            Ok(value) => Ok(value),
            Err(e) => {
                if matches!(e, FtpError::ConnectionError(_)) {
                    warn!(error = %e, "Dropping FTP connection");
                    *guard = None;
                }
                Err(map_ftp_error(context, key, e))
            }
        }
    }

    fn remote_path(&self, key: &str) -> String {
        remote_path(&self.config.root, key)
    }

    fn reset_connection(&self) {
        if self.conn.lock().unwrap().take().is_some() {
            debug!(host = %self.config.host, "FTP connection reset");
        }
    }

    fn ensure_root(&self) -> Result<()> {
        if self.root_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let root = self.remote_path("");
        let create = self.config.create;
        self.with_conn("FTP root", &root, |ftp| {
            if ftp.cwd(&root).is_ok() {
                return Ok(true);
            }
            if !create {
                return Ok(false);
            }
            make_dirs(ftp, &root)?;
            Ok(true)
        })
        .and_then(|ready| {
            if !ready {
                return Err(StorageError::Backend(format!(
                    "The directory \"{}\" does not exist",
                    root
                )));
            }
            self.root_ready.store(true, Ordering::Release);
            Ok(())
        })
    }

    fn is_dir_path(&self, path: &str) -> Result<bool> {
        self.with_conn("FTP CWD", path, |ftp| Ok(ftp.cwd(path).is_ok()))
    }

    fn list_dir(&self, relative: &str) -> Result<Option<Vec<DirEntry>>> {
        let path = self.remote_path(relative);
        self.with_conn("FTP LIST", &path, |ftp| {
            if ftp.cwd(&path).is_err() {
                return Ok(None);
            }
            let lines = ftp.list(None)?;
            Ok(Some(parse_listing(&lines)))
        })
    }

    fn ensure_parent(&self, path: &str) -> Result<()> {
        let parent = parent_path(path);
        self.with_conn("FTP MKD", &parent, |ftp| make_dirs(ftp, &parent))
    }

    fn existing_path(&self, key: &str) -> Result<String> {
        if !self.exists(key)? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(self.remote_path(key))
    }
}

impl BackendAdapter for FtpAdapter {
    fn backend_name(&self) -> &'static str {
        "ftp"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            url_aware: false,
            uploadable: true,
            downloadable: true,
            appendable: true,
            time_aware: false,
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_root()?;
        let normalized = normalize_path("", key);
        if normalized.is_empty() {
            return Ok(true);
        }
        let name = basename(&normalized);
        Ok(self
            .list_dir(dirname(&normalized))?
            .map(|entries| entries.iter().any(|e| e.name == name))
            .unwrap_or(false))
    }

    fn read(&self, key: &str) -> Result<Bytes> {
        self.ensure_root()?;
        let path = self.remote_path(key);
        let buffer = self.with_conn("FTP RETR", key, |ftp| ftp.retr_as_buffer(&path))?;
        Ok(Bytes::from(buffer.into_inner()))
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<u64> {
        self.ensure_root()?;
        let path = self.remote_path(key);
        self.ensure_parent(&path)?;
        let written = self.with_conn("FTP STOR", key, |ftp| {
            ftp.put_file(&path, &mut Cursor::new(data))
        })?;
        debug!(key = %key, bytes = written, "FTP write complete");
        Ok(written)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.ensure_root()?;
        let path = self.existing_path(key)?;
        if self.is_dir_path(&path)? {
            self.with_conn("FTP RMD", key, |ftp| ftp.rmdir(&path))?;
        } else {
            self.with_conn("FTP DELE", key, |ftp| ftp.rm(&path))?;
        }
        debug!(key = %key, "FTP delete complete");
        Ok(())
    }

    fn rename(&self, key: &str, new_key: &str) -> Result<()> {
        self.ensure_root()?;
        let from = self.existing_path(key)?;
        let to = self.remote_path(new_key);
        self.ensure_parent(&to)?;
        self.with_conn("FTP RNFR", key, |ftp| ftp.rename(&from, &to))?;
        debug!(from = %key, to = %new_key, "FTP rename complete");
        Ok(())
    }

    fn mtime(&self, key: &str) -> Result<DateTime<Utc>> {
        let path = self.existing_path(key)?;
        let modified = self.with_conn("FTP MDTM", key, |ftp| ftp.mdtm(&path))?;
        Ok(modified.and_utc())
    }

    fn size(&self, key: &str) -> Result<u64> {
        let path = self.existing_path(key)?;
        let size = self.with_conn("FTP SIZE", key, |ftp| ftp.size(&path))?;
        Ok(size as u64)
    }

    fn is_directory(&self, key: &str) -> Result<bool> {
        self.ensure_root()?;
        self.is_dir_path(&self.remote_path(key))
    }

    fn content_type(&self, key: &str) -> Result<String> {
        self.ensure_root()?;
        let path = self.remote_path(key);
        let (head, complete) = self.with_conn("FTP RETR", key, |ftp| {
            let mut stream = ftp.retr_as_stream(&path)?;
            let (head, complete) = read_head(&mut stream).map_err(FtpError::ConnectionError)?;
            if complete {
                ftp.finalize_retr_stream(stream)?;
            }
            Ok((head, complete))
        })?;
        if !complete {
            // the server still owes a reply for the aborted transfer
            self.reset_connection();
        }
        Ok(content_type::sniff(key, &head))
    }

    fn list_keys(&self, prefix: Option<&str>, include_directories: bool) -> Result<Vec<String>> {
        self.ensure_root()?;
        let query = KeyQuery::parse(prefix);
        walk_hierarchy(&query, include_directories, |relative| self.list_dir(relative))
    }

    fn append(&self, key: &str, data: &[u8]) -> Result<u64> {
        self.ensure_root()?;
        let path = self.remote_path(key);
        self.ensure_parent(&path)?;
        self.with_conn("FTP APPE", key, |ftp| {
            ftp.append_file(&path, &mut Cursor::new(data))
        })
    }

    fn upload_file(&self, local: &Path, key: &str) -> Result<()> {
        self.ensure_root()?;
        let path = self.remote_path(key);
        self.ensure_parent(&path)?;
        let mut file = std::fs::File::open(local)?;
        let written = self.with_conn("FTP STOR", key, |ftp| ftp.put_file(&path, &mut file))?;
        debug!(key = %key, local = %local.display(), bytes = written, "FTP upload complete");
        Ok(())
    }

    fn download_file(&self, key: &str, local: &Path) -> Result<()> {
        self.ensure_root()?;
        let path = self.remote_path(key);
        let copied = self.with_conn("FTP RETR", key, |ftp| {
            ftp.retr(&path, |reader: &mut dyn Read| {
                stream_atomic(local, reader).map_err(FtpError::ConnectionError)
            })
        })?;
        debug!(key = %key, local = %local.display(), bytes = copied, "FTP download complete");
        Ok(())
    }
}

fn map_ftp_error(context: &str, key: &str, err: FtpError) -> StorageError {
    match err {
        FtpError::UnexpectedResponse(ref resp) if resp.status == Status::FileUnavailable => {
            StorageError::NotFound(key.to_string())
        }
        other => StorageError::backend(format!("{} {}", context, key), other),
    }
}

/// Create `path` and every missing parent, one level at a time.
fn make_dirs(ftp: &mut FtpStream, path: &str) -> std::result::Result<(), FtpError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(());
    }
    let mut levels: Vec<&str> = ancestors(trimmed);
    levels.push(trimmed);
    for level in levels {
        let absolute = format!("/{}", level);
        if ftp.cwd(&absolute).is_err() {
            ftp.mkdir(&absolute)?;
        }
    }
    Ok(())
}

/// Parse the lines of a LIST response, dropping `.`/`..` and anything the
/// parser does not understand.
fn parse_listing(lines: &[String]) -> Vec<DirEntry> {
    lines
        .iter()
        .filter_map(|line| match ListEntry::from_str(line) {
            Ok(entry) => Some(entry),
            Err(_) => {
                debug!(line = %line, "Skipping unparsable LIST line");
                None
            }
        })
        .filter(|entry| entry.name() != "." && entry.name() != "..")
        .map(|entry| DirEntry {
            name: entry.name().to_string(),
            is_dir: entry.is_directory(),
        })
        .collect()
}

/// Read at most `SNIFF_LEN` bytes. The flag is true when the reader hit end
/// of file within that window.
fn read_head<R: Read + ?Sized>(reader: &mut R) -> std::io::Result<(Vec<u8>, bool)> {
    let mut head = Vec::with_capacity(SNIFF_LEN + 1);
    reader.take(SNIFF_LEN as u64 + 1).read_to_end(&mut head)?;
    let complete = head.len() <= SNIFF_LEN;
    head.truncate(SNIFF_LEN);
    Ok((head, complete))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listing() {
        let lines: Vec<String> = [
            "drwxr-xr-x    2 1000     1000         4096 Jan 01 12:00 .",
            "drwxr-xr-x    2 1000     1000         4096 Jan 01 12:00 ..",
            "-rw-r--r--    1 1000     1000           11 Jan 01 12:00 file.txt",
            "drwxr-xr-x    2 1000     1000         4096 Jan 01 12:00 sub",
            "total 8",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            parse_listing(&lines),
            vec![DirEntry::file("file.txt"), DirEntry::dir("sub")]
        );
    }

    #[test]
    fn test_read_head_stops_early() {
        let mut small = Cursor::new(b"%PDF-1.4 short".to_vec());
        let (head, complete) = read_head(&mut small).unwrap();
        assert_eq!(head, b"%PDF-1.4 short");
        assert!(complete);

        let mut large = Cursor::new(vec![b'x'; SNIFF_LEN * 4]);
        let (head, complete) = read_head(&mut large).unwrap();
        assert_eq!(head.len(), SNIFF_LEN);
        assert!(!complete);
        assert_eq!(large.position(), SNIFF_LEN as u64 + 1);

        let mut exact = Cursor::new(vec![b'y'; SNIFF_LEN]);
        let (head, complete) = read_head(&mut exact).unwrap();
        assert_eq!(head.len(), SNIFF_LEN);
        assert!(complete);
    }

    #[test]
    fn test_no_time_capabilities() {
        let adapter = FtpAdapter::new(FtpConfig {
            host: "ftp.example.com".to_string(),
            port: DEFAULT_PORT,
            username: "anonymous".to_string(),
            password: String::new(),
            root: "/".to_string(),
            create: false,
            passive: true,
        });
        let caps = adapter.capabilities();
        assert!(caps.appendable && caps.uploadable && caps.downloadable);
        assert!(!caps.time_aware && !caps.url_aware);
        assert!(adapter.ctime("a.txt").unwrap_err().is_unsupported());
    }
}
