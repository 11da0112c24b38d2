//! SFTP backend adapter on top of libssh2.
//!
//! Authentication tries, in order: a key pair (when `private_key` is set,
//! with `password` as its passphrase), a password, then the SSH agent.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ssh2::{ErrorCode, MethodType, Session, Sftp};
use tracing::{debug, info, warn};

use bnrepo_common::backend::{BackendAdapter, Capabilities};
use bnrepo_common::content_type::{self, SNIFF_LEN};
use bnrepo_common::error::{Result, StorageError};
use bnrepo_common::key::{ancestors, KeyQuery};
use bnrepo_common::listing::{walk_hierarchy, DirEntry};

use super::local::stream_atomic;
use super::{parent_path, remote_path};

pub const DEFAULT_PORT: u16 = 22;

/// libssh2 status for a missing file.
const FX_NO_SUCH_FILE: i32 = 2;

const DIR_MODE: i32 = 0o755;

#[derive(Clone, Debug)]
pub struct SftpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub public_key: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    /// SSH method preferences as `(method, preference list)`, e.g.
    /// `("kex", "diffie-hellman-group14-sha1")`.
    pub methods: Vec<(String, String)>,
    pub root: String,
    pub create: bool,
}

struct Connection {
    // the session must outlive the sftp channel
    _session: Session,
    sftp: Sftp,
}

pub struct SftpAdapter {
    config: SftpConfig,
    conn: Mutex<Option<Connection>>,
    root_ready: AtomicBool,
}

impl SftpAdapter {
    pub fn new(config: SftpConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
            root_ready: AtomicBool::new(false),
        }
    }

    fn connect(&self) -> Result<Connection> {
        let context = format!("SFTP connect {}", self.config.host);
        let tcp = TcpStream::connect((self.config.host.as_str(), self.config.port))?;
        let mut session = Session::new().map_err(|e| StorageError::backend(&context, e))?;
        for (name, preference) in &self.config.methods {
            match method_type(name) {
                Some(method) => session
                    .method_pref(method, preference)
                    .map_err(|e| StorageError::backend(&context, e))?,
                None => warn!(method = %name, "Ignoring unknown SSH method type"),
            }
        }
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| StorageError::backend(&context, e))?;
        self.authenticate(&session)
            .map_err(|e| StorageError::backend(&context, e))?;
        if !session.authenticated() {
            return Err(StorageError::Backend(format!(
                "{}: authentication failed for {}",
                context, self.config.username
            )));
        }
        let sftp = session.sftp().map_err(|e| StorageError::backend(&context, e))?;
        info!(host = %self.config.host, port = self.config.port, "Connected to SFTP server");
        Ok(Connection { _session: session, sftp })
    }

    fn authenticate(&self, session: &Session) -> std::result::Result<(), ssh2::Error> {
        let user = &self.config.username;
        if let Some(ref private_key) = self.config.private_key {
            return session.userauth_pubkey_file(
                user,
                self.config.public_key.as_deref(),
                private_key,
                self.config.password.as_deref(),
            );
        }
        if let Some(ref password) = self.config.password {
            return session.userauth_password(user, password);
        }
        session.userauth_agent(user)
    }

    /// Run `f` on the shared SFTP channel, connecting if needed. A transport
    /// failure drops the connection so the next call starts fresh; refused
    /// operations (permissions, missing files) keep it.
    fn with_sftp<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Sftp) -> Result<T>,
    {
        let mut guard = self.conn.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        let conn = match guard.as_ref() {
            Some(conn) => conn,
            None => return Err(StorageError::Backend("SFTP connection unavailable".to_string())),
        };
        let result = f(&conn.sftp);
        if let Err(ref e) = result {
            if drops_connection(e) {
                warn!(error = %e, "Dropping SFTP connection");
                *guard = None;
            }
        }
        result
    }

    fn remote_path(&self, key: &str) -> PathBuf {
        PathBuf::from(remote_path(&self.config.root, key))
    }

    fn ensure_root(&self) -> Result<()> {
        if self.root_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let root = remote_path(&self.config.root, "");
        let exists = self.with_sftp(|sftp| stat_dir(sftp, Path::new(&root)))?;
        if !exists {
            if !self.config.create {
                return Err(StorageError::Backend(format!(
                    "The directory \"{}\" does not exist",
                    root
                )));
            }
            self.with_sftp(|sftp| make_dirs(sftp, &root))?;
            info!(path = %root, "Created SFTP repository directory");
        }
        self.root_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        let parent = parent_path(&path.to_string_lossy());
        self.with_sftp(|sftp| make_dirs(sftp, &parent))
    }

    fn stat(&self, key: &str) -> Result<ssh2::FileStat> {
        self.ensure_root()?;
        let path = self.remote_path(key);
        self.with_sftp(|sftp| sftp.stat(&path).map_err(|e| map_ssh_error("SFTP stat", key, e)))
    }

    fn list_dir(&self, relative: &str) -> Result<Option<Vec<DirEntry>>> {
        let path = self.remote_path(relative);
        self.with_sftp(|sftp| {
            if !stat_dir(sftp, &path)? {
                return Ok(None);
            }
            let entries = sftp
                .readdir(&path)
                .map_err(|e| map_ssh_error("SFTP readdir", relative, e))?;
            Ok(Some(
                entries
                    .into_iter()
                    .filter_map(|(entry, stat)| {
                        let name = entry.file_name()?.to_string_lossy().to_string();
                        Some(DirEntry { name, is_dir: stat.is_dir() })
                    })
                    .collect(),
            ))
        })
    }
}

impl BackendAdapter for SftpAdapter {
    fn backend_name(&self) -> &'static str {
        "sftp"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            url_aware: false,
            uploadable: true,
            downloadable: true,
            appendable: false,
            time_aware: false,
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        match self.stat(key) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read(&self, key: &str) -> Result<Bytes> {
        self.ensure_root()?;
        let path = self.remote_path(key);
        self.with_sftp(|sftp| {
            let mut file = sftp.open(&path).map_err(|e| map_ssh_error("SFTP open", key, e))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            Ok(Bytes::from(data))
        })
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<u64> {
        self.ensure_root()?;
        let path = self.remote_path(key);
        self.ensure_parent(&path)?;
        self.with_sftp(|sftp| {
            let mut file = sftp
                .create(&path)
                .map_err(|e| map_ssh_error("SFTP create", key, e))?;
            file.write_all(data)?;
            Ok(())
        })?;
        debug!(key = %key, bytes = data.len(), "SFTP write complete");
        Ok(data.len() as u64)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.ensure_root()?;
        let path = self.remote_path(key);
        self.with_sftp(|sftp| {
            let stat = sftp.lstat(&path).map_err(|e| map_ssh_error("SFTP stat", key, e))?;
            if stat.is_dir() {
                sftp.rmdir(&path).map_err(|e| map_ssh_error("SFTP rmdir", key, e))
            } else {
                sftp.unlink(&path).map_err(|e| map_ssh_error("SFTP unlink", key, e))
            }
        })?;
        debug!(key = %key, "SFTP delete complete");
        Ok(())
    }

    fn rename(&self, key: &str, new_key: &str) -> Result<()> {
        self.ensure_root()?;
        let from = self.remote_path(key);
        let to = self.remote_path(new_key);
        self.ensure_parent(&to)?;
        self.with_sftp(|sftp| {
            sftp.rename(&from, &to, None)
                .map_err(|e| map_ssh_error("SFTP rename", key, e))
        })?;
        debug!(from = %key, to = %new_key, "SFTP rename complete");
        Ok(())
    }

    fn mtime(&self, key: &str) -> Result<DateTime<Utc>> {
        let stat = self.stat(key)?;
        stat.mtime
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
            .ok_or_else(|| StorageError::Backend(format!("no modification time for {}", key)))
    }

    fn size(&self, key: &str) -> Result<u64> {
        let stat = self.stat(key)?;
        stat.size
            .ok_or_else(|| StorageError::Backend(format!("no size for {}", key)))
    }

    fn is_directory(&self, key: &str) -> Result<bool> {
        match self.stat(key) {
            Ok(stat) => Ok(stat.is_dir()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn content_type(&self, key: &str) -> Result<String> {
        self.ensure_root()?;
        let path = self.remote_path(key);
        let head = self.with_sftp(|sftp| {
            let file = sftp.open(&path).map_err(|e| map_ssh_error("SFTP open", key, e))?;
            let mut head = Vec::with_capacity(SNIFF_LEN);
            file.take(SNIFF_LEN as u64).read_to_end(&mut head)?;
            Ok(head)
        })?;
        Ok(content_type::sniff(key, &head))
    }

    fn list_keys(&self, prefix: Option<&str>, include_directories: bool) -> Result<Vec<String>> {
        self.ensure_root()?;
        let query = KeyQuery::parse(prefix);
        walk_hierarchy(&query, include_directories, |relative| self.list_dir(relative))
    }

    fn upload_file(&self, local: &Path, key: &str) -> Result<()> {
        self.ensure_root()?;
        let path = self.remote_path(key);
        self.ensure_parent(&path)?;
        let mut source = std::fs::File::open(local)?;
        let copied = self.with_sftp(|sftp| {
            let mut file = sftp
                .create(&path)
                .map_err(|e| map_ssh_error("SFTP create", key, e))?;
            Ok(std::io::copy(&mut source, &mut file)?)
        })?;
        debug!(key = %key, local = %local.display(), bytes = copied, "SFTP upload complete");
        Ok(())
    }

    fn download_file(&self, key: &str, local: &Path) -> Result<()> {
        self.ensure_root()?;
        let path = self.remote_path(key);
        let copied = self.with_sftp(|sftp| {
            let mut file = sftp.open(&path).map_err(|e| map_ssh_error("SFTP open", key, e))?;
            Ok(stream_atomic(local, &mut file)?)
        })?;
        debug!(key = %key, local = %local.display(), bytes = copied, "SFTP download complete");
        Ok(())
    }
}

fn is_no_such_file(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::SFTP(FX_NO_SUCH_FILE))
}

fn map_ssh_error(context: &str, key: &str, err: ssh2::Error) -> StorageError {
    if is_no_such_file(&err) {
        StorageError::NotFound(key.to_string())
    } else {
        ssh_failure(format!("{} {}", context, key), err)
    }
}

/// Session-level libssh2 errors mean the transport is gone and surface as
/// I/O errors. SFTP status codes are answers from a live server.
fn ssh_failure(context: String, err: ssh2::Error) -> StorageError {
    match err.code() {
        ErrorCode::Session(_) => StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            format!("{}: {}", context, err),
        )),
        _ => StorageError::backend(context, err),
    }
}

fn drops_connection(err: &StorageError) -> bool {
    matches!(err, StorageError::Io(_))
}

/// Whether `path` exists and is a directory.
fn stat_dir(sftp: &Sftp, path: &Path) -> Result<bool> {
    match sftp.stat(path) {
        Ok(stat) => Ok(stat.is_dir()),
        Err(e) if is_no_such_file(&e) => Ok(false),
        Err(e) => Err(ssh_failure(format!("SFTP stat {}", path.display()), e)),
    }
}

/// Create `path` and every missing parent.
fn make_dirs(sftp: &Sftp, path: &str) -> Result<()> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(());
    }
    let mut levels = ancestors(trimmed);
    levels.push(trimmed);
    for level in levels {
        let absolute = PathBuf::from(format!("/{}", level));
        if !stat_dir(sftp, &absolute)? {
            sftp.mkdir(&absolute, DIR_MODE)
                .map_err(|e| ssh_failure(format!("SFTP mkdir {}", absolute.display()), e))?;
        }
    }
    Ok(())
}

fn method_type(name: &str) -> Option<MethodType> {
    let method = match name {
        "kex" => MethodType::Kex,
        "hostkey" => MethodType::HostKey,
        "crypt_cs" => MethodType::CryptCs,
        "crypt_sc" => MethodType::CryptSc,
        "mac_cs" => MethodType::MacCs,
        "mac_sc" => MethodType::MacSc,
        "comp_cs" => MethodType::CompCs,
        "comp_sc" => MethodType::CompSc,
        "lang_cs" => MethodType::LangCs,
        "lang_sc" => MethodType::LangSc,
        _ => return None,
    };
    Some(method)
}

/// Flatten the `methods` option into `(method, preference)` pairs.
///
/// Accepts flat names (`kex`, `crypt_cs`, ...) as well as the nested
/// `client_to_server` / `server_to_client` tables with `crypt`, `comp`,
/// `mac` and `lang` entries.
pub fn parse_methods(value: &serde_json::Value) -> Result<Vec<(String, String)>> {
    let table = value.as_object().ok_or_else(|| {
        StorageError::Configuration("option 'methods' must be a table".to_string())
    })?;
    let mut methods = Vec::new();
    for (name, pref) in table {
        match (name.as_str(), pref) {
            ("client_to_server" | "server_to_client", serde_json::Value::Object(inner)) => {
                let suffix = if name == "client_to_server" { "cs" } else { "sc" };
                for (kind, pref) in inner {
                    methods.push((format!("{}_{}", kind, suffix), preference(pref)?));
                }
            }
            _ => methods.push((name.clone(), preference(pref)?)),
        }
    }
    for (name, _) in &methods {
        if method_type(name).is_none() {
            return Err(StorageError::Configuration(format!(
                "unknown SSH method type '{}'",
                name
            )));
        }
    }
    Ok(methods)
}

fn preference(value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Array(items) => Ok(items
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(",")),
        _ => Err(StorageError::Configuration(
            "SSH method preferences must be strings".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_methods() {
        let methods = parse_methods(&json!({
            "kex": "diffie-hellman-group14-sha1",
            "client_to_server": {"crypt": ["aes256-ctr", "aes128-ctr"], "comp": "none"},
            "server_to_client": {"mac": "hmac-sha2-256"}
        }))
        .unwrap();
        assert!(methods.contains(&("kex".to_string(), "diffie-hellman-group14-sha1".to_string())));
        assert!(methods.contains(&("crypt_cs".to_string(), "aes256-ctr,aes128-ctr".to_string())));
        assert!(methods.contains(&("comp_cs".to_string(), "none".to_string())));
        assert!(methods.contains(&("mac_sc".to_string(), "hmac-sha2-256".to_string())));
        assert_eq!(methods.len(), 4);
    }

    #[test]
    fn test_parse_methods_rejects_unknown() {
        assert!(parse_methods(&json!({"cipher": "aes"})).is_err());
        assert!(parse_methods(&json!("kex")).is_err());
        assert!(parse_methods(&json!({"kex": 3})).is_err());
    }

    #[test]
    fn test_error_classification() {
        let missing = map_ssh_error("SFTP stat", "a.txt", ssh2::Error::new(ErrorCode::SFTP(FX_NO_SUCH_FILE), "no such file"));
        assert!(missing.is_not_found());
        assert!(!drops_connection(&missing));

        // permission denied leaves the session usable
        let denied = map_ssh_error("SFTP unlink", "a.txt", ssh2::Error::new(ErrorCode::SFTP(3), "permission denied"));
        assert!(denied.is_backend_failure());
        assert!(denied.to_string().contains("permission denied"));
        assert!(!drops_connection(&denied));

        let lost = map_ssh_error("SFTP open", "a.txt", ssh2::Error::new(ErrorCode::Session(-7), "unable to send"));
        assert!(matches!(lost, StorageError::Io(_)));
        assert!(drops_connection(&lost));
    }

    #[test]
    fn test_remote_paths() {
        let adapter = SftpAdapter::new(SftpConfig {
            host: "ssh.example.com".to_string(),
            port: DEFAULT_PORT,
            username: "deploy".to_string(),
            password: None,
            public_key: None,
            private_key: None,
            methods: Vec::new(),
            root: "/srv/files".to_string(),
            create: false,
        });
        assert_eq!(adapter.remote_path("/a//b.txt"), PathBuf::from("/srv/files/a/b.txt"));
        assert!(!adapter.capabilities().time_aware);
        assert!(adapter.atime("a.txt").unwrap_err().is_unsupported());
    }
}
