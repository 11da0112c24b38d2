#[cfg(feature = "ftp")]
pub mod ftp;
pub mod local;
pub mod s3;
#[cfg(feature = "sftp")]
pub mod sftp;

use bnrepo_common::backend::BackendAdapter;
use bnrepo_common::config::{BackendType, RepositoryConfig};
use bnrepo_common::error::{Result, StorageError};

use self::local::LocalAdapter;
use self::s3::{S3Adapter, S3Config};

/// Construct a backend adapter from a repository configuration.
///
/// S3 credentials missing from the configuration are read from
/// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`.
pub fn from_config(config: &RepositoryConfig) -> Result<Box<dyn BackendAdapter>> {
    config.validate()?;

    match config.backend {
        BackendType::Local | BackendType::LocalUrlAware => {
            let url_aware = config.backend == BackendType::LocalUrlAware
                || config.option_bool("url_aware").unwrap_or(false);
            Ok(Box::new(
                LocalAdapter::new(config.root_dir(), config.create).with_urls(url_aware),
            ))
        }
        BackendType::S3 => {
            let access_key_id = config
                .access_key
                .clone()
                .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
                .unwrap_or_default();
            let secret_access_key = config
                .secret_key
                .clone()
                .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
                .unwrap_or_default();

            if access_key_id.is_empty() || secret_access_key.is_empty() {
                return Err(StorageError::Configuration(format!(
                    "S3 credentials not found for repository '{}'",
                    config.id
                )));
            }

            Ok(Box::new(S3Adapter::new(S3Config {
                bucket: config.bucket.clone().unwrap_or_default(),
                root: config.dir.clone().unwrap_or_default(),
                region: config.region.clone().unwrap_or_default(),
                endpoint: config.endpoint.clone(),
                access_key_id,
                secret_access_key,
                default_acl: config
                    .option_str("default_acl")
                    .unwrap_or(s3::DEFAULT_ACL)
                    .to_string(),
                storage_class: config.option_str("storage_class").map(str::to_string),
                create: config.create,
            })?))
        }
        BackendType::Ftp => ftp_adapter(config),
        BackendType::Sftp => sftp_adapter(config),
    }
}

#[cfg(feature = "ftp")]
fn ftp_adapter(config: &RepositoryConfig) -> Result<Box<dyn BackendAdapter>> {
    Ok(Box::new(ftp::FtpAdapter::new(ftp::FtpConfig {
        host: config.host.clone().unwrap_or_default(),
        port: config.port.unwrap_or(ftp::DEFAULT_PORT),
        username: config
            .username
            .clone()
            .unwrap_or_else(|| "anonymous".to_string()),
        password: config.password.clone().unwrap_or_default(),
        root: config.root_dir().to_string(),
        create: config.create,
        passive: config.option_bool("passive").unwrap_or(true),
    })))
}

#[cfg(not(feature = "ftp"))]
fn ftp_adapter(config: &RepositoryConfig) -> Result<Box<dyn BackendAdapter>> {
    Err(StorageError::Configuration(format!(
        "repository '{}' needs FTP support, which this build does not include",
        config.id
    )))
}

#[cfg(feature = "sftp")]
fn sftp_adapter(config: &RepositoryConfig) -> Result<Box<dyn BackendAdapter>> {
    let methods = match config.options.get("methods") {
        Some(value) => sftp::parse_methods(value)?,
        None => Vec::new(),
    };
    Ok(Box::new(sftp::SftpAdapter::new(sftp::SftpConfig {
        host: config.host.clone().unwrap_or_default(),
        port: config.port.unwrap_or(sftp::DEFAULT_PORT),
        username: config.username.clone().unwrap_or_default(),
        password: config.password.clone(),
        public_key: config.public_key.clone(),
        private_key: config.private_key.clone(),
        methods,
        root: config.root_dir().to_string(),
        create: config.create,
    })))
}

#[cfg(not(feature = "sftp"))]
fn sftp_adapter(config: &RepositoryConfig) -> Result<Box<dyn BackendAdapter>> {
    Err(StorageError::Configuration(format!(
        "repository '{}' needs SFTP support, which this build does not include",
        config.id
    )))
}

/// Absolute server path for a key below `root`.
#[cfg(any(feature = "ftp", feature = "sftp"))]
pub(crate) fn remote_path(root: &str, key: &str) -> String {
    format!("/{}", bnrepo_common::key::normalize_path(root, key))
}

#[cfg(any(feature = "ftp", feature = "sftp"))]
pub(crate) fn parent_path(path: &str) -> String {
    format!("/{}", bnrepo_common::key::dirname(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(any(feature = "ftp", feature = "sftp"))]
    #[test]
    fn test_remote_path() {
        assert_eq!(remote_path("/", "a/b.txt"), "/a/b.txt");
        assert_eq!(remote_path("/pub/", "//a//b.txt/"), "/pub/a/b.txt");
        assert_eq!(remote_path("/pub", ""), "/pub");
        assert_eq!(remote_path("/", ""), "/");
    }

    #[cfg(any(feature = "ftp", feature = "sftp"))]
    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/pub/a/b.txt"), "/pub/a");
        assert_eq!(parent_path("/b.txt"), "/");
    }

    #[test]
    fn test_local_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RepositoryConfig::local("files", dir.path().to_string_lossy());
        let adapter = from_config(&cfg).unwrap();
        assert_eq!(adapter.backend_name(), "local");
        assert!(!adapter.capabilities().url_aware);

        let mut cfg = cfg;
        cfg.backend = BackendType::LocalUrlAware;
        assert!(from_config(&cfg).unwrap().capabilities().url_aware);
    }

    #[test]
    fn test_s3_from_config_requires_credentials() {
        let mut cfg = RepositoryConfig::new("assets", BackendType::S3);
        cfg.bucket = Some("assets".to_string());
        cfg.region = Some("eu-west-1".to_string());
        cfg.access_key = Some("AKIA".to_string());
        cfg.secret_key = Some(String::new());
        let err = from_config(&cfg).err().unwrap();
        assert!(matches!(err, StorageError::Configuration(_)));

        cfg.secret_key = Some("secret".to_string());
        let adapter = from_config(&cfg).unwrap();
        assert_eq!(adapter.backend_name(), "s3");
        assert!(adapter.capabilities().url_aware);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = RepositoryConfig::new("ftp", BackendType::Ftp);
        assert!(matches!(
            from_config(&cfg).err().unwrap(),
            StorageError::Configuration(_)
        ));
    }
}
