mod common;

use std::fs;
use std::sync::Arc;

use bnrepo::{BackendType, Download, Repository, RepositoryConfig, StorageError, UrlOptions};
use common::{local_config, populate};

fn repository(dir: &tempfile::TempDir) -> Arc<Repository> {
    Arc::new(Repository::new(local_config("files", dir.path())).unwrap())
}

#[test]
fn test_listing_examples() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir);
    populate(&repo);

    assert_eq!(
        repo.keys(None, false).unwrap(),
        vec!["a.txt", "sub/b.txt", "sub/c.txt", "sub/deep/d.txt"]
    );
    assert_eq!(
        repo.keys(None, true).unwrap(),
        vec!["a.txt", "sub", "sub/b.txt", "sub/c.txt", "sub/deep", "sub/deep/d.txt"]
    );
    assert_eq!(repo.keys(Some("sub/"), false).unwrap(), vec!["b.txt", "c.txt", "deep/d.txt"]);
    assert_eq!(
        repo.keys(Some("sub/"), true).unwrap(),
        vec!["b.txt", "c.txt", "deep", "deep/d.txt"]
    );
    assert!(repo.keys(Some("missing/"), true).unwrap().is_empty());
}

#[test]
fn test_fragment_search() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir);
    populate(&repo);
    repo.write("other/sub_copy/x.txt", b"x", false).unwrap();

    assert_eq!(
        repo.keys(Some("sub"), false).unwrap(),
        vec!["sub/b.txt", "sub/c.txt", "sub/deep/d.txt"]
    );
    assert_eq!(repo.keys(Some("sub/de"), true).unwrap(), vec!["deep", "deep/d.txt"]);
    assert_eq!(repo.keys(Some("other/copy"), false).unwrap(), vec!["sub_copy/x.txt"]);
}

#[test]
fn test_write_guards_and_rename() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir);

    repo.write("docs/report.txt", b"v1", false).unwrap();
    assert!(repo.write("docs/report.txt", b"v2", false).unwrap_err().is_already_exists());
    assert_eq!(repo.read("docs/report.txt").unwrap().as_ref(), b"v1");
    repo.write("docs/report.txt", b"v2", true).unwrap();
    assert_eq!(repo.read("docs/report.txt").unwrap().as_ref(), b"v2");

    repo.write("docs/other.txt", b"o", false).unwrap();
    assert!(repo.rename("docs/report.txt", "docs/other.txt").unwrap_err().is_already_exists());
    repo.rename("docs/report.txt", "archive/2024/report.txt").unwrap();
    assert!(!repo.has("docs/report.txt").unwrap());
    assert_eq!(repo.read("archive/2024/report.txt").unwrap().as_ref(), b"v2");
    assert!(repo.rename("docs/report.txt", "x.txt").unwrap_err().is_not_found());

    assert!(repo.delete("nope.txt").unwrap_err().is_not_found());
    repo.delete("docs/other.txt").unwrap();
    assert!(!dir.path().join("docs/other.txt").exists());
}

#[test]
fn test_root_keys_name_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir);
    repo.write("keep.txt", b"k", false).unwrap();

    for key in ["", "/", ".", "..", "../..", "./"] {
        assert!(matches!(repo.has(key), Err(StorageError::InvalidUri(_))));
        assert!(matches!(repo.delete(key), Err(StorageError::InvalidUri(_))));
        assert!(matches!(repo.size(key), Err(StorageError::InvalidUri(_))));
        assert!(matches!(repo.write(key, b"x", true), Err(StorageError::InvalidUri(_))));
    }
    assert!(matches!(
        repo.rename("keep.txt", ".."),
        Err(StorageError::InvalidUri(_))
    ));

    assert!(dir.path().is_dir());
    assert_eq!(repo.read("keep.txt").unwrap().as_ref(), b"k");
    assert_eq!(repo.keys(None, false).unwrap(), vec!["keep.txt"]);
}

#[test]
fn test_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir);
    repo.write("hello.txt", b"hello", false).unwrap();

    assert_eq!(repo.size("hello.txt").unwrap(), 5);
    assert_eq!(
        repo.checksum("hello.txt").unwrap(),
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    assert!(repo.content_type("hello.txt").unwrap().starts_with("text/plain"));
    assert!(repo.mtime("hello.txt").unwrap() <= chrono::Utc::now());
    assert!(repo.ctime("hello.txt").is_ok());
    assert!(repo.atime("hello.txt").is_ok());
    assert!(repo.size("missing.txt").unwrap_err().is_not_found());
    assert!(repo.checksum("missing.txt").unwrap_err().is_not_found());

    let file = repo.file("hello.txt").unwrap();
    assert_eq!(file.name(), "hello.txt");
    assert_eq!(file.human_size().unwrap(), "5 bytes");
    let meta = file.metadata().unwrap();
    assert_eq!(meta.size, 5);
    assert!(meta.ctime.is_some());
    assert!(repo.file("missing.txt").unwrap_err().is_not_found());
}

#[test]
fn test_append() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir);

    repo.append("log/app.log", b"C1").unwrap();
    repo.append("log/app.log", b"C2").unwrap();
    assert_eq!(repo.read("log/app.log").unwrap().as_ref(), b"C1C2");
}

#[test]
fn test_upload_and_download_guards() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let repo = repository(&dir);

    let local = work.path().join("input.bin");
    fs::write(&local, b"payload").unwrap();
    repo.upload(&local, "in/input.bin", false).unwrap();
    assert_eq!(repo.read("in/input.bin").unwrap().as_ref(), b"payload");

    fs::write(&local, b"changed").unwrap();
    assert!(repo.upload(&local, "in/input.bin", false).unwrap_err().is_already_exists());
    repo.upload(&local, "in/input.bin", true).unwrap();
    assert_eq!(repo.read("in/input.bin").unwrap().as_ref(), b"changed");
    assert!(repo
        .upload(&work.path().join("absent"), "x", false)
        .unwrap_err()
        .is_not_found());

    let existing = work.path().join("existing.bin");
    fs::write(&existing, b"keep me").unwrap();
    assert!(repo.download("in/input.bin", &existing, false).unwrap_err().is_already_exists());
    assert_eq!(fs::read(&existing).unwrap(), b"keep me");

    repo.download("in/input.bin", &existing, true).unwrap();
    assert_eq!(fs::read(&existing).unwrap(), b"changed");

    let fresh = work.path().join("fresh.bin");
    assert!(repo.download("missing", &fresh, false).unwrap_err().is_not_found());
    assert!(!fresh.exists());
}

#[test]
fn test_url_templates() {
    let dir = tempfile::tempdir().unwrap();
    let secure = UrlOptions {
        secure: Some(true),
        ..Default::default()
    };

    let plain = Repository::new(local_config("plain", dir.path())).unwrap();
    plain.write("sub/dir/file.txt", b"x", false).unwrap();
    assert!(plain.url("sub/dir/file.txt", None, secure.clone()).is_err());
    assert_eq!(
        plain
            .url(
                "sub/dir/file.txt",
                Some("{SCHEME}://cdn.example.com/{PATH}/{FILENAME}?p={FULL_PATH}"),
                secure.clone()
            )
            .unwrap(),
        "https://cdn.example.com/sub/dir/file.txt?p=sub/dir/file.txt"
    );

    let config = RepositoryConfig::new("public", BackendType::LocalUrlAware)
        .with_download_url("{SCHEME}://files.example.com/{FULL_PATH}");
    let config = RepositoryConfig {
        dir: Some(dir.path().to_string_lossy().into_owned()),
        ..config
    };
    let public = Repository::new(config).unwrap();
    assert_eq!(
        public
            .url(
                "sub/dir/file.txt",
                None,
                UrlOptions {
                    secure: Some(false),
                    ..Default::default()
                }
            )
            .unwrap(),
        "http://files.example.com/sub/dir/file.txt"
    );

    // key text resembling a placeholder survives expansion
    assert_eq!(
        public
            .url(
                "docs/{FILENAME}.txt",
                None,
                UrlOptions {
                    secure: Some(true),
                    ..Default::default()
                }
            )
            .unwrap(),
        "https://files.example.com/docs/{FILENAME}.txt"
    );
    assert_eq!(
        plain
            .url("a/{PATH}", Some("http://cdn/{FULL_PATH}"), secure)
            .unwrap(),
        "http://cdn/a/{PATH}"
    );
}

#[test]
fn test_stream_download_headers() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir);
    repo.write("report.txt", b"hello", false).unwrap();

    match repo.stream_download("report.txt", Some("r.txt"), None).unwrap() {
        Download::Content { headers, body } => {
            assert_eq!(body.as_ref(), b"hello");
            let header = |name: &str| {
                headers
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v.clone())
            };
            assert_eq!(header("Content-Length").as_deref(), Some("5"));
            assert_eq!(
                header("Content-Disposition").as_deref(),
                Some("attachment; filename=\"r.txt\"")
            );
            assert_eq!(header("Content-Transfer-Encoding").as_deref(), Some("binary"));
        }
        Download::Redirect { location } => panic!("unexpected redirect to {}", location),
    }
    assert!(repo.stream_download("missing.txt", None, None).unwrap_err().is_not_found());
}
