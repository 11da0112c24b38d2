use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use bnrepo::{RepositoryLinker, RepositoryManager, UrlOptions};

const DEFAULT_CONFIG_PATH: &str = "repositories.toml";

const USAGE: &str = "usage: bnrepo [--config FILE] <command>

commands:
  ls URI [--dirs]           list keys below URI
  cat URI                   write the content to stdout
  put LOCAL URI [--force]   upload a local file
  get URI LOCAL [--force]   download to a local file
  cp SRC DST                copy between repositories
  mv SRC DST                move (native rename inside one repository)
  rm URI                    delete
  url URI                   print the download URL
  stat URI                  print file metadata";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    List { uri: String, dirs: bool },
    Cat { uri: String },
    Put { local: PathBuf, uri: String, force: bool },
    Get { uri: String, local: PathBuf, force: bool },
    Copy { source: String, target: String },
    Move { source: String, target: String },
    Remove { uri: String },
    Url { uri: String },
    Stat { uri: String },
}

#[derive(Debug, PartialEq, Eq)]
struct Invocation {
    config: PathBuf,
    command: Command,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let default_config = std::env::var("BNREPO_CONFIG").ok();
    let invocation = parse_args(&args, default_config.as_deref())?;

    let manager = Arc::new(RepositoryManager::new());
    manager
        .import_toml_file(&invocation.config)
        .with_context(|| format!("loading {}", invocation.config.display()))?;
    debug!(repositories = ?manager.repository_ids(), "Configuration loaded");

    run(&RepositoryLinker::new(manager), invocation.command)
}

fn run(linker: &RepositoryLinker, command: Command) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    match command {
        Command::List { uri, dirs } => {
            for key in linker.keys(&uri, dirs)? {
                writeln!(out, "{}", key)?;
            }
        }
        Command::Cat { uri } => {
            out.write_all(&linker.read(&uri)?)?;
        }
        Command::Put { local, uri, force } => {
            linker
                .upload(&local, &uri, force)
                .with_context(|| format!("uploading {} to {}", local.display(), uri))?;
        }
        Command::Get { uri, local, force } => {
            linker
                .download(&uri, &local, force)
                .with_context(|| format!("downloading {} to {}", uri, local.display()))?;
        }
        Command::Copy { source, target } => {
            linker
                .copy(&source, &target)
                .with_context(|| format!("copying {} to {}", source, target))?;
        }
        Command::Move { source, target } => {
            linker
                .rename(&source, &target)
                .with_context(|| format!("moving {} to {}", source, target))?;
        }
        Command::Remove { uri } => linker.delete(&uri)?,
        Command::Url { uri } => {
            writeln!(out, "{}", linker.url(&uri, None, UrlOptions::default())?)?;
        }
        Command::Stat { uri } => {
            let file = linker.file(&uri)?;
            let meta = file.metadata()?;
            writeln!(out, "key:          {}", meta.key)?;
            writeln!(out, "size:         {} ({})", meta.size, file.human_size()?)?;
            writeln!(out, "content-type: {}", meta.content_type)?;
            writeln!(out, "mtime:        {}", meta.mtime.to_rfc3339())?;
            if let Some(ctime) = meta.ctime {
                writeln!(out, "ctime:        {}", ctime.to_rfc3339())?;
            }
            if let Some(atime) = meta.atime {
                writeln!(out, "atime:        {}", atime.to_rfc3339())?;
            }
            writeln!(out, "sha256:       {}", linker.checksum(&uri)?)?;
        }
    }
    Ok(())
}

fn parse_args(args: &[String], default_config: Option<&str>) -> anyhow::Result<Invocation> {
    let mut config = None;
    let mut flags = Vec::new();
    let mut positional = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let value = iter.next().context("--config needs a file")?;
                config = Some(PathBuf::from(value));
            }
            "-h" | "--help" => bail!("{}", USAGE),
            flag if flag.starts_with("--") => flags.push(flag.to_string()),
            _ => positional.push(arg.clone()),
        }
    }

    let config = config
        .or_else(|| default_config.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let Some((name, rest)) = positional.split_first() else {
        bail!("{}", USAGE);
    };
    let allowed: &[&str] = match name.as_str() {
        "ls" => &["--dirs"],
        "put" | "get" => &["--force"],
        _ => &[],
    };
    if let Some(flag) = flags.iter().find(|f| !allowed.contains(&f.as_str())) {
        bail!("unknown option {} for {}", flag, name);
    }
    let has = |flag: &str| flags.iter().any(|f| f == flag);

    let command = match (name.as_str(), rest) {
        ("ls", [uri]) => Command::List {
            uri: uri.clone(),
            dirs: has("--dirs"),
        },
        ("cat", [uri]) => Command::Cat { uri: uri.clone() },
        ("put", [local, uri]) => Command::Put {
            local: PathBuf::from(local),
            uri: uri.clone(),
            force: has("--force"),
        },
        ("get", [uri, local]) => Command::Get {
            uri: uri.clone(),
            local: PathBuf::from(local),
            force: has("--force"),
        },
        ("cp", [source, target]) => Command::Copy {
            source: source.clone(),
            target: target.clone(),
        },
        ("mv", [source, target]) => Command::Move {
            source: source.clone(),
            target: target.clone(),
        },
        ("rm", [uri]) => Command::Remove { uri: uri.clone() },
        ("url", [uri]) => Command::Url { uri: uri.clone() },
        ("stat", [uri]) => Command::Stat { uri: uri.clone() },
        _ => bail!("{}", USAGE),
    };
    Ok(Invocation { config, command })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bnrepo::RepositoryConfig;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_parse_commands() {
        let inv = parse_args(&args("ls bnrepo://files/sub/ --dirs"), None).unwrap();
        assert_eq!(inv.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(
            inv.command,
            Command::List {
                uri: "bnrepo://files/sub/".into(),
                dirs: true
            }
        );

        let inv = parse_args(&args("--force put a.bin bnrepo://files/a.bin"), None).unwrap();
        assert_eq!(
            inv.command,
            Command::Put {
                local: PathBuf::from("a.bin"),
                uri: "bnrepo://files/a.bin".into(),
                force: true
            }
        );

        let inv = parse_args(&args("mv bnrepo://a/x bnrepo://b/x"), None).unwrap();
        assert!(matches!(inv.command, Command::Move { .. }));
    }

    #[test]
    fn test_parse_config_sources() {
        let inv = parse_args(&args("stat bnrepo://f/a"), Some("/etc/bnrepo.toml")).unwrap();
        assert_eq!(inv.config, PathBuf::from("/etc/bnrepo.toml"));

        let inv = parse_args(&args("--config local.toml stat bnrepo://f/a"), Some("/etc/x")).unwrap();
        assert_eq!(inv.config, PathBuf::from("local.toml"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&[], None).is_err());
        assert!(parse_args(&args("cat"), None).is_err());
        assert!(parse_args(&args("cp bnrepo://a/x"), None).is_err());
        assert!(parse_args(&args("rm bnrepo://a/x --force"), None).is_err());
        assert!(parse_args(&args("frobnicate x"), None).is_err());
        assert!(parse_args(&args("ls x --config"), None).is_err());
    }

    #[test]
    fn test_run_copy_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(RepositoryManager::new());
        manager
            .add_repository(RepositoryConfig::local("files", dir.path().to_string_lossy()), false)
            .unwrap();
        let linker = RepositoryLinker::new(manager);
        linker.write("bnrepo://files/a.txt", b"a", false).unwrap();

        run(
            &linker,
            Command::Copy {
                source: "bnrepo://files/a.txt".into(),
                target: "bnrepo://files/b.txt".into(),
            },
        )
        .unwrap();
        assert!(dir.path().join("b.txt").is_file());

        run(&linker, Command::Remove { uri: "bnrepo://files/a.txt".into() }).unwrap();
        assert!(!dir.path().join("a.txt").exists());
        assert!(run(&linker, Command::Remove { uri: "bnrepo://files/a.txt".into() }).is_err());
    }
}
