//! Registry of repository configurations and the repositories built from
//! them. Repositories are constructed on first access and cached until the
//! registry is reset.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use bnrepo_common::config::RepositoryConfig;
use bnrepo_common::error::{Result, StorageError};

use crate::repository::Repository;

#[derive(Default)]
pub struct RepositoryManager {
    configs: RwLock<HashMap<String, RepositoryConfig>>,
    repositories: RwLock<HashMap<String, Arc<Repository>>>,
}

impl RepositoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached repository for `id`, built from its configuration on first use.
    pub fn get_repository(&self, id: &str) -> Result<Arc<Repository>> {
        if let Some(repo) = self.repositories.read().unwrap().get(id) {
            return Ok(Arc::clone(repo));
        }
        let repo = Arc::new(self.build(id)?);
        let mut repositories = self.repositories.write().unwrap();
        Ok(Arc::clone(repositories.entry(id.to_string()).or_insert(repo)))
    }

    /// Rebuild the repository for `id` even if one is cached.
    pub fn get_repository_forced(&self, id: &str) -> Result<Arc<Repository>> {
        let repo = Arc::new(self.build(id)?);
        self.repositories
            .write()
            .unwrap()
            .insert(id.to_string(), Arc::clone(&repo));
        Ok(repo)
    }

    fn build(&self, id: &str) -> Result<Repository> {
        let config = self
            .configs
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("repository '{}'", id)))?;
        Repository::new(config)
    }

    pub fn add_repository(&self, config: RepositoryConfig, overwrite: bool) -> Result<()> {
        self.add_repositories(vec![config], overwrite)
    }

    /// Register configurations. Without `overwrite`, an id that is already
    /// registered (or repeated within `configs`) rejects the whole batch.
    /// Replacing a configuration drops its cached repository.
    pub fn add_repositories<I>(&self, configs: I, overwrite: bool) -> Result<()>
    where
        I: IntoIterator<Item = RepositoryConfig>,
    {
        let configs: Vec<RepositoryConfig> = configs.into_iter().collect();
        let mut registered = self.configs.write().unwrap();

        let mut seen = HashSet::new();
        for config in &configs {
            if config.id.is_empty() {
                return Err(StorageError::Configuration(
                    "repository id must not be empty".to_string(),
                ));
            }
            let duplicate = !seen.insert(config.id.as_str()) || registered.contains_key(&config.id);
            if duplicate && !overwrite {
                return Err(StorageError::AlreadyExists(format!(
                    "Repository with id {} already exists - use overwrite to replace it",
                    config.id
                )));
            }
        }

        let mut repositories = self.repositories.write().unwrap();
        for config in configs {
            debug!(repository = %config.id, backend = %config.backend, "Repository registered");
            repositories.remove(&config.id);
            registered.insert(config.id.clone(), config);
        }
        Ok(())
    }

    /// Register configurations keyed by id. A config without an `id` takes
    /// its key; an explicit `id` wins over the key.
    pub fn add_repository_table(
        &self,
        table: BTreeMap<String, RepositoryConfig>,
        overwrite: bool,
    ) -> Result<()> {
        let configs = table.into_iter().map(|(key, mut config)| {
            if config.id.is_empty() {
                config.id = key;
            }
            config
        });
        self.add_repositories(configs, overwrite)
    }

    /// Register an already built repository, e.g. one with a custom adapter.
    pub fn insert_repository(&self, repository: Repository, overwrite: bool) -> Result<Arc<Repository>> {
        self.add_repository(repository.config().clone(), overwrite)?;
        let repo = Arc::new(repository);
        self.repositories
            .write()
            .unwrap()
            .insert(repo.id().to_string(), Arc::clone(&repo));
        Ok(repo)
    }

    /// Load a TOML document whose top-level tables are repository
    /// configurations keyed by id. Returns the number of repositories added.
    pub fn import_toml_str(&self, text: &str) -> Result<usize> {
        let table: BTreeMap<String, RepositoryConfig> = toml::from_str(text)
            .map_err(|e| StorageError::Configuration(format!("invalid repository TOML: {}", e)))?;
        let count = table.len();
        self.add_repository_table(table, false)?;
        Ok(count)
    }

    pub fn import_toml_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(StorageError::NotFound(format!(
                "File \"{}\" not found",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)?;
        let count = self.import_toml_str(&text).map_err(|e| match e {
            StorageError::Configuration(msg) => {
                StorageError::Configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        info!(path = %path.display(), repositories = count, "Imported repository configuration");
        Ok(count)
    }

    pub fn config(&self, id: &str) -> Option<RepositoryConfig> {
        self.configs.read().unwrap().get(id).cloned()
    }

    /// Registered ids, sorted.
    pub fn repository_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.configs.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Forget every configuration and cached repository.
    pub fn reset(&self) {
        self.configs.write().unwrap().clear();
        self.repositories.write().unwrap().clear();
    }
}
