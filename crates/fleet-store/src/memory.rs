//! In-memory configuration store
//!
//! Keeps every config in a map guarded by an async lock. Used by the
//! controller when no external store is configured, and as the reference
//! implementation of the versioning rules.

use crate::error::StoreError;
use crate::store_trait::ConfigStoreTrait;
use fleet_model::Config;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    configs: Arc<RwLock<BTreeMap<String, Config>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a YAML list of configs. Versions in the file are
    /// ignored; every seeded config starts at version 1.
    pub fn from_yaml(yaml: &str) -> Result<Self, StoreError> {
        let seeded: Vec<Config> = serde_yaml::from_str(yaml)?;
        let mut configs = BTreeMap::new();
        for mut config in seeded {
            if configs.contains_key(&config.name) {
                return Err(StoreError::AlreadyExists(config.name));
            }
            config.version = 1;
            configs.insert(config.name.clone(), config);
        }
        info!("Seeded in-memory store with {} configs", configs.len());
        Ok(Self { configs: Arc::new(RwLock::new(configs)) })
    }

    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml(&raw)
    }
}

#[async_trait::async_trait]
impl ConfigStoreTrait for MemoryStore {
    async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.configs.read().await.keys().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Config, StoreError> {
        self.configs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn create(&self, mut config: Config) -> Result<Config, StoreError> {
        let mut configs = self.configs.write().await;
        if configs.contains_key(&config.name) {
            return Err(StoreError::AlreadyExists(config.name));
        }
        config.version = 1;
        configs.insert(config.name.clone(), config.clone());
        debug!("Created config {} at version 1", config.name);
        Ok(config)
    }

    async fn update(&self, config: &Config) -> Result<Config, StoreError> {
        let mut configs = self.configs.write().await;
        let stored = configs
            .get_mut(&config.name)
            .ok_or_else(|| StoreError::NotFound(config.name.clone()))?;
        if stored.version != config.version {
            return Err(StoreError::DirtyWrite {
                name: config.name.clone(),
                expected: config.version,
                found: stored.version,
            });
        }
        let mut next = config.clone();
        next.version += 1;
        *stored = next.clone();
        debug!("Updated config {} to version {}", next.name, next.version);
        Ok(next)
    }

    async fn delete(&self, name: &str, version: u64) -> Result<(), StoreError> {
        let mut configs = self.configs.write().await;
        let found = configs
            .get(name)
            .map(|c| c.version)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if found != version {
            return Err(StoreError::DirtyWrite { name: name.to_string(), expected: version, found });
        }
        configs.remove(name);
        Ok(())
    }
}
