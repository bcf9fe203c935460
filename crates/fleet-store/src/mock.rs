//! Mock ConfigStore for unit testing
//!
//! Wraps the in-memory store and lets tests inject the failures a remote
//! store produces: concurrent writers (dirty writes) and outages.

use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::store_trait::ConfigStoreTrait;
use fleet_model::Config;
use std::sync::{Arc, Mutex};

/// Mock ConfigStore for testing
#[derive(Debug, Clone, Default)]
pub struct MockConfigStore {
    pub(crate) inner: MemoryStore,
    /// Number of upcoming updates that are rejected as dirty writes
    pub(crate) dirty_writes: Arc<Mutex<u32>>,
    pub(crate) unavailable: Arc<Mutex<bool>>,
    pub(crate) update_calls: Arc<Mutex<u32>>,
}

impl MockConfigStore {
    /// Create a new empty mock store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a config to the mock store (for test setup)
    pub async fn add_config(&self, config: Config) -> Config {
        self.inner.create(config).await.unwrap()
    }

    /// Reject the next `count` updates as if another writer got there first.
    /// The rejected write also bumps the stored version, like a real race.
    pub fn fail_next_updates(&self, count: u32) {
        *self.dirty_writes.lock().unwrap() = count;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    pub fn update_calls(&self) -> u32 {
        *self.update_calls.lock().unwrap()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if *self.unavailable.lock().unwrap() {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConfigStoreTrait for MockConfigStore {
    async fn list(&self) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        self.inner.list().await
    }

    async fn get(&self, name: &str) -> Result<Config, StoreError> {
        self.check_available()?;
        self.inner.get(name).await
    }

    async fn create(&self, config: Config) -> Result<Config, StoreError> {
        self.check_available()?;
        self.inner.create(config).await
    }

    async fn update(&self, config: &Config) -> Result<Config, StoreError> {
        self.check_available()?;
        *self.update_calls.lock().unwrap() += 1;
        let inject = {
            let mut remaining = self.dirty_writes.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        };
        if inject {
            // Simulate a concurrent writer: bump the stored version first.
            let stored = self.inner.get(&config.name).await?;
            self.inner.update(&stored).await?;
        }
        self.inner.update(config).await
    }

    async fn delete(&self, name: &str, version: u64) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner.delete(name, version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_dirty_write() {
        let store = MockConfigStore::new();
        let config = store.add_config(Config::new("fleet")).await;

        store.fail_next_updates(1);
        let err = store.update(&config).await.unwrap_err();
        assert!(err.is_dirty_write());

        // Re-read and retry succeeds.
        let fresh = store.get("fleet").await.unwrap();
        let written = store.update(&fresh).await.unwrap();
        assert_eq!(written.version, fresh.version + 1);
        assert_eq!(store.update_calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_outage() {
        let store = MockConfigStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.list().await, Err(StoreError::Unavailable(_))));
    }
}
