//! ConfigStore trait for mocking
//!
//! This trait abstracts the configuration store so the controller can run
//! against the in-memory backend, a remote backend, or a mock in unit tests.

use crate::error::StoreError;
use fleet_model::Config;

/// Trait for configuration store operations
///
/// Every config carries a monotonic version. `update` succeeds only when the
/// version on the passed config equals the stored one, and returns the
/// config with its bumped version.
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ConfigStoreTrait: Send + Sync {
    /// Names of all stored configs, sorted
    async fn list(&self) -> Result<Vec<String>, StoreError>;

    /// Fetch a config together with its current version
    async fn get(&self, name: &str) -> Result<Config, StoreError>;

    /// Insert a new config at version 1
    async fn create(&self, config: Config) -> Result<Config, StoreError>;

    /// Write a config; fails with `DirtyWrite` on a version mismatch
    async fn update(&self, config: &Config) -> Result<Config, StoreError>;

    /// Remove a config; fails with `DirtyWrite` on a version mismatch
    async fn delete(&self, name: &str, version: u64) -> Result<(), StoreError>;
}
