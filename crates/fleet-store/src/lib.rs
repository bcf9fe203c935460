//! FleetOps configuration store
//!
//! Versioned persistence boundary for cluster state. All mutation of
//! cluster state goes through `ConfigStoreTrait::update`, which rejects
//! writes against a stale version (optimistic concurrency control).
//!
//! # Example
//!
//! ```no_run
//! use fleet_store::{ConfigStoreTrait, MemoryStore};
//! use fleet_model::Config;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! let config = store.create(Config::new("production")).await?;
//!
//! // A second writer holding the same version loses the race.
//! let updated = store.update(&config).await?;
//! assert!(store.update(&config).await.is_err());
//! assert_eq!(updated.version, 2);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod memory;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use store_trait::ConfigStoreTrait;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockConfigStore;
