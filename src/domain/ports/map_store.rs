//! Map Store Port
//!
//! Persistence collaborator for primary maps, keyed by map name.

use crate::error::StoreError;
use crate::map::Delta;
use async_trait::async_trait;

/// Durable storage of map dumps.
///
/// This is an outbound port. Implementations keep one dump per map name
/// and apply deltas with an optimistic version check.
#[async_trait]
pub trait MapStore: Send + Sync {
    /// Store the initial dump of a new map.
    async fn create(&self, name: &str, dump: &Delta) -> Result<(), StoreError>;

    /// Current dump of a map.
    async fn read(&self, name: &str) -> Result<Delta, StoreError>;

    /// Apply a delta computed against the stored version.
    ///
    /// Fails with `VersionMismatch` if the stored version differs from
    /// `delta.version`.
    async fn update(&self, name: &str, delta: &Delta) -> Result<(), StoreError>;

    /// Remove a map. Missing maps are not an error.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}
