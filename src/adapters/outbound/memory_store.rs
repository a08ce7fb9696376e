//! In-Memory Map Store
//!
//! Implements MapStore with DashMap. Contents are lost on restart.

use crate::domain::ports::MapStore;
use crate::error::StoreError;
use crate::map::{Delta, MapOptions, VersionedMap};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// DashMap-backed map store.
///
/// Each stored map is kept as a live VersionedMap; deltas are applied
/// through the engine so version checks match the primary's.
#[derive(Clone, Default)]
pub struct MemoryMapStore {
    maps: Arc<DashMap<String, VersionedMap>>,
}

impl MemoryMapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

#[async_trait]
impl MapStore for MemoryMapStore {
    async fn create(&self, name: &str, dump: &Delta) -> Result<(), StoreError> {
        let map = VersionedMap::from_dump(dump, MapOptions::default())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match self.maps.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::AlreadyExists(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(map);
                Ok(())
            }
        }
    }

    async fn read(&self, name: &str) -> Result<Delta, StoreError> {
        self.maps
            .get(name)
            .map(|map| map.dump())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn update(&self, name: &str, delta: &Delta) -> Result<(), StoreError> {
        let map = self
            .maps
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if map.version() != delta.version {
            return Err(StoreError::VersionMismatch {
                expected: delta.version,
                actual: map.version(),
            });
        }
        map.apply_changes(delta)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.maps.remove(name);
        Ok(())
    }
}
