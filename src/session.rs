//! Sharing Session
//!
//! Transaction lifecycle for one hosted actor. The host calls `begin`
//! before processing a message, `prepare` to seal changes into a
//! checkpoint, then `commit` or `abort`. After a restart `resume` replays
//! a checkpoint whose updates may not have been committed.

use crate::aggregate::{AggregateMap, AggregateSnapshot};
use crate::error::{Result, SharingError};
use crate::map::{Delta, MapRef, VersionedMap};
use crate::replication::SharingManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// How an alias is attached to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub name: String,
    pub writable: bool,
    #[serde(default)]
    pub aggregate: bool,
}

/// Serializable state returned by `prepare`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub attachments: BTreeMap<String, AttachmentInfo>,
    #[serde(default)]
    pub updates: BTreeMap<String, Delta>,
}

pub struct SharingSession {
    manager: Arc<SharingManager>,
    attachments: BTreeMap<String, AttachmentInfo>,
    maps: HashMap<String, VersionedMap>,
    aggregates: HashMap<String, AggregateMap>,
    refs: BTreeMap<String, MapRef>,
    snapshots: BTreeMap<String, AggregateSnapshot>,
    updates: BTreeMap<String, Delta>,
}

impl SharingSession {
    pub fn new(manager: Arc<SharingManager>) -> Self {
        Self {
            manager,
            attachments: BTreeMap::new(),
            maps: HashMap::new(),
            aggregates: HashMap::new(),
            refs: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            updates: BTreeMap::new(),
        }
    }

    /// Attach map `name` under `alias`: a local primary when `writable`,
    /// otherwise a replica.
    pub async fn add_map(
        &mut self,
        alias: &str,
        name: &str,
        writable: bool,
        initial: Option<Value>,
    ) -> Result<()> {
        if self.attachments.contains_key(alias) {
            self.delete_map(alias).await?;
        }
        let map = if writable {
            self.manager.primary(name, initial).await?
        } else {
            self.manager.replica_of(name).await?
        };
        self.maps.insert(alias.to_string(), map);
        self.attachments.insert(
            alias.to_string(),
            AttachmentInfo {
                name: name.to_string(),
                writable,
                aggregate: false,
            },
        );
        Ok(())
    }

    /// Attach the aggregate rooted at `root` under `alias`.
    pub async fn add_aggregate(&mut self, alias: &str, root: &str) -> Result<()> {
        if self.attachments.contains_key(alias) {
            self.delete_map(alias).await?;
        }
        let aggregate = self.manager.aggregate_of(root).await?;
        self.aggregates.insert(alias.to_string(), aggregate);
        self.attachments.insert(
            alias.to_string(),
            AttachmentInfo {
                name: root.to_string(),
                writable: false,
                aggregate: true,
            },
        );
        Ok(())
    }

    /// Detach `alias` and release its map.
    pub async fn delete_map(&mut self, alias: &str) -> Result<()> {
        let Some(info) = self.attachments.remove(alias) else {
            tracing::warn!("delete of unknown alias={}", alias);
            return Ok(());
        };
        self.refs.remove(alias);
        self.snapshots.remove(alias);
        self.updates.remove(alias);
        self.maps.remove(alias);

        if info.aggregate {
            if let Some(mut aggregate) = self.aggregates.remove(alias) {
                self.manager.unregister_aggregate(&mut aggregate).await?;
            }
        } else if info.writable {
            self.manager.unregister_primary(&info.name);
        } else {
            self.manager.unregister_replica(&info.name);
        }
        Ok(())
    }

    /// Detach every alias.
    pub async fn close(&mut self) -> Result<()> {
        let aliases: Vec<String> = self.attachments.keys().cloned().collect();
        for alias in aliases {
            self.delete_map(&alias).await?;
        }
        Ok(())
    }

    pub fn aliases(&self) -> Vec<&str> {
        self.attachments.keys().map(String::as_str).collect()
    }

    pub fn attachment(&self, alias: &str) -> Option<&AttachmentInfo> {
        self.attachments.get(alias)
    }

    /// Reference taken by the last `begin`.
    pub fn map(&self, alias: &str) -> Option<&MapRef> {
        self.refs.get(alias)
    }

    pub fn map_mut(&mut self, alias: &str) -> Option<&mut MapRef> {
        self.refs.get_mut(alias)
    }

    /// Snapshot assembled by the last `begin`.
    pub fn aggregate(&self, alias: &str) -> Option<&AggregateSnapshot> {
        self.snapshots.get(alias)
    }

    /// Snapshot every attached map and reassemble every aggregate.
    pub async fn begin(&mut self) -> Result<()> {
        self.refs.clear();
        self.snapshots.clear();
        self.updates.clear();

        for (alias, info) in &self.attachments {
            if let Some(map) = self.maps.get(alias) {
                self.refs
                    .insert(alias.clone(), map.reference(!info.writable));
            }
        }
        for (alias, aggregate) in self.aggregates.iter_mut() {
            let snapshot = aggregate.assemble().await?;
            self.snapshots.insert(alias.clone(), snapshot);
        }
        Ok(())
    }

    /// Seal changes of writable maps and return the pending state.
    pub fn prepare(&mut self) -> Result<Checkpoint> {
        let mut updates = BTreeMap::new();
        for (alias, info) in &self.attachments {
            if !info.writable {
                continue;
            }
            if let Some(reference) = self.refs.get_mut(alias) {
                if reference.has_changed() && reference.changes().is_none() {
                    updates.insert(alias.clone(), reference.prepare()?);
                }
            }
        }
        self.updates = updates;
        Ok(Checkpoint {
            attachments: self.attachments.clone(),
            updates: self.updates.clone(),
        })
    }

    /// Apply the sealed updates to their primaries.
    ///
    /// Fails with `ConcurrentUpdate` if another writer committed to one of
    /// the maps since `begin`; the caller must begin again and retry.
    pub async fn commit(&mut self) -> Result<()> {
        let result = self.apply_updates(false).await;
        self.refs.clear();
        self.snapshots.clear();
        result
    }

    /// Discard everything done since `begin`.
    pub fn abort(&mut self) {
        self.refs.clear();
        self.snapshots.clear();
        self.updates.clear();
    }

    /// Recreate the attachments of a checkpoint and replay its updates.
    /// Updates that were already applied are ignored.
    pub async fn resume(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.close().await?;
        for (alias, info) in &checkpoint.attachments {
            if info.aggregate {
                self.add_aggregate(alias, &info.name).await?;
            } else {
                self.add_map(alias, &info.name, info.writable, None).await?;
            }
        }
        self.updates = checkpoint.updates;
        self.apply_updates(true).await
    }

    async fn apply_updates(&mut self, replay: bool) -> Result<()> {
        let updates = std::mem::take(&mut self.updates);
        for (alias, delta) in &updates {
            let info = self
                .attachments
                .get(alias)
                .filter(|info| info.writable && !info.aggregate)
                .ok_or_else(|| {
                    SharingError::InvalidUpdate(format!("alias {} is not a writable map", alias))
                })?;
            if replay {
                self.manager.replay_primary(&info.name, delta).await?;
            } else {
                self.manager.update_primary(&info.name, delta).await?;
            }
        }
        Ok(())
    }
}
