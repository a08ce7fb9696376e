//! Sharing Manager
//!
//! Owns the primary and replica maps of one process. Primaries are
//! persisted through the [`MapStore`] and propagated on the [`Transport`];
//! replicas follow them and recover from gaps on their own.

use crate::aggregate::{AggregateMap, MapResolver};
use crate::config::{ConfigError, SharingConfig};
use crate::domain::ports::{MapStore, Transport};
use crate::error::{Result, SharingError, StoreError};
use crate::infrastructure::ShutdownController;
use crate::map::{CatchUp, Delta, VersionedMap};
use crate::replication::broadcaster::DumpBroadcaster;
use crate::replication::protocol::{
    create_dump, decode_message, encode_message, primary_channel, replica_channel, SyncMessage,
};
use crate::replication::replica::ReplicaHandler;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events emitted by the sharing manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SharingEvent {
    PrimaryRegistered { name: String, version: u64 },
    /// Persistence failed and the primary was dropped.
    PrimaryRevoked { name: String, reason: String },
    ReplicaRegistered { name: String, version: u64 },
    ReplicaResynced { name: String, version: u64 },
    /// A replica could not recover; the subsystem is shutting down.
    Fatal { name: String, reason: String },
}

struct PrimaryEntry {
    map: VersionedMap,
    broadcaster: DumpBroadcaster,
    listener: JoinHandle<()>,
}

impl Drop for PrimaryEntry {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

struct ReplicaEntry {
    map: VersionedMap,
    count: usize,
    task: JoinHandle<()>,
}

impl Drop for ReplicaEntry {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct SharingManager {
    config: SharingConfig,
    store: Arc<dyn MapStore>,
    transport: Arc<dyn Transport>,
    primaries: DashMap<String, PrimaryEntry>,
    replicas: DashMap<String, ReplicaEntry>,
    event_tx: mpsc::Sender<SharingEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SharingEvent>>>,
    shutdown: ShutdownController,
}

impl SharingManager {
    pub fn new(
        config: SharingConfig,
        store: Arc<dyn MapStore>,
        transport: Arc<dyn Transport>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::channel(1024);
        Ok(Self {
            config,
            store,
            transport,
            primaries: DashMap::new(),
            replicas: DashMap::new(),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            shutdown: ShutdownController::new(),
        })
    }

    pub fn config(&self) -> &SharingConfig {
        &self.config
    }

    /// Get the event receiver. Returns `None` after the first call.
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SharingEvent>> {
        self.event_rx.lock().take()
    }

    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    fn emit(&self, event: SharingEvent) {
        let _ = self.event_tx.try_send(event);
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_shutdown() {
            return Err(SharingError::Shutdown);
        }
        Ok(())
    }

    // ==================== Primaries ====================

    /// Local primary for `name`: the registered one, else loaded from the
    /// store, else created and seeded with `initial` (a JSON object).
    pub async fn primary(&self, name: &str, initial: Option<Value>) -> Result<VersionedMap> {
        self.ensure_running()?;
        if let Some(entry) = self.primaries.get(name) {
            return Ok(entry.map.clone());
        }

        let map = match self.store.read(name).await {
            Ok(dump) => VersionedMap::from_dump(&dump, self.config.map_options())?,
            Err(StoreError::NotFound(_)) => {
                let map = seeded_map(&self.config, initial)?;
                self.store.create(name, &map.dump()).await?;
                map
            }
            Err(e) => return Err(e.into()),
        };

        let subscription = self.transport.subscribe(&primary_channel(name)).await?;
        let listener = tokio::spawn(serve_catch_up(
            name.to_string(),
            map.clone(),
            self.transport.clone(),
            subscription,
            self.shutdown.clone(),
        ));
        let broadcaster = DumpBroadcaster::spawn(
            name.to_string(),
            map.clone(),
            self.transport.clone(),
            self.config.recovery_interval,
            self.shutdown.clone(),
        );

        match self.primaries.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                listener.abort();
                Ok(existing.get().map.clone())
            }
            Entry::Vacant(slot) => {
                broadcaster.trigger();
                slot.insert(PrimaryEntry {
                    map: map.clone(),
                    broadcaster,
                    listener,
                });
                tracing::info!("primary registered map={} version={}", name, map.version());
                self.emit(SharingEvent::PrimaryRegistered {
                    name: name.to_string(),
                    version: map.version(),
                });
                Ok(map)
            }
        }
    }

    /// Apply a delta to a local primary, persist it and propagate it.
    ///
    /// A delta computed against an older version fails with
    /// `ConcurrentUpdate`. A persistence failure revokes the primary.
    pub async fn update_primary(&self, name: &str, delta: &Delta) -> Result<bool> {
        self.apply_to_primary(name, delta, false).await
    }

    /// Like `update_primary`, but a delta older than the primary is taken
    /// as already applied and returns `false`. Used when replaying
    /// checkpointed updates after a restart.
    pub async fn replay_primary(&self, name: &str, delta: &Delta) -> Result<bool> {
        self.apply_to_primary(name, delta, true).await
    }

    async fn apply_to_primary(&self, name: &str, delta: &Delta, replay: bool) -> Result<bool> {
        self.ensure_running()?;
        let map = self
            .primaries
            .get(name)
            .map(|entry| entry.map.clone())
            .ok_or_else(|| SharingError::InvalidUpdate(format!("{} is not a local primary", name)))?;

        if !map.apply_changes(delta)? {
            let actual = map.version();
            if !replay && delta.version < actual {
                tracing::warn!(
                    "stale update rejected map={} version={} current={}",
                    name,
                    delta.version,
                    actual
                );
                return Err(SharingError::ConcurrentUpdate {
                    expected: delta.version,
                    actual,
                });
            }
            tracing::debug!("update already applied map={} version={}", name, delta.version);
            return Ok(false);
        }

        if let Err(e) = self.store.update(name, delta).await {
            tracing::error!("persist failed, revoking primary map={} error={}", name, e);
            self.primaries.remove(name);
            self.emit(SharingEvent::PrimaryRevoked {
                name: name.to_string(),
                reason: e.to_string(),
            });
            return Err(e.into());
        }

        let msg = SyncMessage::Update {
            map: name.to_string(),
            delta: delta.clone(),
        };
        if let Err(e) = self.publish(&replica_channel(name), &msg).await {
            tracing::warn!("update publish failed map={} error={}", name, e);
        }
        if let Some(entry) = self.primaries.get(name) {
            entry.broadcaster.trigger();
        }
        Ok(true)
    }

    pub fn unregister_primary(&self, name: &str) {
        if self.primaries.remove(name).is_some() {
            tracing::info!("primary unregistered map={}", name);
        } else {
            tracing::warn!("unregister of unknown primary map={}", name);
        }
    }

    pub fn primary_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.primaries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // ==================== Replicas ====================

    /// Reference-counted local replica of `name`.
    pub async fn replica_of(&self, name: &str) -> Result<VersionedMap> {
        self.ensure_running()?;
        if let Some(mut entry) = self.replicas.get_mut(name) {
            entry.count += 1;
            return Ok(entry.map.clone());
        }

        // subscribe before reading so no update falls in between
        let subscription = self.transport.subscribe(&replica_channel(name)).await?;
        let dump = self.store.read(name).await?;
        let map = VersionedMap::from_dump(&dump, self.config.map_options())?;

        match self.replicas.entry(name.to_string()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().count += 1;
                Ok(existing.get().map.clone())
            }
            Entry::Vacant(slot) => {
                let handler = ReplicaHandler {
                    name: name.to_string(),
                    map: map.clone(),
                    store: self.store.clone(),
                    transport: self.transport.clone(),
                    events: self.event_tx.clone(),
                    shutdown: self.shutdown.clone(),
                };
                let task = tokio::spawn(handler.run(subscription));
                slot.insert(ReplicaEntry {
                    map: map.clone(),
                    count: 1,
                    task,
                });
                tracing::info!("replica registered map={} version={}", name, map.version());
                self.emit(SharingEvent::ReplicaRegistered {
                    name: name.to_string(),
                    version: map.version(),
                });
                Ok(map)
            }
        }
    }

    /// Drop one reference to a replica; it stops following the primary
    /// when the count reaches zero.
    pub fn unregister_replica(&self, name: &str) {
        let remove = match self.replicas.get_mut(name) {
            Some(mut entry) => {
                entry.count -= 1;
                entry.count == 0
            }
            None => {
                tracing::warn!("unregister of unknown replica map={}", name);
                return;
            }
        };
        if remove {
            self.replicas.remove(name);
            tracing::info!("replica unregistered map={}", name);
        }
    }

    pub fn replica_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.replicas.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Current reference count of a replica, 0 if not registered.
    pub fn replica_count(&self, name: &str) -> usize {
        self.replicas.get(name).map_or(0, |e| e.count)
    }

    // ==================== Aggregates ====================

    /// Aggregate rooted at `root` whose maps are replicas of this manager.
    ///
    /// Missing maps become placeholders. Maps no longer reachable are
    /// released after each assemble.
    pub async fn aggregate_of(self: &Arc<Self>, root: &str) -> Result<AggregateMap> {
        self.ensure_running()?;
        let resolver = Arc::new(ManagerResolver {
            manager: self.clone(),
        });
        let mut aggregate = AggregateMap::new(root, resolver)
            .with_link_key(self.config.link_key.clone())
            .with_cleanup();
        aggregate.assemble().await?;
        Ok(aggregate)
    }

    pub async fn unregister_aggregate(&self, aggregate: &mut AggregateMap) -> Result<()> {
        aggregate.unregister().await
    }

    // ==================== Lifecycle ====================

    /// Stop every background task and drop all maps.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
        self.primaries.clear();
        self.replicas.clear();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    async fn publish(&self, channel: &str, msg: &SyncMessage) -> Result<()> {
        let payload = encode_message(msg)?;
        self.transport.publish(channel, payload).await?;
        Ok(())
    }
}

fn seeded_map(config: &SharingConfig, initial: Option<Value>) -> Result<VersionedMap> {
    let map = VersionedMap::with_options(config.map_options());
    let entries = match initial {
        None | Some(Value::Null) => return Ok(map),
        Some(Value::Object(entries)) => entries,
        Some(other) => {
            return Err(SharingError::InvalidState(format!(
                "initial value must be an object, got {}",
                other
            )))
        }
    };
    if entries.is_empty() {
        return Ok(map);
    }
    let mut writer = map.writer();
    for (key, value) in entries {
        writer.set(&key, value)?;
    }
    writer.prepare()?;
    map.commit(&writer)?;
    Ok(map)
}

/// Answer catch-up requests from replicas of one primary.
async fn serve_catch_up(
    name: String,
    map: VersionedMap,
    transport: Arc<dyn Transport>,
    mut subscription: crate::domain::ports::Subscription,
    shutdown: ShutdownController,
) {
    let _guard = shutdown.task_guard();
    let channel = replica_channel(&name);
    loop {
        let received = tokio::select! {
            received = subscription.recv() => received,
            _ = shutdown.wait() => break,
        };
        let payload = match received {
            Ok(payload) => payload,
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!("catch-up listener lagged map={} missed={}", name, missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let version = match decode_message(&payload) {
            Ok(SyncMessage::CatchUpRequest { map: target, version }) if target == name => version,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("undecodable catch-up request map={} error={}", name, e);
                continue;
            }
        };

        let reply = match map.catch_up(version) {
            CatchUp::Updates(deltas) if deltas.is_empty() => continue,
            CatchUp::Updates(deltas) => SyncMessage::Updates {
                map: name.clone(),
                deltas,
            },
            CatchUp::Dump(dump) => match create_dump(&name, dump) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::error!("catch-up dump failed map={} error={}", name, e);
                    continue;
                }
            },
        };
        tracing::debug!(
            "catch-up reply map={} from={} kind={}",
            name,
            version,
            reply.type_name()
        );
        let sent = match encode_message(&reply) {
            Ok(payload) => transport.publish(&channel, payload).await.map_err(SharingError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::warn!("catch-up reply failed map={} error={}", name, e);
        }
    }
}

/// Resolves aggregate links to replicas of the manager.
struct ManagerResolver {
    manager: Arc<SharingManager>,
}

#[async_trait]
impl MapResolver for ManagerResolver {
    async fn find_map(&self, name: &str) -> Result<Option<VersionedMap>> {
        match self.manager.replica_of(name).await {
            Ok(map) => Ok(Some(map)),
            Err(SharingError::Shutdown) => Err(SharingError::Shutdown),
            Err(e) => {
                tracing::debug!("aggregate dependency unavailable map={} error={}", name, e);
                Ok(None)
            }
        }
    }

    async fn release(&self, name: &str) -> Result<()> {
        self.manager.unregister_replica(name);
        Ok(())
    }
}
