//! Replica Update Handler
//!
//! Applies primary traffic to a local replica. On a detected gap or a
//! corrupted message the replica resyncs from the store; if the store
//! cannot be read the subsystem is torn down.

use crate::domain::ports::{MapStore, Subscription, Transport};
use crate::error::{Result, SharingError};
use crate::infrastructure::ShutdownController;
use crate::map::{Delta, VersionedMap};
use crate::replication::manager::SharingEvent;
use crate::replication::protocol::{
    decode_message, encode_message, primary_channel, verify_message, SyncMessage,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

pub(crate) struct ReplicaHandler {
    pub(crate) name: String,
    pub(crate) map: VersionedMap,
    pub(crate) store: Arc<dyn MapStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) events: mpsc::Sender<SharingEvent>,
    pub(crate) shutdown: ShutdownController,
}

impl ReplicaHandler {
    /// Consume the replica channel until shutdown or until it closes.
    pub(crate) async fn run(self, mut subscription: Subscription) {
        let _guard = self.shutdown.task_guard();
        loop {
            let received = tokio::select! {
                received = subscription.recv() => received,
                _ = self.shutdown.wait() => break,
            };
            match received {
                Ok(payload) => self.handle_payload(&payload).await,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("replica lagged map={} missed={}", self.name, missed);
                    self.resync().await;
                }
                Err(RecvError::Closed) => break,
            }
            if self.shutdown.is_shutdown() {
                break;
            }
        }
        tracing::debug!("replica handler stopped map={}", self.name);
    }

    async fn handle_payload(&self, payload: &str) {
        let msg = match decode_message(payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("undecodable sync message map={} error={}", self.name, e);
                return;
            }
        };
        if msg.map() != self.name {
            tracing::debug!("ignoring message for map={} on {}", msg.map(), self.name);
            return;
        }
        if !verify_message(&msg) {
            tracing::warn!("corrupted {} map={}", msg.type_name(), self.name);
            self.resync().await;
            return;
        }

        match msg {
            SyncMessage::Update { delta, .. } => {
                if let Err(e) = self.map.apply_changes(&delta) {
                    self.on_apply_error(e).await;
                }
            }
            SyncMessage::Updates { deltas, .. } => {
                if let Err(e) = self.map.apply_changes_all(&deltas) {
                    self.on_apply_error(e).await;
                }
            }
            SyncMessage::Dump { version, dump, .. } => {
                self.apply_newer_dump(version, &dump).await;
            }
            SyncMessage::CatchUpRequest { .. } => {}
        }
    }

    async fn on_apply_error(&self, e: SharingError) {
        match e {
            SharingError::IncompatibleVersion { local, received } => {
                tracing::warn!(
                    "missed update map={} local={} received={}",
                    self.name,
                    local,
                    received
                );
            }
            other => {
                tracing::warn!("update rejected map={} error={}", self.name, other);
            }
        }
        self.resync().await;
    }

    /// Apply a dump only if it moves the replica forward.
    async fn apply_newer_dump(&self, version: u64, dump: &Delta) {
        let local = self.map.version();
        if version <= local {
            tracing::debug!(
                "ignoring stale dump map={} version={} local={}",
                self.name,
                version,
                local
            );
            return;
        }
        if let Err(e) = self.map.apply_changes(dump) {
            tracing::warn!("dump rejected map={} error={}", self.name, e);
            self.resync().await;
        }
    }

    /// Reload the replica from the store, then ask the primary for
    /// anything still missing.
    pub(crate) async fn resync(&self) {
        match self.resync_from_store().await {
            Ok(version) => {
                tracing::info!("replica resynced map={} version={}", self.name, version);
                let _ = self.events.try_send(SharingEvent::ReplicaResynced {
                    name: self.name.clone(),
                    version,
                });
                self.request_catch_up(version).await;
            }
            Err(e) => {
                tracing::error!("replica unrecoverable map={} error={}", self.name, e);
                let _ = self.events.try_send(SharingEvent::Fatal {
                    name: self.name.clone(),
                    reason: e.to_string(),
                });
                self.shutdown.shutdown();
            }
        }
    }

    async fn resync_from_store(&self) -> Result<u64> {
        let dump = self.store.read(&self.name).await?;
        let stored = dump.carried_version().ok_or_else(|| {
            SharingError::InvalidState(format!("stored dump of {} has no version", self.name))
        })?;
        if stored > self.map.version() {
            self.map.apply_changes(&dump)?;
        }
        Ok(self.map.version())
    }

    async fn request_catch_up(&self, version: u64) {
        let msg = SyncMessage::CatchUpRequest {
            map: self.name.clone(),
            version,
        };
        let result = match encode_message(&msg) {
            Ok(payload) => self
                .transport
                .publish(&primary_channel(&self.name), payload)
                .await
                .map_err(SharingError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("catch-up request failed map={} error={}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{MemoryBus, MemoryMapStore};
    use crate::replication::protocol::create_dump;
    use serde_json::json;

    fn commit(map: &VersionedMap, key: &str, value: i64) -> Delta {
        let mut w = map.writer();
        w.set(key, json!(value)).unwrap();
        let delta = w.prepare().unwrap();
        map.commit(&w).unwrap();
        delta
    }

    fn handler(
        map: VersionedMap,
        store: Arc<MemoryMapStore>,
        bus: Arc<MemoryBus>,
    ) -> (ReplicaHandler, mpsc::Receiver<SharingEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            ReplicaHandler {
                name: "m1".to_string(),
                map,
                store,
                transport: bus,
                events: tx,
                shutdown: ShutdownController::new(),
            },
            rx,
        )
    }

    fn payload(msg: &SyncMessage) -> String {
        encode_message(msg).unwrap()
    }

    #[tokio::test]
    async fn test_gap_triggers_resync_from_store() {
        let store = Arc::new(MemoryMapStore::new());
        let bus = Arc::new(MemoryBus::new());
        let primary = VersionedMap::new();
        store.create("m1", &primary.dump()).await.unwrap();
        let d1 = commit(&primary, "a", 1);
        store.update("m1", &d1).await.unwrap();
        let d2 = commit(&primary, "b", 2);
        store.update("m1", &d2).await.unwrap();

        let replica = VersionedMap::new();
        let (handler, mut events) = handler(replica.clone(), store, bus);
        handler
            .handle_payload(&payload(&SyncMessage::Update {
                map: "m1".to_string(),
                delta: d2,
            }))
            .await;

        assert_eq!(replica.version(), 2);
        assert_eq!(replica.reader().to_object(), primary.reader().to_object());
        assert!(matches!(
            events.try_recv(),
            Ok(SharingEvent::ReplicaResynced { version: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_dump_is_ignored() {
        let store = Arc::new(MemoryMapStore::new());
        let bus = Arc::new(MemoryBus::new());
        let primary = VersionedMap::new();
        commit(&primary, "a", 1);
        let old_dump = primary.dump();
        commit(&primary, "a", 2);

        let replica = VersionedMap::from_dump(&primary.dump(), Default::default()).unwrap();
        let (handler, _events) = handler(replica.clone(), store, bus);
        handler
            .handle_payload(&payload(&create_dump("m1", old_dump).unwrap()))
            .await;
        assert_eq!(replica.version(), 2);
        assert_eq!(replica.reader().get("a"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_store_failure_is_fatal() {
        let store = Arc::new(MemoryMapStore::new());
        let bus = Arc::new(MemoryBus::new());
        let primary = VersionedMap::new();
        commit(&primary, "a", 1);
        let d2 = commit(&primary, "b", 2);

        let (handler, mut events) = handler(VersionedMap::new(), store, bus);
        let shutdown = handler.shutdown.clone();
        handler
            .handle_payload(&payload(&SyncMessage::Update {
                map: "m1".to_string(),
                delta: d2,
            }))
            .await;

        assert!(shutdown.is_shutdown());
        assert!(matches!(events.try_recv(), Ok(SharingEvent::Fatal { .. })));
    }

    #[tokio::test]
    async fn test_messages_for_other_maps_are_ignored() {
        let store = Arc::new(MemoryMapStore::new());
        let bus = Arc::new(MemoryBus::new());
        let primary = VersionedMap::new();
        let d1 = commit(&primary, "a", 1);

        let replica = VersionedMap::new();
        let (handler, _events) = handler(replica.clone(), store, bus);
        handler
            .handle_payload(&payload(&SyncMessage::Update {
                map: "other".to_string(),
                delta: d1,
            }))
            .await;
        handler.handle_payload("garbage").await;
        assert_eq!(replica.version(), 0);
    }
}
