//! Replication Integration Tests
//!
//! Primaries and replicas talking over the in-memory bus.

use serde_json::json;
use shared_maps::adapters::outbound::{MemoryBus, MemoryMapStore};
use shared_maps::domain::ports::Transport;
use shared_maps::replication::protocol::{
    decode_message, encode_message, primary_channel, replica_channel,
};
use shared_maps::replication::SyncMessage;
use shared_maps::{Delta, SharingConfig, SharingEvent, SharingManager, VersionedMap};
use std::sync::Arc;
use std::time::Duration;

fn config(node: &str) -> SharingConfig {
    SharingConfig::new(node).recovery_interval(Duration::from_millis(20))
}

fn node(node: &str, store: Arc<MemoryMapStore>, bus: Arc<MemoryBus>) -> Arc<SharingManager> {
    Arc::new(SharingManager::new(config(node), store, bus).unwrap())
}

fn set_delta(map: &VersionedMap, key: &str, value: serde_json::Value) -> Delta {
    let mut w = map.writer();
    w.set(key, value).unwrap();
    w.prepare().unwrap()
}

async fn wait_for_version(map: &VersionedMap, version: u64) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while map.version() < version {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("replica did not converge");
}

#[tokio::test]
async fn test_updates_reach_replica_on_other_node() {
    let store = Arc::new(MemoryMapStore::new());
    let bus = Arc::new(MemoryBus::new());
    let owner = node("owner", store.clone(), bus.clone());
    let reader = node("reader", store, bus);

    let primary = owner.primary("m1", Some(json!({"a": 1}))).await.unwrap();
    let replica = reader.replica_of("m1").await.unwrap();
    assert_eq!(replica.version(), 1);

    for i in 0..3 {
        let delta = set_delta(&primary, "counter", json!(i));
        owner.update_primary("m1", &delta).await.unwrap();
    }

    wait_for_version(&replica, 4).await;
    assert_eq!(replica.reader().to_object(), primary.reader().to_object());
}

#[tokio::test]
async fn test_lagging_replica_resyncs() {
    let store = Arc::new(MemoryMapStore::new());
    let bus = Arc::new(MemoryBus::with_capacity(2));
    let owner = node("owner", store.clone(), bus.clone());
    let reader = node("reader", store, bus);
    let mut events = reader.take_event_rx().unwrap();

    let primary = owner.primary("m1", None).await.unwrap();
    let replica = reader.replica_of("m1").await.unwrap();

    // no yield between updates, so the replica's subscription overflows
    for i in 0..10 {
        let delta = set_delta(&primary, "k", json!(i));
        owner.update_primary("m1", &delta).await.unwrap();
    }

    wait_for_version(&replica, 10).await;
    assert_eq!(replica.reader().get("k"), Some(&json!(9)));

    let mut resynced = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SharingEvent::ReplicaResynced { .. }) {
            resynced = true;
        }
    }
    assert!(resynced);
}

#[tokio::test]
async fn test_primary_answers_catch_up_request() {
    let store = Arc::new(MemoryMapStore::new());
    let bus = Arc::new(MemoryBus::new());
    let owner = node("owner", store, bus.clone());

    let primary = owner.primary("m1", None).await.unwrap();
    for i in 0..3 {
        let delta = set_delta(&primary, "k", json!(i));
        owner.update_primary("m1", &delta).await.unwrap();
    }

    let mut rx = bus.subscribe(&replica_channel("m1")).await.unwrap();
    let request = SyncMessage::CatchUpRequest {
        map: "m1".to_string(),
        version: 1,
    };
    bus.publish(&primary_channel("m1"), encode_message(&request).unwrap())
        .await
        .unwrap();

    let deltas = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let payload = rx.recv().await.unwrap();
            if let SyncMessage::Updates { deltas, .. } = decode_message(&payload).unwrap() {
                return deltas;
            }
        }
    })
    .await
    .unwrap();

    let versions: Vec<u64> = deltas.iter().map(|d| d.version).collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn test_late_replica_gets_full_state() {
    let store = Arc::new(MemoryMapStore::new());
    let bus = Arc::new(MemoryBus::new());
    let owner = node("owner", store.clone(), bus.clone());

    let primary = owner.primary("m1", None).await.unwrap();
    for i in 0..5 {
        let delta = set_delta(&primary, &format!("k{}", i), json!(i));
        owner.update_primary("m1", &delta).await.unwrap();
    }

    let late = node("late", store, bus);
    let replica = late.replica_of("m1").await.unwrap();
    assert_eq!(replica.version(), 5);
    assert_eq!(replica.reader().to_object(), primary.reader().to_object());
}

#[tokio::test]
async fn test_replica_survives_duplicates_and_reordering() {
    let store = Arc::new(MemoryMapStore::new());
    let bus = Arc::new(MemoryBus::new());
    let owner = node("owner", store.clone(), bus.clone());
    let reader = node("reader", store, bus.clone());

    let primary = owner.primary("m1", None).await.unwrap();
    let replica = reader.replica_of("m1").await.unwrap();

    let d1 = set_delta(&primary, "a", json!(1));
    owner.update_primary("m1", &d1).await.unwrap();
    let d2 = set_delta(&primary, "b", json!(2));
    owner.update_primary("m1", &d2).await.unwrap();
    wait_for_version(&replica, 2).await;

    // replay old traffic out of order
    for delta in [d2, d1] {
        let msg = SyncMessage::Update {
            map: "m1".to_string(),
            delta,
        };
        bus.publish(&replica_channel("m1"), encode_message(&msg).unwrap())
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(replica.version(), 2);
    assert_eq!(replica.reader().to_object(), primary.reader().to_object());
    assert!(!reader.is_shutdown());
}
