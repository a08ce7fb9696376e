//! shared-maps demo node
//!
//! Composition root: one primary map updated by a hosted session and one
//! replica following it over the in-memory bus.

use serde_json::json;
use shared_maps::adapters::outbound::{MemoryBus, SqliteMapStore};
use shared_maps::infrastructure::shutdown_signal;
use shared_maps::{load_config, SharingEvent, SharingManager, SharingSession};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting shared-maps node_id={} db={}",
        cfg.node_id,
        cfg.db_path
    );

    // ===== COMPOSITION ROOT =====
    let store = Arc::new(SqliteMapStore::open(&cfg.db_path)?);
    let bus = Arc::new(MemoryBus::new());
    let map_name = format!("{}-counter", cfg.node_id);
    let manager = Arc::new(SharingManager::new(cfg, store, bus.clone())?);

    if let Some(mut events) = manager.take_event_rx() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SharingEvent::Fatal { name, reason } => {
                        tracing::error!("fatal sharing event map={} reason={}", name, reason)
                    }
                    other => tracing::debug!("sharing event {:?}", other),
                }
            }
        });
    }

    let mut session = SharingSession::new(manager.clone());
    session.add_map("counter", &map_name, true, Some(json!({"count": 0}))).await?;
    let replica = manager.replica_of(&map_name).await?;

    let shutdown = manager.shutdown_controller().clone();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait() => break,
        }

        session.begin().await?;
        if let Some(counter) = session.map_mut("counter") {
            let count = counter.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
            counter.set("count", json!(count + 1))?;
        }
        session.prepare()?;
        session.commit().await?;

        tracing::info!(
            "tick map={} replica_version={} count={}",
            map_name,
            replica.version(),
            replica.reader().get("count").cloned().unwrap_or_default()
        );
    }

    session.close().await?;
    manager.unregister_replica(&map_name);
    manager.shutdown();
    shutdown.wait_for_drain(Duration::from_secs(5)).await;
    bus.close();
    tracing::info!("shared-maps stopped");
    Ok(())
}
