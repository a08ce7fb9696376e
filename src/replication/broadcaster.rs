//! Dump Broadcaster
//!
//! Debounced propagation of a primary's full state. Every trigger inside
//! one recovery interval collapses into a single dump of the latest state.

use crate::domain::ports::Transport;
use crate::infrastructure::ShutdownController;
use crate::map::VersionedMap;
use crate::replication::protocol::{create_dump, encode_message, replica_channel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub(crate) struct DumpBroadcaster {
    dirty: Arc<AtomicBool>,
    notify: Arc<Notify>,
    task: JoinHandle<()>,
}

impl DumpBroadcaster {
    pub(crate) fn spawn(
        name: String,
        map: VersionedMap,
        transport: Arc<dyn Transport>,
        interval: Duration,
        shutdown: ShutdownController,
    ) -> Self {
        let dirty = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let task = {
            let dirty = dirty.clone();
            let notify = notify.clone();
            let guard = shutdown.task_guard();
            tokio::spawn(async move {
                let _guard = guard;
                let channel = replica_channel(&name);
                loop {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = shutdown.wait() => break,
                    }
                    tokio::time::sleep(interval).await;
                    if !dirty.swap(false, Ordering::SeqCst) {
                        continue;
                    }

                    let encoded =
                        create_dump(&name, map.dump()).and_then(|msg| encode_message(&msg));
                    let payload = match encoded {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::error!("dump encode failed map={} error={}", name, e);
                            continue;
                        }
                    };
                    match transport.publish(&channel, payload).await {
                        Ok(()) => tracing::debug!(
                            "dump broadcast map={} version={}",
                            name,
                            map.version()
                        ),
                        Err(e) => tracing::warn!("dump publish failed map={} error={}", name, e),
                    }
                }
                tracing::debug!("dump broadcaster stopped map={}", name);
            })
        };

        Self {
            dirty,
            notify,
            task,
        }
    }

    /// Schedule a dump of the latest state.
    pub(crate) fn trigger(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

impl Drop for DumpBroadcaster {
    fn drop(&mut self) {
        self.task.abort();
    }
}
