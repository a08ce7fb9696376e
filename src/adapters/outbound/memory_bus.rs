//! In-Memory Bus
//!
//! Implements Transport with one tokio broadcast channel per name.
//! Suitable for a single process and for tests.

use crate::domain::ports::{Subscription, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct MemoryBus {
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
    closed: Arc<AtomicBool>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus whose subscribers lag after `capacity` undelivered messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop the bus. Open subscriptions end with `RecvError::Closed` and
    /// later calls fail with `TransportError::Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.channels.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Number of live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |tx| tx.receiver_count())
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), TransportError> {
        self.ensure_open()?;
        if let Some(tx) = self.channels.get(channel) {
            // no receivers is not an error
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        let tx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(tx.subscribe())
    }
}
