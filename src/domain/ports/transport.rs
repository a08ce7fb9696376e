//! Transport Port
//!
//! Publish/subscribe collaborator. Delivery is at-least-once and may be
//! reordered; payloads are JSON strings.

use crate::error::TransportError;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Receiving end of a channel subscription.
pub type Subscription = broadcast::Receiver<String>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), TransportError>;

    /// Subscribe to `channel`. Messages published before the call are not
    /// delivered.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;
}
