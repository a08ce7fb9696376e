//! Shared Maps Library
//!
//! Replicated, versioned key-value maps with single-writer semantics,
//! snapshot isolation and incremental catch-up, plus a reliable channel
//! and an aggregate view built on top of them.

pub mod adapters;
pub mod aggregate;
pub mod channel;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod map;
pub mod replication;
pub mod session;

// Re-export commonly used types
pub use aggregate::{AggregateMap, AggregateSnapshot, MapResolver};
pub use config::{load_config, SharingConfig};
pub use domain::ports::{MapStore, Transport};
pub use error::{Result, SharingError, StoreError, TransportError};
pub use map::{CatchUp, Delta, MapOptions, MapRef, VersionedMap, VERSION_KEY};
pub use replication::{SharingEvent, SharingManager};
pub use session::{Checkpoint, SharingSession};
