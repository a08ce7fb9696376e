//! Replication Module
//!
//! Keeps replicas of shared maps eventually consistent with their primary.
//!
//! ## How It Works
//!
//! 1. A primary commit is applied locally, persisted, then published as an
//!    `Update` on `replica:{name}`
//! 2. Each commit also schedules a debounced full `Dump` so late joiners
//!    and lagging replicas converge on the latest state
//! 3. A replica that detects a gap reloads the stored dump and publishes a
//!    `CatchUpRequest` on `primary:{name}`; the primary answers with a log
//!    slice or a dump
//! 4. If the store cannot be read during recovery the subsystem shuts down
//!
//! Delivery may be duplicated or reordered: every apply is idempotent by
//! version.

mod broadcaster;
mod manager;
pub mod protocol;
mod replica;

pub use manager::{SharingEvent, SharingManager};
pub use protocol::SyncMessage;
