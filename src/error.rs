//! Error Types
//!
//! Errors raised by the map engine, the replication manager and the
//! external collaborators (persistence and transport).

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = SharingError> = std::result::Result<T, E>;

/// Errors raised by shared maps and the layers built on them.
#[derive(Debug, Error)]
pub enum SharingError {
    /// Corrupt or missing version metadata. Fatal for the map.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Mutation attempted through a read-only (or sealed) reference.
    #[error("cannot modify read-only reference")]
    ReadOnly,

    /// Optimistic commit lost a race. Retry with a fresh reference.
    #[error("concurrent update detected: reference at version {expected}, map at {actual}")]
    ConcurrentUpdate { expected: u64, actual: u64 },

    /// A delta assumes a version this map has not seen yet. Resync with a dump.
    #[error("incompatible version: missed update (local={local}, received={received})")]
    IncompatibleVersion { local: u64, received: u64 },

    /// `commit` called on a reference that was never prepared.
    #[error("call prepare before commit")]
    NotPrepared,

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("method execution disabled")]
    ExecutionDisabled,

    #[error("method failed: {0}")]
    MethodFailed(String),

    /// Update addressed to a map this process does not own as primary.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// Acknowledgement index beyond the channel contents.
    #[error("invalid ack for channel {channel}: ack={ack} index={index} len={len}")]
    InvalidAck {
        channel: String,
        ack: u64,
        index: u64,
        len: usize,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("sharing subsystem is shut down")]
    Shutdown,
}

/// Errors from the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("map {0} already exists")]
    AlreadyExists(String),

    #[error("map {0} does not exist")]
    NotFound(String),

    #[error("version {actual} does not match expected {expected}")]
    VersionMismatch { expected: u64, actual: u64 },

    #[error("backend: {0}")]
    Backend(String),
}

/// Errors from the publish/subscribe collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}
