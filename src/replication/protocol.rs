//! Sync Protocol
//!
//! Wire messages exchanged between a primary and its replicas.
//!
//! Uses Sans-IO pattern: encoding, decoding and validation are plain
//! functions, separate from the transport.

use crate::error::Result;
use crate::map::Delta;
use serde::{Deserialize, Serialize};

/// Messages on the sync channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// One committed delta, primary to replicas.
    Update { map: String, delta: Delta },
    /// Ordered log slice answering a catch-up request.
    Updates { map: String, deltas: Vec<Delta> },
    /// Full state, primary to replicas.
    Dump {
        map: String,
        version: u64,
        dump: Delta,
        checksum: u32,
    },
    /// A replica at `version` asks the primary to catch it up.
    CatchUpRequest { map: String, version: u64 },
}

impl SyncMessage {
    /// Name of the map the message is about.
    pub fn map(&self) -> &str {
        match self {
            SyncMessage::Update { map, .. }
            | SyncMessage::Updates { map, .. }
            | SyncMessage::Dump { map, .. }
            | SyncMessage::CatchUpRequest { map, .. } => map,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::Update { .. } => "Update",
            SyncMessage::Updates { .. } => "Updates",
            SyncMessage::Dump { .. } => "Dump",
            SyncMessage::CatchUpRequest { .. } => "CatchUpRequest",
        }
    }
}

/// Channel carrying primary to replica traffic for `map`.
pub fn replica_channel(map: &str) -> String {
    format!("replica:{}", map)
}

/// Channel carrying replica to primary traffic for `map`.
pub fn primary_channel(map: &str) -> String {
    format!("primary:{}", map)
}

/// Encode a message for the transport (Sans-IO pattern).
pub fn encode_message(msg: &SyncMessage) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode a message received from the transport (Sans-IO pattern).
pub fn decode_message(payload: &str) -> Result<SyncMessage> {
    Ok(serde_json::from_str(payload)?)
}

/// CRC32 of a dump's serialized form.
pub fn dump_checksum(dump: &Delta) -> Result<u32> {
    let bytes = serde_json::to_vec(dump)?;
    Ok(crc32fast::hash(&bytes))
}

/// Create a dump message, stamping the version and checksum.
pub fn create_dump(map: &str, dump: Delta) -> Result<SyncMessage> {
    Ok(SyncMessage::Dump {
        map: map.to_string(),
        version: dump.carried_version().unwrap_or(0),
        checksum: dump_checksum(&dump)?,
        dump,
    })
}

/// Check a dump message against its checksum and carried version.
///
/// Other message kinds are always valid.
pub fn verify_message(msg: &SyncMessage) -> bool {
    match msg {
        SyncMessage::Dump {
            version,
            dump,
            checksum,
            ..
        } => {
            dump_checksum(dump).map_or(false, |actual| actual == *checksum)
                && dump.carried_version() == Some(*version)
        }
        _ => true,
    }
}
