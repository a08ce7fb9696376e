//! Map Types
//!
//! Wire shapes shared by the engine, the persistence store and the
//! replication protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved key holding the map version.
pub const VERSION_KEY: &str = "__map_version__";

/// Version of a freshly created map.
pub const FIRST_VERSION: u64 = 0;

/// Default number of deltas kept for incremental catch-up.
pub const DEFAULT_LOG_WINDOW: usize = 100;

/// A versioned set of removals and additions.
///
/// `version` is the version the delta was computed against, i.e. the map
/// version before the commit. On the wire `add` is flattened as
/// `[key1, value1, key2, value2, ...]`.
///
/// A dump is a delta with `version == 0`, no removals, every entry in
/// `add` (the version key included) and `dump` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub version: u64,
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default, with = "flat_pairs")]
    pub add: Vec<(String, Value)>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dump: bool,
}

impl Delta {
    /// An empty delta against `version`.
    pub fn empty(version: u64) -> Self {
        Self {
            version,
            remove: Vec::new(),
            add: Vec::new(),
            dump: false,
        }
    }

    /// A full dump built from every entry of a map.
    pub fn full_dump(entries: Vec<(String, Value)>) -> Self {
        Self {
            version: FIRST_VERSION,
            remove: Vec::new(),
            add: entries,
            dump: true,
        }
    }

    /// True if the delta neither removes nor adds anything.
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }

    /// Version written by this delta under [`VERSION_KEY`], if any.
    ///
    /// For a dump this is the version of the map it was taken from.
    pub fn carried_version(&self) -> Option<u64> {
        self.add
            .iter()
            .rev()
            .find(|(k, _)| k == VERSION_KEY)
            .and_then(|(_, v)| v.as_u64())
    }

    /// Value added for `key`, if the delta adds it.
    pub fn added(&self, key: &str) -> Option<&Value> {
        self.add.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// Answer to a catch-up request from a lagging replica.
#[derive(Debug, Clone, PartialEq)]
pub enum CatchUp {
    /// Ordered deltas starting at the requested version (possibly none).
    Updates(Vec<Delta>),
    /// The requested version is outside the log window.
    Dump(Delta),
}

mod flat_pairs {
    use serde::de::Error as _;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(pairs: &[(String, Value)], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(pairs.len() * 2))?;
        for (key, value) in pairs {
            seq.serialize_element(key)?;
            seq.serialize_element(value)?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<(String, Value)>, D::Error> {
        let flat = Vec::<Value>::deserialize(d)?;
        if flat.len() % 2 != 0 {
            return Err(D::Error::custom("add list has an odd number of elements"));
        }
        let mut pairs = Vec::with_capacity(flat.len() / 2);
        let mut it = flat.into_iter();
        while let (Some(key), Some(value)) = (it.next(), it.next()) {
            match key {
                Value::String(key) => pairs.push((key, value)),
                other => return Err(D::Error::custom(format!("non-string key {}", other))),
            }
        }
        Ok(pairs)
    }
}
