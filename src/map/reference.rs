//! Map References
//!
//! A reference is a snapshot of a map at one version. Writable references
//! keep a private working copy and coalesce their mutations into a single
//! net delta; `prepare` seals that delta and freezes the reference.

use crate::error::{Result, SharingError};
use crate::map::method::MethodSpec;
use crate::map::types::{Delta, VERSION_KEY};
use crate::map::versioned::{Entries, VersionedMap};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Snapshot view of a [`VersionedMap`].
pub struct MapRef {
    map: VersionedMap,
    read_only: bool,
    original_version: u64,
    epoch: u64,
    view: Arc<Entries>,
    log: Arc<VecDeque<Delta>>,
    /// Net pending change per key, `None` is a delete.
    pending: BTreeMap<String, Option<Arc<Value>>>,
    changes: Option<Delta>,
}

impl std::fmt::Debug for MapRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapRef")
            .field("read_only", &self.read_only)
            .field("version", &self.original_version)
            .field("pending", &self.pending.len())
            .field("prepared", &self.changes.is_some())
            .finish()
    }
}

impl MapRef {
    pub(crate) fn new(
        map: VersionedMap,
        read_only: bool,
        original_version: u64,
        epoch: u64,
        view: Arc<Entries>,
        log: Arc<VecDeque<Delta>>,
    ) -> Self {
        Self {
            map,
            read_only,
            original_version,
            epoch,
            view,
            log,
            pending: BTreeMap::new(),
            changes: None,
        }
    }

    /// The map this reference was taken from.
    pub fn map(&self) -> &VersionedMap {
        &self.map
    }

    /// Version captured when the reference was created.
    pub fn version(&self) -> u64 {
        self.original_version
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn view(&self) -> &Arc<Entries> {
        &self.view
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True if the reference carries uncommitted mutations.
    pub fn has_changed(&self) -> bool {
        match &self.changes {
            Some(delta) => !delta.is_empty(),
            None => !self.pending.is_empty(),
        }
    }

    /// Sealed delta, once `prepare` has been called.
    pub fn changes(&self) -> Option<&Delta> {
        self.changes.as_ref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.view.get(key).map(|v| v.as_ref())
    }

    pub fn has(&self, key: &str) -> bool {
        self.view.contains_key(key)
    }

    /// Number of entries, the version key included.
    pub fn size(&self) -> usize {
        self.view.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.view.keys().map(String::as_str)
    }

    /// Plain JSON object with every visible entry.
    pub fn to_object(&self) -> Value {
        let object: Map<String, Value> = self
            .view
            .iter()
            .map(|(k, v)| (k.clone(), v.as_ref().clone()))
            .collect();
        Value::Object(object)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(SharingError::ReadOnly);
        }
        Ok(())
    }

    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.ensure_writable()?;
        let value = Arc::new(value);
        Arc::make_mut(&mut self.view).insert(key.to_string(), value.clone());
        self.pending.insert(key.to_string(), Some(value));
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.ensure_writable()?;
        Arc::make_mut(&mut self.view).remove(key);
        self.pending.insert(key.to_string(), None);
        Ok(())
    }

    /// Store a serialized method under `key`.
    pub fn set_fun(&mut self, key: &str, args: &[&str], body: &str) -> Result<()> {
        let spec = MethodSpec::new(args, body)?;
        self.set(key, serde_json::to_value(spec)?)
    }

    /// Run the method stored under `name` with `this` bound to this reference.
    pub fn apply_method(&self, name: &str, args: &[Value]) -> Result<Value> {
        self.map.inner.methods.call(self, name, args)
    }

    /// Seal the pending mutations into a delta and freeze the reference.
    ///
    /// Unless the delta already writes the version key, a non-empty delta
    /// also writes `version + 1` under it.
    pub fn prepare(&mut self) -> Result<Delta> {
        self.ensure_writable()?;

        let mut delta = Delta::empty(self.original_version);
        if !self.pending.is_empty() && !self.pending.contains_key(VERSION_KEY) {
            let next = Arc::new(Value::from(self.original_version + 1));
            Arc::make_mut(&mut self.view).insert(VERSION_KEY.to_string(), next.clone());
            self.pending.insert(VERSION_KEY.to_string(), Some(next));
        }
        for (key, change) in std::mem::take(&mut self.pending) {
            match change {
                Some(value) => delta.add.push((key, value.as_ref().clone())),
                None => delta.remove.push(key),
            }
        }

        self.read_only = true;
        self.changes = Some(delta.clone());
        Ok(delta)
    }

    /// Full dump of this reference's view.
    pub fn dump(&self) -> Delta {
        Delta::full_dump(
            self.view
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().clone()))
                .collect(),
        )
    }

    /// Logged deltas needed to bring a map at version `from` up to this
    /// reference's version.
    ///
    /// Empty when `from` is already current; `None` when the log does not
    /// reach back to `from` (or `from` is ahead), meaning a dump is needed.
    pub fn updates_slice(&self, from: u64) -> Option<Vec<Delta>> {
        if from == self.original_version {
            return Some(Vec::new());
        }
        if from > self.original_version {
            return None;
        }
        let oldest = self.log.front()?;
        if oldest.version > from {
            return None;
        }
        Some(
            self.log
                .iter()
                .filter(|delta| delta.version >= from)
                .cloned()
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys_of(delta: &Delta) -> Vec<&str> {
        delta.add.iter().map(|(k, _)| k.as_str()).collect()
    }

    #[test]
    fn test_last_write_wins() {
        let map = VersionedMap::new();
        let mut writer = map.writer();
        writer.set("x", json!(1)).unwrap();
        writer.set("x", json!(2)).unwrap();
        let delta = writer.prepare().unwrap();
        assert_eq!(delta.added("x"), Some(&json!(2)));
        assert_eq!(keys_of(&delta), vec![VERSION_KEY, "x"]);
        assert!(delta.remove.is_empty());
    }

    #[test]
    fn test_set_then_delete_is_pure_remove() {
        let map = VersionedMap::new();
        let mut writer = map.writer();
        writer.set("x", json!(1)).unwrap();
        writer.delete("x").unwrap();
        let delta = writer.prepare().unwrap();
        assert_eq!(delta.remove, vec!["x".to_string()]);
        assert_eq!(keys_of(&delta), vec![VERSION_KEY]);
    }

    #[test]
    fn test_delete_then_set_is_pure_add() {
        let map = VersionedMap::new();
        let mut writer = map.writer();
        writer.delete("x").unwrap();
        writer.set("x", json!(7)).unwrap();
        let delta = writer.prepare().unwrap();
        assert!(delta.remove.is_empty());
        assert_eq!(delta.added("x"), Some(&json!(7)));
    }

    #[test]
    fn test_prepare_bumps_version_once() {
        let map = VersionedMap::new();
        let mut writer = map.writer();
        writer.set("a", json!("b")).unwrap();
        let delta = writer.prepare().unwrap();
        assert_eq!(delta.version, 0);
        assert_eq!(delta.carried_version(), Some(1));
        assert_eq!(writer.get(VERSION_KEY), Some(&json!(1)));
    }

    #[test]
    fn test_explicit_version_write_is_kept() {
        let map = VersionedMap::new();
        let mut writer = map.writer();
        writer.set(VERSION_KEY, json!(1)).unwrap();
        writer.set("a", json!(true)).unwrap();
        let delta = writer.prepare().unwrap();
        assert_eq!(delta.carried_version(), Some(1));
        assert_eq!(delta.add.len(), 2);
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let map = VersionedMap::new();
        let mut reader = map.reader();
        assert!(matches!(reader.set("x", json!(1)), Err(SharingError::ReadOnly)));
        assert!(matches!(reader.delete("x"), Err(SharingError::ReadOnly)));
        assert!(matches!(reader.prepare(), Err(SharingError::ReadOnly)));
    }

    #[test]
    fn test_prepared_reference_is_frozen() {
        let map = VersionedMap::new();
        let mut writer = map.writer();
        writer.set("x", json!(1)).unwrap();
        writer.prepare().unwrap();
        assert!(writer.is_read_only());
        assert!(writer.has_changed());
        assert!(matches!(writer.set("y", json!(1)), Err(SharingError::ReadOnly)));
        assert!(matches!(writer.prepare(), Err(SharingError::ReadOnly)));
    }

    #[test]
    fn test_writer_sees_own_changes() {
        let map = VersionedMap::new();
        let mut writer = map.writer();
        writer.set("obj", json!({"nested": [1, 2]})).unwrap();
        assert!(writer.has("obj"));
        assert_eq!(writer.size(), 2);
        assert_eq!(
            writer.to_object(),
            json!({VERSION_KEY: 0, "obj": {"nested": [1, 2]}})
        );
        assert!(!map.reader().has("obj"));
    }

    #[test]
    fn test_dump_contains_version_entry() {
        let map = VersionedMap::new();
        let mut writer = map.writer();
        writer.set("k", json!(1)).unwrap();
        writer.prepare().unwrap();
        map.commit(&writer).unwrap();

        let dump = map.reader().dump();
        assert!(dump.dump);
        assert_eq!(dump.version, 0);
        assert_eq!(dump.carried_version(), Some(1));
        assert_eq!(dump.added("k"), Some(&json!(1)));
    }

    #[test]
    fn test_writable_reference_has_no_log() {
        let map = VersionedMap::new();
        let mut writer = map.writer();
        writer.set("k", json!(1)).unwrap();
        writer.prepare().unwrap();
        map.commit(&writer).unwrap();

        assert_eq!(map.reader().updates_slice(0).map(|u| u.len()), Some(1));
        assert_eq!(map.writer().updates_slice(0), None);
    }
}
