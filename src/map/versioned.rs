//! Versioned Map
//!
//! Single-writer, multiple-reader dictionary with snapshot isolation.
//! Every committed delta bumps the version by exactly one and is kept in a
//! bounded update log so lagging replicas can catch up incrementally.

use crate::error::{Result, SharingError};
use crate::map::method::MethodRuntime;
use crate::map::reference::MapRef;
use crate::map::types::{CatchUp, Delta, DEFAULT_LOG_WINDOW, FIRST_VERSION, VERSION_KEY};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Entries of one map version. Shared copy-on-write between the map and
/// the references taken from it.
pub(crate) type Entries = BTreeMap<String, Arc<Value>>;

/// Tuning knobs for a map instance.
#[derive(Debug, Clone)]
pub struct MapOptions {
    /// Number of committed deltas kept for incremental catch-up
    pub log_window: usize,
    /// Maximum number of compiled methods cached before the cache is cleared
    pub method_cache_size: usize,
    /// Reject every serialized method call
    pub no_exec: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            log_window: DEFAULT_LOG_WINDOW,
            method_cache_size: 100,
            no_exec: false,
        }
    }
}

struct MapState {
    entries: Arc<Entries>,
    version: u64,
    log: Arc<VecDeque<Delta>>,
    /// Bumped by `reset` so references taken earlier can no longer commit.
    epoch: u64,
}

impl MapState {
    fn fresh(epoch: u64) -> Self {
        let mut entries = Entries::new();
        entries.insert(VERSION_KEY.to_string(), Arc::new(Value::from(FIRST_VERSION)));
        Self {
            entries: Arc::new(entries),
            version: FIRST_VERSION,
            log: Arc::new(VecDeque::new()),
            epoch,
        }
    }
}

pub(crate) struct MapInner {
    state: RwLock<MapState>,
    log_window: usize,
    pub(crate) methods: MethodRuntime,
}

/// Handle to a versioned map. Cloning is cheap and shares the map.
#[derive(Clone)]
pub struct VersionedMap {
    pub(crate) inner: Arc<MapInner>,
}

impl std::fmt::Debug for VersionedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("VersionedMap")
            .field("version", &state.version)
            .field("size", &state.entries.len())
            .field("log_len", &state.log.len())
            .finish()
    }
}

impl Default for VersionedMap {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionedMap {
    /// Create an empty map at version 0.
    pub fn new() -> Self {
        Self::with_options(MapOptions::default())
    }

    pub fn with_options(options: MapOptions) -> Self {
        Self {
            inner: Arc::new(MapInner {
                state: RwLock::new(MapState::fresh(0)),
                log_window: options.log_window.max(1),
                methods: MethodRuntime::new(options.method_cache_size, options.no_exec),
            }),
        }
    }

    /// Create a map from a full dump.
    ///
    /// Fails with `InvalidState` if the dump carries no usable version.
    pub fn from_dump(dump: &Delta, options: MapOptions) -> Result<Self> {
        if dump.carried_version().is_none() {
            return Err(SharingError::InvalidState(
                "dump has missing or invalid version".to_string(),
            ));
        }
        let map = Self::with_options(options);
        map.apply_changes(dump)?;
        Ok(map)
    }

    /// Take a reference capturing the current version.
    ///
    /// Read-only references also capture the update log.
    pub fn reference(&self, read_only: bool) -> MapRef {
        let state = self.inner.state.read();
        let log = if read_only {
            state.log.clone()
        } else {
            Arc::new(VecDeque::new())
        };
        MapRef::new(
            self.clone(),
            read_only,
            state.version,
            state.epoch,
            state.entries.clone(),
            log,
        )
    }

    /// Shorthand for a writable reference.
    pub fn writer(&self) -> MapRef {
        self.reference(false)
    }

    /// Shorthand for a read-only reference.
    pub fn reader(&self) -> MapRef {
        self.reference(true)
    }

    /// Current committed version.
    pub fn version(&self) -> u64 {
        self.inner.state.read().version
    }

    /// Number of deltas currently kept in the update log.
    pub fn log_len(&self) -> usize {
        self.inner.state.read().log.len()
    }

    /// True if both handles point at the same map instance.
    pub fn same_map(&self, other: &VersionedMap) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Full dump of the current state.
    pub fn dump(&self) -> Delta {
        self.reader().dump()
    }

    /// Commit a prepared reference.
    ///
    /// Returns `Ok(false)` when the sealed delta is empty.
    pub fn commit(&self, reference: &MapRef) -> Result<bool> {
        self.commit_inner(reference, true)
    }

    fn commit_inner(&self, reference: &MapRef, logged: bool) -> Result<bool> {
        let delta = reference.changes().ok_or(SharingError::NotPrepared)?;
        if !self.same_map(reference.map()) {
            return Err(SharingError::InvalidState(
                "reference belongs to another map".to_string(),
            ));
        }
        if delta.is_empty() {
            return Ok(false);
        }

        let new_version = reference
            .get(VERSION_KEY)
            .and_then(Value::as_u64)
            .ok_or_else(|| SharingError::InvalidState("missing or invalid version".to_string()))?;

        let mut state = self.inner.state.write();
        if state.epoch != reference.epoch() || state.version != reference.version() {
            return Err(SharingError::ConcurrentUpdate {
                expected: reference.version(),
                actual: state.version,
            });
        }

        state.entries = reference.view().clone();
        state.version = new_version;
        if logged {
            let window = self.inner.log_window;
            let log = Arc::make_mut(&mut state.log);
            log.push_back(delta.clone());
            while log.len() > window {
                log.pop_front();
            }
        }
        Ok(true)
    }

    /// Apply a delta (or a dump) received from the primary.
    ///
    /// Deltas older than the local version are ignored and newer ones fail
    /// with `IncompatibleVersion`. A dump replaces the whole state and
    /// clears the update log. Returns `true` if the state changed.
    pub fn apply_changes(&self, delta: &Delta) -> Result<bool> {
        if delta.dump {
            self.install_dump(delta)
        } else {
            self.apply_delta(delta, true)
        }
    }

    /// Replace the whole state with a dump in one swap, so readers see
    /// either the old state or the new one.
    fn install_dump(&self, dump: &Delta) -> Result<bool> {
        let version = dump.carried_version().ok_or_else(|| {
            SharingError::InvalidState("dump has missing or invalid version".to_string())
        })?;
        let entries: Entries = dump
            .add
            .iter()
            .map(|(key, value)| (key.clone(), Arc::new(value.clone())))
            .collect();

        {
            let mut state = self.inner.state.write();
            if state.version == version && *state.entries == entries {
                return Ok(false);
            }
            let epoch = state.epoch + 1;
            *state = MapState {
                entries: Arc::new(entries),
                version,
                log: Arc::new(VecDeque::new()),
                epoch,
            };
        }
        self.inner.methods.clear();
        Ok(true)
    }

    /// Apply a batch of deltas in order, stopping at the first error.
    ///
    /// Returns how many of them changed the map.
    pub fn apply_changes_all(&self, deltas: &[Delta]) -> Result<usize> {
        let mut applied = 0;
        for delta in deltas {
            if self.apply_changes(delta)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn apply_delta(&self, delta: &Delta, logged: bool) -> Result<bool> {
        let mut writer = self.writer();
        let local = writer.version();
        if delta.version > local {
            return Err(SharingError::IncompatibleVersion {
                local,
                received: delta.version,
            });
        }
        if delta.version < local {
            tracing::debug!("ignoring old update version={} local={}", delta.version, local);
            return Ok(false);
        }

        for key in &delta.remove {
            writer.delete(key)?;
        }
        for (key, value) in &delta.add {
            writer.set(key, value.clone())?;
        }
        writer.prepare()?;
        self.commit_inner(&writer, logged)
    }

    /// Discard all state, the update log and the compiled methods.
    ///
    /// References taken before the reset can no longer commit.
    pub fn reset(&self) {
        {
            let mut state = self.inner.state.write();
            let epoch = state.epoch + 1;
            *state = MapState::fresh(epoch);
        }
        self.inner.methods.clear();
    }

    /// What a replica at version `from` needs to reach the current version.
    pub fn catch_up(&self, from: u64) -> CatchUp {
        let reader = self.reader();
        if from == FIRST_VERSION {
            return CatchUp::Dump(reader.dump());
        }
        match reader.updates_slice(from) {
            Some(updates) => CatchUp::Updates(updates),
            None => CatchUp::Dump(reader.dump()),
        }
    }
}
