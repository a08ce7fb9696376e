//! Aggregate Map
//!
//! Read-only facade over the set of maps reachable from a root map by
//! following a well-known link key. The link graph may be cyclic.

use crate::error::Result;
use crate::map::{MapRef, VersionedMap};
use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Key whose value lists the names of linked maps.
pub const DEFAULT_LINK_KEY: &str = "__link_key__";

/// Finds maps by name for an aggregate.
#[async_trait]
pub trait MapResolver: Send + Sync {
    /// Fetch map `name`. `Ok(None)` marks a missing map that the traversal
    /// skips; callers may retry on the next assemble.
    async fn find_map(&self, name: &str) -> Result<Option<VersionedMap>>;

    /// Give back a map the aggregate no longer uses.
    async fn release(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Transitive closure of linked maps, rooted at one name.
pub struct AggregateMap {
    root: String,
    link_key: String,
    resolver: Arc<dyn MapResolver>,
    maps: HashMap<String, VersionedMap>,
    cleanup: bool,
}

impl std::fmt::Debug for AggregateMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateMap")
            .field("root", &self.root)
            .field("link_key", &self.link_key)
            .field("maps", &self.maps.len())
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

impl AggregateMap {
    pub fn new(root: impl Into<String>, resolver: Arc<dyn MapResolver>) -> Self {
        Self {
            root: root.into(),
            link_key: DEFAULT_LINK_KEY.to_string(),
            resolver,
            maps: HashMap::new(),
            cleanup: false,
        }
    }

    pub fn with_link_key(mut self, link_key: impl Into<String>) -> Self {
        self.link_key = link_key.into();
        self
    }

    /// Release maps that are no longer reachable after each assemble.
    pub fn with_cleanup(mut self) -> Self {
        self.cleanup = true;
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Maps fetched so far, by name.
    pub fn maps(&self) -> &HashMap<String, VersionedMap> {
        &self.maps
    }

    /// Recompute a consistent snapshot of the reachable maps.
    ///
    /// Traversal is breadth-first. Unknown names in a level are fetched
    /// concurrently and the whole level completes before the next one
    /// starts. Each name is visited once.
    pub async fn assemble(&mut self) -> Result<AggregateSnapshot> {
        let mut refs: BTreeMap<String, MapRef> = BTreeMap::new();
        let mut missing = BTreeSet::new();
        let mut visited: HashSet<String> = HashSet::from([self.root.clone()]);
        let mut frontier = vec![self.root.clone()];

        while !frontier.is_empty() {
            let resolver = &self.resolver;
            let unknown = frontier.iter().filter(|n| !self.maps.contains_key(*n));
            let fetched = try_join_all(unknown.map(|name| async move {
                resolver.find_map(name).await.map(|map| (name.clone(), map))
            }))
            .await?;

            for (name, map) in fetched {
                match map {
                    Some(map) => {
                        self.maps.insert(name, map);
                    }
                    None => {
                        tracing::debug!("aggregate link unresolved root={} map={}", self.root, name);
                        missing.insert(name);
                    }
                }
            }

            let mut next = Vec::new();
            for name in frontier {
                let Some(map) = self.maps.get(&name) else {
                    continue;
                };
                let reference = map.reader();
                for link in links(&reference, &self.link_key) {
                    if visited.insert(link.clone()) {
                        next.push(link);
                    }
                }
                refs.insert(name, reference);
            }
            frontier = next;
        }

        if self.cleanup {
            let stale: Vec<String> = self
                .maps
                .keys()
                .filter(|name| !refs.contains_key(*name))
                .cloned()
                .collect();
            for name in stale {
                self.maps.remove(&name);
                tracing::debug!("aggregate releasing root={} map={}", self.root, name);
                self.resolver.release(&name).await?;
            }
        }

        Ok(AggregateSnapshot {
            root: self.root.clone(),
            refs,
            missing,
        })
    }

    /// Release every map fetched so far.
    pub async fn unregister(&mut self) -> Result<()> {
        for (name, _) in self.maps.drain() {
            self.resolver.release(&name).await?;
        }
        Ok(())
    }
}

fn links(reference: &MapRef, link_key: &str) -> Vec<String> {
    match reference.get(link_key) {
        Some(Value::Array(names)) => names
            .iter()
            .filter_map(|n| n.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Read-only references to every map reached by one assemble.
pub struct AggregateSnapshot {
    root: String,
    refs: BTreeMap<String, MapRef>,
    missing: BTreeSet<String>,
}

impl AggregateSnapshot {
    /// Every binding of `key`, one per map that has it. Duplicates are kept.
    pub fn get_all(&self, key: &str) -> Vec<&Value> {
        self.refs.values().filter_map(|r| r.get(key)).collect()
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn map_names(&self) -> Vec<&str> {
        self.refs.keys().map(String::as_str).collect()
    }

    /// Linked names that could not be resolved.
    pub fn missing(&self) -> Vec<&str> {
        self.missing.iter().map(String::as_str).collect()
    }

    pub fn reference(&self, name: &str) -> Option<&MapRef> {
        self.refs.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Registry {
        maps: Mutex<HashMap<String, VersionedMap>>,
        lookups: Mutex<Vec<String>>,
        released: Mutex<Vec<String>>,
    }

    impl Registry {
        fn add(&self, name: &str, links: &[&str], value: i64) -> VersionedMap {
            let map = VersionedMap::new();
            let mut w = map.writer();
            w.set(DEFAULT_LINK_KEY, json!(links)).unwrap();
            w.set("foo", json!(value)).unwrap();
            w.prepare().unwrap();
            map.commit(&w).unwrap();
            self.maps.lock().insert(name.to_string(), map.clone());
            map
        }
    }

    #[async_trait]
    impl MapResolver for Registry {
        async fn find_map(&self, name: &str) -> Result<Option<VersionedMap>> {
            self.lookups.lock().push(name.to_string());
            Ok(self.maps.lock().get(name).cloned())
        }

        async fn release(&self, name: &str) -> Result<()> {
            self.released.lock().push(name.to_string());
            Ok(())
        }
    }

    fn sorted(values: Vec<&Value>) -> Vec<i64> {
        let mut out: Vec<i64> = values.iter().filter_map(|v| v.as_i64()).collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_cycle_visits_each_map_once() {
        let registry = Arc::new(Registry::default());
        registry.add("p1", &["p2"], 1);
        registry.add("p2", &["p1"], 2);

        let mut aggregate = AggregateMap::new("p1", registry.clone());
        let snapshot = aggregate.assemble().await.unwrap();
        assert_eq!(sorted(snapshot.get_all("foo")), vec![1, 2]);
        assert_eq!(snapshot.map_names(), vec!["p1", "p2"]);
        assert_eq!(registry.lookups.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_maps_are_memoized() {
        let registry = Arc::new(Registry::default());
        registry.add("p1", &["p2"], 1);
        registry.add("p2", &[], 2);

        let mut aggregate = AggregateMap::new("p1", registry.clone());
        aggregate.assemble().await.unwrap();
        aggregate.assemble().await.unwrap();
        assert_eq!(registry.lookups.lock().len(), 2);
        assert_eq!(aggregate.maps().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_map_is_a_placeholder() {
        let registry = Arc::new(Registry::default());
        registry.add("p1", &["ghost", "p2"], 1);
        registry.add("p2", &[], 2);

        let mut aggregate = AggregateMap::new("p1", registry.clone());
        let snapshot = aggregate.assemble().await.unwrap();
        assert_eq!(snapshot.missing(), vec!["ghost"]);
        assert_eq!(sorted(snapshot.get_all("foo")), vec![1, 2]);

        registry.add("ghost", &[], 3);
        let snapshot = aggregate.assemble().await.unwrap();
        assert!(snapshot.missing().is_empty());
        assert_eq!(sorted(snapshot.get_all("foo")), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cleanup_releases_unreachable_maps() {
        let registry = Arc::new(Registry::default());
        registry.add("p1", &["p2", "p3"], 1);
        let p2 = registry.add("p2", &["p4"], 2);
        registry.add("p3", &[], 3);
        registry.add("p4", &["p3", "p1"], 4);

        let mut aggregate = AggregateMap::new("p1", registry.clone()).with_cleanup();
        let snapshot = aggregate.assemble().await.unwrap();
        assert_eq!(sorted(snapshot.get_all("foo")), vec![1, 2, 3, 4]);

        let mut w = p2.writer();
        w.set(DEFAULT_LINK_KEY, json!([])).unwrap();
        w.prepare().unwrap();
        p2.commit(&w).unwrap();

        let snapshot = aggregate.assemble().await.unwrap();
        assert_eq!(sorted(snapshot.get_all("foo")), vec![1, 2, 3]);
        assert_eq!(*registry.released.lock(), vec!["p4".to_string()]);
        assert!(!aggregate.maps().contains_key("p4"));

        aggregate.unregister().await.unwrap();
        assert_eq!(registry.released.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_custom_link_key() {
        let registry = Arc::new(Registry::default());
        let p1 = VersionedMap::new();
        let mut w = p1.writer();
        w.set("links", json!(["p2"])).unwrap();
        w.prepare().unwrap();
        p1.commit(&w).unwrap();
        registry.maps.lock().insert("p1".to_string(), p1);
        registry.add("p2", &[], 2);

        let mut aggregate = AggregateMap::new("p1", registry.clone()).with_link_key("links");
        let snapshot = aggregate.assemble().await.unwrap();
        assert_eq!(snapshot.map_names(), vec!["p1", "p2"]);
        assert!(snapshot.reference("p2").is_some());
    }
}
