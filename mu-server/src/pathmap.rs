//! PathMap (spec §3/§4.8): the multi-user server's path→destination
//! mapping. Reads are far more frequent than writes, so lookups take only
//! a read lock; mutation is always a whole batch under one write lock.

use std::collections::HashMap;

use parking_lot::RwLock;

/// One `{path, dst}` entry from a control-API request.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PathEntry {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub dst: String,
}

#[derive(Default)]
pub struct PathMap {
    inner: RwLock<HashMap<String, String>>,
}

impl PathMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts every entry in the bunch, overwriting any existing mapping
    /// for the same path, then releases the lock — the whole bunch is
    /// atomic relative to concurrent lookups.
    pub fn add(&self, entries: &[PathEntry]) {
        let mut map = self.inner.write();
        for entry in entries {
            map.insert(entry.path.clone(), entry.dst.clone());
        }
    }

    pub fn del(&self, entries: &[PathEntry]) {
        let mut map = self.inner.write();
        for entry in entries {
            map.remove(&entry.path);
        }
    }

    pub fn reset(&self) {
        let mut map = self.inner.write();
        map.clear();
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.inner.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, dst: &str) -> PathEntry {
        PathEntry {
            path: path.to_string(),
            dst: dst.to_string(),
        }
    }

    #[test]
    fn add_then_get_round_trips() {
        let map = PathMap::new();
        map.add(&[entry("/a", "127.0.0.1:1"), entry("/b", "127.0.0.1:2")]);
        assert_eq!(map.get("/a").as_deref(), Some("127.0.0.1:1"));
        assert_eq!(map.get("/b").as_deref(), Some("127.0.0.1:2"));
        assert_eq!(map.get("/c"), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn add_overwrites_existing_path() {
        let map = PathMap::new();
        map.add(&[entry("/a", "127.0.0.1:1")]);
        map.add(&[entry("/a", "127.0.0.1:9")]);
        assert_eq!(map.get("/a").as_deref(), Some("127.0.0.1:9"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn del_removes_only_named_paths() {
        let map = PathMap::new();
        map.add(&[entry("/a", "x:1"), entry("/b", "x:2")]);
        map.del(&[entry("/a", "")]);
        assert_eq!(map.get("/a"), None);
        assert_eq!(map.get("/b").as_deref(), Some("x:2"));
    }

    #[test]
    fn reset_clears_the_whole_map() {
        let map = PathMap::new();
        map.add(&[entry("/a", "x:1"), entry("/b", "x:2")]);
        map.reset();
        assert!(map.is_empty());
    }
}
