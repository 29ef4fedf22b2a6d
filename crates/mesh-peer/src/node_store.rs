//! Persistent set of known node addresses.
//!
//! Backed by the KV layer's `Nodes` column family and fully loaded at
//! open. Insertion order is preserved for `get(index)`, which the
//! rotation cursor depends on; iteration order of entries loaded from
//! disk is unspecified but stable within a process.

use crate::peermessage::ConnectInfo;
use crate::{PeerError, PeerResult};
use bytes::{Bytes, BytesMut};
use mesh_storage::{ColumnFamily, Database, Storage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Default)]
struct NodeStoreInner {
    order: Vec<String>,
    map: HashMap<String, ConnectInfo>,
}

/// Persistent `addr -> ConnectInfo` with a stable index.
pub struct NodeStore {
    db: Database,
    inner: RwLock<NodeStoreInner>,
}

impl NodeStore {
    /// Open the store, loading every persisted record.
    pub fn open<P: AsRef<Path>>(path: P) -> PeerResult<Self> {
        let db = Database::open(path).map_err(PeerError::Storage)?;
        Self::with_database(db)
    }

    /// Load from an already-open database.
    pub fn with_database(db: Database) -> PeerResult<Self> {
        let mut inner = NodeStoreInner::default();
        for (key, value) in db.iter(ColumnFamily::Nodes)? {
            let addr = String::from_utf8_lossy(&key).to_string();
            let mut raw = Bytes::from(value);
            match ConnectInfo::decode(&mut raw) {
                Ok(ci) => {
                    inner.order.push(addr.clone());
                    inner.map.insert(addr, ci);
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "dropping undecodable node record");
                }
            }
        }
        debug!(count = inner.order.len(), "node store loaded");

        Ok(Self {
            db,
            inner: RwLock::new(inner),
        })
    }

    /// Upsert a record and persist it.
    pub fn store(&self, addr: &str, info: ConnectInfo) {
        {
            let mut inner = self.inner.write();
            if !inner.map.contains_key(addr) {
                inner.order.push(addr.to_string());
            }
            inner.map.insert(addr.to_string(), info.clone());
        }
        self.persist_info(addr, &info);
    }

    /// Return the existing record or insert (and persist) `info`.
    pub fn load_or_store(&self, addr: &str, info: ConnectInfo) -> ConnectInfo {
        let (existing, inserted) = {
            let mut inner = self.inner.write();
            match inner.map.get(addr) {
                Some(ci) => (ci.clone(), false),
                None => {
                    inner.order.push(addr.to_string());
                    inner.map.insert(addr.to_string(), info.clone());
                    (info, true)
                }
            }
        };
        if inserted {
            self.persist_info(addr, &existing);
        }
        existing
    }

    pub fn load(&self, addr: &str) -> Option<ConnectInfo> {
        self.inner.read().map.get(addr).cloned()
    }

    /// Visit every record in index order; stop early when `f` returns
    /// false.
    pub fn range(&self, mut f: impl FnMut(&str, &ConnectInfo) -> bool) {
        let inner = self.inner.read();
        for addr in &inner.order {
            if let Some(ci) = inner.map.get(addr) {
                if !f(addr, ci) {
                    break;
                }
            }
        }
    }

    /// The record at insertion index `index`.
    pub fn get(&self, index: usize) -> Option<ConnectInfo> {
        let inner = self.inner.read();
        let addr = inner.order.get(index)?;
        inner.map.get(addr).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-persist the current in-memory record for `addr`, picking up
    /// scoreboard mutations.
    pub fn persist(&self, addr: &str) {
        if let Some(info) = self.load(addr) {
            self.persist_info(addr, &info);
        }
    }

    fn persist_info(&self, addr: &str, info: &ConnectInfo) {
        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        if let Err(e) = self.db.put(ColumnFamily::Nodes, addr.as_bytes(), &buf) {
            warn!(addr = %addr, error = %e, "node record write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_insertion_order_preserved() {
        let tmp = TempDir::new().unwrap();
        let store = NodeStore::open(tmp.path()).unwrap();

        for i in 0..5 {
            let addr = format!("node{}:3000", i);
            store.store(&addr, ConnectInfo::new(addr.clone(), Duration::ZERO));
        }

        assert_eq!(store.len(), 5);
        assert_eq!(store.get(2).unwrap().address, "node2:3000");

        // Re-storing must not duplicate the index entry.
        store.store(
            "node2:3000",
            ConnectInfo::new("node2:3000", Duration::from_millis(1)),
        );
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_reload_from_disk() {
        let tmp = TempDir::new().unwrap();
        {
            let store = NodeStore::open(tmp.path()).unwrap();
            let ci = ConnectInfo::new("node1:3000", Duration::from_millis(12));
            ci.ping_score_board
                .store("node2:3000", Duration::from_millis(3), "test");
            store.store("node1:3000", ci);
            store.persist("node1:3000");
        }

        let store = NodeStore::open(tmp.path()).unwrap();
        let ci = store.load("node1:3000").unwrap();
        assert_eq!(ci.ping_time, Duration::from_millis(12));
        assert_eq!(
            ci.ping_score_board.load("node2:3000"),
            Some(Duration::from_millis(3))
        );
    }

    #[test]
    fn test_load_or_store_returns_existing() {
        let tmp = TempDir::new().unwrap();
        let store = NodeStore::open(tmp.path()).unwrap();

        let first = store.load_or_store(
            "node1:3000",
            ConnectInfo::new("node1:3000", Duration::from_millis(5)),
        );
        first
            .ping_score_board
            .store("node9:3000", Duration::from_millis(1), "test");

        let second = store.load_or_store(
            "node1:3000",
            ConnectInfo::new("node1:3000", Duration::from_millis(99)),
        );

        // The shared scoreboard proves the existing record came back.
        assert_eq!(second.ping_time, Duration::from_millis(5));
        assert_eq!(second.ping_score_board.len(), 1);
    }
}
