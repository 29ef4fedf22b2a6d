//! Evil-node accounting.
//!
//! Every remote host has a persisted record with a misbehavior score.
//! Scores only grow during a process lifetime; a host whose score reaches
//! the configured threshold is refused by dial and admission policy.
//! Persistence means a restart does not forgive.

use crate::addr::strip_port;
use crate::{RouterError, RouterResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use mesh_storage::{ColumnFamily, Database, Storage, StorageError};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Reasons reported to [`EvilNodeManager::tell_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvilReason {
    /// An outbound dial to the host failed.
    DialFail,
    /// The host violated the wire protocol.
    ProtocolViolation,
}

/// Score increments per reason, fixed at construction.
#[derive(Debug, Clone)]
pub struct EvilDeltas {
    pub dial_fail: u16,
    pub protocol_violation: u16,
}

impl Default for EvilDeltas {
    fn default() -> Self {
        Self {
            dial_fail: 10,
            protocol_violation: 40,
        }
    }
}

impl EvilDeltas {
    fn delta(&self, reason: EvilReason) -> u16 {
        match reason {
            EvilReason::DialFail => self.dial_fail,
            EvilReason::ProtocolViolation => self.protocol_violation,
        }
    }
}

/// Persisted record for a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalConnInfo {
    /// Remote host (or full address where the port could not be stripped).
    pub addr: String,
    /// Accumulated misbehavior score, saturating at `u16::MAX`.
    pub evil_score: u16,
    /// Reserved; written as 0.
    pub last_seen: u64,
}

impl PhysicalConnInfo {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            evil_score: 0,
            last_seen: 0,
        }
    }

    /// Serialize the value portion: `u16 evil_score, u64 last_seen`,
    /// little-endian.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        buf.put_u16_le(self.evil_score);
        buf.put_u64_le(self.last_seen);
        buf.freeze()
    }

    /// Parse a value read back from storage.
    pub fn decode(addr: String, mut value: Bytes) -> RouterResult<Self> {
        if value.remaining() < 10 {
            return Err(RouterError::Storage(StorageError::Deserialization(
                format!("physical conn record too short: {} bytes", value.remaining()),
            )));
        }
        let evil_score = value.get_u16_le();
        let last_seen = value.get_u64_le();
        Ok(Self {
            addr,
            evil_score,
            last_seen,
        })
    }
}

/// Persistent `host -> PhysicalConnInfo` store over the KV layer.
///
/// Writes are durable before returning. Score mutation is read-modify-write
/// at the caller; [`PhysicalConnStore::lock_addr`] provides the per-address
/// mutex callers must hold across the cycle.
pub struct PhysicalConnStore {
    db: Database,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PhysicalConnStore {
    /// Open the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> RouterResult<Self> {
        Ok(Self {
            db: Database::open(path)?,
            locks: DashMap::new(),
        })
    }

    /// Reuse an already-open database.
    pub fn with_database(db: Database) -> Self {
        Self {
            db,
            locks: DashMap::new(),
        }
    }

    /// Per-address mutex for read-modify-write cycles.
    pub fn lock_addr(&self, addr: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Upsert a record. Durable on return.
    pub fn store(&self, info: &PhysicalConnInfo) -> RouterResult<()> {
        self.db
            .put_sync(ColumnFamily::PhysicalConns, info.addr.as_bytes(), &info.encode())?;
        Ok(())
    }

    /// Fetch a record; `StorageError::KeyNotFound` when absent.
    pub fn get(&self, addr: &str) -> RouterResult<PhysicalConnInfo> {
        match self.db.get(ColumnFamily::PhysicalConns, addr.as_bytes())? {
            Some(value) => PhysicalConnInfo::decode(addr.to_string(), Bytes::from(value)),
            None => Err(RouterError::Storage(StorageError::KeyNotFound)),
        }
    }
}

/// Per-address score accounting with a ban decision.
pub struct EvilNodeManager {
    store: PhysicalConnStore,
    deltas: EvilDeltas,
    ban_threshold: u16,
}

impl EvilNodeManager {
    pub fn new(store: PhysicalConnStore, deltas: EvilDeltas, ban_threshold: u16) -> Self {
        Self {
            store,
            deltas,
            ban_threshold,
        }
    }

    /// Report misbehavior by reason; the increment comes from the fixed
    /// delta table.
    pub fn tell_on(&self, addr: &str, reason: EvilReason) {
        self.update_evil_score(addr, self.deltas.delta(reason));
    }

    /// Add `delta` to the host's score, saturating at `u16::MAX`.
    ///
    /// Public form used when higher layers convict a peer.
    pub fn update_evil_score(&self, addr: &str, delta: u16) {
        let host = strip_port(addr).unwrap_or(addr).to_string();

        let lock = self.store.lock_addr(&host);
        let _guard = lock.lock();

        let mut info = match self.store.get(&host) {
            Ok(info) => info,
            Err(RouterError::Storage(StorageError::KeyNotFound)) => {
                PhysicalConnInfo::new(host.clone())
            }
            Err(e) => {
                warn!(addr = %host, error = %e, "evil score read failed");
                return;
            }
        };

        info.evil_score = info.evil_score.saturating_add(delta);
        debug!(addr = %host, score = info.evil_score, delta, "evil score updated");

        if let Err(e) = self.store.store(&info) {
            warn!(addr = %host, error = %e, "evil score write failed");
        }
    }

    /// True when the host's persisted score has reached the ban threshold.
    pub fn is_ban_node(&self, addr: &str) -> bool {
        let host = strip_port(addr).unwrap_or(addr);
        match self.store.get(host) {
            Ok(info) => info.evil_score >= self.ban_threshold,
            Err(_) => false,
        }
    }

    /// The underlying persistent store.
    pub fn store(&self) -> &PhysicalConnStore {
        &self.store
    }

    /// The configured ban threshold.
    pub fn ban_threshold(&self) -> u16 {
        self.ban_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> EvilNodeManager {
        let store = PhysicalConnStore::open(tmp.path()).unwrap();
        EvilNodeManager::new(store, EvilDeltas::default(), 100)
    }

    #[test]
    fn test_conn_info_roundtrip() {
        let mut info = PhysicalConnInfo::new("test");
        info.evil_score = 10;

        let decoded = PhysicalConnInfo::decode("test".into(), info.encode()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_score_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = PhysicalConnStore::open(tmp.path()).unwrap();
            let mut info = PhysicalConnInfo::new("test");
            info.evil_score = 10;
            store.store(&info).unwrap();

            let mut read = store.get("test").unwrap();
            assert_eq!(read.evil_score, 10);

            read.evil_score *= 10;
            store.store(&read).unwrap();
        }

        let store = PhysicalConnStore::open(tmp.path()).unwrap();
        assert_eq!(store.get("test").unwrap().evil_score, 100);
    }

    #[test]
    fn test_tell_on_accumulates_and_bans() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);

        for _ in 0..9 {
            mgr.tell_on("node1:3000", EvilReason::DialFail);
        }
        assert!(!mgr.is_ban_node("node1:3000"));

        mgr.tell_on("node1:3000", EvilReason::DialFail);
        assert!(mgr.is_ban_node("node1:3000"));
        // The record is keyed by host, so any port matches.
        assert!(mgr.is_ban_node("node1:9999"));
    }

    #[test]
    fn test_score_saturates() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);

        mgr.update_evil_score("node2", u16::MAX - 5);
        mgr.update_evil_score("node2", 1000);

        let info = mgr.store().get("node2").unwrap();
        assert_eq!(info.evil_score, u16::MAX);
    }

    #[test]
    fn test_unknown_host_is_not_banned() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        assert!(!mgr.is_ban_node("stranger:3000"));
    }
}
