//! In-memory ban list ordered by expiry.
//!
//! Records live in a slice sorted by timeout, mirrored by an
//! `addr -> timeout` map. The two always agree in membership over
//! non-expired entries; expired records are lazily purged from the slice
//! prefix during `is_ban`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One banned address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanPeerInfo {
    pub net_addr: String,
    /// Absolute expiry, nanoseconds since the epoch.
    pub timeout_nanos: u64,
    /// Original duration, for display.
    pub over_seconds: u32,
}

impl std::fmt::Display for BanPeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} Ban over {}", self.net_addr, self.over_seconds)
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[derive(Default)]
struct ByTimeInner {
    /// Sorted by `timeout_nanos` ascending.
    arr: Vec<BanPeerInfo>,
    /// Mirror: addr -> timeout, used for binary-search removal.
    map: HashMap<String, u64>,
}

/// Ban list sorted by expiry time.
#[derive(Default)]
pub struct ByTime {
    inner: Mutex<ByTimeInner>,
}

impl ByTime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban `addr` for `seconds`. An existing record is re-armed.
    pub fn add(&self, addr: &str, seconds: u32) {
        let timeout = now_nanos() + Duration::from_secs(seconds as u64).as_nanos() as u64;
        let mut inner = self.inner.lock();

        if let Some(old_timeout) = inner.map.get(addr).copied() {
            if let Some(pos) = Self::search(&inner.arr, addr, old_timeout) {
                inner.arr.remove(pos);
            }
        }

        let record = BanPeerInfo {
            net_addr: addr.to_string(),
            timeout_nanos: timeout,
            over_seconds: seconds,
        };
        let at = inner
            .arr
            .partition_point(|r| r.timeout_nanos < record.timeout_nanos);
        inner.arr.insert(at, record);
        inner.map.insert(addr.to_string(), timeout);
    }

    /// Remove a ban.
    pub fn delete(&self, addr: &str) {
        let mut inner = self.inner.lock();
        let Some(timeout) = inner.map.remove(addr) else {
            return;
        };
        if let Some(pos) = Self::search(&inner.arr, addr, timeout) {
            inner.arr.remove(pos);
        }
    }

    /// True while a live record for `addr` exists. Expired records are
    /// dropped from the slice prefix on the way.
    pub fn is_ban(&self, addr: &str) -> bool {
        let now = now_nanos();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let expired = inner.arr.partition_point(|r| r.timeout_nanos <= now);
        for record in inner.arr.drain(..expired) {
            inner.map.remove(&record.net_addr);
        }

        inner.map.contains_key(addr)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Binary search for the record with the cached timeout; scans
    /// neighbours with equal timeouts for the matching address.
    fn search(arr: &[BanPeerInfo], addr: &str, timeout: u64) -> Option<usize> {
        let mut i = arr.partition_point(|r| r.timeout_nanos < timeout);
        while i < arr.len() && arr[i].timeout_nanos == timeout {
            if arr[i].net_addr == addr {
                return Some(i);
            }
            i += 1;
        }
        None
    }
}
