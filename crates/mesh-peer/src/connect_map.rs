//! Live peer map.

use crate::peer::Peer;
use dashmap::DashMap;
use std::sync::Arc;

/// In-memory concurrent `addr -> Peer` for live connections.
#[derive(Default)]
pub struct ConnectMap {
    map: DashMap<String, Arc<Peer>>,
}

impl ConnectMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, addr: impl Into<String>, peer: Arc<Peer>) {
        self.map.insert(addr.into(), peer);
    }

    pub fn load(&self, addr: &str) -> Option<Arc<Peer>> {
        self.map.get(addr).map(|e| e.value().clone())
    }

    pub fn delete(&self, addr: &str) {
        self.map.remove(addr);
    }

    /// Visit every entry; stop early when `f` returns false.
    pub fn range(&self, mut f: impl FnMut(&str, &Arc<Peer>) -> bool) {
        for entry in self.map.iter() {
            if !f(entry.key(), entry.value()) {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
