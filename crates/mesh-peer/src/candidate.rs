//! Outbound candidate state machine.

use dashmap::DashMap;

/// State of one outbound candidate.
///
/// Transitions are driven by the candidate manager loop:
/// `RequestWait` on insertion; `RequestWait -> PunishableRequestWait`
/// after the first dial attempt; removal on a matching gossip response;
/// `PeerListWait -> RequestWait` when the connection is gone at tick time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    /// Fresh; will be dialed. Dial failure does not punish.
    RequestWait,
    /// Dial failure reports `DialFail` to the evil-node manager.
    PunishableRequestWait,
    /// Connection exists; waiting for the gossip response.
    PeerListWait,
}

/// In-memory concurrent `addr -> CandidateState`.
#[derive(Default)]
pub struct CandidateMap {
    map: DashMap<String, CandidateState>,
}

impl CandidateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, addr: impl Into<String>, state: CandidateState) {
        self.map.insert(addr.into(), state);
    }

    pub fn load(&self, addr: &str) -> Option<CandidateState> {
        self.map.get(addr).map(|e| *e)
    }

    pub fn delete(&self, addr: &str) {
        self.map.remove(addr);
    }

    /// Visit every entry; stop early when `f` returns false.
    pub fn range(&self, mut f: impl FnMut(&str, CandidateState) -> bool) {
        for entry in self.map.iter() {
            if !f(entry.key(), *entry.value()) {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_load_delete() {
        let m = CandidateMap::new();
        m.store("node1:3000", CandidateState::RequestWait);

        assert_eq!(m.load("node1:3000"), Some(CandidateState::RequestWait));

        m.store("node1:3000", CandidateState::PeerListWait);
        assert_eq!(m.load("node1:3000"), Some(CandidateState::PeerListWait));
        assert_eq!(m.len(), 1);

        m.delete("node1:3000");
        assert_eq!(m.load("node1:3000"), None);
    }
}
