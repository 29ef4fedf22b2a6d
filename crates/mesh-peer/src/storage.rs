//! Bounded working set of chosen peers.
//!
//! The storage keeps at most [`MAX_PEER_STORAGE_LEN`] peers, keyed by
//! address, holding only weak references: lookups answer membership, but
//! closing is the connection map's business. When an insertion would
//! exceed capacity, the member with the worst known round trip is evicted
//! through the `kick_out` callback supplied at construction.
//!
//! Contract: the callback must not call back into the storage.

use crate::peer::Peer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Capacity of the working set.
pub const MAX_PEER_STORAGE_LEN: usize = 6;

/// Eviction callback.
pub type KickOutFn = Box<dyn Fn(Arc<Peer>) + Send + Sync>;

/// Bounded peer working set with scored eviction.
pub struct PeerStorage {
    peers: Mutex<HashMap<String, Weak<Peer>>>,
    kick_out: KickOutFn,
}

impl PeerStorage {
    pub fn new(kick_out: KickOutFn) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            kick_out,
        }
    }

    /// Add a peer, evicting the worst-scored member if the set is full.
    ///
    /// `score_of` returns the known round trip to an address; `None` marks
    /// the address unscored, which makes it the preferred victim.
    pub fn add(&self, peer: &Arc<Peer>, score_of: &dyn Fn(&str) -> Option<Duration>) {
        let victim = {
            let mut peers = self.peers.lock();
            peers.retain(|_, weak| weak.strong_count() > 0);

            let addr = peer.net_addr().to_string();
            if peers.contains_key(&addr) {
                return;
            }
            if peers.len() < MAX_PEER_STORAGE_LEN {
                peers.insert(addr, Arc::downgrade(peer));
                return;
            }

            // Full: pick the member with the largest round trip; an
            // unscored member loses to any scored one.
            let mut victim_addr: Option<String> = None;
            let mut victim_score: Option<Duration> = None;
            for member in peers.keys() {
                match (score_of(member), victim_score) {
                    (None, _) => {
                        victim_addr = Some(member.clone());
                        victim_score = None;
                        break;
                    }
                    (Some(rtt), None) if victim_addr.is_none() => {
                        victim_addr = Some(member.clone());
                        victim_score = Some(rtt);
                    }
                    (Some(rtt), Some(worst)) if rtt > worst => {
                        victim_addr = Some(member.clone());
                        victim_score = Some(rtt);
                    }
                    _ => {}
                }
            }

            let victim_addr = match victim_addr {
                Some(a) => a,
                None => return,
            };
            debug!(new = %addr, victim = %victim_addr, "rotating peer storage");
            let evicted = peers.remove(&victim_addr).and_then(|w| w.upgrade());
            peers.insert(addr, Arc::downgrade(peer));
            evicted
        };

        // Invoke outside the lock so the callback may inspect other
        // components freely.
        if let Some(evicted) = victim {
            (self.kick_out)(evicted);
        }
    }

    /// Membership test.
    pub fn have(&self, addr: &str) -> bool {
        self.peers.lock().contains_key(addr)
    }

    /// Current member addresses.
    pub fn list(&self) -> Vec<String> {
        self.peers.lock().keys().cloned().collect()
    }

    /// True while the working set is below capacity.
    pub fn not_enough_peer(&self) -> bool {
        let mut peers = self.peers.lock();
        peers.retain(|_, weak| weak.strong_count() > 0);
        peers.len() < MAX_PEER_STORAGE_LEN
    }
}
