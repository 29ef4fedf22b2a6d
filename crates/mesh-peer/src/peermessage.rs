//! Gossip messages: connect info, ping scoreboards and the peer list.
//!
//! `ConnectInfo` is both the persistent node-store value and the wire form
//! carried inside `PeerList`:
//!
//! ```text
//! u32 addr_len, addr, u64 ping_nanos,
//! u32 board_len, board_len x (u32 key_len, key, u64 rtt_nanos)
//! ```
//!
//! Lengths and integers are little-endian, matching the KV-store schema.

use crate::message::{Message, MessageType};
use crate::peer::Peer;
use crate::{PeerError, PeerResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

/// One observed round trip on a scoreboard.
#[derive(Debug, Clone)]
pub struct ScoreEntry {
    pub rtt: Duration,
    /// Where the observation came from, for diagnostics.
    pub source: String,
}

/// A peer's observed latency to other peers, gossiped alongside its
/// address.
#[derive(Debug, Default)]
pub struct ScoreBoard {
    entries: DashMap<String, ScoreEntry>,
}

impl ScoreBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation, overwriting any previous one for `addr`.
    pub fn store(&self, addr: impl Into<String>, rtt: Duration, source: impl Into<String>) {
        self.entries.insert(
            addr.into(),
            ScoreEntry {
                rtt,
                source: source.into(),
            },
        );
    }

    /// Look up the recorded round trip to `addr`.
    pub fn load(&self, addr: &str) -> Option<Duration> {
        self.entries.get(addr).map(|e| e.rtt)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn snapshot(&self) -> Vec<(String, Duration)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().rtt))
            .collect()
    }
}

/// Gossiped record for one known node.
///
/// The scoreboard is shared: clones of a `ConnectInfo` observe the same
/// board, mirroring its role as the node store's live value.
#[derive(Clone)]
pub struct ConnectInfo {
    pub address: String,
    pub ping_time: Duration,
    pub ping_score_board: Arc<ScoreBoard>,
}

impl ConnectInfo {
    pub fn new(address: impl Into<String>, ping_time: Duration) -> Self {
        Self {
            address: address.into(),
            ping_time,
            ping_score_board: Arc::new(ScoreBoard::new()),
        }
    }

    /// Serialize to the KV/wire form.
    pub fn encode(&self, buf: &mut BytesMut) {
        let addr = self.address.as_bytes();
        buf.put_u32_le(addr.len() as u32);
        buf.put_slice(addr);
        buf.put_u64_le(self.ping_time.as_nanos() as u64);

        let board = self.ping_score_board.snapshot();
        buf.put_u32_le(board.len() as u32);
        for (key, rtt) in board {
            let key = key.as_bytes();
            buf.put_u32_le(key.len() as u32);
            buf.put_slice(key);
            buf.put_u64_le(rtt.as_nanos() as u64);
        }
    }

    /// Parse from the KV/wire form.
    pub fn decode(buf: &mut Bytes) -> PeerResult<Self> {
        let address = read_string(buf)?;
        if buf.remaining() < 8 {
            return Err(PeerError::InvalidMessage("truncated connect info".into()));
        }
        let ping_time = Duration::from_nanos(buf.get_u64_le());

        if buf.remaining() < 4 {
            return Err(PeerError::InvalidMessage("truncated scoreboard".into()));
        }
        let board_len = buf.get_u32_le() as usize;
        let board = ScoreBoard::new();
        for _ in 0..board_len {
            let key = read_string(buf)?;
            if buf.remaining() < 8 {
                return Err(PeerError::InvalidMessage("truncated scoreboard".into()));
            }
            let rtt = Duration::from_nanos(buf.get_u64_le());
            board.store(key, rtt, "");
        }

        Ok(Self {
            address,
            ping_time,
            ping_score_board: Arc::new(board),
        })
    }
}

impl std::fmt::Debug for ConnectInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectInfo")
            .field("address", &self.address)
            .field("ping_time", &self.ping_time)
            .field("scoreboard_len", &self.ping_score_board.len())
            .finish()
    }
}

fn read_string(buf: &mut Bytes) -> PeerResult<String> {
    if buf.remaining() < 4 {
        return Err(PeerError::InvalidMessage("truncated string".into()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(PeerError::InvalidMessage("truncated string".into()));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| PeerError::InvalidMessage("string is not utf-8".into()))
}

fn write_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Peer-list gossip: a request for the remote's node store, or the
/// response carrying it.
#[derive(Debug, Clone, Default)]
pub struct PeerList {
    pub request: bool,
    pub from: String,
    pub list: HashMap<String, ConnectInfo>,
}

/// Type id of [`PeerList`].
pub fn peer_list_type() -> MessageType {
    static TYPE: OnceLock<MessageType> = OnceLock::new();
    *TYPE.get_or_init(|| MessageType::define("peer.PeerList"))
}

impl Message for PeerList {
    fn message_type(&self) -> MessageType {
        peer_list_type()
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.request as u8);
        write_string(buf, &self.from);
        buf.put_u32_le(self.list.len() as u32);
        for ci in self.list.values() {
            ci.encode(buf);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registry creator for [`PeerList`].
pub fn peer_list_creator(body: &mut Bytes) -> PeerResult<Box<dyn Message>> {
    if body.remaining() < 1 {
        return Err(PeerError::InvalidMessage("truncated peer list".into()));
    }
    let request = body.get_u8() != 0;
    let from = read_string(body)?;

    if body.remaining() < 4 {
        return Err(PeerError::InvalidMessage("truncated peer list".into()));
    }
    let count = body.get_u32_le() as usize;
    let mut list = HashMap::with_capacity(count);
    for _ in 0..count {
        let ci = ConnectInfo::decode(body)?;
        list.insert(ci.address.clone(), ci);
    }

    Ok(Box::new(PeerList {
        request,
        from,
        list,
    }))
}

/// Ask `peer` for its node store.
pub fn send_request_peer_list(peer: &Peer, local_addr: &str) {
    let m = PeerList {
        request: true,
        from: local_addr.to_string(),
        list: HashMap::new(),
    };
    if let Err(e) = peer.send(&m) {
        debug!(peer = %peer.id(), error = %e, "peer list request not sent");
    }
}
