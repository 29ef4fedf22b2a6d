//! # mesh-peer
//!
//! Peer management for the meshwork overlay.
//!
//! This crate provides:
//! - Candidate-driven outbound peering with retry and punishment
//! - Peer-list gossip with ping scoreboards
//! - Broadcast primitives over the live connection map
//! - A bounded working set of chosen peers with scored rotation
//! - Time-limited bans

mod ban;
mod candidate;
mod connect_map;
mod error;
mod events;
mod manager;
mod message;
mod node_store;
mod peer;
mod peermessage;
mod storage;

pub use ban::{BanPeerInfo, ByTime};
pub use candidate::{CandidateMap, CandidateState};
pub use connect_map::ConnectMap;
pub use error::{PeerError, PeerResult};
pub use events::EventHandler;
pub use manager::{Config, Manager};
pub use message::{
    encode_message, read_message_type, Creator, Message, MessageRegistry, MessageType,
};
pub use node_store::NodeStore;
pub use peer::{DeletePeerFn, OnRecvFn, Peer};
pub use peermessage::{
    peer_list_creator, peer_list_type, send_request_peer_list, ConnectInfo, PeerList, ScoreBoard,
    ScoreEntry,
};
pub use storage::{KickOutFn, PeerStorage, MAX_PEER_STORAGE_LEN};
