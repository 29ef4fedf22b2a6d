//! # mesh-router
//!
//! Multiplexed connection fabric for the meshwork overlay.
//!
//! This crate provides:
//! - A transport abstraction (TCP and an in-process mock)
//! - The symmetric chain-coordinate handshake and data framing
//! - Per-coordinate connection demultiplexing (`Router`)
//! - Evil-node score accounting with persistent records
//! - Time-bounded handshake caches (`TimedMap`)

mod addr;
mod coord;
mod error;
mod evil;
mod handshake;
mod router;
mod timed_map;
pub mod transport;

pub use addr::{split_addr, strip_port};
pub use coord::{coord_set_hash, ChainCoord, COORD_SIZE};
pub use error::{RouterError, RouterResult};
pub use evil::{EvilDeltas, EvilNodeManager, EvilReason, PhysicalConnInfo, PhysicalConnStore};
pub use handshake::{DataCodec, HandshakeFrame, MAGIC, VERSION};
pub use router::{Config, ConnReceiver, ConnSender, Router, RouterConn};
pub use timed_map::TimedMap;
