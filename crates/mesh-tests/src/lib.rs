//! # mesh-tests
//!
//! Integration tests for the meshwork overlay.
//!
//! This crate provides end-to-end coverage over the mock transport:
//! - Router handshake, send and dial policy
//! - Evil-score persistence and ban propagation
//! - Gossip-driven peer discovery and the broadcast primitives

pub mod harness;

#[cfg(test)]
mod router_tests;

#[cfg(test)]
mod manager_tests;


pub use harness::*;
