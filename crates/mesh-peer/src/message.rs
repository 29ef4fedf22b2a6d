//! Message registry contract.
//!
//! Messages travel inside data frames as `u64 type (big-endian), body`.
//! A type id is derived from the message's registered name, so independent
//! builds agree without a central table. The registry maps type ids to
//! decoder functions; a miss is reported as `UnknownMessage`, which the
//! dispatch loop treats as "not mine".

use crate::{PeerError, PeerResult};
use blake2::{Blake2b, Digest};
use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use std::any::Any;

/// Typed message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType(u64);

impl MessageType {
    /// Derive a type id from a message name.
    pub fn define(name: &str) -> Self {
        let digest = Blake2b::<typenum::U8>::digest(name.as_bytes());
        Self(u64::from_be_bytes(digest.into()))
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A typed overlay message.
pub trait Message: Send + Sync + 'static {
    /// The message's type id.
    fn message_type(&self) -> MessageType;

    /// Serialize the message body (without the type prefix).
    fn encode_body(&self, buf: &mut BytesMut);

    /// Downcast support for dispatch.
    fn as_any(&self) -> &dyn Any;
}

/// Serialize a message to its wire form: `u64 type, body`.
pub fn encode_message(m: &dyn Message) -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&m.message_type().as_u64().to_be_bytes());
    m.encode_body(&mut buf);
    buf.freeze()
}

/// Decoder function for one message type.
pub type Creator = fn(&mut Bytes) -> PeerResult<Box<dyn Message>>;

/// Maps message types to their decoders.
#[derive(Default)]
pub struct MessageRegistry {
    creators: DashMap<MessageType, Creator>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder for a type.
    pub fn set_creator(&self, t: MessageType, creator: Creator) {
        self.creators.insert(t, creator);
    }

    /// Decode a message body, or `UnknownMessage` when the type is not
    /// registered here.
    pub fn parse(&self, t: MessageType, body: &mut Bytes) -> PeerResult<Box<dyn Message>> {
        let creator = self.creators.get(&t).ok_or(PeerError::UnknownMessage)?;
        (*creator)(body)
    }
}

/// Split the type prefix off a raw payload.
pub fn read_message_type(payload: &mut Bytes) -> PeerResult<MessageType> {
    if payload.remaining() < 8 {
        return Err(PeerError::InvalidMessage("missing type prefix".into()));
    }
    Ok(MessageType::from_u64(payload.get_u64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_is_stable_per_name() {
        let a = MessageType::define("peer.PeerList");
        let b = MessageType::define("peer.PeerList");
        let c = MessageType::define("peer.Other");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_registry_miss_is_unknown_message() {
        let registry = MessageRegistry::new();
        let mut body = Bytes::new();
        let err = registry
            .parse(MessageType::define("nobody"), &mut body)
            .unwrap_err();
        assert!(matches!(err, PeerError::UnknownMessage));
    }
}
