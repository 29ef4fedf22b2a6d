//! Event-handler contract for higher layers.

use crate::message::MessageType;
use crate::peer::Peer;
use crate::{PeerError, PeerResult};
use bytes::Bytes;
use std::sync::Arc;

/// Hooks invoked by the peer manager around a peer's lifecycle.
///
/// Handlers run in registration order. `on_recv` returning
/// [`PeerError::UnknownMessage`] means "not mine, try the next handler";
/// any other error stops dispatch for that message.
///
/// Contract: handlers must not call back into handler registration or any
/// manager method that takes the handler list exclusively.
pub trait EventHandler: Send + Sync {
    /// Runs before the peer is admitted; the first error aborts the
    /// connection.
    fn before_connect(&self, _peer: &Arc<Peer>) -> PeerResult<()> {
        Ok(())
    }

    /// Runs after the peer was admitted, on every handler regardless of
    /// errors.
    fn after_connect(&self, _peer: &Arc<Peer>) {}

    /// Handle one received message.
    fn on_recv(&self, _peer: &Arc<Peer>, _msg_type: MessageType, _body: Bytes) -> PeerResult<()> {
        Err(PeerError::UnknownMessage)
    }

    /// Runs when a peer goes away.
    fn on_closed(&self, _peer: &Arc<Peer>) {}
}
