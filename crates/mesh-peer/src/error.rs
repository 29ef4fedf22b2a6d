//! Peer layer error types.

use thiserror::Error;

/// Peer manager errors.
#[derive(Error, Debug)]
pub enum PeerError {
    /// No live peer for the given address.
    #[error("not found peer")]
    NotFoundPeer,

    /// A live peer with the same address already exists.
    #[error("is already connected")]
    IsAlreadyConnected,

    /// The message type is not handled by this handler.
    #[error("unknown message")]
    UnknownMessage,

    /// The peer's bounded send queue is full.
    #[error("send queue full")]
    SendQueueFull,

    /// The peer has been closed.
    #[error("peer closed")]
    PeerClosed,

    /// Malformed message payload.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Router error.
    #[error(transparent)]
    Router(#[from] mesh_router::RouterError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] mesh_storage::StorageError),
}

/// Result type for peer operations.
pub type PeerResult<T> = Result<T, PeerError>;
