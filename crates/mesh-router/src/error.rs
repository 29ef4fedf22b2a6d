//! Router error types.

use thiserror::Error;

/// Router errors.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Address has no numeric port suffix.
    #[error("not found port")]
    NotFoundPort,

    /// Target address resolves to this node.
    #[error("cannot request to local")]
    CannotRequestToLocal,

    /// Target is banned by evil-score admission policy.
    #[error("can not connect to evil node")]
    CanNotConnectToEvilNode,

    /// Target was marked evil by this node; dial policy refuses.
    // The historical spelling is part of the public error surface.
    #[error("do not request to evel node")]
    DoNotRequestToEvelNode,

    /// Handshake produced no shared chain coordinate.
    #[error("no common coordinate")]
    NoCommonCoordinate,

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Router or connection has been shut down.
    #[error("router closed")]
    Closed,

    /// Network string is not `scheme:host`.
    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] mesh_storage::StorageError),
}

/// Result type for router operations.
pub type RouterResult<T> = Result<T, RouterError>;
