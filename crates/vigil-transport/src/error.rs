//! Transport layer error types

pub use crate::codec::FrameError;
pub use crate::connection::ConnectionError;
pub use crate::discovery::DiscoveryError;
pub use crate::protocol::ProtocolError;
pub use crate::session::SessionError;

use thiserror::Error;

/// Unified transport error type
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
