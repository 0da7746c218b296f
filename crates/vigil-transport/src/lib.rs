//! # Vigil Transport
//!
//! Streams store events from a device to a viewer over a framed TCP
//! protocol.
//!
//! ## Features
//!
//! - Length-prefixed, deflate-compressed frames with incremental reassembly
//! - Handshake, pause/resume flow control and keepalive pings
//! - Automatic connection to discovered servers in most-recently-used order
//! - Request mocking driven by the viewer
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vigil_transport::{ManualDiscovery, RemoteSession, SessionConfig};
//!
//! let discovery = ManualDiscovery::new();
//! let session = RemoteSession::start(
//!     SessionConfig::default().with_known_servers_path("servers.json"),
//!     Arc::new(discovery.clone()),
//!     store.subscribe(),
//! )?;
//! session.enable()?;
//!
//! // Found endpoints are connected to automatically
//! discovery.announce(Endpoint::new("Mac-1", "192.168.1.20:9090".parse()?));
//! ```

pub mod codec;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod known_servers;
pub mod mocks;
pub mod protocol;
pub mod server;
pub mod session;

// Re-export main types
pub use codec::{DEFAULT_MAX_FRAME_SIZE, Frame, FrameReassembler};
pub use connection::{BoxedStream, ConnectionState, Connector, StreamConnection, TcpConnector};
pub use discovery::{Discovery, DiscoveryEvent, Endpoint, ManualDiscovery, StaticDiscovery};
pub use error::{
    ConnectionError, DiscoveryError, FrameError, ProtocolError, SessionError, TransportError,
    TransportResult,
};
pub use known_servers::{KnownServer, KnownServers};
pub use mocks::{Mock, MockRegistry, MockedResponse};
pub use protocol::{ClientHello, Message, PROTOCOL_VERSION, PacketCode, Path, ServerHello};
pub use server::{ConnectedClient, ServerEvent, ViewerServer, ViewerServerConfig};
pub use session::{
    ConnectionStatus, DisconnectReason, DiscoveryStatus, RemoteSession, SessionConfig,
    SessionStatus,
};
