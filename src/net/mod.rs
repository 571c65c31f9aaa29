//! Networking: control channel, connections, package maps
//!
//! The control channel is a reliable ordered byte stream per peer. Every
//! message is a single type tag byte followed by a typed payload; the
//! message set is a closed enum so encode/decode is one dispatch per tag.

pub mod auth;
pub mod connection;
pub mod control;
pub mod driver;
pub mod message;
pub mod package_map;
pub mod transport;

pub use auth::{AuthModule, NullAuth};
pub use connection::{ActorChannel, ClientPhase, Connection, ConnectionStats, ControlState};
pub use driver::NetDriver;
pub use message::{AuthChunk, ControlMessage, PeerAddr, WirePackageInfo};
pub use package_map::{NetIndexRange, PackageInfo, PackageMap};
pub use transport::{MemoryTransport, TcpTransport, Transport};

/// Lower bound of the server-side clamp on client-requested rates
pub const MIN_CLIENT_RATE: i32 = 1800;

/// Result type for network operations
pub type NetResult<T> = Result<T, NetError>;

/// Errors raised by the network layer
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("Encode failed: {message}")]
    Encode { message: String },

    #[error("Decode failed: {message}")]
    Decode { message: String },

    #[error("Unknown control message tag {tag}")]
    UnknownTag { tag: u8 },

    #[error("Transport closed")]
    TransportClosed,

    #[error("Frame too large: {size} bytes")]
    FrameTooLarge { size: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
