//! A QUIC transport core: the connection state machine, packet and frame coders, loss
//! detection and congestion control, connection-ID management and path migration, and the
//! run loop driving it all. A TLS 1.3 implementation, the UDP socket itself, qlog, ticket
//! storage and HTTP framing are external collaborators (see [`crypto::Session`]) — this crate
//! only implements the transport.

pub mod cid;
pub mod coding;
pub mod congestion;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod packet;
pub mod range_set;
pub mod recovery;
pub mod token;
pub mod transport_parameters;
pub mod varint;

pub use cid::ConnectionId;
pub use connection::streams::StreamId;
pub use connection::Connection;
pub use endpoint::{Endpoint, EndpointConfig};
pub use error::{ConnectionError, QuicError, Result, TransportError, TransportErrorCode};
pub use varint::VarInt;

/// Which role an endpoint plays in a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    Client = 0,
    Server = 1,
}

impl Side {
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

/// The minimum size a UDP datagram carrying a client Initial must be padded to (spec section
/// 4.2: "Client Initials that open the connection are PADDED to exactly 1200 bytes")
pub const MIN_INITIAL_SIZE: usize = 1200;

/// The smallest path MTU a QUIC endpoint may assume without path MTU discovery
pub const MIN_MTU: u16 = 1200;
