//! Peer wire protocol: messages, framing and transports

pub mod codec;
pub mod mem;
pub mod message;
pub mod transport;

pub use message::{AppendRequest, AppendResponse, ClientOp, OpResult, PeerMessage, WireError};
pub use transport::{serve_peer, PeerHandler, TcpTransport, Transport};
