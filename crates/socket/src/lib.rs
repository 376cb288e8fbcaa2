//! Multiplexed service connections over framed TCP.
//!
//! One physical connection carries any number of named services. The
//! [`SocketServer`] accepts connections and assigns each a sequential id,
//! announced to the peer in a `Connection` frame; [`SocketClient`] dials and
//! waits for that handshake. Inbound frames are routed by service name to a
//! [`Service`] and by kind to its string, data or JSON handler.

mod client;
mod connection;
mod server;
mod service;

pub use client::SocketClient;
pub use connection::{Connection, ConnectionId, FrameSender, SendError, ServiceSender};
pub use server::{ServerConfig, SocketServer};
pub use service::{HandlerFuture, Service, ServiceRegistry};

/// Per-service inbound queue depth.
///
/// A service that falls this far behind stalls reads on its connection.
pub const SERVICE_QUEUE_DEPTH: usize = 64;

/// Errors produced by the socket layer.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] buildfarm_protocol::ProtocolError),

    #[error("connection timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("service already registered: {0}")]
    DuplicateService(String),
}
