//! Peer transport layer
//!
//! Abstracts "named endpoint, bidirectional frame channel" so the topology
//! layer never sees sockets. Provides the transport traits, a typed
//! per-connection event stream, an in-process network for tests and
//! simulation, and (behind `tcp-transport`) a LAN TCP implementation.

pub mod memory;
#[cfg(feature = "tcp-transport")]
pub mod tcp;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use memory::{MemoryNetwork, MemoryTransport};
#[cfg(feature = "tcp-transport")]
pub use tcp::TcpTransport;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Another endpoint already listens on this address (or a stale
    /// registration has not expired yet).
    #[error("Address already taken: {0}")]
    AddressTaken(String),

    /// Nobody listens on the target address yet.
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Peer disconnected")]
    Disconnected,
}

/// Identity an endpoint presents to the other side when a connection opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMetadata {
    pub peer_id: String,
    /// Human-readable name shown in the hub's connection list.
    pub label: String,
}

impl PeerMetadata {
    pub fn new(peer_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            label: label.into(),
        }
    }
}

/// An open, ordered, bidirectional frame channel to one remote endpoint.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Metadata announced by the remote endpoint.
    fn remote(&self) -> &PeerMetadata;

    /// Hand one frame to the link. Frames from one sender arrive in send
    /// order. Must not wait on the remote reader: a link that cannot keep up
    /// fails the send and reports itself closed instead.
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive the next frame. Returns `Disconnected` once the link is closed.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Close the link. Both sides observe `Disconnected` afterwards.
    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// A bound address accepting inbound connections. Dropping the listener
/// releases the address.
#[async_trait]
pub trait PeerListener: Send + Sync {
    async fn accept(&self) -> Result<Box<dyn PeerConnection>, TransportError>;

    fn address(&self) -> &str;
}

/// Factory for listeners and outbound connections.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Bind `address`. Fails with `AddressTaken` when the name is in use.
    async fn listen(
        &self,
        address: &str,
        local: &PeerMetadata,
    ) -> Result<Box<dyn PeerListener>, TransportError>;

    /// Open a connection to `address`. Fails with `PeerUnavailable` when
    /// nothing listens there.
    async fn connect(
        &self,
        address: &str,
        local: &PeerMetadata,
    ) -> Result<Box<dyn PeerConnection>, TransportError>;
}

/// Lifecycle events of a single connection, in delivery order:
/// `Open`, any number of `Data`, then exactly one `Close` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Open,
    Data(Vec<u8>),
    Close,
    Error(TransportError),
}

impl ConnectionEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionEvent::Close | ConnectionEvent::Error(_))
    }
}

/// Drive a connection's receive side and forward its events to `sink`.
///
/// `wrap` lets the caller tag each event (connection id, handle epoch)
/// before it enters a shared input queue.
pub fn spawn_event_pump<T, F>(
    conn: Arc<dyn PeerConnection>,
    sink: mpsc::UnboundedSender<T>,
    wrap: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(ConnectionEvent) -> T + Send + 'static,
{
    tokio::spawn(async move {
        if sink.send(wrap(ConnectionEvent::Open)).is_err() {
            return;
        }
        loop {
            let event = match conn.recv().await {
                Ok(frame) => ConnectionEvent::Data(frame),
                Err(TransportError::Disconnected) => ConnectionEvent::Close,
                Err(e) => ConnectionEvent::Error(e),
            };
            let terminal = event.is_terminal();
            if sink.send(wrap(event)).is_err() || terminal {
                break;
            }
        }
    })
}

/// Map a named address onto a port in `[base, base + span)`.
///
/// Every process derives the same port from the same name, which is what
/// lets the address string double as the discovery mechanism on a LAN.
pub fn address_port(address: &str, base: u16, span: u16) -> u16 {
    let hash = Sha256::digest(address.as_bytes());
    let raw = u16::from_be_bytes([hash[0], hash[1]]);
    base.saturating_add(raw % span.max(1))
}
