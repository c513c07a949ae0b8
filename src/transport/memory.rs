//! In-process peer network
//!
//! A shared broker through which any number of endpoints listen on named
//! addresses and open connections to each other, entirely in-process. Used
//! by the integration tests and the `simulate` CLI command. Connections are
//! pairs of unbounded channels; `silence` drops traffic without any close
//! event, which is how a killed process or a NAT timeout looks from the
//! outside.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{PeerConnection, PeerListener, PeerMetadata, PeerTransport, TransportError};

struct Registration {
    token: u64,
    accept_tx: mpsc::UnboundedSender<MemoryConnection>,
    meta: PeerMetadata,
}

#[derive(Default)]
struct NetworkInner {
    listeners: Mutex<HashMap<String, Registration>>,
    silenced: Mutex<HashSet<String>>,
    next_token: AtomicU64,
}

impl NetworkInner {
    fn is_silenced(&self, address: &str) -> bool {
        self.silenced
            .lock()
            .map(|s| s.contains(address))
            .unwrap_or(false)
    }

    fn release(&self, address: &str, token: u64) {
        if let Ok(mut listeners) = self.listeners.lock() {
            if listeners.get(address).map(|r| r.token) == Some(token) {
                listeners.remove(address);
            }
        }
    }
}

/// The simulated "LAN" shared by every in-process endpoint.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport bound to this network.
    pub fn transport(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
        })
    }

    /// Whether something currently listens on `address`.
    pub fn is_listening(&self, address: &str) -> bool {
        self.inner
            .listeners
            .lock()
            .map(|l| l.get(address).map_or(false, |r| !r.accept_tx.is_closed()))
            .unwrap_or(false)
    }

    /// Silently drop every frame sent from or to `address`. Open connections
    /// stay open and no close event fires.
    pub fn silence(&self, address: &str) {
        if let Ok(mut silenced) = self.inner.silenced.lock() {
            silenced.insert(address.to_string());
        }
    }

    /// Undo [`silence`](Self::silence).
    pub fn restore(&self, address: &str) {
        if let Ok(mut silenced) = self.inner.silenced.lock() {
            silenced.remove(address);
        }
    }
}

/// `PeerTransport` over a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn listen(
        &self,
        address: &str,
        local: &PeerMetadata,
    ) -> Result<Box<dyn PeerListener>, TransportError> {
        let inner = &self.network.inner;
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let token = inner.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut listeners = inner
                .listeners
                .lock()
                .map_err(|_| TransportError::Network("listener registry poisoned".into()))?;
            if let Some(existing) = listeners.get(address) {
                if !existing.accept_tx.is_closed() {
                    return Err(TransportError::AddressTaken(address.to_string()));
                }
            }
            listeners.insert(
                address.to_string(),
                Registration {
                    token,
                    accept_tx,
                    meta: local.clone(),
                },
            );
        }
        Ok(Box::new(MemoryListener {
            address: address.to_string(),
            token,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            network: Arc::clone(inner),
        }))
    }

    async fn connect(
        &self,
        address: &str,
        local: &PeerMetadata,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        let inner = &self.network.inner;
        let (accept_tx, listener_meta) = {
            let listeners = inner
                .listeners
                .lock()
                .map_err(|_| TransportError::Network("listener registry poisoned".into()))?;
            listeners
                .get(address)
                .map(|r| (r.accept_tx.clone(), r.meta.clone()))
                .ok_or_else(|| TransportError::PeerUnavailable(address.to_string()))?
        };

        let (initiator, responder) = MemoryConnection::pair(
            Arc::clone(inner),
            (local.peer_id.clone(), local.clone()),
            (address.to_string(), listener_meta),
        );

        accept_tx
            .send(responder)
            .map_err(|_| TransportError::PeerUnavailable(address.to_string()))?;

        Ok(Box::new(initiator))
    }
}

/// A bound in-process address. Dropping it releases the address.
pub struct MemoryListener {
    address: String,
    token: u64,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
    network: Arc<NetworkInner>,
}

#[async_trait]
impl PeerListener for MemoryListener {
    async fn accept(&self) -> Result<Box<dyn PeerConnection>, TransportError> {
        let mut rx = self.accept_rx.lock().await;
        match rx.recv().await {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(TransportError::Network(format!(
                "listener {} closed",
                self.address
            ))),
        }
    }

    fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.release(&self.address, self.token);
    }
}

/// Both directions of one link. Closing either side clears both senders, so
/// each receiver drains what was already queued and then reports
/// `Disconnected`.
#[derive(Default)]
struct LinkState {
    a_to_b: Option<mpsc::UnboundedSender<Vec<u8>>>,
    b_to_a: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Clone, Copy)]
enum Side {
    A,
    B,
}

/// One end of an in-process link.
pub struct MemoryConnection {
    side: Side,
    link: Arc<Mutex<LinkState>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    local_address: String,
    remote_address: String,
    remote: PeerMetadata,
    network: Arc<NetworkInner>,
}

impl MemoryConnection {
    /// Create a connected pair. `a` is `(address, metadata)` of the
    /// initiating endpoint and `b` of the accepting one.
    fn pair(
        network: Arc<NetworkInner>,
        a: (String, PeerMetadata),
        b: (String, PeerMetadata),
    ) -> (MemoryConnection, MemoryConnection) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let link = Arc::new(Mutex::new(LinkState {
            a_to_b: Some(tx_ab),
            b_to_a: Some(tx_ba),
        }));

        let (a_address, a_meta) = a;
        let (b_address, b_meta) = b;

        let conn_a = MemoryConnection {
            side: Side::A,
            link: Arc::clone(&link),
            rx: tokio::sync::Mutex::new(rx_ba),
            local_address: a_address.clone(),
            remote_address: b_address.clone(),
            remote: b_meta,
            network: Arc::clone(&network),
        };
        let conn_b = MemoryConnection {
            side: Side::B,
            link,
            rx: tokio::sync::Mutex::new(rx_ab),
            local_address: b_address,
            remote_address: a_address,
            remote: a_meta,
            network,
        };
        (conn_a, conn_b)
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        let link = self.link.lock().ok()?;
        match self.side {
            Side::A => link.a_to_b.clone(),
            Side::B => link.b_to_a.clone(),
        }
    }
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    fn remote(&self) -> &PeerMetadata {
        &self.remote
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let tx = self.outbound().ok_or(TransportError::Disconnected)?;
        if self.network.is_silenced(&self.local_address)
            || self.network.is_silenced(&self.remote_address)
        {
            return Ok(());
        }
        tx.send(frame.to_vec())
            .map_err(|_| TransportError::Disconnected)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Disconnected)
    }

    async fn close(&self) {
        if let Ok(mut link) = self.link.lock() {
            link.a_to_b = None;
            link.b_to_a = None;
        }
    }

    fn is_open(&self) -> bool {
        self.link
            .lock()
            .map(|l| l.a_to_b.is_some() && l.b_to_a.is_some())
            .unwrap_or(false)
    }
}
