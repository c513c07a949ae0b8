//! LAN transport over TCP
//!
//! Frames are newline-delimited JSON documents. The connecting side writes a
//! hello line carrying its [`PeerMetadata`] and the accepting side answers
//! with its own, so both ends know who they talk to before the first data
//! frame. Named addresses map to a port derived from the name, so the hub
//! address string is all a workstation needs.
//!
//! Every connection owns a writer task fed by a bounded queue. `send` only
//! enqueues, so a peer that stops reading can never stall the caller; once
//! its queue overflows or a write stalls past [`WRITE_TIMEOUT`] the link is
//! reported closed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

use super::{
    address_port, PeerConnection, PeerListener, PeerMetadata, PeerTransport, TransportError,
};

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
/// Frames queued per connection before the link is given up on.
pub const SEND_QUEUE: usize = 32;
/// Longest a single frame may take to reach the kernel.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where named addresses live on the network.
#[derive(Clone, Debug)]
pub struct TcpTransportConfig {
    /// Interface the hub binds to.
    pub bind_host: String,
    /// Host workstations dial for named addresses.
    pub remote_host: String,
    /// First port of the range named addresses hash into.
    pub port_base: u16,
    pub port_span: u16,
    /// Bound on the TCP handshake plus hello exchange when connecting.
    pub connect_timeout: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            remote_host: "127.0.0.1".to_string(),
            port_base: 40000,
            port_span: 20000,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Resolve an address string. A literal socket address is used as-is,
    /// anything else is a name hashed into the configured port range.
    pub fn resolve(&self, address: &str, host: &str) -> String {
        if address.parse::<SocketAddr>().is_ok() {
            return address.to_string();
        }
        let port = address_port(address, self.config.port_base, self.config.port_span);
        format!("{}:{}", host, port)
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn listen(
        &self,
        address: &str,
        local: &PeerMetadata,
    ) -> Result<Box<dyn PeerListener>, TransportError> {
        let target = self.resolve(address, &self.config.bind_host);
        let listener = TcpListener::bind(&target).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => TransportError::AddressTaken(address.to_string()),
            _ => TransportError::Network(format!("bind {}: {}", target, e)),
        })?;
        log::info!("Listening for {} on {}", address, target);
        Ok(Box::new(TcpPeerListener {
            address: address.to_string(),
            local: local.clone(),
            listener,
        }))
    }

    async fn connect(
        &self,
        address: &str,
        local: &PeerMetadata,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        let target = self.resolve(address, &self.config.remote_host);
        // A host that drops SYNs would otherwise hold the attempt for the
        // OS connect timeout.
        let attempt = dial(&target, address, local);
        match tokio::time::timeout(self.config.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                log::debug!("Connect to {} timed out", target);
                Err(TransportError::PeerUnavailable(address.to_string()))
            }
        }
    }
}

async fn dial(
    target: &str,
    address: &str,
    local: &PeerMetadata,
) -> Result<Box<dyn PeerConnection>, TransportError> {
    let stream = TcpStream::connect(target).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            TransportError::PeerUnavailable(address.to_string())
        }
        _ => TransportError::Network(format!("connect {}: {}", target, e)),
    })?;
    let (read_half, mut write_half) = stream.into_split();
    write_frame(&mut write_half, &encode_hello(local)?).await?;

    let mut lines = BufReader::new(read_half).lines();
    let remote = read_hello(&mut lines).await?;

    Ok(Box::new(TcpConnection::new(remote, lines, write_half)))
}

pub struct TcpPeerListener {
    address: String,
    local: PeerMetadata,
    listener: TcpListener,
}

#[async_trait]
impl PeerListener for TcpPeerListener {
    async fn accept(&self) -> Result<Box<dyn PeerConnection>, TransportError> {
        loop {
            let (socket, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| TransportError::Network(format!("accept: {}", e)))?;
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();

            let remote = match read_hello(&mut lines).await {
                Ok(remote) => remote,
                Err(e) => {
                    log::warn!("Dropping connection from {} without hello: {}", peer_addr, e);
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut write_half, &encode_hello(&self.local)?).await {
                log::warn!("Failed to answer hello from {}: {}", peer_addr, e);
                continue;
            }
            log::debug!("Accepted {} ({}) from {}", remote.label, remote.peer_id, peer_addr);
            return Ok(Box::new(TcpConnection::new(remote, lines, write_half)));
        }
    }

    fn address(&self) -> &str {
        &self.address
    }
}

pub struct TcpConnection {
    remote: PeerMetadata,
    reader: Mutex<Lines<BufReader<OwnedReadHalf>>>,
    /// `None` once the link is closed; dropping it stops the writer.
    outbound: std::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    open: Arc<AtomicBool>,
}

impl TcpConnection {
    fn new(
        remote: PeerMetadata,
        reader: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    ) -> Self {
        let (tx, rx) = mpsc::channel(SEND_QUEUE);
        let open = Arc::new(AtomicBool::new(true));
        tokio::spawn(run_writer(writer, rx, Arc::clone(&open), remote.peer_id.clone()));
        Self {
            remote,
            reader: Mutex::new(reader),
            outbound: std::sync::Mutex::new(Some(tx)),
            open,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.outbound.lock().ok().and_then(|tx| tx.clone())
    }

    fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Ok(mut tx) = self.outbound.lock() {
            tx.take();
        }
    }
}

/// Drain queued frames onto the socket until the queue closes or a write
/// fails or stalls, then shut the write side down.
async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Vec<u8>>,
    open: Arc<AtomicBool>,
    peer: String,
) {
    while let Some(frame) = queue.recv().await {
        match tokio::time::timeout(WRITE_TIMEOUT, write_frame(&mut writer, &frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("Write to {} failed: {}", peer, e);
                break;
            }
            Err(_) => {
                log::warn!("Write to {} stalled for {:?}", peer, WRITE_TIMEOUT);
                break;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
    let _ = tokio::time::timeout(WRITE_TIMEOUT, writer.shutdown()).await;
}

#[async_trait]
impl PeerConnection for TcpConnection {
    fn remote(&self) -> &PeerMetadata {
        &self.remote
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.contains(&b'\n') {
            return Err(TransportError::Network("frame contains a newline".into()));
        }
        let tx = self
            .sender()
            .filter(|_| self.is_open())
            .ok_or(TransportError::Disconnected)?;
        match tx.try_send(frame.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::warn!("{} is not reading, dropping the link", self.remote.peer_id);
                self.shut();
                Err(TransportError::Network("send queue full".into()))
            }
            Err(TrySendError::Closed(_)) => {
                self.shut();
                Err(TransportError::Disconnected)
            }
        }
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut reader = self.reader.lock().await;
        match reader.next_line().await {
            Ok(Some(line)) => Ok(line.into_bytes()),
            Ok(None) => {
                self.open.store(false, Ordering::SeqCst);
                Err(TransportError::Disconnected)
            }
            Err(e) => {
                self.open.store(false, Ordering::SeqCst);
                Err(TransportError::Network(e.to_string()))
            }
        }
    }

    async fn close(&self) {
        // The writer flushes what is queued, then shuts the socket.
        self.shut();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

fn encode_hello(local: &PeerMetadata) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(local).map_err(|e| TransportError::Network(e.to_string()))
}

async fn read_hello(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
) -> Result<PeerMetadata, TransportError> {
    let line = tokio::time::timeout(HELLO_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| TransportError::Network("hello timed out".into()))?
        .map_err(|e| TransportError::Network(e.to_string()))?
        .ok_or(TransportError::Disconnected)?;
    serde_json::from_str(&line).map_err(|e| TransportError::Network(format!("bad hello: {}", e)))
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> Result<(), TransportError> {
    if frame.contains(&b'\n') {
        return Err(TransportError::Network("frame contains a newline".into()));
    }
    writer
        .write_all(frame)
        .await
        .map_err(|e| TransportError::Network(e.to_string()))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| TransportError::Network(e.to_string()))
}
