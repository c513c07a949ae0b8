// TallySync - hub-and-spoke dataset replication for offline-first LAN apps

pub mod config;
pub mod liveness;
pub mod replication;
pub mod storage;
pub mod supervisor;
pub mod topology;
pub mod transport;

pub use config::{ConfigError, FlushMode, Role, SyncConfig, SyncTimings};
pub use replication::{Collection, Dataset, Record, RemoteActivity, SyncMessage};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use supervisor::ConnectionStatus;
pub use topology::{PeerSummary, SessionHandle, SyncEvent, TopologyError, TopologyManager};
pub use transport::{MemoryNetwork, PeerMetadata, PeerTransport, TransportError};
