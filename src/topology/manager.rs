//! TopologyManager: one replication session
//!
//! A session is a single tokio task that owns the transport handle, the
//! connection registry, the replication engine, the liveness clock and the
//! reconnection supervisor. Commands from [`SessionHandle`]s, per-connection
//! events, listener results and timer fires all arrive on channels and are
//! processed one at a time, so session state needs no locks.
//!
//! Every transport handle generation gets an epoch. Tearing a handle down
//! bumps the epoch, and anything still in flight from the old generation
//! (attempt results, accepted links, close events) is discarded on arrival.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::registry::{ConnectionId, ConnectionRegistry, PeerEntry, PeerSummary};
use super::{SyncEvent, TopologyError};
use crate::config::{Role, SyncConfig};
use crate::liveness::{LivenessMonitor, LivenessSettings};
use crate::replication::{
    Dataset, Ingest, MergeOutcome, Record, ReplicationEngine, ReplicationError, SyncMessage,
};
use crate::storage::{self, BackupMirror, KeyValueStore};
use crate::supervisor::{
    ConnectionStatus, FailureKind, ReconnectionSupervisor, RetryPolicy, Scheduler, TimerFired,
};
use crate::transport::{
    spawn_event_pump, ConnectionEvent, PeerConnection, PeerListener, PeerMetadata, PeerTransport,
    TransportError,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Timer {
    Flush,
    Ping,
    LivenessCheck,
    Retry,
    /// FULL_PUSH to a freshly joined connection.
    Settle(ConnectionId),
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Start(Reply<()>),
    Upsert {
        collection: String,
        record: Record,
        reply: Reply<Result<Record, ReplicationError>>,
    },
    Delete {
        collection: String,
        id: String,
        reply: Reply<Result<Record, ReplicationError>>,
    },
    Dataset(Reply<Dataset>),
    Peers(Reply<Vec<PeerSummary>>),
    ForceReset(Reply<()>),
    Shutdown(Reply<()>),
}

enum Attempt {
    Listening(Box<dyn PeerListener>),
    Connected(Box<dyn PeerConnection>),
    Failed(TransportError),
}

enum Input {
    Attempt {
        epoch: u64,
        outcome: Attempt,
    },
    Accepted {
        epoch: u64,
        conn: Box<dyn PeerConnection>,
    },
    ListenerFailed {
        epoch: u64,
        error: TransportError,
    },
    Connection {
        epoch: u64,
        id: ConnectionId,
        event: ConnectionEvent,
    },
}

/// A workstation's single link to the hub.
struct Upstream {
    id: ConnectionId,
    conn: Arc<dyn PeerConnection>,
    pump: JoinHandle<()>,
}

pub struct TopologyManager;

impl TopologyManager {
    /// Restore the persisted dataset and spawn the session task. The session
    /// stays idle until [`SessionHandle::start`].
    pub async fn spawn(
        config: SyncConfig,
        transport: Arc<dyn PeerTransport>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<SessionHandle, TopologyError> {
        config.validate()?;

        let peer_id = config
            .self_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let label = config
            .display_name
            .clone()
            .unwrap_or_else(|| default_display_name(config.role, &peer_id));
        let address = config.hub_address();

        let dataset = storage::load_or_default(
            store.as_ref(),
            &storage::dataset_key(&config.dataset_id),
            Dataset::new(),
        )
        .await;
        if let Err(e) = storage::save_json(store.as_ref(), storage::LAST_CONFIG_KEY, &config).await
        {
            log::warn!("Failed to persist configuration: {}", e);
        }

        let engine = ReplicationEngine::new(peer_id.clone(), dataset)
            .with_flush_mode(config.flush_mode)
            .with_suppression_window(config.timings.suppression_window())
            .with_allow_list(config.collections.clone())
            .with_audit(config.audit_collection.clone(), config.local_user.clone());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (scheduler, timers_rx) = Scheduler::new();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let liveness = LivenessSettings::from(&config.timings);
        log::info!(
            "Session {} ({}) as {} for dataset {} with {} records",
            label,
            peer_id,
            config.role,
            config.dataset_id,
            engine.dataset().record_count()
        );

        let handle = SessionHandle {
            commands: commands_tx,
            events: events_tx.clone(),
            status: status_rx,
            peer_id: peer_id.clone(),
            role: config.role,
            hub_address: address.clone(),
        };

        let session = Session {
            role: config.role,
            local: PeerMetadata::new(peer_id, label),
            address,
            transport,
            store,
            backup: config.backup_dir.clone().map(BackupMirror::new),
            engine,
            supervisor: ReconnectionSupervisor::new(RetryPolicy::from(&config.timings)),
            scheduler,
            liveness_monitor: LivenessMonitor::new(liveness.timeout, Instant::now()),
            liveness,
            registry: ConnectionRegistry::new(),
            upstream: None,
            accept_task: None,
            epoch: 0,
            next_connection_id: 0,
            started: false,
            inputs_tx,
            events: events_tx,
            status_tx,
            config,
        };
        tokio::spawn(session.run(commands_rx, inputs_rx, timers_rx));

        Ok(handle)
    }
}

/// The last configuration any session persisted to `store`.
pub async fn load_last_config(store: &dyn KeyValueStore) -> Option<SyncConfig> {
    storage::load_or_default(store, storage::LAST_CONFIG_KEY, None).await
}

fn default_display_name(role: Role, peer_id: &str) -> String {
    let short: String = peer_id.chars().take(8).collect();
    match role {
        Role::Hub => format!("Hub {}", short),
        Role::Workstation => format!("Workstation {}", short),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct Session {
    config: SyncConfig,
    role: Role,
    local: PeerMetadata,
    address: String,
    transport: Arc<dyn PeerTransport>,
    store: Arc<dyn KeyValueStore>,
    backup: Option<BackupMirror>,
    engine: ReplicationEngine,
    supervisor: ReconnectionSupervisor,
    scheduler: Scheduler<Timer>,
    liveness: LivenessSettings,
    liveness_monitor: LivenessMonitor,
    /// Hub only.
    registry: ConnectionRegistry,
    /// Workstation only.
    upstream: Option<Upstream>,
    /// Hub only. Owns the listener; aborting it releases the address.
    accept_task: Option<JoinHandle<()>>,
    epoch: u64,
    next_connection_id: ConnectionId,
    /// Whether the session should be connected. Cleared on shutdown.
    started: bool,
    inputs_tx: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<SyncEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut timers: mpsc::UnboundedReceiver<TimerFired<Timer>>,
    ) {
        self.scheduler
            .schedule_once(Timer::Flush, self.config.timings.flush_interval());

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        // Every handle is gone.
                        self.shutdown().await;
                        break;
                    }
                },
                Some(input) = inputs.recv() => self.handle_input(input).await,
                Some(fired) = timers.recv() => {
                    if self.scheduler.claim(&fired) {
                        self.handle_timer(fired.purpose).await;
                    }
                }
            }
        }
        log::info!("Session {} stopped", self.local.peer_id);
    }

    /// Returns `false` once the session should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start(reply) => {
                self.start().await;
                let _ = reply.send(());
            }
            Command::Upsert {
                collection,
                record,
                reply,
            } => {
                let result = self.engine.apply_local(&collection, record, now_ms());
                if result.is_ok() {
                    self.persist().await;
                }
                let _ = reply.send(result);
            }
            Command::Delete {
                collection,
                id,
                reply,
            } => {
                let result = self.engine.delete_local(&collection, &id, now_ms());
                if result.is_ok() {
                    self.persist().await;
                }
                let _ = reply.send(result);
            }
            Command::Dataset(reply) => {
                let _ = reply.send(self.engine.snapshot());
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.registry.summaries());
            }
            Command::ForceReset(reply) => {
                self.force_reset().await;
                let _ = reply.send(());
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Attempt { epoch, outcome } => {
                if epoch == self.epoch {
                    self.on_attempt(outcome).await;
                } else {
                    discard(outcome).await;
                }
            }
            Input::Accepted { epoch, conn } => {
                if epoch == self.epoch {
                    self.on_accepted(conn);
                } else {
                    conn.close().await;
                }
            }
            Input::ListenerFailed { epoch, error } => {
                if epoch == self.epoch {
                    log::warn!("Listener on {} failed: {}", self.address, error);
                    self.teardown().await;
                    self.fail(FailureKind::from(&error));
                }
            }
            Input::Connection { epoch, id, event } => {
                if epoch != self.epoch {
                    return;
                }
                match self.role {
                    Role::Hub => self.on_hub_event(id, event).await,
                    Role::Workstation => self.on_upstream_event(id, event).await,
                }
            }
        }
    }

    async fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Flush => {
                self.flush().await;
                self.scheduler
                    .schedule_once(Timer::Flush, self.config.timings.flush_interval());
            }
            Timer::Ping => {
                self.ping_round().await;
                self.scheduler
                    .schedule_once(Timer::Ping, self.liveness.ping_interval);
            }
            Timer::LivenessCheck => self.check_liveness().await,
            Timer::Retry => {
                if self.started {
                    self.attempt().await;
                }
            }
            Timer::Settle(id) => self.push_full(id).await,
        }
    }

    // -- lifecycle --------------------------------------------------------

    async fn start(&mut self) {
        self.started = true;
        if self.supervisor.status() == ConnectionStatus::Connected
            || self.supervisor.is_in_flight()
        {
            log::debug!("Start ignored, session is {}", self.supervisor.status());
            return;
        }
        self.attempt().await;
    }

    /// Tear down whatever handle exists and open a new one.
    async fn attempt(&mut self) {
        if !self.supervisor.begin_attempt() {
            return;
        }
        self.scheduler.cancel(&Timer::Retry);
        self.teardown().await;
        self.publish_status();

        let epoch = self.epoch;
        let role = self.role;
        let transport = Arc::clone(&self.transport);
        let address = self.address.clone();
        let local = self.local.clone();
        let inputs = self.inputs_tx.clone();
        log::debug!("Attempt {} as {} on {}", epoch, role, address);

        tokio::spawn(async move {
            let result = match role {
                Role::Hub => transport
                    .listen(&address, &local)
                    .await
                    .map(Attempt::Listening),
                Role::Workstation => transport
                    .connect(&address, &local)
                    .await
                    .map(Attempt::Connected),
            };
            let outcome = result.unwrap_or_else(Attempt::Failed);
            let _ = inputs.send(Input::Attempt { epoch, outcome });
        });
    }

    /// Drop the current handle generation: stop accepting, close every
    /// link and forget the upstream. Events still in flight from it are
    /// ignored afterwards.
    async fn teardown(&mut self) {
        self.epoch += 1;
        self.scheduler.cancel(&Timer::Ping);
        self.scheduler.cancel(&Timer::LivenessCheck);
        self.scheduler.cancel_where(|t| matches!(t, Timer::Settle(_)));

        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        for (_, entry) in self.registry.drain() {
            let peer_id = entry.remote_peer_id.clone();
            let joined = entry.joined;
            entry.close().await;
            if joined {
                self.emit(SyncEvent::PeerLeft { peer_id });
            }
        }
        if let Some(upstream) = self.upstream.take() {
            upstream.pump.abort();
            upstream.conn.close().await;
        }
    }

    fn fail(&mut self, kind: FailureKind) {
        let delay = self.supervisor.on_failure(kind);
        self.publish_status();
        if self.started {
            self.scheduler.schedule_once(Timer::Retry, delay);
        }
    }

    async fn force_reset(&mut self) {
        log::info!("Forcing topology reset");
        self.started = true;
        self.scheduler.cancel(&Timer::Retry);
        self.teardown().await;
        let delay = self.supervisor.force_reset();
        self.publish_status();
        self.scheduler.schedule_once(Timer::Retry, delay);
    }

    async fn shutdown(&mut self) {
        log::info!("Shutting down session {}", self.local.peer_id);
        self.started = false;
        self.scheduler.cancel_all();
        self.teardown().await;
        self.supervisor.on_shutdown();
        self.publish_status();
        self.persist().await;
    }

    async fn on_attempt(&mut self, outcome: Attempt) {
        match outcome {
            Attempt::Listening(listener) => {
                log::info!("Hub listening on {}", listener.address());
                self.supervisor.on_connected();
                self.publish_status();
                self.spawn_accept_loop(listener);
                self.scheduler
                    .schedule_once(Timer::Ping, self.liveness.ping_interval);
            }
            Attempt::Connected(conn) => {
                // Status flips to connected on the open event.
                let conn: Arc<dyn PeerConnection> = Arc::from(conn);
                let id = self.allocate_id();
                let pump = self.spawn_pump(id, &conn);
                self.upstream = Some(Upstream { id, conn, pump });
            }
            Attempt::Failed(error) => {
                log::warn!("Could not reach {}: {}", self.address, error);
                self.fail(FailureKind::from(&error));
            }
        }
    }

    fn spawn_accept_loop(&mut self, listener: Box<dyn PeerListener>) {
        let epoch = self.epoch;
        let inputs = self.inputs_tx.clone();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        if inputs.send(Input::Accepted { epoch, conn }).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        let _ = inputs.send(Input::ListenerFailed { epoch, error });
                        break;
                    }
                }
            }
        }));
    }

    fn spawn_pump(&self, id: ConnectionId, conn: &Arc<dyn PeerConnection>) -> JoinHandle<()> {
        let epoch = self.epoch;
        spawn_event_pump(Arc::clone(conn), self.inputs_tx.clone(), move |event| {
            Input::Connection { epoch, id, event }
        })
    }

    fn allocate_id(&mut self) -> ConnectionId {
        self.next_connection_id += 1;
        self.next_connection_id
    }

    // -- hub ----------------------------------------------------------------

    fn on_accepted(&mut self, conn: Box<dyn PeerConnection>) {
        let conn: Arc<dyn PeerConnection> = Arc::from(conn);
        let id = self.allocate_id();
        let pump = self.spawn_pump(id, &conn);
        self.registry.insert(id, PeerEntry::new(conn, pump));
    }

    async fn on_hub_event(&mut self, id: ConnectionId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Open => {
                let Some(entry) = self.registry.get_mut(id) else {
                    return;
                };
                entry.joined = true;
                let peer_id = entry.remote_peer_id.clone();
                let display_name = entry.display_name.clone();
                log::info!("Workstation {} ({}) joined", display_name, peer_id);
                self.emit(SyncEvent::PeerJoined {
                    peer_id,
                    display_name,
                });
                self.scheduler
                    .schedule_once(Timer::Settle(id), self.config.timings.settle_delay());
            }
            ConnectionEvent::Data(frame) => {
                self.registry.touch(id);
                let Some(message) = decode(&frame) else {
                    return;
                };
                match self.engine.ingest(&message, Instant::now()) {
                    Ingest::Merged(outcome) => {
                        // Forward the original bytes, not a re-encoding.
                        for conn in self.registry.forward_targets(id, message.origin()) {
                            if let Err(e) = conn.send(&frame).await {
                                log::warn!("Forward to {} failed: {}", conn.remote().peer_id, e);
                            }
                        }
                        self.prune_dead_links().await;
                        self.apply_outcome(outcome).await;
                    }
                    Ingest::SelfOrigin => log::debug!("Dropped own {} echo", message.kind()),
                    Ingest::Heartbeat => {}
                }
            }
            ConnectionEvent::Close | ConnectionEvent::Error(_) => {
                if let ConnectionEvent::Error(e) = &event {
                    log::warn!("Connection {} failed: {}", id, e);
                }
                self.scheduler.cancel(&Timer::Settle(id));
                if let Some(entry) = self.registry.remove(id) {
                    let peer_id = entry.remote_peer_id.clone();
                    let joined = entry.joined;
                    entry.close().await;
                    log::info!("Workstation {} left", peer_id);
                    if joined {
                        self.emit(SyncEvent::PeerLeft { peer_id });
                    }
                }
            }
        }
    }

    async fn push_full(&mut self, id: ConnectionId) {
        let Some(conn) = self
            .registry
            .get(id)
            .filter(|e| e.conn.is_open())
            .map(|e| Arc::clone(&e.conn))
        else {
            return;
        };
        let message = SyncMessage::full_push(self.engine.snapshot(), &self.local.peer_id, now_ms());
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("{}", e);
                return;
            }
        };
        match conn.send(&frame).await {
            Ok(()) => log::debug!(
                "FULL_PUSH of {} records to {}",
                self.engine.dataset().record_count(),
                conn.remote().peer_id
            ),
            Err(e) => {
                log::warn!("FULL_PUSH to {} failed: {}", conn.remote().peer_id, e);
                self.prune_dead_links().await;
            }
        }
    }

    /// Fire-and-forget heartbeat to every open link, after dropping links
    /// that no longer report open.
    async fn ping_round(&mut self) {
        self.prune_dead_links().await;

        let frame = match SyncMessage::ping(&self.local.peer_id, now_ms()).encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("{}", e);
                return;
            }
        };
        for conn in self.registry.open_connections() {
            let _ = conn.send(&frame).await;
        }
    }

    /// Drop links that report themselves closed, such as one whose send
    /// queue overflowed because the workstation stopped reading.
    async fn prune_dead_links(&mut self) {
        for (id, entry) in self.registry.prune_closed() {
            self.scheduler.cancel(&Timer::Settle(id));
            let peer_id = entry.remote_peer_id.clone();
            let joined = entry.joined;
            entry.close().await;
            log::info!("Dropped dead link to {}", peer_id);
            if joined {
                self.emit(SyncEvent::PeerLeft { peer_id });
            }
        }
    }

    // -- workstation --------------------------------------------------------

    async fn on_upstream_event(&mut self, id: ConnectionId, event: ConnectionEvent) {
        let hub = match self.upstream.as_ref() {
            Some(upstream) if upstream.id == id => upstream.conn.remote().clone(),
            _ => return,
        };
        match event {
            ConnectionEvent::Open => {
                log::info!("Connected to hub {} ({})", hub.label, hub.peer_id);
                self.supervisor.on_connected();
                self.publish_status();
                self.liveness_monitor.reset(Instant::now());
                self.engine.request_full_flush();
                self.scheduler
                    .schedule_once(Timer::LivenessCheck, self.liveness.check_interval);
            }
            ConnectionEvent::Data(frame) => {
                let Some(message) = decode(&frame) else {
                    return;
                };
                match self.engine.ingest(&message, Instant::now()) {
                    Ingest::Heartbeat => self.liveness_monitor.record_ping(Instant::now()),
                    Ingest::SelfOrigin => log::debug!("Dropped own {} echo", message.kind()),
                    Ingest::Merged(outcome) => self.apply_outcome(outcome).await,
                }
            }
            ConnectionEvent::Close | ConnectionEvent::Error(_) => {
                let kind = match &event {
                    ConnectionEvent::Error(e) => {
                        log::warn!("Hub connection failed: {}", e);
                        FailureKind::from(e)
                    }
                    _ => FailureKind::TransportClosed,
                };
                self.lose_upstream(kind).await;
            }
        }
    }

    async fn lose_upstream(&mut self, kind: FailureKind) {
        log::info!("Disconnected from hub");
        if let Some(upstream) = self.upstream.take() {
            upstream.pump.abort();
            upstream.conn.close().await;
        }
        self.scheduler.cancel(&Timer::LivenessCheck);
        self.fail(kind);
    }

    async fn check_liveness(&mut self) {
        if self.upstream.is_none() {
            return;
        }
        let now = Instant::now();
        if self.liveness_monitor.is_expired(now) {
            log::warn!(
                "No heartbeat from hub for {:?}, resetting topology",
                self.liveness_monitor.silence(now)
            );
            self.emit(SyncEvent::LinkLost);
            self.teardown().await;
            self.fail(FailureKind::HeartbeatTimeout);
        } else {
            self.scheduler
                .schedule_once(Timer::LivenessCheck, self.liveness.check_interval);
        }
    }

    // -- replication --------------------------------------------------------

    fn flush_targets(&self) -> Vec<Arc<dyn PeerConnection>> {
        match self.role {
            Role::Hub => self.registry.open_connections(),
            Role::Workstation => self
                .upstream
                .iter()
                .filter(|u| u.conn.is_open())
                .map(|u| Arc::clone(&u.conn))
                .collect(),
        }
    }

    async fn flush(&mut self) {
        let Some(payload) = self.engine.prepare_flush(Instant::now()) else {
            return;
        };
        let targets = self.flush_targets();
        if targets.is_empty() {
            // A hub's future peers get everything through FULL_PUSH.
            if self.role == Role::Hub {
                self.engine.mark_flushed();
            }
            return;
        }

        let count = payload.record_count();
        let frame = match SyncMessage::data_sync(payload, &self.local.peer_id, now_ms()).encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("{}", e);
                return;
            }
        };
        let mut delivered = 0;
        for conn in &targets {
            match conn.send(&frame).await {
                Ok(()) => delivered += 1,
                Err(e) => log::warn!("DATA_SYNC to {} failed: {}", conn.remote().peer_id, e),
            }
        }
        log::debug!("Flushed {} records to {} peers", count, delivered);
        if delivered > 0 || self.role == Role::Hub {
            self.engine.mark_flushed();
        }
        match self.role {
            Role::Hub => self.prune_dead_links().await,
            Role::Workstation => {
                if self.upstream.as_ref().map_or(false, |u| !u.conn.is_open()) {
                    self.lose_upstream(FailureKind::NetworkError).await;
                }
            }
        }
    }

    async fn apply_outcome(&mut self, outcome: MergeOutcome) {
        for collection in &outcome.changed {
            let records = self
                .engine
                .dataset()
                .collection(collection)
                .map(|c| c.records())
                .unwrap_or_default();
            self.emit(SyncEvent::CollectionUpdated {
                collection: collection.clone(),
                records,
            });
        }
        if let Some(activity) = outcome.activity {
            log::info!("{}: {}", activity.author, activity.action);
            self.emit(SyncEvent::RemoteActivity(activity));
        }
        if !outcome.changed.is_empty() {
            self.persist().await;
        }
    }

    async fn persist(&self) {
        let key = storage::dataset_key(&self.config.dataset_id);
        if let Err(e) = storage::save_json(self.store.as_ref(), &key, self.engine.dataset()).await {
            log::warn!("Failed to persist dataset: {}", e);
        }
        if let Some(backup) = &self.backup {
            if let Err(e) = backup
                .write(&self.config.dataset_id, self.engine.dataset())
                .await
            {
                log::warn!("Backup to {} failed: {}", backup.dir().display(), e);
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_status(&mut self) {
        let status = self.supervisor.status();
        if *self.status_tx.borrow() != status {
            self.status_tx.send_replace(status);
            self.emit(SyncEvent::StatusChanged(status));
        }
    }
}

async fn discard(outcome: Attempt) {
    if let Attempt::Connected(conn) = outcome {
        conn.close().await;
    }
}

fn decode(frame: &[u8]) -> Option<SyncMessage> {
    match SyncMessage::decode(frame) {
        Ok(message) => {
            log::debug!("Received {}", message.kind());
            Some(message)
        }
        Err(e) => {
            log::warn!("Dropping frame: {}", e);
            None
        }
    }
}

/// Cloneable front end of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SyncEvent>,
    status: watch::Receiver<ConnectionStatus>,
    peer_id: String,
    role: Role,
    hub_address: String,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, TopologyError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| TopologyError::SessionClosed)?;
        rx.await.map_err(|_| TopologyError::SessionClosed)
    }

    /// Start listening (hub) or connecting (workstation). Calling it while
    /// connected or while an attempt is in flight does nothing.
    pub async fn start(&self) -> Result<(), TopologyError> {
        self.request(Command::Start).await
    }

    /// Write a record locally; it replicates on the next flush.
    pub async fn upsert(&self, collection: &str, record: Record) -> Result<Record, TopologyError> {
        let collection = collection.to_string();
        Ok(self
            .request(|reply| Command::Upsert {
                collection,
                record,
                reply,
            })
            .await??)
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<Record, TopologyError> {
        let collection = collection.to_string();
        let id = id.to_string();
        Ok(self
            .request(|reply| Command::Delete {
                collection,
                id,
                reply,
            })
            .await??)
    }

    pub async fn dataset(&self) -> Result<Dataset, TopologyError> {
        self.request(Command::Dataset).await
    }

    /// Connected workstations. Always empty on a workstation.
    pub async fn peers(&self) -> Result<Vec<PeerSummary>, TopologyError> {
        self.request(Command::Peers).await
    }

    /// Tear everything down and reconnect after the force-reset delay.
    pub async fn force_reset(&self) -> Result<(), TopologyError> {
        self.request(Command::ForceReset).await
    }

    /// Cancel all timers, close every link, release the address and persist
    /// the dataset. Returns once the session task is done with all of it.
    pub async fn shutdown(&self) -> Result<(), TopologyError> {
        self.request(Command::Shutdown).await
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn hub_address(&self) -> &str {
        &self.hub_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;

    async fn session(network: &MemoryNetwork, config: SyncConfig) -> SessionHandle {
        TopologyManager::spawn(config, network.transport(), Arc::new(MemoryStore::new()))
            .await
            .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_listens_on_derived_address() {
        let network = MemoryNetwork::new();
        let hub = session(&network, SyncConfig::hub("acme").with_self_id("hub")).await;
        assert_eq!(hub.hub_address(), "tallysync-hub-acme");
        assert_eq!(hub.status(), ConnectionStatus::Disconnected);

        hub.start().await.unwrap();
        settle().await;
        assert_eq!(hub.status(), ConnectionStatus::Connected);
        assert!(network.is_listening("tallysync-hub-acme"));

        hub.shutdown().await.unwrap();
        assert!(!network.is_listening("tallysync-hub-acme"));
        assert_eq!(hub.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workstation_without_hub_is_retrying() {
        let network = MemoryNetwork::new();
        let ws = session(&network, SyncConfig::workstation("acme")).await;
        ws.start().await.unwrap();
        settle().await;
        assert_eq!(ws.status(), ConnectionStatus::Retrying);
        assert!(ws.peers().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_start_is_idempotent() {
        let network = MemoryNetwork::new();
        let hub = session(&network, SyncConfig::hub("acme")).await;
        let mut events = hub.subscribe();

        hub.start().await.unwrap();
        hub.start().await.unwrap();
        settle().await;
        hub.start().await.unwrap();
        settle().await;

        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::StatusChanged(ConnectionStatus::Connecting)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::StatusChanged(ConnectionStatus::Connected)
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_edits_and_validation() {
        let network = MemoryNetwork::new();
        let mut config = SyncConfig::hub("acme");
        config.collections = Some(vec!["clients".into()]);
        let hub = session(&network, config).await;

        let stored = hub
            .upsert("clients", Record::new("c1").with_field("name", "Acme"))
            .await
            .unwrap();
        assert!(stored.updated_at > 0);

        let rejected = hub.upsert("scratch", Record::new("s1")).await;
        assert!(matches!(
            rejected,
            Err(TopologyError::Replication(ReplicationError::UnknownCollection(_)))
        ));

        let dead = hub.delete("clients", "c1").await.unwrap();
        assert!(dead.is_deleted);
        assert!(hub.dataset().await.unwrap().get("clients", "c1").unwrap().is_deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let network = MemoryNetwork::new();
        let result = TopologyManager::spawn(
            SyncConfig::hub(""),
            network.transport(),
            Arc::new(MemoryStore::new()),
        )
        .await;
        assert!(matches!(result, Err(TopologyError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_after_shutdown() {
        let network = MemoryNetwork::new();
        let hub = session(&network, SyncConfig::hub("acme")).await;
        hub.shutdown().await.unwrap();
        settle().await;
        assert!(matches!(hub.dataset().await, Err(TopologyError::SessionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_config_is_persisted() {
        let network = MemoryNetwork::new();
        let store = Arc::new(MemoryStore::new());
        let config = SyncConfig::workstation("acme").with_local_user("bob");
        let _ws = TopologyManager::spawn(config.clone(), network.transport(), store.clone())
            .await
            .unwrap();
        assert_eq!(load_last_config(store.as_ref()).await, Some(config));
    }
}
