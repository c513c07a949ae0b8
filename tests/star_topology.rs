//! Star topology integration tests
//!
//! Full sessions (one hub, several workstations) over an in-process
//! MemoryNetwork, with tokio time paused so heartbeat and retry timers run
//! instantly. Some tests use bare transport connections as scripted peers to
//! observe exactly what the hub puts on the wire.
//!
//! Run with:
//!   cargo test --test star_topology

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tallysync::replication::{Dataset, Record, SyncMessage};
use tallysync::storage::{FileStore, MemoryStore};
use tallysync::transport::{MemoryNetwork, PeerConnection, PeerMetadata, PeerTransport};
use tallysync::{ConnectionStatus, SessionHandle, SyncConfig, SyncEvent, TopologyManager};

use tokio::sync::broadcast;
use tokio::time::Instant;

const DATASET: &str = "acme";
const HUB_ADDRESS: &str = "tallysync-hub-acme";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn hub_config() -> SyncConfig {
    SyncConfig::hub(DATASET)
        .with_self_id("hub")
        .with_display_name("Back office")
}

fn ws_config(n: usize) -> SyncConfig {
    SyncConfig::workstation(DATASET)
        .with_self_id(format!("ws{}", n))
        .with_display_name(format!("Till {}", n))
        .with_local_user(format!("user{}", n))
}

async fn spawn(network: &MemoryNetwork, config: SyncConfig) -> SessionHandle {
    TopologyManager::spawn(config, network.transport(), Arc::new(MemoryStore::new()))
        .await
        .unwrap()
}

async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

async fn wait_status(node: &SessionHandle, status: ConnectionStatus, limit: Duration) -> bool {
    eventually(limit, || async move { node.status() == status }).await
}

async fn record(node: &SessionHandle, collection: &str, id: &str) -> Option<Record> {
    node.dataset()
        .await
        .ok()
        .and_then(|d| d.get(collection, id).cloned())
}

async fn all_have(nodes: &[&SessionHandle], collection: &str, id: &str) -> bool {
    for node in nodes {
        if record(node, collection, id).await.is_none() {
            return false;
        }
    }
    true
}

/// Hub plus `n` workstations, all started and connected.
async fn star(network: &MemoryNetwork, n: usize) -> (SessionHandle, Vec<SessionHandle>) {
    let hub = spawn(network, hub_config()).await;
    hub.start().await.unwrap();
    assert!(wait_status(&hub, ConnectionStatus::Connected, Duration::from_secs(5)).await);

    let mut workstations = Vec::new();
    for i in 1..=n {
        let ws = spawn(network, ws_config(i)).await;
        ws.start().await.unwrap();
        assert!(wait_status(&ws, ConnectionStatus::Connected, Duration::from_secs(5)).await);
        workstations.push(ws);
    }
    (hub, workstations)
}

async fn raw_peer(network: &MemoryNetwork, peer_id: &str) -> Box<dyn PeerConnection> {
    network
        .transport()
        .connect(HUB_ADDRESS, &PeerMetadata::new(peer_id, peer_id))
        .await
        .unwrap()
}

/// Next non-heartbeat frame, raw and decoded.
async fn next_data(conn: &dyn PeerConnection, limit: Duration) -> Option<(Vec<u8>, SyncMessage)> {
    let deadline = Instant::now() + limit;
    loop {
        let frame = tokio::time::timeout_at(deadline, conn.recv()).await.ok()?.ok()?;
        let message = SyncMessage::decode(&frame).unwrap();
        if !matches!(message, SyncMessage::HeartbeatPing { .. }) {
            return Some((frame, message));
        }
    }
}

async fn wait_event<F>(
    events: &mut broadcast::Receiver<SyncEvent>,
    limit: Duration,
    mut pred: F,
) -> Option<SyncEvent>
where
    F: FnMut(&SyncEvent) -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) if pred(&event) => return Some(event),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return None,
        }
    }
}

fn payload(collection: &str, record: Record) -> Dataset {
    let mut dataset = Dataset::new();
    dataset.insert_record(collection, record);
    dataset
}

/// Encoded DATA_SYNC carrying one record, as `origin` would send it.
fn data_frame(origin: &str, collection: &str, record: Record) -> Vec<u8> {
    SyncMessage::data_sync(payload(collection, record), origin, 0)
        .encode()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Convergence
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_star_converges_like_a_mesh() {
    let network = MemoryNetwork::new();
    let (hub, ws) = star(&network, 3).await;
    let nodes = [&hub, &ws[0], &ws[1], &ws[2]];

    ws[0]
        .upsert("clients", Record::new("c1").with_field("name", "Acme Ltd"))
        .await
        .unwrap();
    ws[2]
        .upsert("products", Record::new("p1").with_field("sku", "TEA-01"))
        .await
        .unwrap();
    hub.upsert("invoices", Record::new("i1").with_field("total", 42))
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(10), || async {
            all_have(&nodes, "clients", "c1").await
                && all_have(&nodes, "products", "p1").await
                && all_have(&nodes, "invoices", "i1").await
        })
        .await
    );

    let reference = hub.dataset().await.unwrap();
    for node in &ws {
        assert_eq!(node.dataset().await.unwrap(), reference);
    }
    assert_eq!(hub.peers().await.unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_latest_edit_wins_everywhere() {
    let network = MemoryNetwork::new();
    let (hub, ws) = star(&network, 2).await;

    ws[0]
        .upsert("clients", Record::new("c1").with_field("name", "First"))
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(10), || async {
            record(&ws[1], "clients", "c1").await.is_some()
        })
        .await
    );

    // Edit on top of the replicated copy, so it is stamped later.
    ws[1]
        .upsert("clients", Record::new("c1").with_field("name", "Second"))
        .await
        .unwrap();
    let nodes = [&hub, &ws[0], &ws[1]];
    assert!(
        eventually(Duration::from_secs(10), || async {
            for node in &nodes {
                let name = record(node, "clients", "c1")
                    .await
                    .and_then(|r| r.field_str("name").map(str::to_string));
                if name.as_deref() != Some("Second") {
                    return false;
                }
            }
            true
        })
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn test_tombstones_replicate() {
    let network = MemoryNetwork::new();
    let (hub, ws) = star(&network, 2).await;

    ws[0].upsert("clients", Record::new("c1")).await.unwrap();
    assert!(
        eventually(Duration::from_secs(10), || async {
            record(&ws[1], "clients", "c1").await.is_some()
        })
        .await
    );

    ws[1].delete("clients", "c1").await.unwrap();
    let nodes = [&hub, &ws[0], &ws[1]];
    assert!(
        eventually(Duration::from_secs(10), || async {
            for node in &nodes {
                if !record(node, "clients", "c1").await.map_or(false, |r| r.is_deleted) {
                    return false;
                }
            }
            true
        })
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn test_stale_update_does_not_overwrite() {
    let network = MemoryNetwork::new();
    let hub = spawn(&network, hub_config()).await;
    hub.start().await.unwrap();
    assert!(wait_status(&hub, ConnectionStatus::Connected, Duration::from_secs(5)).await);

    let w1 = raw_peer(&network, "w1").await;
    let a = |ts: i64, v: &str| Record::new("A").with_updated_at(ts).with_field("v", v);

    for (ts, v) in [(100, "local"), (50, "stale"), (200, "newer")] {
        w1.send(&data_frame("w1", "clients", a(ts, v))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stored = record(&hub, "clients", "A").await.unwrap();
        match ts {
            100 | 50 => assert_eq!(stored.field_str("v"), Some("local")),
            _ => assert_eq!(stored.field_str("v"), Some("newer")),
        }
    }

    // A record the hub never had is simply added.
    let frame = data_frame("w1", "clients", Record::new("B").with_updated_at(1));
    w1.send(&frame).await.unwrap();
    assert!(
        eventually(Duration::from_secs(1), || async {
            record(&hub, "clients", "B").await.is_some()
        })
        .await
    );
}

// ---------------------------------------------------------------------------
// Wire behaviour of the hub
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_new_peer_receives_full_push_after_settle() {
    let network = MemoryNetwork::new();
    let hub = spawn(&network, hub_config()).await;
    hub.upsert("clients", Record::new("c1")).await.unwrap();
    hub.start().await.unwrap();
    assert!(wait_status(&hub, ConnectionStatus::Connected, Duration::from_secs(5)).await);

    let w1 = raw_peer(&network, "w1").await;
    let joined = Instant::now();
    let (_, message) = next_data(w1.as_ref(), Duration::from_secs(5)).await.unwrap();

    assert!(joined.elapsed() >= Duration::from_secs(1));
    assert_eq!(message.kind(), "FULL_PUSH");
    assert_eq!(message.origin(), Some("hub"));
    assert!(message.payload().unwrap().get("clients", "c1").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_hub_forwards_original_bytes_but_never_echoes() {
    let network = MemoryNetwork::new();
    let hub = spawn(&network, hub_config()).await;
    hub.start().await.unwrap();
    assert!(wait_status(&hub, ConnectionStatus::Connected, Duration::from_secs(5)).await);

    let w1 = raw_peer(&network, "w1").await;
    let w2 = raw_peer(&network, "w2").await;
    for conn in [&w1, &w2] {
        let (_, push) = next_data(conn.as_ref(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(push.kind(), "FULL_PUSH");
    }

    // Odd spacing, so a re-encoding would not match byte for byte.
    let original = concat!(
        r#"{"type":"DATA_SYNC", "sourcePeerId":"w1","#,
        r#""payload":{"clients":[{"id":"c9","updatedAt":7}]}}"#
    )
    .as_bytes();
    w1.send(original).await.unwrap();

    let (forwarded, _) = next_data(w2.as_ref(), Duration::from_secs(5)).await.unwrap();
    assert_eq!(forwarded, original.to_vec());

    // The origin only ever sees heartbeats from here on.
    assert!(next_data(w1.as_ref(), Duration::from_secs(40)).await.is_none());
    assert!(record(&hub, "clients", "c9").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_hub_skips_every_link_of_the_origin_peer() {
    let network = MemoryNetwork::new();
    let hub = spawn(&network, hub_config()).await;
    hub.start().await.unwrap();
    assert!(wait_status(&hub, ConnectionStatus::Connected, Duration::from_secs(5)).await);

    // A relay forwards w3's data; w3 itself must not get it back.
    let relay = raw_peer(&network, "relay").await;
    let w3 = raw_peer(&network, "w3").await;
    for conn in [&relay, &w3] {
        next_data(conn.as_ref(), Duration::from_secs(5)).await.unwrap();
    }

    let frame = data_frame("w3", "clients", Record::new("x").with_updated_at(1));
    relay.send(&frame).await.unwrap();

    assert!(next_data(w3.as_ref(), Duration::from_secs(20)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_workstation_does_not_echo_received_data() {
    let network = MemoryNetwork::new();
    let hub = spawn(&network, hub_config()).await;
    hub.start().await.unwrap();
    assert!(wait_status(&hub, ConnectionStatus::Connected, Duration::from_secs(5)).await);

    let w1 = raw_peer(&network, "w1").await;
    next_data(w1.as_ref(), Duration::from_secs(5)).await.unwrap();

    let ws2 = spawn(&network, ws_config(2)).await;
    ws2.start().await.unwrap();
    assert!(wait_status(&ws2, ConnectionStatus::Connected, Duration::from_secs(5)).await);
    // Past the first flush tick, which consumes the on-connect full request.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let mut events = ws2.subscribe();

    let frame = data_frame("w1", "clients", Record::new("c1").with_updated_at(5));
    w1.send(&frame).await.unwrap();

    let updated = wait_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SyncEvent::CollectionUpdated { collection, .. } if collection == "clients")
    })
    .await;
    assert!(updated.is_some());

    // ws2 merged but has no local changes, so nothing flows back to w1.
    assert!(next_data(w1.as_ref(), Duration::from_secs(20)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_dropped() {
    let network = MemoryNetwork::new();
    let hub = spawn(&network, hub_config()).await;
    hub.start().await.unwrap();
    assert!(wait_status(&hub, ConnectionStatus::Connected, Duration::from_secs(5)).await);

    let w1 = raw_peer(&network, "w1").await;
    w1.send(b"garbage").await.unwrap();
    w1.send(br#"{"type":"DATA_SYNC","payload":{}}"#).await.unwrap();
    let good = data_frame("w1", "clients", Record::new("ok").with_updated_at(1));
    w1.send(&good).await.unwrap();

    assert!(
        eventually(Duration::from_secs(2), || async {
            record(&hub, "clients", "ok").await.is_some()
        })
        .await
    );
    assert_eq!(hub.status(), ConnectionStatus::Connected);
    assert_eq!(hub.peers().await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_workstation_waits_for_late_hub() {
    let network = MemoryNetwork::new();
    let ws = spawn(&network, ws_config(1)).await;
    ws.start().await.unwrap();
    assert!(wait_status(&ws, ConnectionStatus::Retrying, Duration::from_secs(1)).await);

    // Edited while the hub does not exist yet.
    ws.upsert("clients", Record::new("offline")).await.unwrap();

    let hub = spawn(&network, hub_config()).await;
    hub.start().await.unwrap();

    assert!(wait_status(&ws, ConnectionStatus::Connected, Duration::from_secs(6)).await);
    assert!(
        eventually(Duration::from_secs(5), || async {
            record(&hub, "clients", "offline").await.is_some()
        })
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_hub_retries_until_address_frees() {
    let network = MemoryNetwork::new();
    let first = spawn(&network, hub_config()).await;
    first.start().await.unwrap();
    assert!(wait_status(&first, ConnectionStatus::Connected, Duration::from_secs(5)).await);

    let second = spawn(&network, hub_config().with_self_id("hub-b")).await;
    second.start().await.unwrap();
    assert!(wait_status(&second, ConnectionStatus::Retrying, Duration::from_secs(1)).await);

    // Still taken after a couple of retry rounds.
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(second.status(), ConnectionStatus::Retrying);

    first.shutdown().await.unwrap();
    assert!(!network.is_listening(HUB_ADDRESS));
    assert!(wait_status(&second, ConnectionStatus::Connected, Duration::from_secs(4)).await);
}

#[tokio::test(start_paused = true)]
async fn test_hub_restart_reconnects_workstations() {
    let network = MemoryNetwork::new();
    let (hub, ws) = star(&network, 2).await;

    hub.shutdown().await.unwrap();
    for node in &ws {
        assert!(wait_status(node, ConnectionStatus::Disconnected, Duration::from_secs(1)).await);
    }

    let hub = spawn(&network, hub_config()).await;
    hub.start().await.unwrap();
    for node in &ws {
        assert!(wait_status(node, ConnectionStatus::Connected, Duration::from_secs(15)).await);
    }
    assert!(
        eventually(Duration::from_secs(5), || async {
            hub.peers().await.unwrap().len() == 2
        })
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn test_silent_hub_triggers_reset_and_recovery() {
    let network = MemoryNetwork::new();
    let (hub, ws) = star(&network, 1).await;
    let ws = &ws[0];
    let mut events = ws.subscribe();

    // Nothing closes, traffic just stops.
    network.silence(HUB_ADDRESS);
    let started = Instant::now();
    let lost = wait_event(&mut events, Duration::from_secs(90), |e| {
        *e == SyncEvent::LinkLost
    })
    .await;
    assert!(lost.is_some());
    // Last ping at most one interval before the silence, then the timeout,
    // then at most one check tick.
    let elapsed = started.elapsed();
    assert!(elapsed > Duration::from_secs(20));
    assert!(elapsed <= Duration::from_secs(15 + 35 + 10));

    network.restore(HUB_ADDRESS);
    assert!(wait_status(ws, ConnectionStatus::Connected, Duration::from_secs(10)).await);

    hub.upsert("clients", Record::new("after")).await.unwrap();
    assert!(
        eventually(Duration::from_secs(10), || async {
            record(ws, "clients", "after").await.is_some()
        })
        .await
    );
    assert_eq!(hub.peers().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_regular_heartbeats_keep_link_up() {
    let network = MemoryNetwork::new();
    let (_hub, ws) = star(&network, 1).await;
    let mut events = ws[0].subscribe();

    let lost = wait_event(&mut events, Duration::from_secs(120), |e| {
        *e == SyncEvent::LinkLost
    })
    .await;
    assert!(lost.is_none());
    assert_eq!(ws[0].status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_single_upstream_connection() {
    let network = MemoryNetwork::new();
    let (hub, ws) = star(&network, 1).await;
    let ws = &ws[0];

    for _ in 0..3 {
        ws.force_reset().await.unwrap();
        ws.start().await.unwrap();
    }

    assert!(wait_status(ws, ConnectionStatus::Connected, Duration::from_secs(5)).await);
    // Give any superseded link time to be noticed and dropped.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(ws.status(), ConnectionStatus::Connected);
    assert_eq!(hub.peers().await.unwrap().len(), 1);
    assert_eq!(hub.peers().await.unwrap()[0].peer_id, "ws1");
}

#[tokio::test(start_paused = true)]
async fn test_force_reset_reconnects_after_delay() {
    let network = MemoryNetwork::new();
    let (_hub, ws) = star(&network, 1).await;
    let ws = &ws[0];

    ws.force_reset().await.unwrap();
    assert_eq!(ws.status(), ConnectionStatus::Disconnected);
    assert!(wait_status(ws, ConnectionStatus::Connected, Duration::from_secs(3)).await);
}

// ---------------------------------------------------------------------------
// Notifications and persistence
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_remote_activity_names_author() {
    let network = MemoryNetwork::new();
    let (hub, ws) = star(&network, 2).await;
    let mut events = ws[1].subscribe();
    let mut own_events = ws[0].subscribe();

    ws[0]
        .upsert(
            "auditLogs",
            Record::new("log-1")
                .with_field("user", "user1")
                .with_field("action", "Created invoice 17"),
        )
        .await
        .unwrap();

    let activity = wait_event(&mut events, Duration::from_secs(10), |e| {
        matches!(e, SyncEvent::RemoteActivity(_))
    })
    .await;
    match activity {
        Some(SyncEvent::RemoteActivity(a)) => {
            assert_eq!(a.author, "user1");
            assert_eq!(a.action, "Created invoice 17");
        }
        other => panic!("expected remote activity, got {:?}", other),
    }

    // The author is not notified about their own entry.
    let own = wait_event(&mut own_events, Duration::from_secs(5), |e| {
        matches!(e, SyncEvent::RemoteActivity(_))
    })
    .await;
    assert!(own.is_none());
    assert!(record(&hub, "auditLogs", "log-1").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_peer_join_and_leave_events() {
    let network = MemoryNetwork::new();
    let hub = spawn(&network, hub_config()).await;
    let mut events = hub.subscribe();
    hub.start().await.unwrap();

    let ws = spawn(&network, ws_config(1)).await;
    ws.start().await.unwrap();

    let joined = wait_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SyncEvent::PeerJoined { .. })
    })
    .await;
    assert_eq!(
        joined,
        Some(SyncEvent::PeerJoined {
            peer_id: "ws1".into(),
            display_name: "Till 1".into(),
        })
    );

    ws.shutdown().await.unwrap();
    let left = wait_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SyncEvent::PeerLeft { .. })
    })
    .await;
    assert_eq!(left, Some(SyncEvent::PeerLeft { peer_id: "ws1".into() }));
}

#[tokio::test]
async fn test_dataset_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let network = MemoryNetwork::new();
    let backups = tmp.path().join("backups");

    let config = hub_config().with_backup_dir(backups.clone());
    let store = Arc::new(FileStore::new(tmp.path().join("store")));
    let hub = TopologyManager::spawn(config.clone(), network.transport(), store.clone())
        .await
        .unwrap();
    hub.upsert("clients", Record::new("c1").with_field("name", "Acme"))
        .await
        .unwrap();
    hub.shutdown().await.unwrap();

    assert!(backups.join("acme.backup.json").exists());

    let store = Arc::new(FileStore::new(tmp.path().join("store")));
    let hub = TopologyManager::spawn(config, network.transport(), store)
        .await
        .unwrap();
    let restored = record(&hub, "clients", "c1").await.unwrap();
    assert_eq!(restored.field_str("name"), Some("Acme"));
    hub.shutdown().await.unwrap();
}
