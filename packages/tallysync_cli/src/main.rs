use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use tallysync::topology::load_last_config;
use tallysync::transport::tcp::{TcpTransport, TcpTransportConfig};
use tallysync::{
    ConnectionStatus, FileStore, KeyValueStore, MemoryNetwork, MemoryStore, Record, SessionHandle,
    SyncConfig, SyncEvent, TopologyManager,
};

#[derive(Parser)]
#[command(name = "tallysync", about = "Hub-and-spoke dataset replication")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a hub or workstation over TCP until Ctrl-C
    Run {
        /// JSON configuration file. Defaults to the last one used with this store.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory holding the persisted dataset and configuration
        #[arg(long, default_value = "./tallysync-data")]
        store_dir: PathBuf,
        /// Interface the hub binds to
        #[arg(long, default_value = "0.0.0.0")]
        bind_host: String,
        /// Host workstations dial for the hub
        #[arg(long, default_value = "127.0.0.1")]
        remote_host: String,
        /// First port of the range hub addresses hash into
        #[arg(long, default_value_t = 40000)]
        port_base: u16,
    },
    /// Run an in-process star and show it converging
    Simulate {
        #[arg(long, default_value_t = 3)]
        workstations: usize,
        #[arg(long, default_value = "demo")]
        dataset: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Run {
            config,
            store_dir,
            bind_host,
            remote_host,
            port_base,
        } => {
            let transport = TcpTransport::new(TcpTransportConfig {
                bind_host,
                remote_host,
                port_base,
                ..Default::default()
            });
            run(config, store_dir, transport).await
        }
        Command::Simulate {
            workstations,
            dataset,
        } => simulate(workstations, &dataset).await,
    }
}

async fn run(config: Option<PathBuf>, store_dir: PathBuf, transport: TcpTransport) -> Result<()> {
    let store = Arc::new(FileStore::new(&store_dir));

    let mut config = match config {
        Some(path) => SyncConfig::from_json_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => match load_last_config(store.as_ref()).await {
            Some(config) => {
                log::info!("Using last configuration from {}", store_dir.display());
                config
            }
            None => bail!("no --config given and none saved in {}", store_dir.display()),
        },
    };
    if config.display_name.is_none() {
        if let Ok(name) = hostname::get() {
            config.display_name = Some(name.to_string_lossy().into_owned());
        }
    }

    let session = TopologyManager::spawn(config, Arc::new(transport), store).await?;
    session.start().await?;
    let mut events = session.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => log::warn!("Skipped {} events", n),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                break;
            }
        }
    }
    session.shutdown().await?;
    Ok(())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::StatusChanged(status) => println!("status: {}", status),
        SyncEvent::PeerJoined {
            peer_id,
            display_name,
        } => println!("joined: {} ({})", display_name, peer_id),
        SyncEvent::PeerLeft { peer_id } => println!("left: {}", peer_id),
        SyncEvent::CollectionUpdated {
            collection,
            records,
        } => println!("updated: {} ({} records)", collection, records.len()),
        SyncEvent::RemoteActivity(activity) => {
            println!("activity: {} {}", activity.author, activity.action)
        }
        SyncEvent::LinkLost => println!("link lost, resetting"),
    }
}

async fn simulate(workstations: usize, dataset: &str) -> Result<()> {
    if workstations == 0 {
        bail!("need at least one workstation");
    }
    let network = MemoryNetwork::new();

    let mut nodes = vec![(
        "hub".to_string(),
        spawn_node(&network, SyncConfig::hub(dataset).with_self_id("hub")).await?,
    )];
    for i in 1..=workstations {
        let name = format!("ws-{}", i);
        let config = SyncConfig::workstation(dataset)
            .with_self_id(name.clone())
            .with_local_user(format!("user-{}", i));
        nodes.push((name, spawn_node(&network, config).await?));
    }
    for (_, node) in &nodes {
        node.start().await?;
    }
    wait_connected(&nodes).await?;

    let editor = &nodes[1].1;
    editor
        .upsert(
            "clients",
            Record::new("c1").with_field("name", "Acme Ltd").with_field("balance", 120.5),
        )
        .await?;
    editor
        .upsert(
            "auditLogs",
            Record::new("a1")
                .with_field("user", "user-1")
                .with_field("action", "Created client Acme Ltd"),
        )
        .await?;

    // One flush on the editor, one forward by the hub.
    tokio::time::sleep(Duration::from_secs(5)).await;

    for (name, node) in &nodes {
        let data = node.dataset().await?;
        println!("{}: {}", name, serde_json::to_string(&data)?);
    }
    for (_, node) in &nodes {
        node.shutdown().await?;
    }
    Ok(())
}

async fn spawn_node(network: &MemoryNetwork, config: SyncConfig) -> Result<SessionHandle> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    Ok(TopologyManager::spawn(config, network.transport(), store).await?)
}

async fn wait_connected(nodes: &[(String, SessionHandle)]) -> Result<()> {
    for (name, node) in nodes {
        let mut status = node.status_watch();
        tokio::time::timeout(Duration::from_secs(30), async {
            while *status.borrow_and_update() != ConnectionStatus::Connected {
                if status.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .with_context(|| format!("{} did not connect", name))?;
    }
    // Let the hub's FULL_PUSH reach everyone.
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(())
}
