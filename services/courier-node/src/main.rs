//! Courier Node
//!
//! Runs a DHT peer with relay support over UDP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use courier_dht::KademliaDht;
use courier_relay::{RelayPacketHandler, RelayQueue, RelaySender};
use courier_transport::{BanList, DatagramTransport, PacketDispatcher, SendQueue, UdpTransport};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::NodeConfig;

/// Courier node CLI arguments
#[derive(Parser, Debug)]
#[command(name = "courier-node")]
#[command(about = "Courier DHT and relay node")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for stored packets, peers and the relay queue
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// UDP address to bind, overriding the configuration file
    #[arg(long)]
    bind: Option<String>,

    /// Bootstrap peers (comma-separated host:port)
    #[arg(long)]
    bootstrap: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON
    #[arg(long)]
    json: bool,
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let default = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if args.json {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("installing logger: {}", e))
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("installing logger: {}", e))
    }
}

fn load_config(args: &Args) -> anyhow::Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.set_data_dir(dir);
    }
    if let Some(bind) = &args.bind {
        config.network.bind_address = bind.clone();
    }
    if let Some(bootstrap) = &args.bootstrap {
        config.network.bootstrap = bootstrap.split(',').map(|s| s.trim().to_string()).collect();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    let config = load_config(&args)?;

    info!("Starting Courier node");
    info!("Storage path: {}", config.dht.storage_path);
    info!("Relay queue: {}", config.relay.queue_path);

    let (transport, inbound) =
        UdpTransport::bind(config.bind_address()?, config.advertised_address()?)
            .await
            .context("binding UDP transport")?;
    let send_queue = Arc::new(SendQueue::new(transport as Arc<dyn DatagramTransport>));
    let bans = Arc::new(BanList::new());
    let dispatcher = Arc::new(PacketDispatcher::new(bans.clone()));
    dispatcher.add_listener(send_queue.clone());

    let dht = KademliaDht::new(config.dht.clone(), send_queue.clone(), bans)
        .context("opening DHT storage")?;
    dht.register(&dispatcher);
    info!("Local identity: {}", dht.local_identity());

    let relay_queue = RelayQueue::open(config.relay_queue_dir()).context("opening relay queue")?;
    let relay = RelayPacketHandler::new(
        config.relay.clone(),
        relay_queue.clone(),
        send_queue.clone(),
        Arc::new(dht.clone()),
    )?;
    relay.register(&dispatcher);
    let sender = Arc::new(RelaySender::new(
        relay_queue,
        send_queue.clone(),
        config.relay.clone(),
    ));

    let dispatch_handle = tokio::spawn(dispatcher.run(inbound));

    let bootstrap = config
        .bootstrap_addresses()?
        .iter()
        .map(UdpTransport::identity_for)
        .collect::<Result<Vec<_>, _>>()?;
    if bootstrap.is_empty() && dht.routing_table().is_empty() {
        warn!("No bootstrap peers configured; waiting to be contacted");
    } else {
        let found = dht.bootstrap(&bootstrap).await;
        info!("Bootstrap found {} peers", found);
    }

    let maintenance_handle = dht.run_maintenance();
    let sender_handle = sender.spawn();

    tokio::select! {
        _ = dispatch_handle => {
            error!("Packet dispatcher stopped unexpectedly");
        }
        _ = maintenance_handle => {
            warn!("DHT maintenance loop ended unexpectedly");
        }
        _ = sender_handle => {
            warn!("Relay sender loop ended unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    if let Err(e) = dht.save_peers() {
        warn!("Could not save peers: {}", e);
    }
    let stats = dht.stats();
    info!(
        "Courier node shutting down with {} known peers",
        stats.routing.total_peers
    );
    Ok(())
}
