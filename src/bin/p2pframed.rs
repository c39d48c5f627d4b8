use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use p2pframe::config::{Network, NodeConfig};
use p2pframe::net::node::P2PNode;

#[derive(Parser, Debug)]
#[command(name = "p2pframed", version, about = "P2P message framing and validation node")]
struct Args {
    /// JSON config file; P2PFRAME_* environment variables override it
    #[arg(long, env = "P2PFRAME_CONFIG")]
    config: Option<PathBuf>,

    /// mainnet, testnet or regtest
    #[arg(long)]
    network: Option<Network>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    bind: Option<String>,

    /// Outbound peers to connect to at startup
    #[arg(long = "connect")]
    connect: Vec<SocketAddr>,

    /// Seconds between traffic totals reports, 0 to disable
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,
}

fn banner(config: &NodeConfig) {
    println!("{}", " p2pframed ".on_blue().white().bold());
    println!(
        "{}",
        format!("  v{} {:?}", env!("CARGO_PKG_VERSION"), config.network)
            .bright_green()
            .bold()
    );
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(network) = args.network {
        config.p2p_port = network.default_port();
        config.network = network;
    }
    config = config.with_env_overrides()?;
    if let Some(port) = args.port {
        config.p2p_port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }

    banner(&config);
    println!(
        "{} magic {} max message {} bytes, flood size {} bytes",
        "[init]".bright_blue().bold(),
        hex::encode(config.magic()),
        config.max_message_length,
        config.receive_flood_size
    );

    let handle = P2PNode::start(config).await?;
    println!(
        "{} P2P server listening on {}",
        "[p2p] ".bright_green().bold(),
        handle.local_addr()
    );

    for addr in &args.connect {
        match handle.node().connect(*addr).await {
            Ok(id) => println!("{} connected to {addr} peer={id}", "[p2p] ".bright_green().bold()),
            Err(e) => eprintln!("{} connect {addr} failed: {e}", "[p2p] ".bright_red().bold()),
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.stats_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick(), if args.stats_interval > 0 => {
                let totals = serde_json::to_string(&handle.net_totals())?;
                println!(
                    "{} peers={} {}",
                    "[net] ".bright_magenta().bold(),
                    handle.peer_count().await,
                    totals
                );
            }
        }
    }

    println!("{} stopping", "[shutdown]".bright_red().bold());
    handle.shutdown().await;
    println!("{} done", "[shutdown]".bright_red().bold());
    Ok(())
}
