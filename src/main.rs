use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use hyparmesh::{Config, Flooder, Node, NodeId};

#[derive(Parser, Debug)]
#[command(name = "hyparmesh")]
#[command(author, version, about = "HyParView overlay node with flood chat", long_about = None)]
struct Args {
    /// Address to listen on; port 0 picks a free one.
    #[arg(short, long, default_value = "127.0.0.1:0")]
    bind: String,

    /// Contact node to join the overlay through (ip:port).
    #[arg(short, long)]
    join: Option<NodeId>,

    /// Milliseconds between shuffle ticks; 0 disables shuffling.
    #[arg(long, default_value = "10000")]
    shuffle_period: u64,

    /// Maximum active view size.
    #[arg(long, default_value = "5")]
    active_size: usize,

    /// Maximum passive view size.
    #[arg(long, default_value = "30")]
    passive_size: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config {
        active_size: args.active_size,
        passive_size: args.passive_size,
        shuffle_period: match args.shuffle_period {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        },
        ..Default::default()
    };

    let (flooder, mut messages) = Flooder::new();
    let node = Node::bind(&args.bind, config, flooder.clone()).await?;
    flooder.attach(node.clone());

    println!("node id: {}", node.self_id());
    println!("join with: hyparmesh --join {}", node.self_id());

    if let Some(contact) = args.join {
        info!(%contact, "joining overlay");
        match node.join_cluster(contact).await {
            Ok(()) => info!("joined"),
            Err(e) => warn!(error = %e, "join failed"),
        }
    }

    // Print floods from the overlay as they arrive.
    tokio::spawn(async move {
        while let Some(msg) = messages.recv().await {
            println!("[{}] {}", msg.origin, String::from_utf8_lossy(&msg.payload));
        }
    });

    // Every stdin line is broadcast to the overlay.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        if line == "/peers" {
            for peer in node.peers().await {
                println!("active: {}", peer.id);
            }
            for id in node.passive_peers().await {
                println!("passive: {}", id);
            }
            continue;
        }
        if let Err(e) = flooder.broadcast(line.into_bytes()).await {
            warn!(error = %e, "broadcast failed");
        }
    }

    node.stop().await;
    Ok(())
}
