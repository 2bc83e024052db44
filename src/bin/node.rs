//! Node binary

use clap::{Parser, Subcommand};
use herd::common::SeedMember;
use herd::{MemoryEngine, Node};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "herd-node")]
#[command(about = "herd cluster node: membership, metadata, replication, gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cluster node
    Serve {
        /// Node ID
        #[arg(long)]
        id: String,

        /// Bind address for the peer wire protocol
        #[arg(long, default_value = "0.0.0.0:7000")]
        peer: String,

        /// Address other nodes reach us at (defaults to --peer)
        #[arg(long)]
        advertise: Option<String>,

        /// Bind address for the client HTTP API
        #[arg(long, default_value = "0.0.0.0:8000")]
        http: String,

        /// Data directory (partition map + logs)
        #[arg(long, default_value = "./herd-data")]
        data: PathBuf,

        /// Initial members as id@addr (comma-separated); doubles as the
        /// metadata voter set
        #[arg(long, value_delimiter = ',')]
        members: Vec<String>,

        /// Number of partitions in the initial map
        #[arg(long)]
        partitions: Option<u64>,

        /// Replicas per partition
        #[arg(long)]
        replicas: Option<usize>,
    },
}

fn parse_member(s: &str) -> anyhow::Result<SeedMember> {
    let (id, addr) = s
        .split_once('@')
        .ok_or_else(|| anyhow::anyhow!("expected id@addr, got {:?}", s))?;
    Ok(SeedMember {
        id: id.to_string(),
        addr: addr.to_string(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            peer,
            advertise,
            http,
            data,
            members,
            partitions,
            replicas,
        } => {
            // config file first, CLI flags on top
            let mut config = herd::Config::load();
            config.node.node_id = id;
            config.node.peer_addr = peer.parse()?;
            config.node.advertise_addr = advertise;
            config.node.http_addr = http.parse()?;
            config.node.data_dir = Some(data);
            if !members.is_empty() {
                config.node.initial_members = members
                    .iter()
                    .map(|m| parse_member(m))
                    .collect::<anyhow::Result<Vec<_>>>()?;
            }
            if let Some(p) = partitions {
                config.replication.num_partitions = p;
            }
            if let Some(r) = replicas {
                config.replication.replication_factor = r;
            }
            if config.node.initial_members.is_empty() {
                anyhow::bail!("--members is required (at least the local node)");
            }

            let transport = Arc::new(herd::net::TcpTransport::new(Duration::from_secs(5)));
            let storage = Arc::new(MemoryEngine::new());
            let node = Node::new(config, transport, storage)?;
            node.serve().await?;
        }
    }

    Ok(())
}
