//! tesserad: the Tessera control-plane daemon.
//!
//! Each invocation opens the local store, publishes a running consensus
//! status backed by the store's membership table, campaigns for
//! leadership and runs one curator operation. Results are printed as JSON.
//!
//! # Usage
//!
//! ```text
//! tesserad --data-dir /var/lib/tessera bootstrap --public-key <hex>
//! tesserad register --public-key <hex> --unlock-key <hex>
//! tesserad approve node-3f2a...
//! tesserad join node-3f2a...
//! tesserad list
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tessera_consensus::{
    AddNodeOptions, ClusterAdmin, LocalCluster, Service, Status, node_id, peer_url,
};
use tessera_curator::{Curator, Election, NodeSummary};
use tessera_pki::RcgenBackend;
use tessera_state::{KvStore, StateStore};
use tracing::info;

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "tesserad", about = "Tessera control-plane daemon")]
struct Cli {
    /// Path to a tesserad.toml file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory; overrides the config file.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the cluster's first node.
    Bootstrap {
        /// Ed25519 public key, hex.
        #[arg(long)]
        public_key: String,
        /// Cluster unlock key, hex.
        #[arg(long, default_value = "")]
        unlock_key: String,
        /// Host advertised to consensus peers; overrides the config file.
        #[arg(long)]
        external_address: Option<String>,
    },
    /// Register a node awaiting approval.
    Register {
        #[arg(long)]
        public_key: String,
        #[arg(long, default_value = "")]
        unlock_key: String,
    },
    /// Approve a registered node.
    Approve { id: String },
    /// Decommission a node.
    Decommission { id: String },
    /// Admit a node into the consensus group.
    Join {
        id: String,
        /// Host the node advertises to consensus peers.
        #[arg(long)]
        external_address: Option<String>,
    },
    /// Let a node run workloads.
    EnableWorker { id: String },
    /// Show one node.
    Show { id: String },
    /// List all nodes.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tessera=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    run(config, cli.command).await
}

async fn run(config: DaemonConfig, command: Command) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path();
    let store: Arc<dyn KvStore> = Arc::new(StateStore::open(&db_path)?);
    info!(path = ?db_path, "state store opened");

    // ── Consensus ──────────────────────────────────────────────

    let cluster = LocalCluster::new(store.clone())?;
    let status = Status::new(store.clone(), Arc::new(cluster.clone()))?
        .with_pki(&config.pki_namespace, Arc::new(RcgenBackend))?
        .with_crl_backoff(config.crl_backoff())
        .with_running(true);
    let service = Arc::new(Service::new());
    service.publish(status.clone());

    // ── Curator ────────────────────────────────────────────────

    let leadership = Election::new(status.curator_client()?)
        .with_ttl(config.lease_ttl())
        .campaign(&config.holder)
        .await?;
    let curator = Curator::new(leadership.clone(), service)?
        .with_node_prefix(&config.node_prefix)?
        .with_deadline(config.deadline());

    match command {
        Command::Bootstrap {
            public_key,
            unlock_key,
            external_address,
        } => {
            let public_key = decode_hex("public key", &public_key)?;
            let unlock_key = decode_hex("unlock key", &unlock_key)?;
            let id = node_id(&public_key);

            let nodes = curator.list_nodes().await?;
            if nodes.iter().any(|n| n.id() != id) {
                bail!("cluster already bootstrapped");
            }

            let mut options = config.add_node_options();
            if external_address.is_some() {
                options.external_address = external_address;
            }
            let host = options.external_address.clone().unwrap_or_else(|| id.clone());
            let members = cluster.member_list().await?;
            if !members.iter().any(|m| m.name == id) {
                let member = cluster
                    .add_member(&id, vec![peer_url(&host, config.consensus_port)])
                    .await?;
                info!(node_id = %id, member = member.id, "registered first consensus member");
            }

            let node = curator
                .bootstrap_node(&unlock_key, &public_key, &options)
                .await?;
            print_json(&node.summary())?;
        }
        Command::Register {
            public_key,
            unlock_key,
        } => {
            let public_key = decode_hex("public key", &public_key)?;
            let unlock_key = decode_hex("unlock key", &unlock_key)?;
            let node = curator.register_node(&unlock_key, &public_key).await?;
            print_json(&node.summary())?;
        }
        Command::Approve { id } => print_json(&curator.approve_node(&id).await?.summary())?,
        Command::Decommission { id } => {
            print_json(&curator.decommission_node(&id).await?.summary())?
        }
        Command::Join {
            id,
            external_address,
        } => {
            let options = AddNodeOptions {
                external_address,
                external_port: Some(config.consensus_port),
            };
            print_json(&curator.join_consensus(&id, &options).await?.summary())?
        }
        Command::EnableWorker { id } => print_json(&curator.enable_worker(&id).await?.summary())?,
        Command::Show { id } => print_json(&curator.get_node(&id).await?.summary())?,
        Command::List => {
            let nodes: Vec<NodeSummary> = curator
                .list_nodes()
                .await?
                .iter()
                .map(|n| n.summary())
                .collect();
            print_json(&nodes)?;
        }
    }

    leadership.resign().await?;
    Ok(())
}

fn decode_hex(what: &str, value: &str) -> anyhow::Result<Vec<u8>> {
    hex::decode(value).with_context(|| format!("{what} must be hex"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
