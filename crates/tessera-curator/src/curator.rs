//! The curator service.
//!
//! Runs on the leader and owns every write to node records. Each method
//! runs under the configured deadline and reports failures in the public
//! status vocabulary.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tessera_consensus::{AddNodeOptions, ServiceHandle, Status, parse_public_key};
use tessera_state::KeyNamespace;
use tracing::{debug, info};

use crate::error::{CuratorError, CuratorResult, with_deadline};
use crate::leadership::Leadership;
use crate::node::{Node, NodeState, NodeStatus, node_create, node_list, node_load, node_save};

/// Default key prefix for node records in the curator view.
pub const DEFAULT_NODE_PREFIX: &str = "/nodes/";

/// Control-plane operations on nodes.
pub struct Curator {
    leadership: Leadership,
    consensus: Arc<dyn ServiceHandle>,
    nodes: KeyNamespace,
    deadline: Duration,
}

impl Curator {
    pub fn new(leadership: Leadership, consensus: Arc<dyn ServiceHandle>) -> CuratorResult<Self> {
        Ok(Self {
            leadership,
            consensus,
            nodes: KeyNamespace::new(DEFAULT_NODE_PREFIX)?,
            deadline: Duration::from_secs(10),
        })
    }

    /// Store node records under a different prefix.
    pub fn with_node_prefix(mut self, prefix: &str) -> CuratorResult<Self> {
        self.nodes = KeyNamespace::new(prefix)?;
        Ok(self)
    }

    /// Set the per-operation deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn leadership(&self) -> &Leadership {
        &self.leadership
    }

    async fn run<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = CuratorResult<T>>,
    ) -> Result<T, tonic::Status> {
        with_deadline(self.deadline, fut).await.map_err(|e| {
            debug!(op, error = %e, kind = ?e.kind(), "curator operation failed");
            tonic::Status::from(e)
        })
    }

    async fn consensus(&self) -> CuratorResult<Arc<Status>> {
        Ok(self.consensus.watch().get_running().await?)
    }

    /// Create the cluster's first node, `UP` and with both roles.
    ///
    /// The consensus service must already count this node as a member.
    /// Repeating the call for the same node returns it unchanged.
    pub async fn bootstrap_node(
        &self,
        cluster_unlock_key: &[u8],
        public_key: &[u8],
        options: &AddNodeOptions,
    ) -> Result<Node, tonic::Status> {
        self.run("bootstrap_node", async {
            parse_public_key(public_key)?;
            let mut node =
                Node::new_for_bootstrap(cluster_unlock_key.to_vec(), public_key.to_vec());
            let id = node.id();

            let existing = node_list(&self.leadership, &self.nodes).await?;
            if let Some(first) = existing.first() {
                if existing.len() == 1 && first.id() == id {
                    debug!(node_id = %id, "node already bootstrapped");
                    return Ok(first.clone());
                }
                return Err(CuratorError::AlreadyBootstrapped);
            }

            let join = self.consensus().await?.add_node(public_key, options).await?;
            node.enable_consensus_member_role(&join);
            node.enable_worker_role();

            let (stored, created) = node_create(&self.leadership, &self.nodes, &node).await?;
            if created {
                info!(node_id = %id, "cluster bootstrapped");
            }
            Ok(stored)
        })
        .await
    }

    /// Record a new node awaiting approval, or return the existing one.
    pub async fn register_node(
        &self,
        cluster_unlock_key: &[u8],
        public_key: &[u8],
    ) -> Result<Node, tonic::Status> {
        self.run("register_node", async {
            parse_public_key(public_key)?;
            let node = Node::new(cluster_unlock_key.to_vec(), public_key.to_vec());
            let (stored, created) = node_create(&self.leadership, &self.nodes, &node).await?;
            if created {
                info!(node_id = %stored.id(), "node registered");
            } else {
                debug!(node_id = %stored.id(), "node already registered");
            }
            Ok(stored)
        })
        .await
    }

    /// Move a node from `NEW` to `UP`.
    pub async fn approve_node(&self, id: &str) -> Result<Node, tonic::Status> {
        self.run("approve_node", async {
            let mut node = node_load(&self.leadership, &self.nodes, id).await?;
            match node.state() {
                NodeState::Up => return Ok(node),
                NodeState::Decommissioned => {
                    return Err(CuratorError::InvalidTransition {
                        id: id.to_string(),
                        from: NodeState::Decommissioned,
                        to: NodeState::Up,
                    });
                }
                NodeState::New => {}
            }
            node.set_state(NodeState::Up);
            node_save(&self.leadership, &self.nodes, &node).await?;
            info!(node_id = %id, "node approved");
            Ok(node)
        })
        .await
    }

    /// Move a node to `DECOMMISSIONED`. The record is kept.
    pub async fn decommission_node(&self, id: &str) -> Result<Node, tonic::Status> {
        self.run("decommission_node", async {
            let mut node = node_load(&self.leadership, &self.nodes, id).await?;
            if node.state() == NodeState::Decommissioned {
                return Ok(node);
            }
            node.set_state(NodeState::Decommissioned);
            node_save(&self.leadership, &self.nodes, &node).await?;
            info!(node_id = %id, "node decommissioned");
            Ok(node)
        })
        .await
    }

    /// Admit an `UP` node into the consensus group and record its role.
    pub async fn join_consensus(
        &self,
        id: &str,
        options: &AddNodeOptions,
    ) -> Result<Node, tonic::Status> {
        self.run("join_consensus", async {
            let mut node = self.load_up(id).await?;
            if node.consensus_member().is_some() {
                debug!(node_id = %id, "node already a consensus member");
                return Ok(node);
            }

            let join = self
                .consensus()
                .await?
                .add_node(node.public_key(), options)
                .await?;
            node.enable_consensus_member_role(&join);
            node_save(&self.leadership, &self.nodes, &node).await?;
            info!(node_id = %id, peers = join.existing_nodes.len(), "node joined consensus");
            Ok(node)
        })
        .await
    }

    /// Let an `UP` node run workloads.
    pub async fn enable_worker(&self, id: &str) -> Result<Node, tonic::Status> {
        self.run("enable_worker", async {
            let mut node = self.load_up(id).await?;
            if node.worker().is_some() {
                return Ok(node);
            }
            node.enable_worker_role();
            node_save(&self.leadership, &self.nodes, &node).await?;
            info!(node_id = %id, "worker role enabled");
            Ok(node)
        })
        .await
    }

    /// Record the status a node reported about itself.
    pub async fn update_status(
        &self,
        id: &str,
        external_address: &str,
    ) -> Result<Node, tonic::Status> {
        self.run("update_status", async {
            let mut node = node_load(&self.leadership, &self.nodes, id).await?;
            node.set_status(NodeStatus {
                external_address: external_address.to_string(),
                reported_at: unix_now(),
            });
            node_save(&self.leadership, &self.nodes, &node).await?;
            debug!(node_id = %id, %external_address, "node status updated");
            Ok(node)
        })
        .await
    }

    pub async fn get_node(&self, id: &str) -> Result<Node, tonic::Status> {
        self.run("get_node", node_load(&self.leadership, &self.nodes, id))
            .await
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, tonic::Status> {
        self.run("list_nodes", node_list(&self.leadership, &self.nodes))
            .await
    }

    async fn load_up(&self, id: &str) -> CuratorResult<Node> {
        let node = node_load(&self.leadership, &self.nodes, id).await?;
        if node.state() != NodeState::Up {
            return Err(CuratorError::NotUp {
                id: id.to_string(),
                state: node.state(),
            });
        }
        Ok(node)
    }
}

impl std::fmt::Debug for Curator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Curator")
            .field("leadership", &self.leadership)
            .field("nodes", &self.nodes.prefix())
            .field("deadline", &self.deadline)
            .finish()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
