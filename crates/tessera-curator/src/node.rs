//! Node records.
//!
//! A [`Node`] is the control plane's view of one cluster member. Its ID is
//! derived from its public key and never stored separately. Role changes
//! are local until [`node_save`] commits them through the leadership gate.
//!
//! Stored as JSON at `/nodes/{id}` in the curator view, with key material
//! and certificates hex-encoded DER.

use serde::{Deserialize, Serialize};
use tessera_consensus::{JoinCluster, node_id};
use tessera_pki::{Crl, ParsedCertificate};
use tessera_state::{Compare, KeyNamespace, Op, TxnRequest};
use tracing::{debug, info};

use crate::error::{CuratorError, CuratorResult};
use crate::leadership::Leadership;

/// Lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    /// Registered, awaiting approval.
    New,
    Up,
    /// Terminal.
    Decommissioned,
}

/// Last status a node reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub external_address: String,
    /// Unix timestamp (seconds) of the report.
    pub reported_at: i64,
}

/// Marker: the node runs scheduled workloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerRole;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusPeer {
    pub name: String,
    pub url: String,
}

/// Material a consensus member needs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusMemberRole {
    pub ca_certificate: ParsedCertificate,
    pub peer_certificate: ParsedCertificate,
    pub crl: Crl,
    pub peers: Vec<ConsensusPeer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    cluster_unlock_key: Vec<u8>,
    public_key: Vec<u8>,
    state: NodeState,
    status: Option<NodeStatus>,
    worker: Option<WorkerRole>,
    consensus_member: Option<ConsensusMemberRole>,
}

impl Node {
    /// A freshly registered node, awaiting approval.
    pub fn new(cluster_unlock_key: Vec<u8>, public_key: Vec<u8>) -> Self {
        Self {
            cluster_unlock_key,
            public_key,
            state: NodeState::New,
            status: None,
            worker: None,
            consensus_member: None,
        }
    }

    /// The cluster's first node, which starts out `UP`.
    pub fn new_for_bootstrap(cluster_unlock_key: Vec<u8>, public_key: Vec<u8>) -> Self {
        Self {
            state: NodeState::Up,
            ..Self::new(cluster_unlock_key, public_key)
        }
    }

    pub fn id(&self) -> String {
        node_id(&self.public_key)
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn cluster_unlock_key(&self) -> &[u8] {
        &self.cluster_unlock_key
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    pub fn status(&self) -> Option<&NodeStatus> {
        self.status.as_ref()
    }

    pub fn set_status(&mut self, status: NodeStatus) {
        self.status = Some(status);
    }

    pub fn worker(&self) -> Option<&WorkerRole> {
        self.worker.as_ref()
    }

    pub fn consensus_member(&self) -> Option<&ConsensusMemberRole> {
        self.consensus_member.as_ref()
    }

    pub fn enable_worker_role(&mut self) {
        self.worker = Some(WorkerRole);
    }

    pub fn disable_worker_role(&mut self) {
        self.worker = None;
    }

    /// Attach the consensus role from a join bundle, replacing any
    /// previous one.
    pub fn enable_consensus_member_role(&mut self, join: &JoinCluster) {
        self.consensus_member = Some(ConsensusMemberRole {
            ca_certificate: join.ca_certificate.clone(),
            peer_certificate: join.node_certificate.clone(),
            crl: join.initial_crl.clone(),
            peers: join
                .existing_nodes
                .iter()
                .map(|n| ConsensusPeer {
                    name: n.name.clone(),
                    url: n.url.clone(),
                })
                .collect(),
        });
    }

    pub fn disable_consensus_member_role(&mut self) {
        self.consensus_member = None;
    }

    fn to_record(&self) -> NodeRecord {
        NodeRecord {
            cluster_unlock_key: self.cluster_unlock_key.clone(),
            public_key: self.public_key.clone(),
            state: self.state,
            status: self.status.clone(),
            roles: RolesRecord {
                worker: self.worker.map(|_| WorkerRecord {}),
                consensus_member: self.consensus_member.as_ref().map(|c| ConsensusMemberRecord {
                    ca_certificate: c.ca_certificate.raw().to_vec(),
                    peer_certificate: c.peer_certificate.raw().to_vec(),
                    initial_crl: c.crl.raw().to_vec(),
                    peers: c.peers.clone(),
                }),
            },
        }
    }

    /// Serialized form, as stored.
    pub fn to_bytes(&self) -> CuratorResult<Vec<u8>> {
        serde_json::to_vec(&self.to_record()).map_err(|e| CuratorError::Encode(e.to_string()))
    }

    /// A JSON-friendly summary, without secrets.
    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id(),
            public_key: hex::encode(&self.public_key),
            state: self.state,
            status: self.status.clone(),
            worker: self.worker.is_some(),
            consensus_member: self.consensus_member.as_ref().map(|c| ConsensusSummary {
                peer_certificate_cn: c.peer_certificate.common_name().to_string(),
                revoked: c.crl.revoked_serials().len(),
                peers: c.peers.clone(),
            }),
        }
    }
}

/// What operators get to see of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub id: String,
    pub public_key: String,
    pub state: NodeState,
    pub status: Option<NodeStatus>,
    pub worker: bool,
    pub consensus_member: Option<ConsensusSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsensusSummary {
    pub peer_certificate_cn: String,
    pub revoked: usize,
    pub peers: Vec<ConsensusPeer>,
}

#[derive(Serialize, Deserialize)]
struct NodeRecord {
    #[serde(with = "hex::serde")]
    cluster_unlock_key: Vec<u8>,
    #[serde(with = "hex::serde")]
    public_key: Vec<u8>,
    state: NodeState,
    status: Option<NodeStatus>,
    roles: RolesRecord,
}

#[derive(Serialize, Deserialize)]
struct RolesRecord {
    worker: Option<WorkerRecord>,
    consensus_member: Option<ConsensusMemberRecord>,
}

#[derive(Serialize, Deserialize)]
struct WorkerRecord {}

#[derive(Serialize, Deserialize)]
struct ConsensusMemberRecord {
    #[serde(with = "hex::serde")]
    ca_certificate: Vec<u8>,
    #[serde(with = "hex::serde")]
    peer_certificate: Vec<u8>,
    #[serde(with = "hex::serde")]
    initial_crl: Vec<u8>,
    peers: Vec<ConsensusPeer>,
}

/// Decode a stored node. Any failure, including an embedded certificate
/// or CRL that does not parse, is corruption.
pub fn node_unmarshal(data: &[u8]) -> CuratorResult<Node> {
    let corrupt = |reason: String| CuratorError::Corrupt {
        key: "node record".to_string(),
        reason,
    };
    let record: NodeRecord = serde_json::from_slice(data).map_err(|e| corrupt(e.to_string()))?;

    let consensus_member = match record.roles.consensus_member {
        None => None,
        Some(c) => Some(ConsensusMemberRole {
            ca_certificate: ParsedCertificate::from_der(&c.ca_certificate)
                .map_err(|e| corrupt(format!("CA certificate: {e}")))?,
            peer_certificate: ParsedCertificate::from_der(&c.peer_certificate)
                .map_err(|e| corrupt(format!("peer certificate: {e}")))?,
            crl: Crl::from_der(&c.initial_crl).map_err(|e| corrupt(format!("CRL: {e}")))?,
            peers: c.peers,
        }),
    };

    Ok(Node {
        cluster_unlock_key: record.cluster_unlock_key,
        public_key: record.public_key,
        state: record.state,
        status: record.status,
        worker: record.roles.worker.map(|_| WorkerRole),
        consensus_member,
    })
}

fn unmarshal_at(key: &str, data: &[u8]) -> CuratorResult<Node> {
    node_unmarshal(data).map_err(|e| match e {
        CuratorError::Corrupt { reason, .. } => CuratorError::Corrupt {
            key: key.to_string(),
            reason,
        },
        other => other,
    })
}

/// Load one node through the leadership gate.
pub async fn node_load(
    leadership: &Leadership,
    nodes: &KeyNamespace,
    id: &str,
) -> CuratorResult<Node> {
    let key = nodes.key(id)?;
    let resp = leadership.txn_as_leader(vec![Op::get(&key)]).await?;
    let Some(raw) = resp.value(0) else {
        debug!(node_id = %id, "node not found");
        return Err(CuratorError::NodeNotFound(id.to_string()));
    };
    unmarshal_at(&key, raw)
}

/// Persist a node through the leadership gate.
pub async fn node_save(
    leadership: &Leadership,
    nodes: &KeyNamespace,
    node: &Node,
) -> CuratorResult<()> {
    let id = node.id();
    let key = nodes.key(&id)?;
    leadership
        .txn_as_leader(vec![Op::put(&key, node.to_bytes()?)])
        .await?;
    info!(node_id = %id, state = ?node.state, "node saved");
    Ok(())
}

/// Persist a node only if no node with its ID exists yet. Returns the
/// stored node and whether this call created it.
pub async fn node_create(
    leadership: &Leadership,
    nodes: &KeyNamespace,
    node: &Node,
) -> CuratorResult<(Node, bool)> {
    let id = node.id();
    let key = nodes.key(&id)?;
    let resp = leadership
        .txn_as_leader_if(
            TxnRequest::new(vec![Op::put(&key, node.to_bytes()?)])
                .when(Compare::absent(&key))
                .otherwise(vec![Op::get(&key)]),
        )
        .await?;
    if resp.succeeded {
        info!(node_id = %id, state = ?node.state, "node created");
        return Ok((node.clone(), true));
    }
    let raw = resp.value(0).ok_or_else(|| CuratorError::Corrupt {
        key: key.clone(),
        reason: "record vanished after failed create".to_string(),
    })?;
    Ok((unmarshal_at(&key, raw)?, false))
}

/// Every stored node, in ID order.
pub async fn node_list(leadership: &Leadership, nodes: &KeyNamespace) -> CuratorResult<Vec<Node>> {
    let resp = leadership
        .txn_as_leader(vec![Op::range(nodes.prefix())])
        .await?;
    resp.kvs(0)
        .iter()
        .filter(|kv| nodes.id_from_key(&kv.key).is_some())
        .map(|kv| unmarshal_at(&kv.key, &kv.value))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use tessera_consensus::{AddNodeOptions, LocalCluster, Status};
    use tessera_state::{KvStore, StateError, StateResult, StateStore, TxnResponse};

    use super::*;
    use crate::error::ErrorKind;
    use crate::leadership::Election;

    fn public_key(seed: u8) -> Vec<u8> {
        SigningKey::from_bytes(&[seed; 32])
            .verifying_key()
            .to_bytes()
            .to_vec()
    }

    fn nodes() -> KeyNamespace {
        KeyNamespace::new("/nodes/").unwrap()
    }

    async fn join_bundle(pk: &[u8]) -> JoinCluster {
        let kv: Arc<dyn KvStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let cluster = Arc::new(LocalCluster::new(kv.clone()).unwrap());
        let status = Status::new(kv, cluster).unwrap().with_running(true);
        status.add_node(pk, &AddNodeOptions::default()).await.unwrap()
    }

    #[test]
    fn id_follows_public_key() {
        let node = Node::new(vec![1], public_key(1));
        assert_eq!(node.id(), node_id(&public_key(1)));
        assert_eq!(node.state(), NodeState::New);
        assert_eq!(
            Node::new_for_bootstrap(vec![1], public_key(1)).state(),
            NodeState::Up
        );
    }

    #[tokio::test]
    async fn round_trip_preserves_every_role_combination() {
        let pk = public_key(2);
        let join = join_bundle(&pk).await;

        for (worker, consensus) in [(false, false), (true, false), (false, true), (true, true)] {
            let mut node = Node::new(b"cuk".to_vec(), pk.clone());
            node.set_status(NodeStatus {
                external_address: "10.0.0.2".to_string(),
                reported_at: 1_700_000_000,
            });
            if worker {
                node.enable_worker_role();
            }
            if consensus {
                node.enable_consensus_member_role(&join);
            }

            let decoded = node_unmarshal(&node.to_bytes().unwrap()).unwrap();
            assert_eq!(decoded, node);
            assert_eq!(decoded.id(), node.id());
            assert_eq!(decoded.worker().is_some(), worker);
            assert_eq!(decoded.consensus_member().is_some(), consensus);
        }
    }

    #[tokio::test]
    async fn consensus_role_projects_existing_nodes() {
        let pk = public_key(3);
        let join = join_bundle(&pk).await;
        let mut node = Node::new_for_bootstrap(vec![], pk);
        node.enable_consensus_member_role(&join);

        let role = node.consensus_member().unwrap();
        assert_eq!(role.peer_certificate, join.node_certificate);
        assert_eq!(role.peers.len(), join.existing_nodes.len());

        node.disable_consensus_member_role();
        assert!(node.consensus_member().is_none());
    }

    #[test]
    fn garbage_is_corruption() {
        let err = node_unmarshal(b"\x00\x01").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataLoss);
    }

    #[test]
    fn unparsable_certificate_is_corruption() {
        let record = serde_json::json!({
            "cluster_unlock_key": "",
            "public_key": hex::encode(public_key(4)),
            "state": "UP",
            "status": null,
            "roles": {
                "worker": null,
                "consensus_member": {
                    "ca_certificate": "deadbeef",
                    "peer_certificate": "deadbeef",
                    "initial_crl": "deadbeef",
                    "peers": []
                }
            }
        });
        let err = node_unmarshal(&serde_json::to_vec(&record).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataLoss);
    }

    /// Passes through to a real store until told to fail.
    struct FlakyKv {
        inner: StateStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl KvStore for FlakyKv {
        async fn txn(&self, request: TxnRequest) -> StateResult<TxnResponse> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StateError::Unavailable("connection reset".to_string()));
            }
            self.inner.txn(request).await
        }
    }

    #[tokio::test]
    async fn not_found_and_unavailable_are_distinct() {
        let kv = Arc::new(FlakyKv {
            inner: StateStore::open_in_memory().unwrap(),
            failing: AtomicBool::new(false),
        });
        let leadership = Election::new(kv.clone()).campaign("replica-a").await.unwrap();

        let missing = node_load(&leadership, &nodes(), "node-missing")
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        kv.failing.store(true, Ordering::SeqCst);
        let broken = node_load(&leadership, &nodes(), "node-missing")
            .await
            .unwrap_err();
        assert_eq!(broken.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn stale_leader_cannot_save() {
        let kv: Arc<dyn KvStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let election = Election::new(kv.clone());
        let stale = election.campaign("replica-a").await.unwrap();
        let current = election.campaign("replica-a").await.unwrap();

        let node = Node::new(vec![], public_key(5));
        let err = node_save(&stale, &nodes(), &node).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        let err = node_load(&current, &nodes(), &node.id()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn save_load_list_and_create() {
        let kv: Arc<dyn KvStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let leadership = Election::new(kv).campaign("replica-a").await.unwrap();

        let mut a = Node::new(vec![1], public_key(6));
        node_save(&leadership, &nodes(), &a).await.unwrap();
        assert_eq!(node_load(&leadership, &nodes(), &a.id()).await.unwrap(), a);

        a.set_state(NodeState::Up);
        let (stored, created) = node_create(&leadership, &nodes(), &a).await.unwrap();
        assert!(!created);
        assert_eq!(stored.state(), NodeState::New);

        let b = Node::new(vec![2], public_key(7));
        let (_, created) = node_create(&leadership, &nodes(), &b).await.unwrap();
        assert!(created);

        let listed = node_list(&leadership, &nodes()).await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn invalid_id_is_invalid_argument() {
        let kv: Arc<dyn KvStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let leadership = Election::new(kv).campaign("replica-a").await.unwrap();
        let err = node_load(&leadership, &nodes(), "../leader").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
