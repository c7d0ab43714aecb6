//! Tessera consensus membership.
//!
//! Derives node identities from public keys, tracks consensus group
//! membership through [`ClusterAdmin`], and admits new members with
//! [`Status::add_node`], which issues their peer certificates and adds them
//! as learners. Consumers observe the local consensus service through a
//! [`ServiceHandle`].

pub mod cluster;
pub mod error;
pub mod identity;
pub mod service;
pub mod status;

pub use cluster::{ClusterAdmin, LocalCluster, Member};
pub use error::{ConsensusError, ConsensusResult};
pub use identity::{node_id, parse_public_key};
pub use service::{Service, ServiceHandle, Watcher};
pub use status::{
    AddNodeOptions, DEFAULT_CONSENSUS_PORT, DEFAULT_PKI_NAMESPACE, ExistingNode, JoinCluster,
    Status, peer_url,
};
