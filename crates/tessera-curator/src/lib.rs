//! tessera-curator: the cluster control plane's node registry.
//!
//! Owns node records and their roles, and drives node admission into the
//! consensus group. All writes go through a [`Leadership`] gate so that only
//! the current leader can change cluster state.
//!
//! # Architecture
//!
//! ```text
//! Curator (leader only)
//!   ├── register / approve / decommission → node lifecycle
//!   ├── join_consensus → Status::add_node → ConsensusMember role
//!   ├── enable_worker → Worker role
//!   └── node_load / node_save
//!       └── Leadership::txn_as_leader → /curator/nodes/{id}
//! ```

pub mod curator;
pub mod error;
pub mod leadership;
pub mod node;

pub use curator::{Curator, DEFAULT_NODE_PREFIX};
pub use error::{CuratorError, CuratorResult, ErrorKind, with_deadline};
pub use leadership::{Election, Leadership};
pub use node::{
    ConsensusMemberRole, ConsensusPeer, ConsensusSummary, Node, NodeState, NodeStatus,
    NodeSummary, WorkerRole, node_create, node_list, node_load, node_save, node_unmarshal,
};
