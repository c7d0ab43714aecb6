//! Consensus group membership.
//!
//! [`ClusterAdmin`] is the slice of the consensus store's administrative API
//! the control plane consumes. [`LocalCluster`] implements it on top of the
//! transactional KV store for single-binary deployments and tests.
//!
//! Layout:
//!
//! ```text
//! /members/{id:016x}     Member (JSON)
//! /peer-urls/{hex(url)}  owning member id, one per advertised URL
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tessera_state::{Compare, KeyNamespace, KvStore, Op, TxnRequest};
use tracing::{debug, info};

use crate::error::{ConsensusError, ConsensusResult};

/// Attempts at committing a membership change before giving up.
const MAX_ATTEMPTS: usize = 8;

/// One member of the consensus group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    /// Empty until a learner starts and reports its name.
    pub name: String,
    pub peer_urls: Vec<String>,
    pub is_learner: bool,
}

/// Administrative operations on the consensus group.
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// Every current member, learners included.
    async fn member_list(&self) -> ConsensusResult<Vec<Member>>;

    /// Add a non-voting member advertising `peer_urls`.
    ///
    /// Fails with [`ConsensusError::PeerUrlExists`] if any member already
    /// advertises one of the URLs.
    async fn member_add_as_learner(&self, peer_urls: Vec<String>) -> ConsensusResult<Member>;
}

/// A membership table kept in the KV store.
#[derive(Clone)]
pub struct LocalCluster {
    kv: Arc<dyn KvStore>,
    members: KeyNamespace,
    peer_urls: KeyNamespace,
}

impl LocalCluster {
    pub fn new(kv: Arc<dyn KvStore>) -> ConsensusResult<Self> {
        Ok(Self {
            kv,
            members: KeyNamespace::new("/members/")?,
            peer_urls: KeyNamespace::new("/peer-urls/")?,
        })
    }

    /// Add a voting member. Used when bootstrapping a cluster.
    pub async fn add_member(&self, name: &str, peer_urls: Vec<String>) -> ConsensusResult<Member> {
        self.insert(name, peer_urls, false).await
    }

    /// Record the name a learner reported when it started.
    pub async fn set_member_name(&self, id: u64, name: &str) -> ConsensusResult<Member> {
        self.update(id, |m| m.name = name.to_string()).await
    }

    /// Turn a learner into a voting member.
    pub async fn promote_member(&self, id: u64) -> ConsensusResult<Member> {
        self.update(id, |m| m.is_learner = false).await
    }

    fn member_key(&self, id: u64) -> ConsensusResult<String> {
        Ok(self.members.key(&format!("{id:016x}"))?)
    }

    fn url_key(&self, url: &str) -> ConsensusResult<String> {
        Ok(self.peer_urls.key(&hex::encode(url))?)
    }

    async fn insert(
        &self,
        name: &str,
        peer_urls: Vec<String>,
        is_learner: bool,
    ) -> ConsensusResult<Member> {
        let Some(first) = peer_urls.first() else {
            return Err(ConsensusError::InvalidArgument(
                "a member needs at least one peer URL".to_string(),
            ));
        };
        let seed = deterministic_hash(first);

        for attempt in 0..MAX_ATTEMPTS {
            let existing = self.member_list().await?;
            if let Some(url) = peer_urls
                .iter()
                .find(|url| existing.iter().any(|m| m.peer_urls.contains(url)))
            {
                return Err(ConsensusError::PeerUrlExists(url.clone()));
            }

            // Linear probing on collision.
            let mut id = seed;
            while existing.iter().any(|m| m.id == id) {
                id = id.wrapping_add(1).max(1);
            }

            let member = Member {
                id,
                name: name.to_string(),
                peer_urls: peer_urls.clone(),
                is_learner,
            };
            let key = self.member_key(id)?;
            let mut txn = TxnRequest::new(vec![Op::put(&key, encode(&member)?)])
                .when(Compare::absent(&key));
            for url in &peer_urls {
                let url_key = self.url_key(url)?;
                txn.success.push(Op::put(&url_key, id.to_be_bytes().to_vec()));
                txn = txn.when(Compare::absent(url_key));
            }

            if self.kv.txn(txn).await?.succeeded {
                info!(id, %name, urls = ?member.peer_urls, is_learner, "member added");
                return Ok(member);
            }
            debug!(id, attempt, "membership changed concurrently, retrying add");
        }
        Err(ConsensusError::Conflict(seed))
    }

    async fn update(&self, id: u64, change: impl Fn(&mut Member)) -> ConsensusResult<Member> {
        let key = self.member_key(id)?;
        for attempt in 0..MAX_ATTEMPTS {
            let resp = self.kv.txn(TxnRequest::new(vec![Op::get(&key)])).await?;
            let raw = resp
                .value(0)
                .ok_or(ConsensusError::MemberNotFound(id))?
                .to_vec();
            let mut member: Member = decode(&key, &raw)?;
            change(&mut member);

            let txn = TxnRequest::new(vec![Op::put(&key, encode(&member)?)])
                .when(Compare::value_equals(&key, raw));
            if self.kv.txn(txn).await?.succeeded {
                info!(id, name = %member.name, is_learner = member.is_learner, "member updated");
                return Ok(member);
            }
            debug!(id, attempt, "member changed concurrently, retrying update");
        }
        Err(ConsensusError::Conflict(id))
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("members", &self.members.prefix())
            .finish()
    }
}

#[async_trait]
impl ClusterAdmin for LocalCluster {
    async fn member_list(&self) -> ConsensusResult<Vec<Member>> {
        let resp = self
            .kv
            .txn(TxnRequest::new(vec![Op::range(self.members.prefix())]))
            .await?;
        resp.kvs(0)
            .iter()
            .filter(|kv| self.members.id_from_key(&kv.key).is_some())
            .map(|kv| decode(&kv.key, &kv.value))
            .collect()
    }

    async fn member_add_as_learner(&self, peer_urls: Vec<String>) -> ConsensusResult<Member> {
        self.insert("", peer_urls, true).await
    }
}

/// FNV-1a, never zero.
fn deterministic_hash(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash.max(1)
}

fn encode(member: &Member) -> ConsensusResult<Vec<u8>> {
    serde_json::to_vec(member).map_err(|e| ConsensusError::Encode(e.to_string()))
}

fn decode(key: &str, raw: &[u8]) -> ConsensusResult<Member> {
    serde_json::from_slice(raw).map_err(|e| ConsensusError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
