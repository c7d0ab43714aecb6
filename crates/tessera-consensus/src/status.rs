//! Consensus status and node admission.
//!
//! A [`Status`] is a snapshot of the local consensus service: whether it is
//! running, and clients into the parts of the store other components use.
//! [`Status::add_node`] admits a new member into the consensus group.
//!
//! Before a learner is added for a peer URL, the node claims the URL with a
//! put-if-absent record next to its certificate:
//!
//! ```text
//! /{pki namespace}/claims/{hex(url)}   node id of the claimant
//! ```
//!
//! Learners carry no name until they start, so the claim is what tells a
//! retry of the same node apart from a different node on the same address.

use std::fmt;
use std::net::Ipv6Addr;
use std::sync::Arc;

use tessera_pki::{
    Backoff, Certificate, CertificateBackend, Crl, Namespace, ParsedCertificate, RcgenBackend,
};
use tessera_state::{Compare, KeyNamespace, KvStore, Namespaced, Op, TxnRequest};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterAdmin, Member};
use crate::error::{ConsensusError, ConsensusResult};
use crate::identity::{node_id, parse_public_key};

/// Port consensus peers listen on unless told otherwise.
pub const DEFAULT_CONSENSUS_PORT: u16 = 7834;

/// Name of the certificate namespace holding consensus peer credentials.
pub const DEFAULT_PKI_NAMESPACE: &str = "consensus-pki";

const CA_NAME: &str = "ca";
const CA_COMMON_NAME: &str = "Tessera Consensus CA";

/// Overrides for how a new member is reachable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddNodeOptions {
    /// Host the new member advertises instead of its node ID. Also added
    /// to its certificate.
    pub external_address: Option<String>,
    pub external_port: Option<u16>,
}

/// An existing voting peer of the consensus group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingNode {
    pub name: String,
    pub url: String,
}

/// Credentials and peers a new member needs to join the consensus group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCluster {
    pub ca_certificate: ParsedCertificate,
    pub node_certificate: ParsedCertificate,
    pub existing_nodes: Vec<ExistingNode>,
    pub initial_crl: Crl,
}

/// How the node's peer URL relates to the current membership.
#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Absent,
    AlreadyAdded,
    HeldBy(String),
}

/// `claimant` is the node that claimed `url`, if any.
fn classify(members: &[Member], node_id: &str, url: &str, claimant: Option<&str>) -> Admission {
    if members.iter().any(|m| m.name == node_id) {
        return Admission::AlreadyAdded;
    }
    match members.iter().find(|m| m.peer_urls.iter().any(|u| u == url)) {
        None => Admission::Absent,
        Some(m) if !m.name.is_empty() => Admission::HeldBy(m.name.clone()),
        // An unstarted learner: whoever claimed the URL added it.
        Some(m) => match claimant {
            Some(c) if c == node_id => Admission::AlreadyAdded,
            Some(c) => Admission::HeldBy(c.to_string()),
            None => Admission::HeldBy(format!("{:016x}", m.id)),
        },
    }
}

/// `https://host:port`, bracketing IPv6 literals.
pub fn peer_url(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("https://[{host}]:{port}")
    } else {
        format!("https://{host}:{port}")
    }
}

/// A snapshot of the consensus service.
#[derive(Clone)]
pub struct Status {
    running: bool,
    kv: Arc<dyn KvStore>,
    cluster: Arc<dyn ClusterAdmin>,
    ca: Arc<Certificate>,
    claims: KeyNamespace,
    crl_backoff: Backoff,
}

impl Status {
    /// A status over the given store and membership API, using the default
    /// certificate namespace and backend.
    pub fn new(kv: Arc<dyn KvStore>, cluster: Arc<dyn ClusterAdmin>) -> ConsensusResult<Self> {
        let namespace = Namespace::with_backend(DEFAULT_PKI_NAMESPACE, Arc::new(RcgenBackend))
            .map_err(ConsensusError::pki("create certificate namespace"))?;
        Ok(Self {
            running: false,
            kv,
            cluster,
            claims: claims_namespace(DEFAULT_PKI_NAMESPACE)?,
            ca: Arc::new(Certificate::new_ca(namespace, CA_NAME, CA_COMMON_NAME)),
            crl_backoff: Backoff::default(),
        })
    }

    pub fn with_running(mut self, running: bool) -> Self {
        self.running = running;
        self
    }

    /// Issue certificates from `namespace` with `backend`.
    pub fn with_pki(
        mut self,
        namespace: &str,
        backend: Arc<dyn CertificateBackend>,
    ) -> ConsensusResult<Self> {
        self.claims = claims_namespace(namespace)?;
        let namespace = Namespace::with_backend(namespace, backend)
            .map_err(ConsensusError::pki("create certificate namespace"))?;
        self.ca = Arc::new(Certificate::new_ca(namespace, CA_NAME, CA_COMMON_NAME));
        Ok(self)
    }

    pub fn with_crl_backoff(mut self, backoff: Backoff) -> Self {
        self.crl_backoff = backoff;
        self
    }

    pub fn running(&self) -> bool {
        self.running
    }

    /// The consensus CA descriptor.
    pub fn ca(&self) -> Arc<Certificate> {
        self.ca.clone()
    }

    /// Store view for certificate records.
    pub fn pki_client(&self) -> ConsensusResult<Arc<dyn KvStore>> {
        self.client("/pki")
    }

    /// Store view for control-plane records.
    pub fn curator_client(&self) -> ConsensusResult<Arc<dyn KvStore>> {
        self.client("/curator")
    }

    pub fn cluster_client(&self) -> Arc<dyn ClusterAdmin> {
        self.cluster.clone()
    }

    fn client(&self, prefix: &str) -> ConsensusResult<Arc<dyn KvStore>> {
        if !self.running {
            return Err(ConsensusError::NotRunning);
        }
        Ok(Arc::new(Namespaced::new(self.kv.clone(), prefix)?))
    }

    /// Admit the node owning `public_key` into the consensus group as a
    /// learner and return everything it needs to join.
    ///
    /// Safe to retry: certificates are issued idempotently, and a node that
    /// is already a member is not added again.
    pub async fn add_node(
        &self,
        public_key: &[u8],
        options: &AddNodeOptions,
    ) -> ConsensusResult<JoinCluster> {
        parse_public_key(public_key)?;
        let pki = self.pki_client()?;

        let id = node_id(public_key);
        let host = options.external_address.clone().unwrap_or_else(|| id.clone());
        let port = options.external_port.unwrap_or(DEFAULT_CONSENSUS_PORT);
        let extra_names = options.external_address.iter().cloned().collect();

        let member = Certificate::new_peer(self.ca.clone(), &id, public_key, extra_names);
        let ca_der = self
            .ca
            .ensure(pki.as_ref())
            .await
            .map_err(ConsensusError::pki("ensure CA certificate"))?;
        let member_der = member
            .ensure(pki.as_ref())
            .await
            .map_err(ConsensusError::pki("ensure member certificate"))?;
        let ca_certificate = parse_stored(&ca_der, "CA certificate")?;
        let node_certificate = parse_stored(&member_der, "member certificate")?;

        let members = self.cluster.member_list().await?;
        let existing_nodes = members
            .iter()
            .filter(|m| !m.is_learner)
            .filter_map(|m| {
                m.peer_urls.first().map(|url| ExistingNode {
                    name: m.name.clone(),
                    url: url.clone(),
                })
            })
            .collect();

        let mut crl_watcher = self
            .ca
            .watch_crl(pki.clone())
            .map_err(ConsensusError::pki("watch CRL"))?
            .with_backoff(self.crl_backoff);
        let initial_crl = crl_watcher
            .get()
            .await
            .map_err(ConsensusError::pki("retrieve initial CRL"))?;

        let url = peer_url(&host, port);
        let claimant = self.claimant(pki.as_ref(), &url).await?;
        match classify(&members, &id, &url, claimant.as_deref()) {
            Admission::AlreadyAdded => {
                debug!(node_id = %id, %url, "node already a member, skipping learner add");
            }
            Admission::HeldBy(holder) => {
                warn!(node_id = %id, %url, %holder, "peer URL held by another member");
                return Err(ConsensusError::RaceLost { url, holder });
            }
            Admission::Absent => {
                self.claim(pki.as_ref(), &url, &id).await?;
                self.add_learner(pki.as_ref(), &id, &url).await?;
            }
        }

        Ok(JoinCluster {
            ca_certificate,
            node_certificate,
            existing_nodes,
            initial_crl,
        })
    }

    /// Node id that claimed `url`, if any.
    async fn claimant(&self, pki: &dyn KvStore, url: &str) -> ConsensusResult<Option<String>> {
        let key = self.claims.key(&hex::encode(url))?;
        let resp = pki.txn(TxnRequest::new(vec![Op::get(&key)])).await?;
        Ok(resp.value(0).map(|raw| String::from_utf8_lossy(raw).into_owned()))
    }

    /// Claim `url` for `id`. Claims are never released or overwritten.
    async fn claim(&self, pki: &dyn KvStore, url: &str, id: &str) -> ConsensusResult<()> {
        let key = self.claims.key(&hex::encode(url))?;
        let resp = pki
            .txn(
                TxnRequest::new(vec![Op::put(&key, id.as_bytes().to_vec())])
                    .when(Compare::absent(&key))
                    .otherwise(vec![Op::get(&key)]),
            )
            .await?;
        if resp.succeeded {
            debug!(node_id = %id, %url, "peer URL claimed");
            return Ok(());
        }

        let holder = resp
            .value(0)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default();
        if holder == id {
            return Ok(());
        }
        warn!(node_id = %id, %url, %holder, "peer URL claimed by another node");
        Err(ConsensusError::RaceLost {
            url: url.to_string(),
            holder,
        })
    }

    async fn add_learner(&self, pki: &dyn KvStore, id: &str, url: &str) -> ConsensusResult<()> {
        match self.cluster.member_add_as_learner(vec![url.to_string()]).await {
            Ok(member) => {
                info!(node_id = %id, %url, member = member.id, "added node as learner");
                Ok(())
            }
            Err(ConsensusError::PeerUrlExists(taken)) => {
                // Someone added this URL between our list and our add.
                let members = self.cluster.member_list().await?;
                let claimant = self.claimant(pki, url).await?;
                match classify(&members, id, url, claimant.as_deref()) {
                    Admission::AlreadyAdded => {
                        debug!(node_id = %id, %url, "concurrent add of the same node");
                        Ok(())
                    }
                    Admission::HeldBy(holder) => {
                        warn!(node_id = %id, %url, %holder, "lost race for peer URL");
                        Err(ConsensusError::RaceLost {
                            url: url.to_string(),
                            holder,
                        })
                    }
                    Admission::Absent => Err(ConsensusError::PeerUrlExists(taken)),
                }
            }
            Err(e) => Err(e),
        }
    }
}

fn claims_namespace(pki_namespace: &str) -> ConsensusResult<KeyNamespace> {
    Ok(KeyNamespace::new(format!("/{pki_namespace}/claims/"))?)
}

fn parse_stored(der: &[u8], what: &str) -> ConsensusResult<ParsedCertificate> {
    ParsedCertificate::from_der(der).map_err(|e| ConsensusError::Corrupt {
        key: what.to_string(),
        reason: e.to_string(),
    })
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("running", &self.running)
            .field("ca", &self.ca.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use tessera_state::StateStore;
    use tokio::sync::Mutex;

    use super::*;
    use crate::cluster::LocalCluster;

    fn public_key(seed: u8) -> Vec<u8> {
        SigningKey::from_bytes(&[seed; 32])
            .verifying_key()
            .to_bytes()
            .to_vec()
    }

    fn fast() -> Backoff {
        Backoff {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
        }
    }

    fn running_status() -> (Status, LocalCluster) {
        let kv: Arc<dyn KvStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let cluster = LocalCluster::new(kv.clone()).unwrap();
        let status = Status::new(kv, Arc::new(cluster.clone()))
            .unwrap()
            .with_running(true)
            .with_crl_backoff(fast());
        (status, cluster)
    }

    #[test]
    fn peer_url_brackets_ipv6() {
        assert_eq!(peer_url("node-1", 7834), "https://node-1:7834");
        assert_eq!(peer_url("10.0.0.1", 1), "https://10.0.0.1:1");
        assert_eq!(peer_url("fd00::1", 7834), "https://[fd00::1]:7834");
    }

    #[test]
    fn classification() {
        let member = |name: &str, url: &str| Member {
            id: 1,
            name: name.to_string(),
            peer_urls: vec![url.to_string()],
            is_learner: true,
        };
        let url = "https://node-a:7834";

        assert_eq!(classify(&[], "node-a", url, None), Admission::Absent);
        assert_eq!(
            classify(&[member("node-a", "https://elsewhere:1")], "node-a", url, None),
            Admission::AlreadyAdded
        );
        assert_eq!(
            classify(&[member("", url)], "node-a", url, Some("node-a")),
            Admission::AlreadyAdded
        );
        assert_eq!(
            classify(&[member("", url)], "node-a", url, Some("node-b")),
            Admission::HeldBy("node-b".to_string())
        );
        assert_eq!(
            classify(&[member("", url)], "node-a", url, None),
            Admission::HeldBy("0000000000000001".to_string())
        );
        assert_eq!(
            classify(&[member("node-b", url)], "node-a", url, Some("node-a")),
            Admission::HeldBy("node-b".to_string())
        );
    }

    #[tokio::test]
    async fn add_node_is_retry_safe() {
        let (status, cluster) = running_status();
        let pk = public_key(1);

        let first = status.add_node(&pk, &AddNodeOptions::default()).await.unwrap();
        assert_eq!(cluster.member_list().await.unwrap().len(), 1);

        let second = status.add_node(&pk, &AddNodeOptions::default()).await.unwrap();
        assert_eq!(first.node_certificate, second.node_certificate);
        assert_eq!(first.ca_certificate, second.ca_certificate);

        let members = cluster.member_list().await.unwrap();
        assert_eq!(members.len(), 1);
        assert!(members[0].is_learner);
        assert_eq!(
            members[0].peer_urls,
            vec![format!("https://{}:7834", node_id(&pk))]
        );
    }

    #[tokio::test]
    async fn existing_nodes_exclude_learners() {
        let (status, cluster) = running_status();
        cluster
            .add_member("node-voter", vec!["https://voter:7834".to_string()])
            .await
            .unwrap();
        cluster
            .member_add_as_learner(vec!["https://learner:7834".to_string()])
            .await
            .unwrap();

        let join = status
            .add_node(&public_key(2), &AddNodeOptions::default())
            .await
            .unwrap();
        assert_eq!(
            join.existing_nodes,
            vec![ExistingNode {
                name: "node-voter".to_string(),
                url: "https://voter:7834".to_string(),
            }]
        );
        assert!(join.initial_crl.revoked_serials().is_empty());
        assert!(join.ca_certificate.is_ca());
    }

    #[tokio::test]
    async fn external_address_goes_into_san_and_url() {
        let (status, cluster) = running_status();
        let options = AddNodeOptions {
            external_address: Some("192.0.2.10".to_string()),
            external_port: Some(2380),
        };

        let join = status.add_node(&public_key(3), &options).await.unwrap();
        assert_eq!(
            join.node_certificate.ip_addresses(),
            &["192.0.2.10".parse::<std::net::IpAddr>().unwrap()]
        );
        assert_eq!(join.node_certificate.common_name(), node_id(&public_key(3)));

        let members = cluster.member_list().await.unwrap();
        assert_eq!(members[0].peer_urls, vec!["https://192.0.2.10:2380"]);
    }

    #[tokio::test]
    async fn node_certificate_is_bound_to_node_key() {
        let (status, _cluster) = running_status();
        let pk = public_key(6);

        let join = status.add_node(&pk, &AddNodeOptions::default()).await.unwrap();
        assert_eq!(join.node_certificate.public_key(), pk.as_slice());
        assert_ne!(join.ca_certificate.public_key(), pk.as_slice());
    }

    #[tokio::test]
    async fn second_node_on_claimed_address_is_race_lost() {
        let (status, cluster) = running_status();
        let options = AddNodeOptions {
            external_address: Some("10.9.9.9".to_string()),
            external_port: None,
        };

        status.add_node(&public_key(7), &options).await.unwrap();
        let err = status.add_node(&public_key(8), &options).await.unwrap_err();
        assert!(matches!(
            err,
            ConsensusError::RaceLost { ref holder, .. } if *holder == node_id(&public_key(7))
        ));
        assert_eq!(cluster.member_list().await.unwrap().len(), 1);

        // The first node can still retry.
        status.add_node(&public_key(7), &options).await.unwrap();
        assert_eq!(cluster.member_list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn url_held_by_other_member_is_race_lost() {
        let (status, cluster) = running_status();
        let options = AddNodeOptions {
            external_address: Some("shared.example".to_string()),
            external_port: None,
        };
        cluster
            .add_member("node-other", vec!["https://shared.example:7834".to_string()])
            .await
            .unwrap();

        let err = status.add_node(&public_key(4), &options).await.unwrap_err();
        assert!(
            matches!(err, ConsensusError::RaceLost { ref holder, .. } if holder == "node-other")
        );
        assert_eq!(cluster.member_list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_key_touches_nothing() {
        let (status, cluster) = running_status();
        let err = status
            .add_node(&[1, 2, 3], &AddNodeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidPublicKey(_)));
        assert!(cluster.member_list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stopped_service_refuses_clients() {
        let (status, _cluster) = running_status();
        let status = status.with_running(false);
        assert!(matches!(status.pki_client(), Err(ConsensusError::NotRunning)));
        assert!(matches!(status.curator_client(), Err(ConsensusError::NotRunning)));
    }

    /// Lets a racing add slip in between the list and the add.
    struct RacingCluster {
        inner: LocalCluster,
        racer_name: String,
        raced: Mutex<bool>,
    }

    #[async_trait]
    impl ClusterAdmin for RacingCluster {
        async fn member_list(&self) -> ConsensusResult<Vec<Member>> {
            self.inner.member_list().await
        }

        async fn member_add_as_learner(&self, peer_urls: Vec<String>) -> ConsensusResult<Member> {
            let mut raced = self.raced.lock().await;
            if !*raced {
                *raced = true;
                let m = self.inner.member_add_as_learner(peer_urls.clone()).await?;
                if !self.racer_name.is_empty() {
                    self.inner.set_member_name(m.id, &self.racer_name).await?;
                }
            }
            self.inner.member_add_as_learner(peer_urls).await
        }
    }

    async fn race(racer_name: &str) -> (ConsensusResult<JoinCluster>, LocalCluster) {
        let kv: Arc<dyn KvStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let inner = LocalCluster::new(kv.clone()).unwrap();
        let racing = RacingCluster {
            inner: inner.clone(),
            racer_name: racer_name.to_string(),
            raced: Mutex::new(false),
        };
        let status = Status::new(kv, Arc::new(racing))
            .unwrap()
            .with_running(true)
            .with_crl_backoff(fast());
        let result = status.add_node(&public_key(5), &AddNodeOptions::default()).await;
        (result, inner)
    }

    #[tokio::test]
    async fn concurrent_identical_add_is_benign() {
        let (result, cluster) = race("").await;
        result.unwrap();
        assert_eq!(cluster.member_list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_add_by_other_node_is_race_lost() {
        let (result, _cluster) = race("node-impostor").await;
        assert!(matches!(
            result.unwrap_err(),
            ConsensusError::RaceLost { holder, .. } if holder == "node-impostor"
        ));
    }
}
