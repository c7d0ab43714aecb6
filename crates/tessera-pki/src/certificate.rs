//! Certificate descriptors and idempotent issuance.
//!
//! A [`Certificate`] names a certificate inside a [`Namespace`] and says how
//! to produce it. [`Certificate::ensure`] is the only write entry point:
//! the first call generates and stores the certificate, every later call
//! (from this or any other replica) returns the stored bytes.
//!
//! Layout of a namespace `ns` in the store:
//!
//! ```text
//! /{ns}/certs/{name}   IssuedCertificate (JSON)
//! /{ns}/crls/{ca}      CrlRecord (JSON), created with the CA
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tessera_state::{Compare, KeyNamespace, KvStore, Op, TxnRequest};
use tracing::{debug, info};

use crate::backend::{CertificateBackend, IssuedCertificate, RcgenBackend, RevokedEntry};
use crate::crl::{CrlRecord, CrlWatcher};
use crate::error::{PkiError, PkiResult};
use crate::parse::Crl;

/// How many times `revoke` retries a CRL compare-and-swap.
const MAX_CRL_UPDATE_ATTEMPTS: usize = 8;

/// What kind of certificate to generate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    /// A self-signed certificate authority that can also sign CRLs.
    Ca { common_name: String },
    /// A consensus peer certificate for a node, usable as TLS server and
    /// client. The certificate is bound to `public_key`, the node's raw
    /// Ed25519 key; `extra_names` become additional SANs.
    Peer {
        node_id: String,
        public_key: Vec<u8>,
        extra_names: Vec<String>,
    },
}

impl Template {
    pub fn is_ca(&self) -> bool {
        matches!(self, Template::Ca { .. })
    }
}

/// A named certificate space.
#[derive(Clone)]
pub struct Namespace {
    name: String,
    certs: KeyNamespace,
    crls: KeyNamespace,
    backend: Arc<dyn CertificateBackend>,
}

impl Namespace {
    /// A namespace using the rcgen backend.
    pub fn new(name: &str) -> PkiResult<Self> {
        Self::with_backend(name, Arc::new(RcgenBackend))
    }

    /// A namespace using a custom backend.
    pub fn with_backend(name: &str, backend: Arc<dyn CertificateBackend>) -> PkiResult<Self> {
        let root = KeyNamespace::new(format!("/{name}/"))?;
        Ok(Self {
            name: name.to_string(),
            certs: root.child("certs")?,
            crls: root.child("crls")?,
            backend,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn cert_key(&self, name: &str) -> PkiResult<String> {
        Ok(self.certs.key(name)?)
    }

    pub(crate) fn crl_key(&self, ca_name: &str) -> PkiResult<String> {
        Ok(self.crls.key(ca_name)?)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace").field("name", &self.name).finish()
    }
}

/// A certificate descriptor: where it lives, who signs it, what it contains.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub name: String,
    pub namespace: Namespace,
    /// Signing authority; `None` for self-signed certificates.
    pub issuer: Option<Arc<Certificate>>,
    pub template: Template,
}

impl Certificate {
    /// A self-signed certificate authority.
    pub fn new_ca(namespace: Namespace, name: &str, common_name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace,
            issuer: None,
            template: Template::Ca {
                common_name: common_name.to_string(),
            },
        }
    }

    /// A peer certificate for `node_id` over its `public_key`, signed by
    /// `issuer`, stored under the node id in the issuer's namespace.
    pub fn new_peer(
        issuer: Arc<Certificate>,
        node_id: &str,
        public_key: &[u8],
        extra_names: Vec<String>,
    ) -> Self {
        Self {
            name: node_id.to_string(),
            namespace: issuer.namespace.clone(),
            issuer: Some(issuer),
            template: Template::Peer {
                node_id: node_id.to_string(),
                public_key: public_key.to_vec(),
                extra_names,
            },
        }
    }

    fn is_authority(&self) -> bool {
        self.issuer.is_none() && self.template.is_ca()
    }

    /// Return this certificate's DER, issuing it first if it does not
    /// exist yet.
    pub async fn ensure(&self, kv: &dyn KvStore) -> PkiResult<Vec<u8>> {
        Ok(self.ensure_record(kv).await?.cert_der)
    }

    /// Like [`Certificate::ensure`], returning the full stored record.
    pub async fn ensure_record(&self, kv: &dyn KvStore) -> PkiResult<IssuedCertificate> {
        let Some(issuer) = &self.issuer else {
            return self.ensure_self_signed(kv).await;
        };

        let key = self.namespace.cert_key(&self.name)?;
        if let Some(existing) = read_record::<IssuedCertificate>(kv, &key).await? {
            return Ok(existing);
        }
        if !issuer.is_authority() {
            return Err(PkiError::NotAnAuthority(issuer.name.clone()));
        }

        let ca = issuer.ensure_self_signed(kv).await?;
        let issued = self
            .namespace
            .backend
            .signed_by(&self.name, &self.template, &ca)?;
        self.store_if_absent(kv, &key, issued, Vec::new()).await
    }

    /// Load this certificate without issuing it.
    pub async fn load(&self, kv: &dyn KvStore) -> PkiResult<Option<IssuedCertificate>> {
        let key = self.namespace.cert_key(&self.name)?;
        read_record(kv, &key).await
    }

    async fn ensure_self_signed(&self, kv: &dyn KvStore) -> PkiResult<IssuedCertificate> {
        let key = self.namespace.cert_key(&self.name)?;
        if let Some(existing) = read_record::<IssuedCertificate>(kv, &key).await? {
            return Ok(existing);
        }

        let backend = &self.namespace.backend;
        let issued = backend.self_signed(&self.name, &self.template)?;

        // An authority is born with an empty CRL so that watchers always
        // have something to observe.
        let mut extra = Vec::new();
        if self.template.is_ca() {
            let record = CrlRecord {
                number: 0,
                der: backend.sign_crl(&issued, 0, &[])?,
                revoked: Vec::new(),
            };
            extra.push(Op::put(
                self.namespace.crl_key(&self.name)?,
                encode(&record)?,
            ));
        }
        self.store_if_absent(kv, &key, issued, extra).await
    }

    /// Persist `issued` unless someone else got there first, in which case
    /// their record wins and is returned instead.
    async fn store_if_absent(
        &self,
        kv: &dyn KvStore,
        key: &str,
        issued: IssuedCertificate,
        mut extra: Vec<Op>,
    ) -> PkiResult<IssuedCertificate> {
        let mut ops = vec![Op::put(key, encode(&issued)?)];
        ops.append(&mut extra);

        let resp = kv
            .txn(
                TxnRequest::new(ops)
                    .when(Compare::absent(key))
                    .otherwise(vec![Op::get(key)]),
            )
            .await?;

        if resp.succeeded {
            info!(namespace = %self.namespace.name, name = %self.name, "certificate issued");
            return Ok(issued);
        }

        debug!(%key, "certificate issued concurrently, using stored copy");
        let raw = resp.value(0).ok_or_else(|| PkiError::Corrupt {
            key: key.to_string(),
            reason: "record vanished after failed put-if-absent".to_string(),
        })?;
        decode(key, raw)
    }

    /// Watch this authority's CRL.
    pub fn watch_crl(&self, kv: Arc<dyn KvStore>) -> PkiResult<CrlWatcher> {
        if !self.is_authority() {
            return Err(PkiError::NotAnAuthority(self.name.clone()));
        }
        Ok(CrlWatcher::new(kv, self.namespace.crl_key(&self.name)?))
    }

    /// Revoke the certificate `name` issued in this authority's namespace
    /// and return the updated CRL.
    pub async fn revoke(&self, kv: &dyn KvStore, name: &str) -> PkiResult<Crl> {
        if !self.is_authority() {
            return Err(PkiError::NotAnAuthority(self.name.clone()));
        }
        let ca = self.ensure_self_signed(kv).await?;

        let cert_key = self.namespace.cert_key(name)?;
        let target = read_record::<IssuedCertificate>(kv, &cert_key)
            .await?
            .ok_or_else(|| PkiError::NotFound(name.to_string()))?;

        let crl_key = self.namespace.crl_key(&self.name)?;
        for attempt in 0..MAX_CRL_UPDATE_ATTEMPTS {
            let resp = kv.txn(TxnRequest::new(vec![Op::get(&crl_key)])).await?;
            let previous = resp.value(0).map(<[u8]>::to_vec);
            let mut record = match &previous {
                Some(raw) => decode::<CrlRecord>(&crl_key, raw)?,
                None => CrlRecord::default(),
            };

            if record.revoked.iter().any(|e| e.serial == target.serial) {
                return parse_crl(&crl_key, &record.der);
            }

            record.number += 1;
            record.revoked.push(RevokedEntry {
                name: name.to_string(),
                serial: target.serial.clone(),
                revoked_at: unix_now(),
            });
            record.der = self
                .namespace
                .backend
                .sign_crl(&ca, record.number, &record.revoked)?;

            let guard = match previous {
                Some(raw) => Compare::value_equals(&crl_key, raw),
                None => Compare::absent(&crl_key),
            };
            let resp = kv
                .txn(TxnRequest::new(vec![Op::put(&crl_key, encode(&record)?)]).when(guard))
                .await?;
            if resp.succeeded {
                info!(ca = %self.name, %name, number = record.number, "certificate revoked");
                return parse_crl(&crl_key, &record.der);
            }
            debug!(ca = %self.name, attempt, "CRL changed concurrently, retrying revocation");
        }
        Err(PkiError::Conflict(self.name.clone()))
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

pub(crate) fn parse_crl(key: &str, der: &[u8]) -> PkiResult<Crl> {
    Crl::from_der(der).map_err(|e| PkiError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn encode<T: Serialize>(value: &T) -> PkiResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| PkiError::Encode(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, raw: &[u8]) -> PkiResult<T> {
    serde_json::from_slice(raw).map_err(|e| PkiError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) async fn read_record<T: DeserializeOwned>(
    kv: &dyn KvStore,
    key: &str,
) -> PkiResult<Option<T>> {
    let resp = kv.txn(TxnRequest::new(vec![Op::get(key)])).await?;
    resp.value(0).map(|raw| decode(key, raw)).transpose()
}
