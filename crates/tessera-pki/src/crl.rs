//! Stored CRLs and the polling watcher over them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_state::KvStore;
use tracing::debug;

use crate::backend::RevokedEntry;
use crate::certificate::{parse_crl, read_record};
use crate::error::PkiResult;
use crate::parse::Crl;

/// A CRL as persisted next to its authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrlRecord {
    /// Monotonic CRL number; 0 is the empty CRL written with the CA.
    pub number: u64,
    /// Signed DER encoding of the CRL.
    pub der: Vec<u8>,
    pub revoked: Vec<RevokedEntry>,
}

/// Exponential backoff between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
        }
    }
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Observes successive versions of an authority's CRL.
///
/// The first [`CrlWatcher::get`] returns the current CRL immediately; each
/// later call waits until a CRL with a higher number has been stored.
pub struct CrlWatcher {
    kv: Arc<dyn KvStore>,
    key: String,
    last: Option<u64>,
    backoff: Backoff,
}

impl CrlWatcher {
    pub(crate) fn new(kv: Arc<dyn KvStore>, key: String) -> Self {
        Self {
            kv,
            key,
            last: None,
            backoff: Backoff::default(),
        }
    }

    /// Override the polling backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Number of the CRL most recently returned by `get`.
    pub fn last_number(&self) -> Option<u64> {
        self.last
    }

    /// Return the next CRL version. Cancel-safe: dropping the future
    /// leaves the watcher where it was.
    pub async fn get(&mut self) -> PkiResult<Crl> {
        let mut delay = self.backoff.initial;
        loop {
            if let Some(record) = read_record::<CrlRecord>(self.kv.as_ref(), &self.key).await? {
                let newer = self.last.is_none_or(|last| record.number > last);
                if newer {
                    let crl = parse_crl(&self.key, &record.der)?;
                    self.last = Some(record.number);
                    debug!(key = %self.key, number = record.number, "CRL update observed");
                    return Ok(crl);
                }
            }
            tokio::time::sleep(delay).await;
            delay = self.backoff.next(delay);
        }
    }
}

impl fmt::Debug for CrlWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrlWatcher")
            .field("key", &self.key)
            .field("last", &self.last)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tessera_state::StateStore;

    use super::*;
    use crate::certificate::{Certificate, Namespace};

    fn fast() -> Backoff {
        Backoff {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
        }
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let b = Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(30),
        };
        assert_eq!(b.next(Duration::from_millis(10)), Duration::from_millis(20));
        assert_eq!(b.next(Duration::from_millis(20)), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn first_get_returns_initial_empty_crl() {
        let store: Arc<dyn KvStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let ca = Certificate::new_ca(Namespace::new("pki").unwrap(), "ca", "Test CA");
        ca.ensure(store.as_ref()).await.unwrap();

        let mut watcher = ca.watch_crl(store.clone()).unwrap().with_backoff(fast());
        let crl = watcher.get().await.unwrap();
        assert!(crl.revoked_serials().is_empty());
        assert_eq!(watcher.last_number(), Some(0));
    }

    #[tokio::test]
    async fn revocation_is_observed_by_watcher() {
        let store: Arc<dyn KvStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let ca = Arc::new(Certificate::new_ca(
            Namespace::new("pki").unwrap(),
            "ca",
            "Test CA",
        ));
        let peer = Certificate::new_peer(ca.clone(), "node-1", &[3; 32], vec![]);
        let issued = peer.ensure_record(store.as_ref()).await.unwrap();

        let mut watcher = ca.watch_crl(store.clone()).unwrap().with_backoff(fast());
        watcher.get().await.unwrap();

        let revoker = {
            let store = store.clone();
            let ca = ca.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ca.revoke(store.as_ref(), "node-1").await.unwrap();
            })
        };

        let next = tokio::time::timeout(Duration::from_secs(5), watcher.get())
            .await
            .expect("watcher should observe the revocation")
            .unwrap();
        assert!(next.is_revoked(&issued.serial));
        assert_eq!(watcher.last_number(), Some(1));
        revoker.await.unwrap();
    }
}
