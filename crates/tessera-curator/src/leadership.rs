//! Leader election and the leadership transaction gate.
//!
//! The leader record (`{holder, term}`) and its lease live in the curator's
//! store view. Every mutation a [`Leadership`] performs is a transaction
//! that compares the leader record against the exact bytes written when
//! leadership was won; if anyone has since replaced it, nothing applies.
//!
//! Terms come from a counter that outlives resignation, so a leader record
//! is never written twice with the same bytes.
//!
//! Lease expiry is evaluated lazily by the next campaigner. A leader whose
//! lease lapsed keeps writing until someone else campaigns.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tessera_state::{Compare, KvStore, Op, TxnRequest, TxnResponse};
use tracing::{debug, info, warn};

use crate::error::{CuratorError, CuratorResult};

const LEADER_KEY: &str = "/leader";
const LEASE_KEY: &str = "/leader-lease";
/// Last term handed out. Never deleted.
const TERM_KEY: &str = "/leader-term";
const MAX_CAMPAIGN_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaderRecord {
    holder: String,
    term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    expires_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TermRecord {
    term: u64,
}

/// Campaigns for leadership over a store.
#[derive(Clone)]
pub struct Election {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl Election {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            ttl: Duration::from_secs(15),
        }
    }

    /// Set the lease duration.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Try to become leader as `holder`.
    ///
    /// Succeeds if nobody leads, the current lease has expired, or `holder`
    /// already leads. Winning always starts a new term, so leadership
    /// values from earlier terms stop working.
    pub async fn campaign(&self, holder: &str) -> CuratorResult<Leadership> {
        if holder.is_empty() {
            return Err(CuratorError::InvalidArgument(
                "leadership holder must not be empty".to_string(),
            ));
        }

        let mut last_holder = String::new();
        for attempt in 0..MAX_CAMPAIGN_ATTEMPTS {
            let resp = self
                .kv
                .txn(TxnRequest::new(vec![
                    Op::get(LEADER_KEY),
                    Op::get(LEASE_KEY),
                    Op::get(TERM_KEY),
                ]))
                .await?;
            let current_raw = resp.value(0).map(<[u8]>::to_vec);
            let lease_raw = resp.value(1).map(<[u8]>::to_vec);
            let term_raw = resp.value(2).map(<[u8]>::to_vec);

            let mut last_term = match &term_raw {
                Some(raw) => decode::<TermRecord>(TERM_KEY, raw)?.term,
                None => 0,
            };
            if let Some(raw) = &current_raw {
                let current: LeaderRecord = decode(LEADER_KEY, raw)?;
                let expired = match &lease_raw {
                    Some(raw) => decode::<LeaseRecord>(LEASE_KEY, raw)?.expires_at_ms <= now_ms(),
                    None => true,
                };
                if current.holder != holder && !expired {
                    return Err(CuratorError::LeadershipHeld {
                        holder: current.holder,
                    });
                }
                last_holder = current.holder;
                last_term = last_term.max(current.term);
            }
            let term = last_term + 1;

            let record = encode(&LeaderRecord {
                holder: holder.to_string(),
                term,
            })?;
            let lease = encode(&self.lease())?;
            let counter = encode(&TermRecord { term })?;
            let txn = TxnRequest::new(vec![
                Op::put(LEADER_KEY, record.clone()),
                Op::put(LEASE_KEY, lease),
                Op::put(TERM_KEY, counter),
            ])
            .when(guard(LEADER_KEY, current_raw))
            .when(guard(LEASE_KEY, lease_raw))
            .when(guard(TERM_KEY, term_raw));

            if self.kv.txn(txn).await?.succeeded {
                info!(%holder, term, "leadership acquired");
                return Ok(Leadership {
                    kv: self.kv.clone(),
                    holder: holder.to_string(),
                    term,
                    record,
                    ttl: self.ttl,
                });
            }
            debug!(%holder, attempt, "leader record changed during campaign, retrying");
        }
        Err(CuratorError::LeadershipHeld {
            holder: last_holder,
        })
    }

    fn lease(&self) -> LeaseRecord {
        LeaseRecord {
            expires_at_ms: now_ms().saturating_add(self.ttl.as_millis() as u64),
        }
    }
}

impl std::fmt::Debug for Election {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Election").field("ttl", &self.ttl).finish()
    }
}

/// Proof of having won a campaign, and the only way to write curator state.
#[derive(Clone)]
pub struct Leadership {
    kv: Arc<dyn KvStore>,
    holder: String,
    term: u64,
    /// Leader record bytes exactly as written by the campaign.
    record: Vec<u8>,
    ttl: Duration,
}

impl Leadership {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Run `ops` atomically, only if this leadership is still current.
    ///
    /// Fails with `LostLeadership` and applies nothing otherwise. A store
    /// error does not prove that nothing was applied; re-read before
    /// retrying.
    pub async fn txn_as_leader(&self, ops: Vec<Op>) -> CuratorResult<TxnResponse> {
        let resp = self
            .kv
            .txn(TxnRequest::new(ops).when(Compare::value_equals(LEADER_KEY, self.record.clone())))
            .await?;
        if !resp.succeeded {
            warn!(holder = %self.holder, term = self.term, "transaction rejected, leadership lost");
            return Err(CuratorError::LostLeadership);
        }
        Ok(resp)
    }

    /// Run a conditional transaction, only if this leadership is still
    /// current.
    ///
    /// The returned response reports whether the request's own compares
    /// held. A lost leadership is an error, never a failed response.
    ///
    /// The failure branch runs whether or not leadership held, so it may
    /// only read.
    pub async fn txn_as_leader_if(&self, mut request: TxnRequest) -> CuratorResult<TxnResponse> {
        if request.failure.iter().any(Op::is_write) {
            return Err(CuratorError::InvalidArgument(
                "failure branch of a leader transaction must not write".to_string(),
            ));
        }
        request = request.when(Compare::value_equals(LEADER_KEY, self.record.clone()));
        request.failure.push(Op::get(LEADER_KEY));

        let mut resp = self.kv.txn(request).await?;
        if resp.succeeded {
            return Ok(resp);
        }

        let last = resp.responses.len().saturating_sub(1);
        if resp.value(last) != Some(self.record.as_slice()) {
            warn!(holder = %self.holder, term = self.term, "transaction rejected, leadership lost");
            return Err(CuratorError::LostLeadership);
        }
        resp.responses.pop();
        Ok(resp)
    }

    /// Extend the lease.
    pub async fn keepalive(&self) -> CuratorResult<()> {
        let lease = LeaseRecord {
            expires_at_ms: now_ms().saturating_add(self.ttl.as_millis() as u64),
        };
        self.txn_as_leader(vec![Op::put(LEASE_KEY, encode(&lease)?)])
            .await?;
        debug!(holder = %self.holder, term = self.term, "leadership lease extended");
        Ok(())
    }

    /// Give up leadership. The term counter is kept.
    pub async fn resign(self) -> CuratorResult<()> {
        self.txn_as_leader(vec![Op::delete(LEADER_KEY), Op::delete(LEASE_KEY)])
            .await?;
        info!(holder = %self.holder, term = self.term, "leadership resigned");
        Ok(())
    }
}

impl std::fmt::Debug for Leadership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leadership")
            .field("holder", &self.holder)
            .field("term", &self.term)
            .finish()
    }
}

fn guard(key: &str, current: Option<Vec<u8>>) -> Compare {
    match current {
        Some(raw) => Compare::value_equals(key, raw),
        None => Compare::absent(key),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn encode<T: Serialize>(value: &T) -> CuratorResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| CuratorError::Encode(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, raw: &[u8]) -> CuratorResult<T> {
    serde_json::from_slice(raw).map_err(|e| CuratorError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
