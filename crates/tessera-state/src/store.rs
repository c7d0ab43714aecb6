//! StateStore: redb-backed implementation of [`KvStore`].
//!
//! Every transaction runs inside a single redb write transaction, which
//! makes compare evaluation and the chosen branch atomic and serializable
//! with respect to every other transaction on the same database. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, Table};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::kv::{KeyValue, KvStore, Op, OpResponse, TxnRequest, TxnResponse};
use crate::tables::KV;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(KV).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run a transaction synchronously.
    pub fn apply(&self, request: &TxnRequest) -> StateResult<TxnResponse> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (succeeded, responses) = {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;

            let mut succeeded = true;
            for cmp in &request.compare {
                let current = table
                    .get(cmp.key.as_str())
                    .map_err(map_err!(Read))?
                    .map(|guard| guard.value().to_vec());
                if current != cmp.expected {
                    succeeded = false;
                    break;
                }
            }

            let ops = if succeeded {
                &request.success
            } else {
                &request.failure
            };
            let mut responses = Vec::with_capacity(ops.len());
            for op in ops {
                responses.push(execute(&mut table, op)?);
            }
            (succeeded, responses)
        };
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(
            succeeded,
            compares = request.compare.len(),
            ops = responses.len(),
            "transaction applied"
        );
        Ok(TxnResponse {
            succeeded,
            responses,
        })
    }
}

fn execute(table: &mut Table<'_, &'static str, &'static [u8]>, op: &Op) -> StateResult<OpResponse> {
    match op {
        Op::Get(key) => {
            let kv = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| KeyValue {
                    key: key.clone(),
                    value: guard.value().to_vec(),
                });
            Ok(OpResponse::Range(kv.into_iter().collect()))
        }
        Op::Range(prefix) => {
            let mut results = Vec::new();
            for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                // Keys sort lexicographically, so the first miss ends the prefix.
                if !key.value().starts_with(prefix.as_str()) {
                    break;
                }
                results.push(KeyValue {
                    key: key.value().to_string(),
                    value: value.value().to_vec(),
                });
            }
            Ok(OpResponse::Range(results))
        }
        Op::Put(key, value) => {
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(OpResponse::Put)
        }
        Op::Delete(key) => {
            let existed = table
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .is_some();
            Ok(OpResponse::Delete { existed })
        }
    }
}

#[async_trait]
impl KvStore for StateStore {
    async fn txn(&self, request: TxnRequest) -> StateResult<TxnResponse> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.apply(&request))
            .await
            .map_err(map_err!(Transaction))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Compare;

    fn put(key: &str, value: &str) -> Op {
        Op::put(key, value.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .txn(TxnRequest::new(vec![put("/nodes/a", "one")]))
            .await
            .unwrap();

        let resp = store
            .txn(TxnRequest::new(vec![Op::get("/nodes/a")]))
            .await
            .unwrap();
        assert!(resp.succeeded);
        assert_eq!(resp.value(0), Some(&b"one"[..]));
    }

    #[tokio::test]
    async fn get_nonexistent_returns_empty_range() {
        let store = StateStore::open_in_memory().unwrap();
        let resp = store
            .txn(TxnRequest::new(vec![Op::get("/nope")]))
            .await
            .unwrap();
        assert!(resp.kvs(0).is_empty());
    }

    #[tokio::test]
    async fn range_returns_prefix_in_key_order() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .txn(TxnRequest::new(vec![
                put("/nodes/b", "2"),
                put("/nodes/a", "1"),
                put("/other/c", "3"),
            ]))
            .await
            .unwrap();

        let resp = store
            .txn(TxnRequest::new(vec![Op::range("/nodes/")]))
            .await
            .unwrap();
        let keys: Vec<_> = resp.kvs(0).iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/nodes/a", "/nodes/b"]);
    }

    #[tokio::test]
    async fn range_stops_at_prefix_boundary() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .txn(TxnRequest::new(vec![
                put("/a/1", "before"),
                put("/nodes", "bare"),
                put("/nodes/x", "in"),
                put("/nodes0", "after"),
                put("/z", "last"),
            ]))
            .await
            .unwrap();

        let resp = store
            .txn(TxnRequest::new(vec![Op::range("/nodes/")]))
            .await
            .unwrap();
        let keys: Vec<_> = resp.kvs(0).iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/nodes/x"]);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .txn(TxnRequest::new(vec![put("/k", "v")]))
            .await
            .unwrap();

        let resp = store
            .txn(TxnRequest::new(vec![Op::delete("/k"), Op::delete("/k")]))
            .await
            .unwrap();
        assert_eq!(
            resp.responses,
            vec![
                OpResponse::Delete { existed: true },
                OpResponse::Delete { existed: false }
            ]
        );
    }

    #[tokio::test]
    async fn failed_compare_runs_failure_branch_only() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .txn(TxnRequest::new(vec![put("/leader", "a")]))
            .await
            .unwrap();

        let resp = store
            .txn(
                TxnRequest::new(vec![put("/nodes/x", "written")])
                    .when(Compare::value_equals("/leader", b"b".to_vec()))
                    .otherwise(vec![Op::get("/leader")]),
            )
            .await
            .unwrap();

        assert!(!resp.succeeded);
        assert_eq!(resp.value(0), Some(&b"a"[..]));

        let check = store
            .txn(TxnRequest::new(vec![Op::get("/nodes/x")]))
            .await
            .unwrap();
        assert!(check.kvs(0).is_empty());
    }

    #[tokio::test]
    async fn compare_absent_is_put_if_absent() {
        let store = StateStore::open_in_memory().unwrap();
        let create = |value: &str| {
            TxnRequest::new(vec![put("/certs/ca", value)])
                .when(Compare::absent("/certs/ca"))
                .otherwise(vec![Op::get("/certs/ca")])
        };

        let first = store.txn(create("first")).await.unwrap();
        let second = store.txn(create("second")).await.unwrap();

        assert!(first.succeeded);
        assert!(!second.succeeded);
        assert_eq!(second.value(0), Some(&b"first"[..]));
    }

    #[tokio::test]
    async fn concurrent_put_if_absent_has_one_winner() {
        let store = StateStore::open_in_memory().unwrap();
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .txn(
                        TxnRequest::new(vec![Op::put("/slot", format!("{i}").into_bytes())])
                            .when(Compare::absent("/slot")),
                    )
                    .await
                    .unwrap()
                    .succeeded
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .txn(TxnRequest::new(vec![put("/nodes/a", "kept")]))
                .await
                .unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let resp = store
            .txn(TxnRequest::new(vec![Op::get("/nodes/a")]))
            .await
            .unwrap();
        assert_eq!(resp.value(0), Some(&b"kept"[..]));
    }
}
