//! Transactional key-value contract.
//!
//! Mirrors the etcd Txn model: a list of `Compare` predicates evaluated
//! atomically, then either the `success` or the `failure` operations.
//! Everything the control plane writes goes through [`KvStore::txn`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{StateError, StateResult};

/// A single store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Read one key.
    Get(String),
    /// Read every key starting with the given prefix, in key order.
    Range(String),
    /// Write one key.
    Put(String, Vec<u8>),
    /// Remove one key.
    Delete(String),
}

impl Op {
    pub fn get(key: impl Into<String>) -> Self {
        Op::Get(key.into())
    }

    pub fn range(prefix: impl Into<String>) -> Self {
        Op::Range(prefix.into())
    }

    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Op::Put(key.into(), value.into())
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Op::Delete(key.into())
    }

    /// Whether the operation modifies the store.
    pub fn is_write(&self) -> bool {
        matches!(self, Op::Put(..) | Op::Delete(_))
    }

    fn map_key(self, f: impl Fn(String) -> String) -> Self {
        match self {
            Op::Get(k) => Op::Get(f(k)),
            Op::Range(k) => Op::Range(f(k)),
            Op::Put(k, v) => Op::Put(f(k), v),
            Op::Delete(k) => Op::Delete(f(k)),
        }
    }
}

/// Predicate on a key's current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    /// Expected value; `None` means the key must be absent.
    pub expected: Option<Vec<u8>>,
}

impl Compare {
    /// Holds iff `key` currently stores exactly `value`.
    pub fn value_equals(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            expected: Some(value.into()),
        }
    }

    /// Holds iff `key` does not exist.
    pub fn absent(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            expected: None,
        }
    }
}

/// A key and its value as returned by `Get`/`Range`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Result of one executed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResponse {
    Range(Vec<KeyValue>),
    Put,
    Delete { existed: bool },
}

impl OpResponse {
    /// Key-values returned by a read; empty for writes.
    pub fn kvs(&self) -> &[KeyValue] {
        match self {
            OpResponse::Range(kvs) => kvs,
            _ => &[],
        }
    }
}

/// An atomic Compare/Then/Else transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

impl TxnRequest {
    /// An unconditional transaction running `ops`.
    pub fn new(ops: Vec<Op>) -> Self {
        Self {
            compare: Vec::new(),
            success: ops,
            failure: Vec::new(),
        }
    }

    /// Add a predicate that must hold for `success` to run.
    pub fn when(mut self, compare: Compare) -> Self {
        self.compare.push(compare);
        self
    }

    /// Operations to run if any predicate fails.
    pub fn otherwise(mut self, ops: Vec<Op>) -> Self {
        self.failure = ops;
        self
    }
}

/// Outcome of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnResponse {
    /// Whether every compare held (and thus `success` ran).
    pub succeeded: bool,
    /// One response per executed operation, in order.
    pub responses: Vec<OpResponse>,
}

impl TxnResponse {
    /// Key-values returned by the `index`-th operation.
    pub fn kvs(&self, index: usize) -> &[KeyValue] {
        self.responses.get(index).map(OpResponse::kvs).unwrap_or(&[])
    }

    /// Value of the single key read by the `index`-th operation, if any.
    pub fn value(&self, index: usize) -> Option<&[u8]> {
        self.kvs(index).first().map(|kv| kv.value.as_slice())
    }
}

/// A linearizable transactional key-value store.
///
/// Implementations must apply each transaction atomically: either every
/// operation of the chosen branch is visible to later transactions, or
/// none is.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn txn(&self, request: TxnRequest) -> StateResult<TxnResponse>;
}

#[async_trait]
impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    async fn txn(&self, request: TxnRequest) -> StateResult<TxnResponse> {
        (**self).txn(request).await
    }
}

/// A view over a store with every key transparently prefixed.
///
/// `Namespaced::new(store, "/curator")` turns `/nodes/a` into
/// `/curator/nodes/a` on the way in and strips the prefix on the way out.
#[derive(Clone)]
pub struct Namespaced {
    inner: Arc<dyn KvStore>,
    prefix: String,
}

impl Namespaced {
    /// The prefix must start with `/` and must not end with one.
    pub fn new(inner: Arc<dyn KvStore>, prefix: impl Into<String>) -> StateResult<Self> {
        let prefix = prefix.into();
        if prefix.len() < 2 || !prefix.starts_with('/') || prefix.ends_with('/') {
            return Err(StateError::InvalidKey(format!(
                "namespace {prefix:?} must look like \"/name\""
            )));
        }
        Ok(Self { inner, prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl std::fmt::Debug for Namespaced {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespaced").field("prefix", &self.prefix).finish()
    }
}

#[async_trait]
impl KvStore for Namespaced {
    async fn txn(&self, request: TxnRequest) -> StateResult<TxnResponse> {
        let add = |k: String| format!("{}{}", self.prefix, k);
        let request = TxnRequest {
            compare: request
                .compare
                .into_iter()
                .map(|c| Compare {
                    key: add(c.key),
                    expected: c.expected,
                })
                .collect(),
            success: request.success.into_iter().map(|op| op.map_key(add)).collect(),
            failure: request.failure.into_iter().map(|op| op.map_key(add)).collect(),
        };

        let mut response = self.inner.txn(request).await?;
        for op in &mut response.responses {
            if let OpResponse::Range(kvs) = op {
                for kv in kvs.iter_mut() {
                    if let Some(stripped) = kv.key.strip_prefix(self.prefix.as_str()) {
                        kv.key = stripped.to_string();
                    }
                }
            }
        }
        Ok(response)
    }
}
