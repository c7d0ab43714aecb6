//! tessera-state: the storage contract the control plane runs against.
//!
//! The cluster's consensus store is consumed as a linearizable,
//! transactional key-value store. This crate pins down that contract
//! and ships one implementation of it.
//!
//! # Architecture
//!
//! - **`keys`**: `KeyNamespace`, the validated mapping from logical ids to
//!   store keys (`/nodes/{id}`).
//! - **`kv`**: `KvStore`, an etcd-style Compare/Then/Else transaction
//!   primitive, and `Namespaced`, a prefixed view over any store.
//! - **`store`**: `StateStore`, a [redb](https://docs.rs/redb) database
//!   implementing `KvStore`, on disk or in memory (for tests).
//!
//! Values are opaque bytes; encoding is the caller's business.

pub mod error;
pub mod keys;
pub mod kv;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use keys::KeyNamespace;
pub use kv::{Compare, KeyValue, KvStore, Namespaced, Op, OpResponse, TxnRequest, TxnResponse};
pub use store::StateStore;
