//! redb table definitions for the Tessera state store.
//!
//! The store is a flat keyspace: one table with `&str` keys (`/nodes/{id}`,
//! `/pki/{ns}/certs/{name}`, ...) and opaque `&[u8]` values.

use redb::TableDefinition;

/// Every key-value pair in the store.
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
