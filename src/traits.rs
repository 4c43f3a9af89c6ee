//! Traits and interfaces for backend-agnostic document storage

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{Filter, Identity, IdentityKey, Record, Scalar};

/// Update one document matching `filter` by setting every top-level field of
/// `payload`, inserting `payload` when nothing matches.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOp {
    pub filter: Filter,
    pub payload: Record,
}

/// An index over one or more dotted field paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub fields: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn unique(fields: &[String]) -> Self {
        Self {
            fields: fields.to_vec(),
            unique: true,
        }
    }

    pub fn secondary(field: &str) -> Self {
        Self {
            fields: vec![field.to_string()],
            unique: false,
        }
    }

    /// Readable name, e.g. `desktop.url+mobile.url (unique)`.
    pub fn describe(&self) -> String {
        let fields = self.fields.join("+");
        if self.unique {
            format!("{fields} (unique)")
        } else {
            fields
        }
    }
}

/// Primitive operations a sync run needs from a document collection.
///
/// Every bulk operation either applies completely or returns an error; the
/// portion of a failed bulk call that reached the store is backend-defined.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Identities of every document in `collection`, read in a single pass with
    /// a projection limited to the key fields. Documents without a usable
    /// identity are left out.
    async fn load_identities(
        &self,
        collection: &str,
        key: &IdentityKey,
    ) -> Result<HashSet<Identity>, StoreError>;

    /// Apply `ops` in order. Returns the number of operations applied.
    async fn upsert_many(&self, collection: &str, ops: &[UpsertOp]) -> Result<u64, StoreError>;

    /// Insert `docs` in order. Returns the number inserted.
    async fn insert_many(&self, collection: &str, docs: &[Record]) -> Result<u64, StoreError>;

    /// Delete every document matching any of `filters`. Returns the number removed.
    async fn delete_matching(&self, collection: &str, filters: &[Filter])
    -> Result<u64, StoreError>;

    /// Set `field` to `value` on every document matching any of `filters`.
    /// Returns the number of documents whose value actually changed.
    async fn set_field(
        &self,
        collection: &str,
        filters: &[Filter],
        field: &str,
        value: Scalar,
    ) -> Result<u64, StoreError>;

    /// Count documents, optionally restricted by `filter`.
    async fn count(&self, collection: &str, filter: Option<&Filter>) -> Result<u64, StoreError>;

    /// Drop every index on `collection` except the backend's primary key.
    async fn drop_indexes(&self, collection: &str) -> Result<(), StoreError>;

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), StoreError>;

    /// Release the connection. Called exactly once per run.
    async fn close(&self);
}

/// Opens a store connection for one sync run.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DocumentStore>, StoreError>;
}
