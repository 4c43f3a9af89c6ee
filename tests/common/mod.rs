#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use catalog_sync::database::{SqliteStore, StoreConfig};
use catalog_sync::error::StoreError;
use catalog_sync::models::{Filter, Identity, IdentityKey, Record, Scalar};
use catalog_sync::traits::{Connector, DocumentStore, IndexSpec, UpsertOp};
use serde_json::Value;
use std::collections::HashSet;

/// Scratch directory holding one test's database and input files.
pub struct Scratch {
    pub dir: PathBuf,
}

impl Scratch {
    pub fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("catalog-sync-{name}-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        Self { dir }
    }

    pub fn store_url(&self) -> String {
        format!("sqlite:{}", self.dir.join("catalog.db").display())
    }

    pub fn connector(&self) -> StoreConfig {
        StoreConfig::from_url(&self.store_url(), "unused").unwrap()
    }

    pub async fn open(&self) -> SqliteStore {
        SqliteStore::connect(&self.store_url()).await.unwrap()
    }

    pub fn write_json(&self, name: &str, value: &Value) -> PathBuf {
        self.write_raw(name, &serde_json::to_vec(value).unwrap())
    }

    pub fn write_raw(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

pub fn text(s: &str) -> Scalar {
    Scalar::Text(s.to_string())
}

pub fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

pub async fn count_where(store: &dyn DocumentStore, collection: &str, field: &str, value: Scalar) -> u64 {
    store
        .count(collection, Some(&Filter::eq(field, value)))
        .await
        .unwrap()
}

/// Faults to inject into a [`FaultyStore`].
#[derive(Default)]
pub struct Faults {
    pub refuse_connection: AtomicBool,
    /// Fail the insert_many call with this 1-based number
    pub fail_insert_call: AtomicUsize,
    pub fail_upserts: AtomicBool,
    pub fail_create_index: AtomicBool,
    insert_calls: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Faults {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Connector opening a SQLite store wrapped with injected faults.
pub struct FaultyConnector {
    url: String,
    pub faults: Arc<Faults>,
}

impl FaultyConnector {
    pub fn new(scratch: &Scratch) -> Self {
        Self {
            url: scratch.store_url(),
            faults: Arc::new(Faults::default()),
        }
    }
}

#[async_trait]
impl Connector for FaultyConnector {
    async fn connect(&self) -> Result<Box<dyn DocumentStore>, StoreError> {
        if self.faults.refuse_connection.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("connection refused".into()));
        }
        let inner = SqliteStore::connect(&self.url).await?;
        Ok(Box::new(FaultyStore {
            inner,
            faults: self.faults.clone(),
        }))
    }
}

pub struct FaultyStore {
    inner: SqliteStore,
    faults: Arc<Faults>,
}

#[async_trait]
impl DocumentStore for FaultyStore {
    fn backend(&self) -> &'static str {
        "faulty-sqlite"
    }

    async fn load_identities(
        &self,
        collection: &str,
        key: &IdentityKey,
    ) -> Result<HashSet<Identity>, StoreError> {
        self.inner.load_identities(collection, key).await
    }

    async fn upsert_many(&self, collection: &str, ops: &[UpsertOp]) -> Result<u64, StoreError> {
        if self.faults.fail_upserts.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("upserts disabled".into()));
        }
        self.inner.upsert_many(collection, ops).await
    }

    async fn insert_many(&self, collection: &str, docs: &[Record]) -> Result<u64, StoreError> {
        let call = self.faults.insert_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.faults.fail_insert_call.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected(format!("insert call {call} rejected")));
        }
        self.inner.insert_many(collection, docs).await
    }

    async fn delete_matching(&self, collection: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        self.inner.delete_matching(collection, filters).await
    }

    async fn set_field(
        &self,
        collection: &str,
        filters: &[Filter],
        field: &str,
        value: Scalar,
    ) -> Result<u64, StoreError> {
        self.inner.set_field(collection, filters, field, value).await
    }

    async fn count(&self, collection: &str, filter: Option<&Filter>) -> Result<u64, StoreError> {
        self.inner.count(collection, filter).await
    }

    async fn drop_indexes(&self, collection: &str) -> Result<(), StoreError> {
        self.inner.drop_indexes(collection).await
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), StoreError> {
        if self.faults.fail_create_index.load(Ordering::SeqCst) && !index.unique {
            return Err(StoreError::Rejected(format!("cannot build {}", index.describe())));
        }
        self.inner.create_index(collection, index).await
    }

    async fn close(&self) {
        self.faults.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await;
    }
}
