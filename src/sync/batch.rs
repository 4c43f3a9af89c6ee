use std::collections::HashMap;
use std::mem;

use tracing::info;

use crate::error::{SyncError, WriteKind};
use crate::models::{Identity, Record};
use crate::traits::{DocumentStore, UpsertOp};

/// A write queued by the resolver.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Update(UpsertOp),
    Insert { identity: Identity, record: Record },
}

/// Buffers updates and inserts separately and writes each kind in bulk once it
/// reaches `batch_size`. Order is kept within a kind, not across kinds.
pub struct BatchAccumulator {
    batch_size: usize,
    updates: Vec<UpsertOp>,
    inserts: Vec<Record>,
    /// Position of each pending insert, for folding duplicates
    pending_inserts: HashMap<Identity, usize>,
    flushed_updates: u64,
    flushed_inserts: u64,
}

impl BatchAccumulator {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            updates: Vec::with_capacity(batch_size),
            inserts: Vec::with_capacity(batch_size),
            pending_inserts: HashMap::new(),
            flushed_updates: 0,
            flushed_inserts: 0,
        }
    }

    /// Queue `operation`; true when its batch is now full.
    pub fn push(&mut self, operation: Operation) -> bool {
        match operation {
            Operation::Update(op) => {
                self.updates.push(op);
                self.updates.len() >= self.batch_size
            }
            Operation::Insert { identity, record } => {
                self.pending_inserts.insert(identity, self.inserts.len());
                self.inserts.push(record);
                self.inserts.len() >= self.batch_size
            }
        }
    }

    /// Replace the payload of a pending insert for `identity`. Gives the
    /// record back when that insert was already written.
    pub fn replace_pending_insert(&mut self, identity: &Identity, record: Record) -> Option<Record> {
        match self.pending_inserts.get(identity) {
            Some(&position) => {
                self.inserts[position] = record;
                None
            }
            None => Some(record),
        }
    }

    pub fn pending(&self) -> usize {
        self.updates.len() + self.inserts.len()
    }

    /// Operations written so far, as (updates, inserts).
    pub fn flushed(&self) -> (u64, u64) {
        (self.flushed_updates, self.flushed_inserts)
    }

    /// Write every batch that reached the threshold.
    pub async fn maybe_flush(
        &mut self,
        store: &dyn DocumentStore,
        collection: &str,
    ) -> Result<(), SyncError> {
        if self.updates.len() >= self.batch_size {
            self.flush_updates(store, collection).await?;
        }
        if self.inserts.len() >= self.batch_size {
            self.flush_inserts(store, collection).await?;
        }
        Ok(())
    }

    /// Write whatever is left, whatever its size. Called once, after the
    /// source is exhausted or has failed.
    pub async fn flush_remaining(
        &mut self,
        store: &dyn DocumentStore,
        collection: &str,
    ) -> Result<(), SyncError> {
        if !self.updates.is_empty() {
            self.flush_updates(store, collection).await?;
        }
        if !self.inserts.is_empty() {
            self.flush_inserts(store, collection).await?;
        }
        Ok(())
    }

    async fn flush_updates(
        &mut self,
        store: &dyn DocumentStore,
        collection: &str,
    ) -> Result<(), SyncError> {
        let batch = mem::take(&mut self.updates);
        store
            .upsert_many(collection, &batch)
            .await
            .map_err(|source| SyncError::BulkWrite {
                kind: WriteKind::Update,
                size: batch.len(),
                source,
            })?;
        self.flushed_updates += batch.len() as u64;
        info!(collection, so_far = self.flushed_updates, "Updated records");
        Ok(())
    }

    async fn flush_inserts(
        &mut self,
        store: &dyn DocumentStore,
        collection: &str,
    ) -> Result<(), SyncError> {
        let batch = mem::take(&mut self.inserts);
        self.pending_inserts.clear();
        store
            .insert_many(collection, &batch)
            .await
            .map_err(|source| SyncError::BulkWrite {
                kind: WriteKind::Insert,
                size: batch.len(),
                source,
            })?;
        self.flushed_inserts += batch.len() as u64;
        info!(collection, so_far = self.flushed_inserts, "Inserted new records");
        Ok(())
    }
}
