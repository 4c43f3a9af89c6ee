//! Incremental synchronization of a hand-off file into a document collection.
//!
//! A run connects, snapshots the identities already stored, streams the input
//! through the resolver into batched writes, applies the staleness policy to
//! identities the input no longer mentions, rebuilds indexes and reports
//! counters. Stream-derived writes always complete before staleness is
//! computed, and staleness before indexes are rebuilt.

mod batch;
mod resolver;
mod staleness;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

pub use batch::{BatchAccumulator, Operation};
pub use resolver::{Resolution, Resolved, Snapshot, resolve};
pub use staleness::{apply_policy, compute_stale};

use crate::error::{StoreError, SyncError, SyncFailure};
use crate::models::{Filter, Identity, Scalar};
use crate::profiles::{EntityProfile, StalenessPolicy, TOMBSTONE_FIELD};
use crate::source::open_records;
use crate::traits::{Connector, DocumentStore, UpsertOp};

/// Lifecycle of one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum SyncState {
    #[default]
    Idle,
    Connected,
    SnapshotLoaded,
    Streaming,
    Reconciling,
    IndexesRebuilt,
    Closed,
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Counters emitted at the end of a run, successful or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Identities stored before the run
    pub existing: u64,
    /// Records resolved as updates of stored identities
    pub updated: u64,
    /// Records resolved as new identities
    pub inserted: u64,
    /// Repeats of an identity inserted earlier in the same run
    pub duplicates: u64,
    /// Records skipped for lack of an identity
    pub skipped: u64,
    /// Duplicates merged into a still pending insert. They cause no write of
    /// their own, so `flushed + folded == updated + inserted + duplicates`
    /// once every batch is written.
    pub folded: u64,
    /// Operations written by bulk flushes
    pub flushed: u64,
    /// Operations left queued when a bulk write failed
    pub unwritten: u64,
    /// Stale documents removed or flagged
    pub stale: u64,
    pub total: u64,
    pub active: u64,
    pub deleted: u64,
    pub index_warnings: u64,
    pub state: SyncState,
    pub failed_in: Option<SyncState>,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "existing={} updated={} inserted={} duplicates={} skipped={} stale={} total={} active={} deleted={}",
            self.existing,
            self.updated,
            self.inserted,
            self.duplicates,
            self.skipped,
            self.stale,
            self.total,
            self.active,
            self.deleted
        )?;
        if let Some(state) = self.failed_in {
            write!(f, " failed_in={state}")?;
        }
        Ok(())
    }
}

/// Run-scoped state: the current lifecycle state and the counters so far.
struct RunState {
    entity: String,
    state: SyncState,
    report: SyncReport,
}

impl RunState {
    fn new(profile: &EntityProfile) -> Self {
        Self {
            entity: profile.kind.to_string(),
            state: SyncState::Idle,
            report: SyncReport::default(),
        }
    }

    fn enter(&mut self, next: SyncState) {
        debug!(entity = %self.entity, from = %self.state, to = %next, "Sync state");
        self.state = next;
        self.report.state = next;
    }

    fn fail(mut self, error: SyncError) -> SyncFailure {
        self.report.failed_in = Some(self.state);
        self.enter(SyncState::Failed);
        error!(entity = %self.entity, error = %error, report = %self.report, "Sync failed");
        SyncFailure {
            entity: self.entity,
            report: self.report,
            error,
        }
    }
}

/// Drives sync runs against whatever store the connector opens.
#[derive(Clone)]
pub struct CatalogSync {
    connector: Arc<dyn Connector>,
    strict_indexes: bool,
}

impl CatalogSync {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            strict_indexes: false,
        }
    }

    /// Treat index rebuild failures as fatal instead of warnings.
    pub fn strict_indexes(mut self, strict: bool) -> Self {
        self.strict_indexes = strict;
        self
    }

    /// Synchronize `input` into the profile's collection.
    ///
    /// The connection is released on every path; a failure carries the
    /// counters reached before it.
    pub async fn run(&self, profile: &EntityProfile, input: &Path) -> Result<SyncReport, SyncFailure> {
        let mut run = RunState::new(profile);
        info!(
            entity = %run.entity,
            collection = %profile.collection,
            input = %input.display(),
            "Starting sync"
        );

        let store = match self.connector.connect().await {
            Ok(store) => store,
            Err(e) => return Err(run.fail(SyncError::Connection(e))),
        };
        run.enter(SyncState::Connected);

        let outcome = self.reconcile(&mut run, store.as_ref(), profile, input).await;

        store.close().await;
        debug!(entity = %run.entity, backend = store.backend(), "Connection released");

        match outcome {
            Ok(()) => {
                run.enter(SyncState::Closed);
                let report = run.report;
                info!(
                    entity = %run.entity,
                    updated = report.updated,
                    inserted = report.inserted,
                    stale = report.stale,
                    total = report.total,
                    active = report.active,
                    deleted = report.deleted,
                    "Sync complete"
                );
                Ok(report)
            }
            Err(e) => Err(run.fail(e)),
        }
    }

    async fn reconcile(
        &self,
        run: &mut RunState,
        store: &dyn DocumentStore,
        profile: &EntityProfile,
        input: &Path,
    ) -> Result<(), SyncError> {
        let snapshot = store.load_identities(&profile.collection, &profile.key).await?;
        run.report.existing = snapshot.len() as u64;
        info!(entity = %run.entity, existing = snapshot.len(), "Loaded existing identities");
        run.enter(SyncState::SnapshotLoaded);

        let mut batches = BatchAccumulator::new(profile.batch_size);
        let mut processed = HashSet::new();

        run.enter(SyncState::Streaming);
        let streamed = self
            .stream(run, store, profile, input, &snapshot, &mut processed, &mut batches)
            .await;

        match streamed {
            Ok(()) => {
                run.enter(SyncState::Reconciling);
                let flushed = batches.flush_remaining(store, &profile.collection).await;
                run.report.flushed = flushed_total(&batches);
                flushed?;
            }
            // A failed write is final; nothing more is written
            Err(e @ SyncError::BulkWrite { .. }) => {
                run.report.flushed = flushed_total(&batches);
                run.report.unwritten = batches.pending() as u64;
                return Err(e);
            }
            // Keep what the source yielded before it failed
            Err(e) => {
                if let Err(flush_error) = batches.flush_remaining(store, &profile.collection).await {
                    error!(entity = %run.entity, error = %flush_error, "Final flush failed after stream error");
                }
                run.report.flushed = flushed_total(&batches);
                return Err(e);
            }
        }

        let stale = compute_stale(&snapshot, &processed);
        run.report.stale = apply_policy(store, profile, &stale).await?;

        run.report.index_warnings = self.rebuild_indexes(store, profile).await?;
        run.enter(SyncState::IndexesRebuilt);

        self.count_final(run, store, profile).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream(
        &self,
        run: &mut RunState,
        store: &dyn DocumentStore,
        profile: &EntityProfile,
        input: &Path,
        snapshot: &Snapshot,
        processed: &mut HashSet<Identity>,
        batches: &mut BatchAccumulator,
    ) -> Result<(), SyncError> {
        let mut records = open_records(input, profile.layout).await?;
        let now = Utc::now().to_rfc3339();
        let mut inserted: HashSet<Identity> = HashSet::new();

        while let Some(item) = records.next().await {
            let Value::Object(mut record) = item? else {
                warn!(entity = %run.entity, "Skipping record that is not an object");
                run.report.skipped += 1;
                continue;
            };
            profile.prepare(&mut record, &now);

            let Resolved {
                identity,
                resolution,
            } = match resolve(profile, record, snapshot) {
                Ok(resolved) => resolved,
                Err(SyncError::MissingIdentity(reason)) => {
                    warn!(entity = %run.entity, key = %profile.key, reason = %reason, "Skipping record without identity");
                    run.report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            processed.insert(identity.clone());

            let operation = match resolution {
                Resolution::Update(op) => {
                    run.report.updated += 1;
                    Operation::Update(op)
                }
                Resolution::Insert(record) if inserted.contains(&identity) => {
                    // Seen earlier in this run: last write wins
                    run.report.duplicates += 1;
                    debug!(entity = %run.entity, identity = %identity, "Folding duplicate identity");
                    match batches.replace_pending_insert(&identity, record) {
                        None => {
                            run.report.folded += 1;
                            continue;
                        }
                        Some(record) => Operation::Update(UpsertOp {
                            filter: profile.key.filter(&identity),
                            payload: record,
                        }),
                    }
                }
                Resolution::Insert(record) => {
                    run.report.inserted += 1;
                    inserted.insert(identity.clone());
                    Operation::Insert { identity, record }
                }
            };

            if batches.push(operation) {
                batches.maybe_flush(store, &profile.collection).await?;
            }
        }
        Ok(())
    }

    /// Drop and recreate the profile's indexes. Returns the number of failures
    /// tolerated; in strict mode the first failure ends the run.
    async fn rebuild_indexes(
        &self,
        store: &dyn DocumentStore,
        profile: &EntityProfile,
    ) -> Result<u64, SyncError> {
        let collection = &profile.collection;
        let mut warnings = 0;

        if let Err(e) = store.drop_indexes(collection).await {
            self.index_failure(e, collection, "drop all")?;
            warnings += 1;
        }

        for index in profile.indexes() {
            match store.create_index(collection, &index).await {
                Ok(()) => info!(collection = %collection, index = %index.describe(), "Created index"),
                Err(e) => {
                    self.index_failure(e, collection, &index.describe())?;
                    warnings += 1;
                }
            }
        }
        Ok(warnings)
    }

    fn index_failure(&self, error: StoreError, collection: &str, index: &str) -> Result<(), SyncError> {
        if self.strict_indexes {
            return Err(SyncError::Index(error));
        }
        warn!(collection, index, error = %error, "Index management failed");
        Ok(())
    }

    async fn count_final(
        &self,
        run: &mut RunState,
        store: &dyn DocumentStore,
        profile: &EntityProfile,
    ) -> Result<(), StoreError> {
        let collection = &profile.collection;
        let report = &mut run.report;
        report.total = store.count(collection, None).await?;
        if profile.staleness == StalenessPolicy::Soft {
            report.active = store
                .count(collection, Some(&Filter::eq(TOMBSTONE_FIELD, Scalar::Bool(false))))
                .await?;
            report.deleted = store
                .count(collection, Some(&Filter::eq(TOMBSTONE_FIELD, Scalar::Bool(true))))
                .await?;
        } else {
            report.active = report.total;
            report.deleted = 0;
        }
        Ok(())
    }
}

fn flushed_total(batches: &BatchAccumulator) -> u64 {
    let (updates, inserts) = batches.flushed();
    updates + inserts
}
