use std::collections::HashSet;

use crate::error::SyncError;
use crate::models::{Identity, Record};
use crate::profiles::EntityProfile;
use crate::traits::UpsertOp;

/// Identities present in the store when the run started.
pub type Snapshot = HashSet<Identity>;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The identity is already stored: set the record's fields on it.
    Update(UpsertOp),
    /// New identity: insert the record as is (plus insert defaults).
    Insert(Record),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub identity: Identity,
    pub resolution: Resolution,
}

/// Classify `record` against `snapshot`. Pure: no store access.
pub fn resolve(
    profile: &EntityProfile,
    mut record: Record,
    snapshot: &Snapshot,
) -> Result<Resolved, SyncError> {
    let identity = profile
        .key
        .extract(&record)
        .map_err(SyncError::MissingIdentity)?;

    let resolution = if snapshot.contains(&identity) {
        Resolution::Update(UpsertOp {
            filter: profile.key.filter(&identity),
            payload: record,
        })
    } else {
        for (field, value) in &profile.insert_defaults {
            record.entry(field.clone()).or_insert_with(|| value.clone());
        }
        Resolution::Insert(record)
    };

    Ok(Resolved {
        identity,
        resolution,
    })
}
