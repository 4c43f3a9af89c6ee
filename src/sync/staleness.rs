use std::collections::HashSet;

use tracing::info;

use crate::error::StoreError;
use crate::models::{Filter, Identity, Scalar};
use crate::profiles::{EntityProfile, StalenessPolicy, TOMBSTONE_FIELD};
use crate::traits::DocumentStore;

/// Identities stored before the run that the input no longer mentions,
/// in a stable order.
pub fn compute_stale(snapshot: &HashSet<Identity>, processed: &HashSet<Identity>) -> Vec<Identity> {
    let mut stale: Vec<Identity> = snapshot.difference(processed).cloned().collect();
    stale.sort();
    stale
}

/// Apply the profile's staleness policy to `stale`. Returns how many documents
/// were removed (hard) or newly flagged (soft); that can be lower than
/// `stale.len()` when the collection changed since the snapshot.
pub async fn apply_policy(
    store: &dyn DocumentStore,
    profile: &EntityProfile,
    stale: &[Identity],
) -> Result<u64, StoreError> {
    if stale.is_empty() || profile.staleness == StalenessPolicy::None {
        return Ok(0);
    }

    let mut affected = 0;
    for chunk in stale.chunks(profile.batch_size.max(1)) {
        let filters: Vec<Filter> = chunk.iter().map(|id| profile.key.filter(id)).collect();
        affected += match profile.staleness {
            StalenessPolicy::Hard => store.delete_matching(&profile.collection, &filters).await?,
            StalenessPolicy::Soft => {
                store
                    .set_field(&profile.collection, &filters, TOMBSTONE_FIELD, Scalar::Bool(true))
                    .await?
            }
            StalenessPolicy::None => 0,
        };
    }

    match profile.staleness {
        StalenessPolicy::Hard => info!(
            collection = %profile.collection,
            stale = stale.len(),
            removed = affected,
            "Removed stale records"
        ),
        _ => info!(
            collection = %profile.collection,
            stale = stale.len(),
            flagged = affected,
            "Marked stale records as deleted"
        ),
    }
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> HashSet<Identity> {
        names
            .iter()
            .map(|s| Identity(vec![Scalar::Text((*s).into())]))
            .collect()
    }

    #[test]
    fn stale_is_snapshot_minus_processed() {
        let stale = compute_stale(&ids(&["A", "B", "C"]), &ids(&["A", "B", "D"]));
        assert_eq!(stale, vec![Identity(vec![Scalar::Text("C".into())])]);
    }

    #[test]
    fn nothing_is_stale_when_everything_was_seen() {
        assert!(compute_stale(&ids(&["A"]), &ids(&["A", "B"])).is_empty());
        assert!(compute_stale(&HashSet::new(), &ids(&["A"])).is_empty());
    }

    #[test]
    fn stale_order_is_stable() {
        let stale = compute_stale(&ids(&["c", "a", "b"]), &HashSet::new());
        let names: Vec<String> = stale.iter().map(ToString::to_string).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }
}
