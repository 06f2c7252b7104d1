//! Conflict resolution.
//!
//! A record's state is a function of the set of log entries known for its
//! key, and its content is a function of the record versions known for it.
//! Both functions are commutative, associative and idempotent, so nodes that
//! have seen the same facts agree regardless of arrival order.

use crate::codec::ReplicationLogEntry;
use crate::record::{RecordState, Version, VersionedRecord};

/// The outcome of resolving a key's log history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The state with the highest rank among the entries.
    pub state: RecordState,
    /// The greatest version among entries in `state`.
    pub version: Version,
}

/// Resolve the state of a key from its log entries.
///
/// Returns `None` for an empty history. Otherwise the highest-ranked state
/// wins (Invalidated over Created, whatever the clocks say) and, within that
/// state, the greatest [`Version`].
pub fn resolve<'a, I>(entries: I) -> Option<Resolution>
where
    I: IntoIterator<Item = &'a ReplicationLogEntry>,
{
    entries
        .into_iter()
        .max_by(|a, b| {
            a.state
                .rank()
                .cmp(&b.state.rank())
                .then_with(|| a.version().cmp(&b.version()))
        })
        .map(|winner| Resolution {
            state: winner.state,
            version: winner.version(),
        })
}

/// Merge what is known about one key into its converged record.
///
/// Credential fields come from whichever of `local` and `remote` carries the
/// greater `content_version`. Invalidation fields come from the greater
/// `invalidation_version` and survive only if `entries` resolve to
/// Invalidated. `state` is always `resolve(entries)`.
///
/// Returns `None` when there is no record to merge or no history to derive
/// a state from.
pub fn merge(
    local: Option<&VersionedRecord>,
    remote: Option<&VersionedRecord>,
    entries: &[ReplicationLogEntry],
) -> Option<VersionedRecord> {
    let resolution = resolve(entries)?;

    let content = match (local, remote) {
        (Some(l), Some(r)) => newer_content(l, r),
        (Some(only), None) | (None, Some(only)) => only,
        (None, None) => return None,
    };
    let mut merged = content.clone();

    let invalidation = [local, remote]
        .into_iter()
        .flatten()
        .filter(|v| v.invalidation_version.is_some())
        .max_by(|a, b| a.invalidation_version.cmp(&b.invalidation_version));

    match (resolution.state, invalidation) {
        (RecordState::Invalidated, Some(source)) => {
            merged.record.invalidation_reason = source.record.invalidation_reason.clone();
            merged.record.invalidated_at = source.record.invalidated_at;
            merged.invalidation_version = source.invalidation_version.clone();
        }
        // Either never invalidated, or the invalidating node's record has not
        // arrived yet and its fields land on a later merge.
        _ => {
            merged.record.invalidation_reason = None;
            merged.record.invalidated_at = None;
            merged.invalidation_version = None;
        }
    }
    merged.record.state = resolution.state;

    Some(merged)
}

fn newer_content<'a>(a: &'a VersionedRecord, b: &'a VersionedRecord) -> &'a VersionedRecord {
    if b.content_version > a.content_version {
        b
    } else {
        a
    }
}
