//! Index execution phase: rebuilds the index generation.
//!
//! The index carries no per-event timestamps, so the age policy cannot be
//! re-evaluated here: MaybeDiscard is treated as Keep and only the exact
//! `discard_point` drops entries. Tombstoned streams keep just the
//! tombstone entry; tombstoned metadata streams keep nothing. The rebuilt
//! generation is published atomically through the index's prepare/commit
//! checkpoint pair, so readers see either the old or the new generation.

use crate::error::Error;
use crate::index::{IndexEntry, StreamIndex};
use crate::orchestrator::CancellationFlag;
use crate::state::ScavengeStateStore;
use crate::types::{
    IndexExecutionInfo, ScavengePoint, StreamHandle, TOMBSTONE_EVENT_NUMBER,
};

/// Run the index execution phase for `point`.
///
/// The rebuild is a single unit of work: it either commits in full or not
/// at all, so the phase carries no sub-checkpoint.
///
/// # Errors
///
/// [`Error::Cancelled`] if `cancel` is already raised on entry; otherwise
/// whatever the index implementation returns from its checkpoint pair.
pub fn execute_index(
    state: &ScavengeStateStore,
    index: &dyn StreamIndex,
    point: &ScavengePoint,
    cancel: &CancellationFlag,
) -> Result<(), Error> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let entries = index.iterate_all();
    let total = entries.len();
    let kept: Vec<IndexEntry> = entries
        .into_iter()
        .filter(|entry| keep_entry(state, point, entry))
        .collect();
    let dropped = total - kept.len();

    if dropped == 0 {
        tracing::debug!(entries = total, "index already clean; no rebuild needed");
        return Ok(());
    }

    index.prepare_checkpoint(kept)?;
    index.commit_checkpoint()?;
    tracing::info!(entries = total, dropped, "index generation rebuilt");
    metrics::counter!(crate::metrics::INDEX_ENTRIES_DISCARDED).increment(dropped as u64);
    Ok(())
}

fn keep_entry(state: &ScavengeStateStore, point: &ScavengePoint, entry: &IndexEntry) -> bool {
    if entry.log_position >= point.position {
        return true;
    }
    match projection(state, &entry.handle) {
        None => true,
        Some((info, is_metastream)) => {
            if info.is_tombstoned {
                // A tombstoned metadata stream keeps nothing; a tombstoned
                // original stream keeps its tombstone entry.
                return !is_metastream && entry.event_number == TOMBSTONE_EVENT_NUMBER;
            }
            !info.discard_point.should_discard(entry.event_number)
        }
    }
}

/// The coarse projection for a handle, and whether it names a metastream.
///
/// Metastream handles and original handles live in disjoint maps keyed by
/// the same handle type; the metastream side wins on the (hash-collision
/// grade) chance a handle appears in both.
fn projection(
    state: &ScavengeStateStore,
    handle: &StreamHandle,
) -> Option<(IndexExecutionInfo, bool)> {
    if let Some(data) = state.metastream(handle) {
        return Some((
            IndexExecutionInfo {
                is_tombstoned: data.is_tombstoned,
                discard_point: data.discard_point,
            },
            true,
        ));
    }
    state.original(handle).map(|data| {
        (
            IndexExecutionInfo {
                is_tombstoned: data.is_tombstoned,
                discard_point: data.discard_point,
            },
            false,
        )
    })
}
