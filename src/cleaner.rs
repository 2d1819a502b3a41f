//! Cleaning phase: trims the scavenge state store.
//!
//! Streams the calculator archived have no work left in this run and none
//! pending for a future one, so their entries are promoted to `Spent` and
//! deleted. Entries the chunk executor deferred are not eligible: a
//! threshold-skipped chunk still holds their discardable records, so they
//! stay `Archived` for a later run to finish. Runs last; a failure here only
//! means the state file stays larger until the next successful clean.

use crate::error::Error;
use crate::state::ScavengeStateStore;
use crate::types::StreamStatus;

/// Run the cleaning phase. Returns the number of entries deleted.
///
/// # Errors
///
/// [`Error::Io`] from checkpoint persistence; the orchestrator treats any
/// failure here as non-fatal.
pub fn clean(state: &mut ScavengeStateStore) -> Result<u64, Error> {
    let mut removed = 0u64;

    for handle in state.original_handles() {
        let status = state.original(&handle).map(|d| d.status);
        if status == Some(StreamStatus::Archived) {
            if state.is_deferred(&handle) {
                tracing::debug!(stream = %handle, "a skipped chunk still holds records; entry stays archived");
                continue;
            }
            state.upsert_original(handle.clone(), |d| d.status = StreamStatus::Spent);
        }
        let status = state.original(&handle).map(|d| d.status);
        if status == Some(StreamStatus::Spent) && state.remove_original(&handle) {
            removed += 1;
        }
    }
    for handle in state.metastream_handles() {
        let status = state.metastream(&handle).map(|d| d.status);
        if status == Some(StreamStatus::Archived) {
            if state.is_deferred(&handle) {
                tracing::debug!(stream = %handle, "a skipped chunk still holds records; entry stays archived");
                continue;
            }
            state.upsert_metastream(handle.clone(), |d| d.status = StreamStatus::Spent);
        }
        let status = state.metastream(&handle).map(|d| d.status);
        if status == Some(StreamStatus::Spent) && state.remove_metastream(&handle) {
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::info!(removed, "cleaned spent state entries");
        metrics::counter!(crate::metrics::STATE_ENTRIES_CLEANED).increment(removed);
    }
    Ok(removed)
}
