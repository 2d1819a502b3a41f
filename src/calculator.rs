//! Calculation phase: derives per-stream discard points.
//!
//! Iterates streams in `StreamHandle` order (resumable from the checkpoint)
//! and folds every applicable retention policy into a single pair of
//! discard points: the exact `discard_point` and the age-pending
//! `maybe_discard_point`. Exact policies (truncate-before, max-count,
//! tombstone) come straight from state and index lookups; max-age is only
//! approximated here from per-chunk timestamp ranges, leaving the precise
//! call to the chunk executor which sees each record's own timestamp.

use std::collections::BTreeSet;

use crate::chunk::ChunkManager;
use crate::error::Error;
use crate::index::StreamIndex;
use crate::orchestrator::CancellationFlag;
use crate::state::ScavengeStateStore;
use crate::types::{
    DiscardPoint, ScavengeCheckpoint, ScavengePoint, StreamHandle, StreamStatus,
    TOMBSTONE_EVENT_NUMBER,
};

/// Run the calculation phase for `point`.
///
/// # Errors
///
/// [`Error::Cancelled`] if `cancel` is raised between streams; I/O errors
/// from checkpoint persistence abort the phase.
pub fn calculate(
    state: &mut ScavengeStateStore,
    index: &dyn StreamIndex,
    chunks: &ChunkManager,
    point: &ScavengePoint,
    cancel: &CancellationFlag,
) -> Result<(), Error> {
    let done = match state.checkpoint() {
        Some(ScavengeCheckpoint::Calculating { done, .. }) => done.clone(),
        _ => None,
    };

    // Original and metastream entries share the handle keyspace; a single
    // sorted pass over the union gives one resumable cursor for both.
    let mut handles: BTreeSet<StreamHandle> = BTreeSet::new();
    handles.extend(state.original_handles());
    handles.extend(state.metastream_handles());

    for handle in handles {
        if done.as_ref().is_some_and(|d| handle <= *d) {
            continue;
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(data) = state.original(&handle).cloned() {
            if data.status == StreamStatus::Active {
                calculate_original(state, index, chunks, point, &handle, &data);
            }
        }
        if let Some(data) = state.metastream(&handle).cloned() {
            if data.status == StreamStatus::Active {
                calculate_metastream(state, index, &handle, &data);
            }
        }

        state.set_checkpoint(ScavengeCheckpoint::Calculating {
            point: *point,
            done: Some(handle),
        })?;
        metrics::counter!(crate::metrics::STREAMS_CALCULATED).increment(1);
    }
    Ok(())
}

fn calculate_original(
    state: &mut ScavengeStateStore,
    index: &dyn StreamIndex,
    chunks: &ChunkManager,
    point: &ScavengePoint,
    handle: &StreamHandle,
    data: &crate::types::OriginalStreamData,
) {
    let last_event = index.last_event_number(handle);

    let mut discard = DiscardPoint::KEEP_ALL;
    if data.is_tombstoned {
        // All prior data goes; the tombstone record itself is always kept.
        discard = discard.or(DiscardPoint::discard_before(TOMBSTONE_EVENT_NUMBER));
    }
    if let Some(truncate_before) = data.truncate_before {
        discard = discard.or(DiscardPoint::discard_before(truncate_before));
    }
    if let (Some(max_count), Some(last)) = (data.max_count, last_event) {
        let keep_from = (last.saturating_add(1)).saturating_sub(max_count);
        discard = discard.or(DiscardPoint::discard_before(keep_from));
    }

    let mut maybe = discard;
    if let Some(max_age_ms) = data.max_age_ms {
        let (age_discard, age_maybe) =
            age_discard_points(state, index, chunks, point, handle, max_age_ms);
        discard = discard.or(age_discard);
        maybe = maybe.or(age_maybe);
    }
    maybe = maybe.or(discard);

    // A live stream always keeps its latest event so its last event number
    // remains answerable without the tombstone sentinel.
    if !data.is_tombstoned {
        if let Some(last) = last_event {
            let cap = DiscardPoint::discard_before(last);
            discard = discard.min(cap);
            maybe = maybe.min(cap);
        }
    }

    // Tombstoned and truncate-only streams cannot discard more at a later
    // scavenge point; count/age policies keep producing work as the stream
    // grows and ages.
    let next_status = if data.is_tombstoned || (data.max_count.is_none() && data.max_age_ms.is_none())
    {
        StreamStatus::Archived
    } else {
        StreamStatus::Active
    };

    state.upsert_original(handle.clone(), |entry| {
        entry.discard_point = discard;
        entry.maybe_discard_point = maybe;
        entry.status = next_status;
    });
    tracing::trace!(
        stream = %handle,
        first_event_to_keep = discard.first_event_to_keep(),
        maybe_first_event_to_keep = maybe.first_event_to_keep(),
        "calculated stream"
    );
}

/// Derive the age-based discard points for one stream from per-chunk
/// timestamp ranges.
///
/// Walks the stream's index entries in ascending event order. An event in a
/// chunk whose entire range predates the cutoff is certainly expired; one in
/// a chunk straddling the cutoff may be. The walk stops at the first chunk
/// entirely newer than the cutoff.
fn age_discard_points(
    state: &ScavengeStateStore,
    index: &dyn StreamIndex,
    chunks: &ChunkManager,
    point: &ScavengePoint,
    handle: &StreamHandle,
    max_age_ms: u64,
) -> (DiscardPoint, DiscardPoint) {
    let Some(cutoff) = point.age_cutoff(max_age_ms) else {
        return (DiscardPoint::KEEP_ALL, DiscardPoint::KEEP_ALL);
    };
    let mut discard = DiscardPoint::KEEP_ALL;
    let mut maybe = DiscardPoint::KEEP_ALL;
    for entry in index.get_range(handle, 0, u64::MAX) {
        if entry.log_position >= point.position {
            break;
        }
        let number = chunks.chunk_of_position(entry.log_position);
        match state.chunk_range(number) {
            // No range recorded: not accumulated, assume recent.
            None => break,
            Some(range) if range.max < cutoff => {
                discard = discard.or(DiscardPoint::discard_including(entry.event_number));
                maybe = maybe.or(DiscardPoint::discard_including(entry.event_number));
            }
            Some(range) if range.min < cutoff => {
                maybe = maybe.or(DiscardPoint::discard_including(entry.event_number));
            }
            Some(_) => break,
        }
    }
    (discard, maybe)
}

fn calculate_metastream(
    state: &mut ScavengeStateStore,
    index: &dyn StreamIndex,
    handle: &StreamHandle,
    data: &crate::types::MetastreamData,
) {
    // A metadata stream only ever needs its most recent record; once the
    // stream is tombstoned the executors drop even that.
    let discard = match index.last_event_number(handle) {
        Some(last) => DiscardPoint::discard_before(last),
        None => DiscardPoint::KEEP_ALL,
    };
    let next_status = if data.is_tombstoned {
        StreamStatus::Archived
    } else {
        StreamStatus::Active
    };
    state.upsert_metastream(handle.clone(), |entry| {
        entry.discard_point = discard;
        entry.status = next_status;
    });
}
