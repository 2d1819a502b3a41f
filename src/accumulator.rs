//! Accumulation phase: forward chunk scan extracting per-stream metadata.
//!
//! Reads every committed record below the scavenge point and distills it
//! into the state store: retention policies from `$$`-stream metadata
//! writes, tombstones, per-chunk timestamp ranges, and every stream name's
//! hash for collision detection. Checkpoints after each chunk, so a crash
//! replays at most one chunk.

use serde::Deserialize;

use crate::chunk::ChunkManager;
use crate::codec::{LogRecord, PrepareRecord};
use crate::error::Error;
use crate::orchestrator::CancellationFlag;
use crate::state::ScavengeStateStore;
use crate::types::{
    is_metastream, original_stream_of, ChunkTimeStampRange, ScavengeCheckpoint, ScavengePoint,
    StreamStatus,
};

/// The subset of stream metadata the scavenger acts on.
///
/// Metadata documents may carry other keys (ACLs, custom properties); they
/// are ignored here. `$maxAge` is in seconds on the wire.
#[derive(Debug, Default, Deserialize)]
struct StreamMetadataDocument {
    #[serde(rename = "$maxCount")]
    max_count: Option<u64>,
    #[serde(rename = "$maxAge")]
    max_age_s: Option<u64>,
    #[serde(rename = "$tb")]
    truncate_before: Option<u64>,
}

/// Run the accumulation phase up to `point`.
///
/// Resumes from the last accumulated chunk recorded in the state store's
/// checkpoint. Archived chunks are skipped; their contents were accumulated
/// while they were still local.
///
/// # Errors
///
/// [`Error::Cancelled`] if `cancel` is raised between chunks; corruption and
/// I/O errors abort the phase without advancing the checkpoint past the
/// failing chunk.
pub fn accumulate(
    state: &mut ScavengeStateStore,
    chunks: &ChunkManager,
    point: &ScavengePoint,
    cancel: &CancellationFlag,
) -> Result<(), Error> {
    if point.position == 0 {
        return Ok(());
    }
    let target = chunks.chunk_of_position(point.position - 1);
    let done_chunk = match state.checkpoint() {
        Some(ScavengeCheckpoint::Accumulating { done_chunk, .. }) => *done_chunk,
        _ => None,
    };

    for number in chunks.chunk_numbers() {
        if number > target {
            break;
        }
        if done_chunk.is_some_and(|done| number <= done) {
            continue;
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (start, end) = chunks.range_of(number)?;
        if chunks.locator(number)?.is_archived() {
            tracing::debug!(
                chunk = number,
                "skipping archived chunk; its metadata was accumulated before archival"
            );
        } else {
            let file = chunks.open_for_read(number)?;
            accumulate_chunk(state, start, end, &file, point)?;
            tracing::debug!(chunk = number, "accumulated chunk");
        }
        state.set_checkpoint(ScavengeCheckpoint::Accumulating {
            point: *point,
            done_chunk: Some(end),
        })?;
        metrics::counter!(crate::metrics::CHUNKS_ACCUMULATED).increment(1);
    }
    Ok(())
}

/// Accumulate one chunk file covering logical chunks `start..=end`.
fn accumulate_chunk(
    state: &mut ScavengeStateStore,
    start: u32,
    end: u32,
    file: &crate::chunk::ChunkFile,
    point: &ScavengePoint,
) -> Result<(), Error> {
    let mut range: Option<ChunkTimeStampRange> = None;
    for record in &file.records {
        if record.log_position() >= point.position {
            break;
        }
        match range.as_mut() {
            None => range = Some(ChunkTimeStampRange::at(record.timestamp())),
            Some(r) => r.extend(record.timestamp()),
        }
        if let LogRecord::Prepare(prepare) = record {
            accumulate_prepare(state, prepare);
        }
    }
    if let Some(range) = range {
        // A merged file spans several logical chunk numbers; the combined
        // range is recorded for each so position-based lookups stay valid.
        for number in start..=end {
            state.set_chunk_range(number, range);
        }
    }
    Ok(())
}

/// Fold one committed prepare into the state store.
fn accumulate_prepare(state: &mut ScavengeStateStore, prepare: &PrepareRecord) {
    let handle = state.record_stream(&prepare.stream_name);

    if is_metastream(&prepare.stream_name) {
        state.upsert_metastream(handle.clone(), |_| {});
        if !prepare.is_committed() {
            return;
        }
        if prepare.is_tombstone() {
            state.upsert_metastream(handle, |data| data.is_tombstoned = true);
            return;
        }
        let Some(original_name) = original_stream_of(&prepare.stream_name) else {
            return;
        };
        let document: StreamMetadataDocument = match serde_json::from_slice(&prepare.data) {
            Ok(document) => document,
            Err(error) => {
                tracing::debug!(
                    stream = %prepare.stream_name,
                    %error,
                    "ignoring unparseable stream metadata"
                );
                return;
            }
        };
        let original_handle = state.record_stream(original_name);
        // The latest metadata write replaces the whole document. A document
        // can also revive an entry a previous run archived, so the
        // calculator re-derives its discard points.
        state.upsert_original(original_handle, |data| {
            data.max_count = document.max_count;
            data.max_age_ms = document.max_age_s.map(|s| s.saturating_mul(1000));
            data.truncate_before = document.truncate_before;
            data.status = StreamStatus::Active;
        });
    } else if prepare.is_tombstone() && prepare.is_committed() {
        state.upsert_original(handle, |data| data.is_tombstoned = true);
    }
}
