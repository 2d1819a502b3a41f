//! Chunk execution phase: the physical rewrite.
//!
//! Streams every record of a chunk through the final discard decision and,
//! when enough weight would be removed, writes the survivors into a fresh
//! scavenged chunk and swaps it in. This is where MaybeDiscard is resolved:
//! each record's own timestamp is now in hand, so the age policy becomes
//! exact.

use crate::chunk::{ChunkFile, ChunkManager, ChunkWriter};
use crate::codec::{self, ChunkHeader, LogRecord, PrepareRecord, SCAVENGED_MIN_COMPATIBLE_VERSION};
use crate::error::Error;
use crate::orchestrator::CancellationFlag;
use crate::state::ScavengeStateStore;
use crate::types::{
    is_metastream, ChunkExecutionInfo, ScavengeCheckpoint, ScavengePoint, StreamHandle,
};

use std::collections::{BTreeSet, HashMap, HashSet};

/// Run the chunk execution phase up to `point`.
///
/// # Errors
///
/// [`Error::Cancelled`] between chunks; structural corruption or I/O
/// failures abort without advancing the checkpoint, leaving the original
/// chunk authoritative.
pub fn execute_chunks(
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
        Some(ScavengeCheckpoint::ExecutingChunks { done_chunk, .. }) => *done_chunk,
        _ => None,
    };
    if done_chunk.is_none() {
        // Fresh pass: deferrals recorded by the previous run's execution no
        // longer describe the chunks this pass will visit.
        state.clear_deferred();
    }

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
            tracing::warn!(
                chunk = number,
                "archived chunk cannot be rewritten in place; flagging for re-ingestion"
            );
            metrics::counter!(crate::metrics::CHUNKS_SKIPPED_ARCHIVED).increment(1);
        } else {
            execute_one_chunk(state, chunks, point, number, start, end)?;
        }
        state.set_checkpoint(ScavengeCheckpoint::ExecutingChunks {
            point: *point,
            done_chunk: Some(end),
        })?;
        metrics::counter!(crate::metrics::CHUNKS_EXECUTED).increment(1);
    }
    Ok(())
}

fn execute_one_chunk(
    state: &mut ScavengeStateStore,
    chunks: &ChunkManager,
    point: &ScavengePoint,
    number: u32,
    start: u32,
    end: u32,
) -> Result<(), Error> {
    let file = chunks.open_for_read(number)?;
    let plan = plan_chunk(state, chunks, point, number, &file)?;

    if plan.removed_weight == 0 {
        tracing::debug!(chunk = number, "nothing to discard");
        return Ok(());
    }
    if plan.removed_weight < point.threshold {
        // The skipped chunk keeps referencing these streams' discardable
        // records, so their state entries must survive this run's cleaning.
        for handle in &plan.discarded_handles {
            state.mark_deferred(handle.clone());
        }
        tracing::debug!(
            chunk = number,
            removed_weight = plan.removed_weight,
            threshold = point.threshold,
            deferred_streams = plan.discarded_handles.len(),
            "removable weight below threshold; leaving chunk untouched"
        );
        return Ok(());
    }

    let header = ChunkHeader {
        version: file.header.version,
        min_compatible_version: SCAVENGED_MIN_COMPATIBLE_VERSION,
        chunk_size: file.header.chunk_size,
        chunk_start_number: start,
        chunk_end_number: end,
        is_scavenged: true,
        transform_type: file.header.transform_type,
        chunk_id: uuid::Uuid::new_v4(),
    };
    let mut writer = ChunkWriter::create(chunks.temp_path(), header)?;
    let mut written = 0usize;
    let result = (|| {
        for (index, record) in file.records.iter().enumerate() {
            if plan.keep[index] {
                writer.append(record)?;
                written += 1;
            }
        }
        Ok::<u64, Error>(writer.physical_data_size())
    })();
    match result {
        Err(error) => {
            // The original chunk stays authoritative; drop the candidate.
            if let Err(cleanup) = writer.discard() {
                tracing::warn!(chunk = number, error = %cleanup, "failed to remove candidate file");
            }
            Err(error)
        }
        Ok(_) => {
            let logical = file
                .footer
                .as_ref()
                .map(|f| f.logical_data_size)
                .unwrap_or(plan.source_physical_size);
            let temp = writer.complete(logical)?;
            chunks.swap_in(&temp, start, end)?;
            tracing::info!(
                chunk = number,
                records_kept = written,
                records_dropped = file.records.len() - written,
                bytes_reclaimed = plan.removed_weight,
                "scavenged chunk swapped in"
            );
            metrics::counter!(crate::metrics::RECORDS_DISCARDED)
                .increment((file.records.len() - written) as u64);
            metrics::counter!(crate::metrics::BYTES_RECLAIMED).increment(plan.removed_weight);
            Ok(())
        }
    }
}

/// The keep/drop decision for every record of a chunk, plus bookkeeping.
struct ChunkPlan {
    keep: Vec<bool>,
    removed_weight: u64,
    source_physical_size: u64,
    /// Streams that lose at least one data record under this plan. Needed to
    /// defer their state entries when the plan is shelved by the threshold.
    discarded_handles: BTreeSet<StreamHandle>,
}

/// Decide the fate of every record in the chunk.
///
/// Two passes: the first decides data records individually and gathers
/// per-transaction facts (any governed record kept, both markers present in
/// this chunk); the second settles transaction begin markers and commit
/// records from those facts.
fn plan_chunk(
    state: &ScavengeStateStore,
    chunks: &ChunkManager,
    point: &ScavengePoint,
    number: u32,
    file: &ChunkFile,
) -> Result<ChunkPlan, Error> {
    let (chunk_start, chunk_end) = chunks.range_of(number)?;
    let in_this_chunk = |position: u64| {
        let c = chunks.chunk_of_position(position);
        c >= chunk_start && c <= chunk_end
    };

    // Transactions with at least one surviving governed record, and
    // transactions that begin in this chunk.
    let mut any_kept: HashSet<u64> = HashSet::new();
    let mut begins_here: HashSet<u64> = HashSet::new();
    let mut ends_here: HashSet<u64> = HashSet::new();
    let mut info_cache: HashMap<&str, Option<ChunkExecutionInfo>> = HashMap::new();

    let mut keep = vec![true; file.records.len()];
    let mut removed_weight = 0u64;
    let mut source_physical_size = 0u64;
    let mut discarded_handles: BTreeSet<StreamHandle> = BTreeSet::new();

    for (index, record) in file.records.iter().enumerate() {
        source_physical_size += codec::encoded_len(record);
        if record.log_position() >= point.position {
            continue; // beyond the scavenge point, untouched
        }
        if let LogRecord::Prepare(prepare) = record {
            if prepare
                .flags
                .contains(codec::PrepareFlags::TRANSACTION_BEGIN)
            {
                begins_here.insert(prepare.transaction_position);
            }
            if prepare.flags.contains(codec::PrepareFlags::TRANSACTION_END) {
                ends_here.insert(prepare.transaction_position);
            }
            if !prepare.flags.contains(codec::PrepareFlags::DATA) {
                continue; // bare marker, settled in the second pass
            }
            let info = match info_cache.get(prepare.stream_name.as_str()) {
                Some(info) => *info,
                None => {
                    let info = execution_info(state, &prepare.stream_name)?;
                    info_cache.insert(prepare.stream_name.as_str(), info);
                    info
                }
            };
            let kept = match info {
                None => true, // no policy recorded for this stream
                Some(info) => keep_prepare(&info, prepare, point),
            };
            if kept {
                if prepare.is_transactional() {
                    any_kept.insert(prepare.transaction_position);
                }
            } else {
                keep[index] = false;
                removed_weight += codec::encoded_len(record);
                discarded_handles.insert(state.detector().handle_for(&prepare.stream_name));
            }
        }
    }

    // Second pass: transaction markers and commits live or die with their
    // governed records, unless the transaction straddles a chunk boundary,
    // in which case they are kept for log replayability.
    for (index, record) in file.records.iter().enumerate() {
        if record.log_position() >= point.position {
            continue;
        }
        let transaction = match record {
            LogRecord::Prepare(p)
                if p.is_transactional() && !p.flags.contains(codec::PrepareFlags::DATA) =>
            {
                p.transaction_position
            }
            LogRecord::Commit(c) => c.transaction_position,
            _ => continue,
        };
        let straddles = !in_this_chunk(transaction)
            || (begins_here.contains(&transaction) != ends_here.contains(&transaction));
        if !straddles && !any_kept.contains(&transaction) {
            keep[index] = false;
            removed_weight += codec::encoded_len(record);
        }
    }

    Ok(ChunkPlan {
        keep,
        removed_weight,
        source_physical_size,
        discarded_handles,
    })
}

/// Resolve the execution projection for a stream name, if any policy exists.
fn execution_info(
    state: &ScavengeStateStore,
    stream_name: &str,
) -> Result<Option<ChunkExecutionInfo>, Error> {
    if is_metastream(stream_name) {
        let handle = state.detector().handle_for(stream_name);
        Ok(state.metastream(&handle).map(|data| ChunkExecutionInfo {
            is_tombstoned: data.is_tombstoned,
            discard_point: data.discard_point,
            maybe_discard_point: data.discard_point,
            max_age_ms: None,
        }))
    } else {
        Ok(state
            .original_for_stream(stream_name)?
            .map(|data| ChunkExecutionInfo {
                is_tombstoned: data.is_tombstoned,
                discard_point: data.discard_point,
                maybe_discard_point: data.maybe_discard_point,
                max_age_ms: data.max_age_ms,
            }))
    }
}

/// The final keep/drop decision for one data prepare.
fn keep_prepare(info: &ChunkExecutionInfo, prepare: &PrepareRecord, point: &ScavengePoint) -> bool {
    if info.is_tombstoned {
        if is_metastream(&prepare.stream_name) {
            // A tombstoned metadata stream keeps nothing.
            return false;
        }
        // A tombstoned original stream keeps only its tombstone.
        return prepare.is_tombstone();
    }
    if prepare.is_tombstone() {
        return true;
    }
    if info.discard_point.should_discard(prepare.event_number) {
        return false;
    }
    if info.maybe_discard_point.should_discard(prepare.event_number) {
        // Deferred age decision: exact timestamp against the cutoff.
        if let Some(max_age_ms) = info.max_age_ms {
            if let Some(cutoff) = point.age_cutoff(max_age_ms) {
                return prepare.timestamp >= cutoff;
            }
        }
        return true;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_file_name;
    use crate::codec::{CommitRecord, PrepareFlags};
    use crate::types::DiscardPoint;
    use bytes::Bytes;

    const CHUNK_SIZE: u32 = 65_536;

    fn prepare(stream: &str, event_number: u64, log_position: u64) -> PrepareRecord {
        PrepareRecord {
            log_position,
            transaction_position: log_position,
            flags: PrepareFlags::DATA | PrepareFlags::IS_COMMITTED,
            stream_name: stream.to_string(),
            event_number,
            timestamp: 1_000,
            event_type: "test".to_string(),
            data: Bytes::from_static(b"payload"),
            metadata: Bytes::new(),
        }
    }

    fn header(number: u32) -> ChunkHeader {
        ChunkHeader {
            version: codec::CHUNK_FORMAT_VERSION,
            min_compatible_version: 0,
            chunk_size: CHUNK_SIZE,
            chunk_start_number: number,
            chunk_end_number: number,
            is_scavenged: false,
            transform_type: 0,
            chunk_id: uuid::Uuid::new_v4(),
        }
    }

    fn write_chunk(dir: &std::path::Path, number: u32, records: &[LogRecord]) {
        let mut writer = ChunkWriter::create(
            dir.join(chunk_file_name(number, 0)),
            header(number),
        )
        .expect("create writer");
        for record in records {
            writer.append(record).expect("append");
        }
        let physical = writer.physical_data_size();
        writer.complete(physical).expect("complete");
    }

    fn harness() -> (tempfile::TempDir, ScavengeStateStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let state =
            ScavengeStateStore::open(&dir.path().join("scavenge.state")).expect("open state");
        (dir, state)
    }

    fn point(position: u64) -> ScavengePoint {
        ScavengePoint {
            position,
            event_number: 1,
            effective_now: 1_000_000,
            threshold: 0,
        }
    }

    fn stream_events(file: &ChunkFile, stream: &str) -> Vec<u64> {
        file.records
            .iter()
            .filter_map(|r| match r {
                LogRecord::Prepare(p) if p.stream_name == stream => Some(p.event_number),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn discarded_events_are_removed_in_order() {
        let (dir, mut state) = harness();
        let records: Vec<LogRecord> = (0u64..10)
            .map(|n| LogRecord::Prepare(prepare("bla", n, n * 64)))
            .collect();
        write_chunk(dir.path(), 0, &records);

        let handle = state.record_stream("bla");
        state.upsert_original(handle, |d| {
            d.discard_point = DiscardPoint::discard_before(7);
            d.maybe_discard_point = DiscardPoint::discard_before(7);
        });

        let chunks = ChunkManager::load(dir.path(), CHUNK_SIZE).expect("load");
        let cancel = CancellationFlag::new();
        execute_chunks(&mut state, &chunks, &point(u64::from(CHUNK_SIZE)), &cancel)
            .expect("execute");

        let rewritten = chunks.open_for_read(0).expect("open");
        assert!(rewritten.header.is_scavenged);
        assert_eq!(stream_events(&rewritten, "bla"), vec![7, 8, 9]);
        assert_eq!(chunks.version_of(0).expect("version"), 1, "version bumped");
    }

    #[test]
    fn below_threshold_chunk_is_left_untouched() {
        let (dir, mut state) = harness();
        let records: Vec<LogRecord> = (0u64..10)
            .map(|n| LogRecord::Prepare(prepare("bla", n, n * 64)))
            .collect();
        write_chunk(dir.path(), 0, &records);

        let handle = state.record_stream("bla");
        state.upsert_original(handle, |d| {
            d.discard_point = DiscardPoint::discard_before(7);
            d.maybe_discard_point = DiscardPoint::discard_before(7);
        });

        let chunks = ChunkManager::load(dir.path(), CHUNK_SIZE).expect("load");
        let cancel = CancellationFlag::new();
        let mut p = point(u64::from(CHUNK_SIZE));
        p.threshold = u64::MAX;
        execute_chunks(&mut state, &chunks, &p, &cancel).expect("execute");

        let untouched = chunks.open_for_read(0).expect("open");
        assert!(!untouched.header.is_scavenged);
        assert_eq!(untouched.records.len(), 10);
        assert_eq!(chunks.version_of(0).expect("version"), 0);
    }

    #[test]
    fn below_threshold_chunk_defers_its_streams() {
        let (dir, mut state) = harness();
        let records: Vec<LogRecord> = (0u64..10)
            .map(|n| LogRecord::Prepare(prepare("bla", n, n * 64)))
            .collect();
        write_chunk(dir.path(), 0, &records);

        let handle = state.record_stream("bla");
        state.upsert_original(handle.clone(), |d| {
            d.discard_point = DiscardPoint::discard_before(7);
            d.maybe_discard_point = DiscardPoint::discard_before(7);
        });

        let chunks = ChunkManager::load(dir.path(), CHUNK_SIZE).expect("load");
        let cancel = CancellationFlag::new();
        let mut p = point(u64::from(CHUNK_SIZE));
        p.threshold = u64::MAX;
        execute_chunks(&mut state, &chunks, &p, &cancel).expect("execute");
        assert!(
            state.is_deferred(&handle),
            "the skipped chunk still holds the stream's discardable records"
        );

        // A fresh pass that clears the threshold rewrites the chunk and
        // drops the deferral.
        state
            .set_checkpoint(ScavengeCheckpoint::ExecutingChunks {
                point: point(u64::from(CHUNK_SIZE)),
                done_chunk: None,
            })
            .expect("checkpoint");
        execute_chunks(&mut state, &chunks, &point(u64::from(CHUNK_SIZE)), &cancel)
            .expect("execute");
        assert!(!state.is_deferred(&handle));
        let rewritten = chunks.open_for_read(0).expect("open");
        assert_eq!(stream_events(&rewritten, "bla"), vec![7, 8, 9]);
    }

    #[test]
    fn tombstoned_stream_keeps_only_the_tombstone() {
        let (dir, mut state) = harness();
        let mut records: Vec<LogRecord> = (0u64..9)
            .map(|n| LogRecord::Prepare(prepare("bla", n, n * 64)))
            .collect();
        let mut tombstone = prepare("bla", crate::types::TOMBSTONE_EVENT_NUMBER, 9 * 64);
        tombstone.flags |= PrepareFlags::DELETE_TOMBSTONE;
        records.push(LogRecord::Prepare(tombstone));
        write_chunk(dir.path(), 0, &records);

        let handle = state.record_stream("bla");
        state.upsert_original(handle, |d| {
            d.is_tombstoned = true;
            d.discard_point =
                DiscardPoint::discard_before(crate::types::TOMBSTONE_EVENT_NUMBER);
            d.maybe_discard_point = d.discard_point;
        });

        let chunks = ChunkManager::load(dir.path(), CHUNK_SIZE).expect("load");
        let cancel = CancellationFlag::new();
        execute_chunks(&mut state, &chunks, &point(u64::from(CHUNK_SIZE)), &cancel)
            .expect("execute");

        let rewritten = chunks.open_for_read(0).expect("open");
        assert_eq!(
            stream_events(&rewritten, "bla"),
            vec![crate::types::TOMBSTONE_EVENT_NUMBER]
        );
    }

    #[test]
    fn maybe_discard_resolves_against_exact_timestamps() {
        let (dir, mut state) = harness();
        // Events 0..4: old timestamps; 4..8: new timestamps. All inside the
        // maybe region; only the genuinely expired ones go.
        let records: Vec<LogRecord> = (0u64..8)
            .map(|n| {
                let mut p = prepare("bla", n, n * 64);
                p.timestamp = if n < 4 { 100_000 } else { 900_000 };
                LogRecord::Prepare(p)
            })
            .collect();
        write_chunk(dir.path(), 0, &records);

        let handle = state.record_stream("bla");
        state.upsert_original(handle, |d| {
            d.max_age_ms = Some(400_000); // cutoff = 600_000
            d.discard_point = DiscardPoint::KEEP_ALL;
            d.maybe_discard_point = DiscardPoint::discard_before(8);
        });

        let chunks = ChunkManager::load(dir.path(), CHUNK_SIZE).expect("load");
        let cancel = CancellationFlag::new();
        execute_chunks(&mut state, &chunks, &point(u64::from(CHUNK_SIZE)), &cancel)
            .expect("execute");

        let rewritten = chunks.open_for_read(0).expect("open");
        assert_eq!(stream_events(&rewritten, "bla"), vec![4, 5, 6, 7]);
    }

    #[test]
    fn fully_discarded_transaction_drops_its_markers() {
        let (dir, mut state) = harness();
        let transaction_position = 0u64;
        let mut data1 = prepare("bla", 0, 64);
        data1.flags = PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN;
        data1.transaction_position = transaction_position;
        let mut data2 = prepare("bla", 1, 128);
        data2.flags = PrepareFlags::DATA | PrepareFlags::TRANSACTION_END;
        data2.transaction_position = transaction_position;
        let commit = LogRecord::Commit(CommitRecord {
            log_position: 192,
            transaction_position,
            first_event_number: 0,
            timestamp: 1_000,
        });
        let records = vec![
            LogRecord::Prepare(data1),
            LogRecord::Prepare(data2),
            commit,
        ];
        write_chunk(dir.path(), 0, &records);

        let handle = state.record_stream("bla");
        state.upsert_original(handle, |d| {
            d.discard_point = DiscardPoint::discard_before(2);
            d.maybe_discard_point = DiscardPoint::discard_before(2);
        });

        let chunks = ChunkManager::load(dir.path(), CHUNK_SIZE).expect("load");
        let cancel = CancellationFlag::new();
        execute_chunks(&mut state, &chunks, &point(u64::from(CHUNK_SIZE)), &cancel)
            .expect("execute");

        let rewritten = chunks.open_for_read(0).expect("open");
        assert!(
            rewritten.records.is_empty(),
            "markers of a fully discarded single-chunk transaction are dropped"
        );
    }

    #[test]
    fn partially_kept_transaction_keeps_its_commit() {
        let (dir, mut state) = harness();
        let transaction_position = 0u64;
        let mut data1 = prepare("bla", 0, 0);
        data1.flags = PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN;
        data1.transaction_position = transaction_position;
        let mut data2 = prepare("bla", 1, 64);
        data2.flags = PrepareFlags::DATA | PrepareFlags::TRANSACTION_END;
        data2.transaction_position = transaction_position;
        let commit = LogRecord::Commit(CommitRecord {
            log_position: 128,
            transaction_position,
            first_event_number: 0,
            timestamp: 1_000,
        });
        write_chunk(
            dir.path(),
            0,
            &[LogRecord::Prepare(data1), LogRecord::Prepare(data2), commit],
        );

        let handle = state.record_stream("bla");
        state.upsert_original(handle, |d| {
            d.discard_point = DiscardPoint::discard_before(1);
            d.maybe_discard_point = DiscardPoint::discard_before(1);
        });

        let chunks = ChunkManager::load(dir.path(), CHUNK_SIZE).expect("load");
        let cancel = CancellationFlag::new();
        execute_chunks(&mut state, &chunks, &point(u64::from(CHUNK_SIZE)), &cancel)
            .expect("execute");

        let rewritten = chunks.open_for_read(0).expect("open");
        assert_eq!(stream_events(&rewritten, "bla"), vec![1]);
        assert!(
            rewritten
                .records
                .iter()
                .any(|r| matches!(r, LogRecord::Commit(_))),
            "commit survives because one governed record was kept"
        );
    }

    #[test]
    fn boundary_spanning_transaction_keeps_its_commit_unconditionally() {
        let (dir, mut state) = harness();
        // The transaction began in chunk 0; its commit lands in chunk 1.
        let chunk1_base = u64::from(CHUNK_SIZE);
        let mut data = prepare("bla", 0, chunk1_base);
        data.flags = PrepareFlags::DATA | PrepareFlags::TRANSACTION_END;
        data.transaction_position = 100; // in chunk 0
        let commit = LogRecord::Commit(CommitRecord {
            log_position: chunk1_base + 64,
            transaction_position: 100,
            first_event_number: 0,
            timestamp: 1_000,
        });
        write_chunk(dir.path(), 0, &[]);
        write_chunk(dir.path(), 1, &[LogRecord::Prepare(data), commit]);

        let handle = state.record_stream("bla");
        state.upsert_original(handle, |d| {
            d.discard_point = DiscardPoint::discard_before(1);
            d.maybe_discard_point = DiscardPoint::discard_before(1);
        });

        let chunks = ChunkManager::load(dir.path(), CHUNK_SIZE).expect("load");
        let cancel = CancellationFlag::new();
        execute_chunks(&mut state, &chunks, &point(2 * u64::from(CHUNK_SIZE)), &cancel)
            .expect("execute");

        let rewritten = chunks.open_for_read(1).expect("open");
        assert!(
            rewritten
                .records
                .iter()
                .any(|r| matches!(r, LogRecord::Commit(_))),
            "boundary-spanning commit must survive even with all data dropped"
        );
    }

    #[test]
    fn records_past_the_scavenge_point_are_untouched() {
        let (dir, mut state) = harness();
        let records: Vec<LogRecord> = (0u64..4)
            .map(|n| LogRecord::Prepare(prepare("bla", n, n * 64)))
            .collect();
        write_chunk(dir.path(), 0, &records);

        let handle = state.record_stream("bla");
        state.upsert_original(handle, |d| {
            d.discard_point = DiscardPoint::discard_before(4);
            d.maybe_discard_point = DiscardPoint::discard_before(4);
        });

        // Scavenge point cuts the chunk in half: only events 0 and 1 are in
        // scope, 2 and 3 are past the point and must stay.
        let chunks = ChunkManager::load(dir.path(), CHUNK_SIZE).expect("load");
        let cancel = CancellationFlag::new();
        execute_chunks(&mut state, &chunks, &point(2 * 64), &cancel).expect("execute");

        let rewritten = chunks.open_for_read(0).expect("open");
        assert_eq!(stream_events(&rewritten, "bla"), vec![2, 3]);
    }
}
