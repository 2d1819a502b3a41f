//! Durable scavenge state: per-stream metadata, collision sets, chunk
//! timestamp ranges, and the pipeline checkpoint.
//!
//! This is the only mutable state shared between phases. Phases run strictly
//! sequentially, so the store needs no internal locking; it needs durability.
//! Every checkpoint write serializes the full state to a snapshot file using
//! write-temp-then-rename, so a crash at any moment leaves either the
//! previous snapshot or the new one -- never a torn mix.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::collisions::CollisionDetector;
use crate::error::Error;
use crate::types::{
    ChunkTimeStampRange, DiscardPoint, MetastreamData, OriginalStreamData, ScavengeCheckpoint,
    ScavengePoint, StreamHandle, StreamStatus,
};

/// Magic bytes identifying a scavenge state snapshot (ASCII "SCVS").
const SNAPSHOT_MAGIC: [u8; 4] = [0x53, 0x43, 0x56, 0x53];

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// Durable key/value store of all scavenge state.
///
/// Keys are [`StreamHandle`]s; the `BTreeMap`s give the Calculator its
/// fixed, resumable iteration order (hash order, then name order for
/// collided streams). All state is positively looked up by key -- entries
/// are never aliased.
#[derive(Debug)]
pub struct ScavengeStateStore {
    path: PathBuf,
    detector: CollisionDetector,
    originals: BTreeMap<StreamHandle, OriginalStreamData>,
    metastreams: BTreeMap<StreamHandle, MetastreamData>,
    chunk_ranges: BTreeMap<u32, ChunkTimeStampRange>,
    /// Streams whose discardable records still sit in a chunk the executor
    /// skipped for falling below the rewrite threshold. Their entries stay
    /// `Archived` through this run's cleaning.
    deferred: BTreeSet<StreamHandle>,
    checkpoint: Option<ScavengeCheckpoint>,
}

impl ScavengeStateStore {
    /// Open the store backed by the snapshot file at `path`.
    ///
    /// A missing file yields an empty store (fresh database). A present but
    /// unparseable file is structural corruption.
    ///
    /// # Errors
    ///
    /// [`Error::CorruptState`] if the snapshot fails magic/version/CRC
    /// validation; [`Error::Io`] for filesystem failures.
    pub fn open(path: &Path) -> Result<ScavengeStateStore, Error> {
        if !path.exists() {
            return Ok(ScavengeStateStore {
                path: path.to_path_buf(),
                detector: CollisionDetector::new(),
                originals: BTreeMap::new(),
                metastreams: BTreeMap::new(),
                chunk_ranges: BTreeMap::new(),
                deferred: BTreeSet::new(),
                checkpoint: None,
            });
        }
        let data = std::fs::read(path)?;
        let mut store = Self::decode_snapshot(&data)?;
        store.path = path.to_path_buf();
        Ok(store)
    }

    // -- collision detection ------------------------------------------------

    /// The collision detector. Read-only; mutation goes through
    /// [`ScavengeStateStore::record_stream`].
    pub fn detector(&self) -> &CollisionDetector {
        &self.detector
    }

    /// Record a stream name with the collision detector and, on a fresh
    /// collision, migrate all hash-keyed state for that hash to id-keyed
    /// entries for both colliding names.
    ///
    /// Returns the canonical handle for `stream_name` after the update.
    pub fn record_stream(&mut self, stream_name: &str) -> StreamHandle {
        use crate::types::CollisionResult;

        let hash = crate::types::stream_hash(stream_name);
        // A new collision implies a previously seen name for the hash.
        let old_name = self.detector.first_name_for(hash).map(str::to_string);
        if self.detector.record(stream_name) == CollisionResult::NewCollision {
            if let Some(old_name) = old_name {
                tracing::info!(
                    hash = format_args!("{hash:#018X}"),
                    old = %old_name,
                    new = %stream_name,
                    "hash collision detected; migrating state to id-keyed form"
                );
                self.migrate_hash_to_id(hash, &old_name);
            }
        }
        self.detector.handle_for(stream_name)
    }

    /// Rewrite any `Hash(hash)`-keyed entries under `Id(owner)` keys.
    ///
    /// Hash-keyed state can only belong to the first-seen name for the hash,
    /// so migration moves each map's entry (if present) to that name's id key.
    fn migrate_hash_to_id(&mut self, hash: u64, owner: &str) {
        let hash_key = StreamHandle::Hash(hash);
        if let Some(data) = self.originals.remove(&hash_key) {
            self.originals.insert(StreamHandle::Id(owner.to_string()), data);
        }
        if let Some(data) = self.metastreams.remove(&hash_key) {
            self.metastreams
                .insert(StreamHandle::Id(owner.to_string()), data);
        }
        if self.deferred.remove(&hash_key) {
            self.deferred.insert(StreamHandle::Id(owner.to_string()));
        }
    }

    /// Test support: seed the detector's first-seen name for a hash, so a
    /// later sighting of a different name under that hash collides.
    #[cfg(test)]
    pub(crate) fn plant_first_name(&mut self, hash: u64, name: &str) {
        self.detector.plant_first_name(hash, name);
    }

    // -- original stream data ----------------------------------------------

    /// Look up original-stream data by handle.
    pub fn original(&self, handle: &StreamHandle) -> Option<&OriginalStreamData> {
        self.originals.get(handle)
    }

    /// Look up original-stream data by stream name, enforcing the collision
    /// invariant.
    ///
    /// # Errors
    ///
    /// [`Error::UnexpectedCollision`] if the name's hash is in the collision
    /// set but a hash-keyed entry still exists -- an accumulation-ordering
    /// bug that must not be silently recovered.
    pub fn original_for_stream(
        &self,
        stream_name: &str,
    ) -> Result<Option<&OriginalStreamData>, Error> {
        let handle = self.detector.handle_for(stream_name);
        if let StreamHandle::Id(_) = &handle {
            let hash = crate::types::stream_hash(stream_name);
            if self.originals.contains_key(&StreamHandle::Hash(hash)) {
                return Err(Error::UnexpectedCollision {
                    hash,
                    handle: StreamHandle::Hash(hash),
                });
            }
        }
        Ok(self.originals.get(&handle))
    }

    /// Create-or-update original-stream data under the canonical handle for
    /// its current collision status.
    pub fn upsert_original<F>(&mut self, handle: StreamHandle, update: F)
    where
        F: FnOnce(&mut OriginalStreamData),
    {
        let entry = self.originals.entry(handle).or_default();
        update(entry);
    }

    /// Iterate original-stream entries in handle order starting strictly
    /// after `after` (or from the beginning when `after` is `None`).
    ///
    /// This is the Calculator's resumable cursor.
    pub fn originals_after<'a>(
        &'a self,
        after: Option<&StreamHandle>,
    ) -> impl Iterator<Item = (&'a StreamHandle, &'a OriginalStreamData)> + 'a {
        use std::ops::Bound;
        let lower = match after {
            Some(handle) => Bound::Excluded(handle.clone()),
            None => Bound::Unbounded,
        };
        self.originals.range((lower, Bound::Unbounded))
    }

    /// All original-stream handles, for tests and the cleaner.
    pub fn original_handles(&self) -> Vec<StreamHandle> {
        self.originals.keys().cloned().collect()
    }

    /// Remove an original-stream entry. Returns whether it existed.
    pub fn remove_original(&mut self, handle: &StreamHandle) -> bool {
        self.originals.remove(handle).is_some()
    }

    // -- metastream data ----------------------------------------------------

    /// Look up metastream data by handle.
    pub fn metastream(&self, handle: &StreamHandle) -> Option<&MetastreamData> {
        self.metastreams.get(handle)
    }

    /// Create-or-update metastream data.
    pub fn upsert_metastream<F>(&mut self, handle: StreamHandle, update: F)
    where
        F: FnOnce(&mut MetastreamData),
    {
        let entry = self.metastreams.entry(handle).or_default();
        update(entry);
    }

    /// All metastream handles.
    pub fn metastream_handles(&self) -> Vec<StreamHandle> {
        self.metastreams.keys().cloned().collect()
    }

    /// Remove a metastream entry. Returns whether it existed.
    pub fn remove_metastream(&mut self, handle: &StreamHandle) -> bool {
        self.metastreams.remove(handle).is_some()
    }

    // -- chunk timestamp ranges ----------------------------------------------

    /// The recorded timestamp range of a chunk, if accumulated.
    pub fn chunk_range(&self, chunk: u32) -> Option<ChunkTimeStampRange> {
        self.chunk_ranges.get(&chunk).copied()
    }

    /// Record (or widen) a chunk's timestamp range.
    pub fn set_chunk_range(&mut self, chunk: u32, range: ChunkTimeStampRange) {
        self.chunk_ranges.insert(chunk, range);
    }

    // -- deferred archival ----------------------------------------------------

    /// Mark a stream as still holding discardable records in a chunk the
    /// executor left untouched (removable weight below the threshold).
    ///
    /// Deferred entries are not eligible for cleaning: they stay `Archived`
    /// so a later run, whose execution may clear the threshold, still finds
    /// their discard points.
    pub fn mark_deferred(&mut self, handle: StreamHandle) {
        self.deferred.insert(handle);
    }

    /// Whether the current run's chunk execution deferred this stream.
    pub fn is_deferred(&self, handle: &StreamHandle) -> bool {
        self.deferred.contains(handle)
    }

    /// Reset the deferred set. Called when a chunk execution pass starts
    /// fresh (not on resume), so stale deferrals from the previous run do not
    /// outlive the chunks that caused them.
    pub fn clear_deferred(&mut self) {
        self.deferred.clear();
    }

    // -- checkpoint -----------------------------------------------------------

    /// The persisted checkpoint, if any.
    pub fn checkpoint(&self) -> Option<&ScavengeCheckpoint> {
        self.checkpoint.as_ref()
    }

    /// Persist `checkpoint` along with the full state, atomically.
    ///
    /// This is the pipeline's durability point: a phase calls it after each
    /// completed unit of work, and a crash rolls back to exactly the last
    /// call.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the snapshot cannot be written; the previous snapshot
    /// remains intact in that case.
    pub fn set_checkpoint(&mut self, checkpoint: ScavengeCheckpoint) -> Result<(), Error> {
        self.checkpoint = Some(checkpoint);
        self.flush()
    }

    /// Serialize the full state and atomically replace the snapshot file.
    fn flush(&self) -> Result<(), Error> {
        let encoded = self.encode_snapshot()?;
        let temp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&temp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp, &self.path)?;
        if let Some(parent) = self.path.parent() {
            let dir_handle = File::open(parent)?;
            dir_handle.sync_all()?;
        }
        Ok(())
    }

    // -- snapshot codec -------------------------------------------------------

    fn encode_snapshot(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.push(SNAPSHOT_VERSION);

        // Collision detector: seen map, then collision set.
        buf.extend_from_slice(&(self.detector.seen_len() as u32).to_le_bytes());
        let mut seen: Vec<(u64, &str)> = self.detector.seen_entries().collect();
        seen.sort(); // deterministic snapshots
        for (hash, name) in seen {
            buf.extend_from_slice(&hash.to_le_bytes());
            encode_str(&mut buf, name)?;
        }
        let mut collisions: Vec<u64> = self.detector.collisions().collect();
        collisions.sort();
        buf.extend_from_slice(&(collisions.len() as u32).to_le_bytes());
        for hash in collisions {
            buf.extend_from_slice(&hash.to_le_bytes());
        }

        // Original streams.
        buf.extend_from_slice(&(self.originals.len() as u32).to_le_bytes());
        for (handle, data) in &self.originals {
            encode_handle(&mut buf, handle)?;
            buf.push(encode_status(data.status));
            encode_opt_u64(&mut buf, data.max_count);
            encode_opt_u64(&mut buf, data.max_age_ms);
            encode_opt_u64(&mut buf, data.truncate_before);
            buf.push(u8::from(data.is_tombstoned));
            buf.extend_from_slice(&data.discard_point.first_event_to_keep().to_le_bytes());
            buf.extend_from_slice(
                &data.maybe_discard_point.first_event_to_keep().to_le_bytes(),
            );
        }

        // Metastreams.
        buf.extend_from_slice(&(self.metastreams.len() as u32).to_le_bytes());
        for (handle, data) in &self.metastreams {
            encode_handle(&mut buf, handle)?;
            buf.push(encode_status(data.status));
            buf.push(u8::from(data.is_tombstoned));
            buf.extend_from_slice(&data.discard_point.first_event_to_keep().to_le_bytes());
        }

        // Chunk timestamp ranges.
        buf.extend_from_slice(&(self.chunk_ranges.len() as u32).to_le_bytes());
        for (chunk, range) in &self.chunk_ranges {
            buf.extend_from_slice(&chunk.to_le_bytes());
            buf.extend_from_slice(&range.min.to_le_bytes());
            buf.extend_from_slice(&range.max.to_le_bytes());
        }

        // Deferred handles.
        buf.extend_from_slice(&(self.deferred.len() as u32).to_le_bytes());
        for handle in &self.deferred {
            encode_handle(&mut buf, handle)?;
        }

        // Checkpoint.
        match &self.checkpoint {
            None => buf.push(0),
            Some(cp) => {
                buf.push(1);
                encode_checkpoint(&mut buf, cp)?;
            }
        }

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    fn decode_snapshot(data: &[u8]) -> Result<ScavengeStateStore, Error> {
        if data.len() < 9 {
            return Err(Error::CorruptState(format!(
                "snapshot too short: {} bytes",
                data.len()
            )));
        }
        if data[0..4] != SNAPSHOT_MAGIC {
            return Err(Error::CorruptState(
                "wrong magic bytes: expected SCVS".to_string(),
            ));
        }
        if data[4] != SNAPSHOT_VERSION {
            return Err(Error::CorruptState(format!(
                "unsupported snapshot version: {}",
                data[4]
            )));
        }
        let crc_offset = data.len() - 4;
        let stored_crc = u32::from_le_bytes(
            data[crc_offset..].try_into().expect("4 bytes for u32"),
        );
        let computed_crc = crc32fast::hash(&data[..crc_offset]);
        if stored_crc != computed_crc {
            return Err(Error::CorruptState(format!(
                "CRC32 mismatch: stored {stored_crc:#010X}, computed {computed_crc:#010X}"
            )));
        }

        let mut reader = SnapshotReader {
            data: &data[..crc_offset],
            cursor: 5,
        };

        let seen_count = reader.u32()? as usize;
        let mut seen = HashMap::with_capacity(seen_count);
        for _ in 0..seen_count {
            let hash = reader.u64()?;
            let name = reader.str()?;
            seen.insert(hash, name);
        }
        let collision_count = reader.u32()? as usize;
        let mut collisions = HashSet::with_capacity(collision_count);
        for _ in 0..collision_count {
            collisions.insert(reader.u64()?);
        }

        let original_count = reader.u32()? as usize;
        let mut originals = BTreeMap::new();
        for _ in 0..original_count {
            let handle = reader.handle()?;
            let status = decode_status(reader.u8()?)?;
            let max_count = reader.opt_u64()?;
            let max_age_ms = reader.opt_u64()?;
            let truncate_before = reader.opt_u64()?;
            let is_tombstoned = reader.u8()? != 0;
            let discard_point = DiscardPoint::discard_before(reader.u64()?);
            let maybe_discard_point = DiscardPoint::discard_before(reader.u64()?);
            originals.insert(
                handle,
                OriginalStreamData {
                    status,
                    max_count,
                    max_age_ms,
                    truncate_before,
                    is_tombstoned,
                    discard_point,
                    maybe_discard_point,
                },
            );
        }

        let metastream_count = reader.u32()? as usize;
        let mut metastreams = BTreeMap::new();
        for _ in 0..metastream_count {
            let handle = reader.handle()?;
            let status = decode_status(reader.u8()?)?;
            let is_tombstoned = reader.u8()? != 0;
            let discard_point = DiscardPoint::discard_before(reader.u64()?);
            metastreams.insert(
                handle,
                MetastreamData {
                    status,
                    is_tombstoned,
                    discard_point,
                },
            );
        }

        let range_count = reader.u32()? as usize;
        let mut chunk_ranges = BTreeMap::new();
        for _ in 0..range_count {
            let chunk = reader.u32()?;
            let min = reader.u64()?;
            let max = reader.u64()?;
            chunk_ranges.insert(chunk, ChunkTimeStampRange { min, max });
        }

        let deferred_count = reader.u32()? as usize;
        let mut deferred = BTreeSet::new();
        for _ in 0..deferred_count {
            deferred.insert(reader.handle()?);
        }

        let checkpoint = match reader.u8()? {
            0 => None,
            1 => Some(reader.checkpoint()?),
            other => {
                return Err(Error::CorruptState(format!(
                    "bad checkpoint presence byte: {other}"
                )))
            }
        };

        Ok(ScavengeStateStore {
            path: PathBuf::new(),
            detector: CollisionDetector::from_parts(seen, collisions),
            originals,
            metastreams,
            chunk_ranges,
            deferred,
            checkpoint,
        })
    }
}

// -- snapshot primitives -----------------------------------------------------

fn encode_str(buf: &mut Vec<u8>, s: &str) -> Result<(), Error> {
    // A longer string would truncate its u16 length prefix and misparse on
    // the next open, with the CRC none the wiser.
    if s.len() > u16::MAX as usize {
        return Err(Error::InvalidArgument(format!(
            "string of {} bytes exceeds the snapshot's u16 length prefix",
            s.len()
        )));
    }
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn encode_handle(buf: &mut Vec<u8>, handle: &StreamHandle) -> Result<(), Error> {
    match handle {
        StreamHandle::None => buf.push(0),
        StreamHandle::Hash(h) => {
            buf.push(1);
            buf.extend_from_slice(&h.to_le_bytes());
        }
        StreamHandle::Id(name) => {
            buf.push(2);
            encode_str(buf, name)?;
        }
    }
    Ok(())
}

fn encode_opt_u64(buf: &mut Vec<u8>, value: Option<u64>) {
    match value {
        None => buf.push(0),
        Some(v) => {
            buf.push(1);
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
}

fn encode_status(status: StreamStatus) -> u8 {
    match status {
        StreamStatus::Active => 0,
        StreamStatus::Archived => 1,
        StreamStatus::Spent => 2,
    }
}

fn decode_status(byte: u8) -> Result<StreamStatus, Error> {
    match byte {
        0 => Ok(StreamStatus::Active),
        1 => Ok(StreamStatus::Archived),
        2 => Ok(StreamStatus::Spent),
        other => Err(Error::CorruptState(format!("bad status byte: {other}"))),
    }
}

fn encode_point(buf: &mut Vec<u8>, point: &ScavengePoint) {
    buf.extend_from_slice(&point.position.to_le_bytes());
    buf.extend_from_slice(&point.event_number.to_le_bytes());
    buf.extend_from_slice(&point.effective_now.to_le_bytes());
    buf.extend_from_slice(&point.threshold.to_le_bytes());
}

fn encode_opt_u32(buf: &mut Vec<u8>, value: Option<u32>) {
    match value {
        None => buf.push(0),
        Some(v) => {
            buf.push(1);
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
}

fn encode_checkpoint(buf: &mut Vec<u8>, cp: &ScavengeCheckpoint) -> Result<(), Error> {
    match cp {
        ScavengeCheckpoint::Accumulating { point, done_chunk } => {
            buf.push(0);
            encode_point(buf, point);
            encode_opt_u32(buf, *done_chunk);
        }
        ScavengeCheckpoint::Calculating { point, done } => {
            buf.push(1);
            encode_point(buf, point);
            match done {
                None => buf.push(0),
                Some(handle) => {
                    buf.push(1);
                    encode_handle(buf, handle)?;
                }
            }
        }
        ScavengeCheckpoint::ExecutingChunks { point, done_chunk } => {
            buf.push(2);
            encode_point(buf, point);
            encode_opt_u32(buf, *done_chunk);
        }
        ScavengeCheckpoint::ExecutingIndex { point } => {
            buf.push(3);
            encode_point(buf, point);
        }
        ScavengeCheckpoint::MergingChunks { point } => {
            buf.push(4);
            encode_point(buf, point);
        }
        ScavengeCheckpoint::Cleaning { point } => {
            buf.push(5);
            encode_point(buf, point);
        }
        ScavengeCheckpoint::Done { point } => {
            buf.push(6);
            encode_point(buf, point);
        }
    }
    Ok(())
}

/// Cursor over the CRC-validated snapshot body.
struct SnapshotReader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> SnapshotReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.cursor + n > self.data.len() {
            return Err(Error::CorruptState(
                "unexpected end of snapshot".to_string(),
            ));
        }
        let start = self.cursor;
        self.cursor += n;
        Ok(&self.data[start..self.cursor])
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(
            self.take(2)?.try_into().expect("2 bytes for u16"),
        ))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(
            self.take(4)?.try_into().expect("4 bytes for u32"),
        ))
    }

    fn u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(
            self.take(8)?.try_into().expect("8 bytes for u64"),
        ))
    }

    fn str(&mut self) -> Result<String, Error> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| Error::CorruptState(format!("invalid UTF-8 in snapshot: {e}")))
    }

    fn opt_u64(&mut self) -> Result<Option<u64>, Error> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.u64()?)),
            other => Err(Error::CorruptState(format!(
                "bad option byte: {other}"
            ))),
        }
    }

    fn opt_u32(&mut self) -> Result<Option<u32>, Error> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.u32()?)),
            other => Err(Error::CorruptState(format!(
                "bad option byte: {other}"
            ))),
        }
    }

    fn handle(&mut self) -> Result<StreamHandle, Error> {
        match self.u8()? {
            0 => Ok(StreamHandle::None),
            1 => Ok(StreamHandle::Hash(self.u64()?)),
            2 => Ok(StreamHandle::Id(self.str()?)),
            other => Err(Error::CorruptState(format!(
                "bad handle tag: {other}"
            ))),
        }
    }

    fn point(&mut self) -> Result<ScavengePoint, Error> {
        Ok(ScavengePoint {
            position: self.u64()?,
            event_number: self.u64()?,
            effective_now: self.u64()?,
            threshold: self.u64()?,
        })
    }

    fn checkpoint(&mut self) -> Result<ScavengeCheckpoint, Error> {
        let tag = self.u8()?;
        let point = self.point()?;
        match tag {
            0 => Ok(ScavengeCheckpoint::Accumulating {
                point,
                done_chunk: self.opt_u32()?,
            }),
            1 => {
                let done = match self.u8()? {
                    0 => None,
                    1 => Some(self.handle()?),
                    other => {
                        return Err(Error::CorruptState(format!(
                            "bad option byte: {other}"
                        )))
                    }
                };
                Ok(ScavengeCheckpoint::Calculating { point, done })
            }
            2 => Ok(ScavengeCheckpoint::ExecutingChunks {
                point,
                done_chunk: self.opt_u32()?,
            }),
            3 => Ok(ScavengeCheckpoint::ExecutingIndex { point }),
            4 => Ok(ScavengeCheckpoint::MergingChunks { point }),
            5 => Ok(ScavengeCheckpoint::Cleaning { point }),
            6 => Ok(ScavengeCheckpoint::Done { point }),
            other => Err(Error::CorruptState(format!(
                "bad checkpoint tag: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> ScavengePoint {
        ScavengePoint {
            position: 8192,
            event_number: 1,
            effective_now: 1_700_000_000_000,
            threshold: 0,
        }
    }

    fn store_in(dir: &Path) -> ScavengeStateStore {
        ScavengeStateStore::open(&dir.join("scavenge.state")).expect("open")
    }

    #[test]
    fn open_missing_file_is_empty_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(dir.path());
        assert!(store.checkpoint().is_none());
        assert!(store.original_handles().is_empty());
    }

    #[test]
    fn snapshot_round_trips_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(dir.path());

        let orders = store.record_stream("orders");
        store.upsert_original(orders.clone(), |data| {
            data.max_count = Some(3);
            data.discard_point = DiscardPoint::discard_before(7);
        });
        let meta = store.record_stream("$$orders");
        store.upsert_metastream(meta.clone(), |data| {
            data.discard_point = DiscardPoint::discard_before(2);
        });
        store.set_chunk_range(0, ChunkTimeStampRange { min: 10, max: 90 });
        store.mark_deferred(orders.clone());
        store
            .set_checkpoint(ScavengeCheckpoint::Calculating {
                point: point(),
                done: Some(orders.clone()),
            })
            .expect("checkpoint");

        let reopened = store_in(dir.path());
        assert!(reopened.is_deferred(&orders));
        assert_eq!(
            reopened.original(&orders).expect("entry").max_count,
            Some(3)
        );
        assert_eq!(
            reopened.metastream(&meta).expect("entry").discard_point,
            DiscardPoint::discard_before(2)
        );
        assert_eq!(
            reopened.chunk_range(0),
            Some(ChunkTimeStampRange { min: 10, max: 90 })
        );
        assert_eq!(
            reopened.checkpoint(),
            Some(&ScavengeCheckpoint::Calculating {
                point: point(),
                done: Some(orders),
            })
        );
    }

    #[test]
    fn every_checkpoint_variant_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cases = vec![
            ScavengeCheckpoint::Accumulating {
                point: point(),
                done_chunk: None,
            },
            ScavengeCheckpoint::Accumulating {
                point: point(),
                done_chunk: Some(4),
            },
            ScavengeCheckpoint::Calculating {
                point: point(),
                done: None,
            },
            ScavengeCheckpoint::Calculating {
                point: point(),
                done: Some(StreamHandle::Id("bla".to_string())),
            },
            ScavengeCheckpoint::ExecutingChunks {
                point: point(),
                done_chunk: Some(2),
            },
            ScavengeCheckpoint::ExecutingIndex { point: point() },
            ScavengeCheckpoint::MergingChunks { point: point() },
            ScavengeCheckpoint::Cleaning { point: point() },
            ScavengeCheckpoint::Done { point: point() },
        ];
        for cp in cases {
            let mut store = store_in(dir.path());
            store.set_checkpoint(cp.clone()).expect("checkpoint");
            let reopened = store_in(dir.path());
            assert_eq!(reopened.checkpoint(), Some(&cp), "variant {cp:?}");
        }
    }

    #[test]
    fn torn_snapshot_is_corrupt_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scavenge.state");
        let mut store = ScavengeStateStore::open(&path).expect("open");
        store
            .set_checkpoint(ScavengeCheckpoint::Done { point: point() })
            .expect("checkpoint");

        let mut data = std::fs::read(&path).expect("read");
        data.truncate(data.len() - 2);
        std::fs::write(&path, &data).expect("write");

        let err = ScavengeStateStore::open(&path).expect_err("torn snapshot should fail");
        assert!(matches!(err, Error::CorruptState(_)), "got: {err:?}");
    }

    #[test]
    fn migration_moves_hash_entry_to_id_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(dir.path());

        // First sighting goes in under the hash key.
        let handle = store.record_stream("orders");
        assert!(matches!(handle, StreamHandle::Hash(_)));
        store.upsert_original(handle.clone(), |data| data.max_count = Some(5));
        store.mark_deferred(handle.clone());

        // Plant a fabricated first-name under the same hash to force the
        // next record_stream("orders") to collide, then verify migration.
        let hash = crate::types::stream_hash("orders");
        let mut seen = HashMap::new();
        seen.insert(hash, "imposter".to_string());
        store.detector = CollisionDetector::from_parts(seen, HashSet::new());

        let migrated = store.record_stream("orders");
        assert_eq!(migrated, StreamHandle::Id("orders".to_string()));
        assert!(
            store.original(&StreamHandle::Hash(hash)).is_none(),
            "hash-keyed entry must be gone"
        );
        // The hash entry belonged to the detector's first-seen name.
        assert_eq!(
            store
                .original(&StreamHandle::Id("imposter".to_string()))
                .expect("migrated entry")
                .max_count,
            Some(5)
        );
        // Deferral follows the entry to its id key.
        assert!(!store.is_deferred(&StreamHandle::Hash(hash)));
        assert!(store.is_deferred(&StreamHandle::Id("imposter".to_string())));
    }

    #[test]
    fn overlong_stream_name_is_rejected_at_flush() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(dir.path());
        let long_name = "x".repeat(u16::MAX as usize + 1);
        store.record_stream(&long_name);

        let err = store
            .set_checkpoint(ScavengeCheckpoint::Done { point: point() })
            .expect_err("a name too long for its length prefix must not encode");
        assert!(matches!(err, Error::InvalidArgument(_)), "got: {err:?}");
    }

    #[test]
    fn original_for_stream_detects_unmigrated_collision() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(dir.path());
        let hash = crate::types::stream_hash("orders");

        // Corrupt the invariant by hand: collided hash with a hash-keyed entry.
        let mut seen = HashMap::new();
        seen.insert(hash, "orders".to_string());
        let mut collisions = HashSet::new();
        collisions.insert(hash);
        store.detector = CollisionDetector::from_parts(seen, collisions);
        store
            .originals
            .insert(StreamHandle::Hash(hash), OriginalStreamData::default());

        let err = store
            .original_for_stream("orders")
            .expect_err("invariant violation must surface");
        assert!(matches!(err, Error::UnexpectedCollision { .. }));
    }

    #[test]
    fn originals_after_resumes_strictly_past_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(dir.path());
        for name in ["a", "b", "c"] {
            let handle = store.record_stream(name);
            store.upsert_original(handle, |_| {});
        }
        let all: Vec<StreamHandle> = store
            .originals_after(None)
            .map(|(h, _)| h.clone())
            .collect();
        assert_eq!(all.len(), 3);

        let resumed: Vec<StreamHandle> = store
            .originals_after(Some(&all[0]))
            .map(|(h, _)| h.clone())
            .collect();
        assert_eq!(resumed, all[1..].to_vec());
    }

    #[test]
    fn remove_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(dir.path());
        let handle = store.record_stream("orders");
        store.upsert_original(handle.clone(), |_| {});
        assert!(store.remove_original(&handle));
        assert!(!store.remove_original(&handle));
    }
}
