//! Core domain types for the scavenger.
//!
//! This module defines the value types every phase depends on: discard points,
//! stream handles (hash-or-name identity), per-stream retention state, the
//! immutable scavenge point, per-chunk timestamp bounds, and the durable
//! checkpoint that makes the pipeline resumable.

use std::fmt;

/// Prefix identifying metadata streams (`$$<original-stream-name>`).
pub const METASTREAM_PREFIX: &str = "$$";

/// Event number carried by a tombstone record.
///
/// A tombstone is written as the stream's final event with this sentinel
/// number, marking the stream permanently deleted.
pub const TOMBSTONE_EVENT_NUMBER: u64 = u64::MAX;

/// Compute the 64-bit hash of a stream name.
///
/// All phases key per-stream state by this hash until a collision is
/// detected, at which point the colliding streams are re-keyed by full name.
///
/// # Arguments
///
/// * `stream_name` - The stream's full UTF-8 name.
pub fn stream_hash(stream_name: &str) -> u64 {
    xxhash_rust::xxh3::xxh3_64(stream_name.as_bytes())
}

/// Returns `true` if `stream_name` is a metadata stream (`$$`-prefixed).
pub fn is_metastream(stream_name: &str) -> bool {
    stream_name.starts_with(METASTREAM_PREFIX)
}

/// Returns the original stream name a metadata stream describes.
///
/// Returns `None` if `stream_name` is not a metadata stream.
pub fn original_stream_of(stream_name: &str) -> Option<&str> {
    stream_name.strip_prefix(METASTREAM_PREFIX)
}

/// Refers to a stream either by its 64-bit name hash or by its full name.
///
/// The hash form is the cheap default. Once the [`CollisionDetector`] reports
/// that two distinct names share a hash, both streams are re-tracked by the
/// `Id` form everywhere in the scavenge state.
///
/// Invariant: a stream is referred to by `Id` if and only if its hash is a
/// member of the current collision set.
///
/// The derived ordering (`None` < `Hash` < `Id`, then by payload) is the
/// Calculator's resumable iteration order: hash order first, name order for
/// collided streams.
///
/// [`CollisionDetector`]: crate::collisions::CollisionDetector
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamHandle {
    /// No stream. Used only as the zero value of optional handle fields.
    None,
    /// The stream's 64-bit name hash (unique, as far as the detector knows).
    Hash(u64),
    /// The stream's full name (its hash collides with another stream's).
    Id(String),
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamHandle::None => write!(f, "none"),
            StreamHandle::Hash(h) => write!(f, "hash:{h:#018X}"),
            StreamHandle::Id(name) => write!(f, "id:{name}"),
        }
    }
}

/// Result of recording a stream name's hash with the collision detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionResult {
    /// First time this hash has been seen.
    NoCollision,
    /// A second distinct name just produced an already-seen hash. Both names
    /// must be migrated to id-keyed state.
    NewCollision,
    /// The hash was already known to collide.
    OldCollision,
}

/// Per-stream lifecycle status in the scavenge state store.
///
/// Transitions strictly forward: `Active` -> `Archived` (no further discards
/// expected before the next scavenge point) -> `Spent` (safe to delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// The stream must be (re)calculated for the current scavenge point.
    Active,
    /// The stream's discard points are final; it can be skipped next run
    /// unless new metadata re-activates it.
    Archived,
    /// No future phase needs this entry; the cleaner may delete it.
    Spent,
}

/// The first event number of a stream that must be kept.
///
/// All events numbered strictly below `first_event_to_keep` are discardable.
/// `KEEP_ALL` (discard before 0) keeps everything. The ordering is total, and
/// [`DiscardPoint::or`] combines two points by taking the stricter (larger)
/// one, which is how multiple retention policies compose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DiscardPoint {
    first_event_to_keep: u64,
}

impl DiscardPoint {
    /// The point that discards nothing.
    pub const KEEP_ALL: DiscardPoint = DiscardPoint {
        first_event_to_keep: 0,
    };

    /// Discard every event numbered strictly below `event_number`.
    pub fn discard_before(event_number: u64) -> DiscardPoint {
        DiscardPoint {
            first_event_to_keep: event_number,
        }
    }

    /// Discard every event numbered at or below `event_number`.
    ///
    /// Saturates at `u64::MAX`, which discards the entire representable
    /// range; used for tombstoned metadata streams where nothing survives.
    pub fn discard_including(event_number: u64) -> DiscardPoint {
        DiscardPoint {
            first_event_to_keep: event_number.saturating_add(1),
        }
    }

    /// The first event number this point keeps.
    pub fn first_event_to_keep(self) -> u64 {
        self.first_event_to_keep
    }

    /// Whether `event_number` falls before this point and must be discarded.
    pub fn should_discard(self, event_number: u64) -> bool {
        event_number < self.first_event_to_keep
    }

    /// Combine two discard points, keeping the stricter (larger) one.
    ///
    /// Commutative, associative, and idempotent.
    pub fn or(self, other: DiscardPoint) -> DiscardPoint {
        if other.first_event_to_keep > self.first_event_to_keep {
            other
        } else {
            self
        }
    }
}

/// Per-event decision produced by the Calculator and refined downstream.
///
/// `MaybeDiscard` arises when an age policy cannot be settled from the coarse
/// per-chunk timestamp range alone. The chunk executor resolves it with the
/// record's exact timestamp; the index executor, which has no per-event
/// timestamps, treats it as `Keep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardDecision {
    /// No retention policy applies to this event (e.g., it lies at or past
    /// the scavenge point).
    None,
    /// The event is certainly discardable.
    Discard,
    /// Age-ambiguous: deferred to a phase with exact timestamps.
    MaybeDiscard,
    /// The event must be kept.
    Keep,
}

/// Immutable marker defining one scavenge run.
///
/// Created once when a run starts and never mutated: all phases of the run,
/// including resumed ones, see the same log bound, the same `effective_now`
/// for age comparisons (so a multi-hour run is insensitive to wall-clock
/// drift), and the same rewrite threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScavengePoint {
    /// Exclusive upper bound: log positions at or past this are untouched.
    pub position: u64,
    /// Monotonically increasing number identifying this run.
    pub event_number: u64,
    /// Unix epoch milliseconds frozen at run start, used for max-age cutoffs.
    pub effective_now: u64,
    /// Minimum weight (bytes of discardable records) before a chunk is
    /// physically rewritten.
    pub threshold: u64,
}

impl ScavengePoint {
    /// The max-age cutoff: records older than this timestamp are expired.
    ///
    /// Returns `None` when the age exceeds `effective_now` (nothing in the
    /// log can be older than the epoch).
    pub fn age_cutoff(&self, max_age_ms: u64) -> Option<u64> {
        self.effective_now.checked_sub(max_age_ms)
    }
}

/// Inclusive `[min, max]` bound on the timestamps of every record in a chunk.
///
/// Recorded by the Accumulator and used by the Calculator to decide Discard
/// vs MaybeDiscard for age policies without reading individual records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTimeStampRange {
    /// Smallest record timestamp in the chunk (unix ms).
    pub min: u64,
    /// Largest record timestamp in the chunk (unix ms).
    pub max: u64,
}

impl ChunkTimeStampRange {
    /// Widen the range to include `timestamp`.
    pub fn extend(&mut self, timestamp: u64) {
        if timestamp < self.min {
            self.min = timestamp;
        }
        if timestamp > self.max {
            self.max = timestamp;
        }
    }

    /// A range containing exactly one timestamp.
    pub fn at(timestamp: u64) -> ChunkTimeStampRange {
        ChunkTimeStampRange {
            min: timestamp,
            max: timestamp,
        }
    }
}

/// Mutable per-stream record for an original (non-metadata) stream.
///
/// Retention fields are written by the Accumulator; discard points and status
/// by the Calculator; both executors read it through their projections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalStreamData {
    /// Calculation lifecycle status.
    pub status: StreamStatus,
    /// `$maxCount` retention: keep only the most recent N events.
    pub max_count: Option<u64>,
    /// `$maxAge` retention in milliseconds: expire events older than this.
    pub max_age_ms: Option<u64>,
    /// `$tb` retention: discard every event numbered below this.
    pub truncate_before: Option<u64>,
    /// The stream has been committed-deleted.
    pub is_tombstoned: bool,
    /// Events certainly discardable (exact policies).
    pub discard_point: DiscardPoint,
    /// Events possibly discardable pending exact-timestamp evaluation.
    pub maybe_discard_point: DiscardPoint,
}

impl Default for OriginalStreamData {
    fn default() -> Self {
        OriginalStreamData {
            status: StreamStatus::Active,
            max_count: None,
            max_age_ms: None,
            truncate_before: None,
            is_tombstoned: false,
            discard_point: DiscardPoint::KEEP_ALL,
            maybe_discard_point: DiscardPoint::KEEP_ALL,
        }
    }
}

impl OriginalStreamData {
    /// Whether any retention policy or tombstone applies to this stream.
    pub fn has_retention(&self) -> bool {
        self.is_tombstoned
            || self.max_count.is_some()
            || self.max_age_ms.is_some()
            || self.truncate_before.is_some()
    }
}

/// Mutable per-stream record for a `$$`-prefixed metadata stream.
///
/// Metadata streams never carry max-age/max-count themselves; only the
/// tombstone flag and the computed discard point are tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetastreamData {
    /// Calculation lifecycle status.
    pub status: StreamStatus,
    /// The original stream (and therefore this metastream) is tombstoned.
    pub is_tombstoned: bool,
    /// Events certainly discardable.
    pub discard_point: DiscardPoint,
}

impl Default for MetastreamData {
    fn default() -> Self {
        MetastreamData {
            status: StreamStatus::Active,
            is_tombstoned: false,
            discard_point: DiscardPoint::KEEP_ALL,
        }
    }
}

/// Read-only projection of [`OriginalStreamData`] for the chunk executor.
///
/// Carries `max_age_ms` so MaybeDiscard can be re-derived from each record's
/// exact timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkExecutionInfo {
    /// The stream is tombstoned: all prior data is discardable.
    pub is_tombstoned: bool,
    /// Events certainly discardable.
    pub discard_point: DiscardPoint,
    /// Events possibly discardable pending exact-timestamp evaluation.
    pub maybe_discard_point: DiscardPoint,
    /// Age policy for exact-timestamp re-evaluation.
    pub max_age_ms: Option<u64>,
}

/// Read-only projection for the index executor.
///
/// The index has no per-event timestamps, so only the coarse discard point
/// and the tombstone flag are needed; MaybeDiscard collapses to Keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexExecutionInfo {
    /// The stream is tombstoned: drop all entries except the tombstone's.
    pub is_tombstoned: bool,
    /// Events certainly discardable.
    pub discard_point: DiscardPoint,
}

/// Durable record of pipeline phase and progress.
///
/// Exactly one checkpoint is persisted at a time, overwritten atomically
/// after each unit of work. On restart the orchestrator resumes the phase
/// named here, at the unit after the recorded one, under the same
/// [`ScavengePoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScavengeCheckpoint {
    /// Scanning the log forward; `done_chunk` is the last fully accumulated
    /// logical chunk number, `None` before the first completes.
    Accumulating {
        /// The run this checkpoint belongs to.
        point: ScavengePoint,
        /// Last fully accumulated chunk, if any.
        done_chunk: Option<u32>,
    },
    /// Computing discard points; `done` is the last fully calculated stream
    /// handle in iteration order, `None` before the first completes.
    Calculating {
        /// The run this checkpoint belongs to.
        point: ScavengePoint,
        /// Last fully calculated stream handle, if any.
        done: Option<StreamHandle>,
    },
    /// Rewriting chunks; `done_chunk` is the last executed logical chunk.
    ExecutingChunks {
        /// The run this checkpoint belongs to.
        point: ScavengePoint,
        /// Last executed chunk, if any.
        done_chunk: Option<u32>,
    },
    /// Rebuilding the index generation.
    ExecutingIndex {
        /// The run this checkpoint belongs to.
        point: ScavengePoint,
    },
    /// Merging adjacent small scavenged chunks.
    MergingChunks {
        /// The run this checkpoint belongs to.
        point: ScavengePoint,
    },
    /// Deleting spent state entries.
    Cleaning {
        /// The run this checkpoint belongs to.
        point: ScavengePoint,
    },
    /// The run completed; the next call starts a fresh scavenge point.
    Done {
        /// The run this checkpoint belongs to.
        point: ScavengePoint,
    },
}

impl ScavengeCheckpoint {
    /// The scavenge point this checkpoint belongs to.
    pub fn point(&self) -> &ScavengePoint {
        match self {
            ScavengeCheckpoint::Accumulating { point, .. }
            | ScavengeCheckpoint::Calculating { point, .. }
            | ScavengeCheckpoint::ExecutingChunks { point, .. }
            | ScavengeCheckpoint::ExecutingIndex { point }
            | ScavengeCheckpoint::MergingChunks { point }
            | ScavengeCheckpoint::Cleaning { point }
            | ScavengeCheckpoint::Done { point } => point,
        }
    }

    /// Short phase name for logs.
    pub fn phase_name(&self) -> &'static str {
        match self {
            ScavengeCheckpoint::Accumulating { .. } => "accumulating",
            ScavengeCheckpoint::Calculating { .. } => "calculating",
            ScavengeCheckpoint::ExecutingChunks { .. } => "executing-chunks",
            ScavengeCheckpoint::ExecutingIndex { .. } => "executing-index",
            ScavengeCheckpoint::MergingChunks { .. } => "merging-chunks",
            ScavengeCheckpoint::Cleaning { .. } => "cleaning",
            ScavengeCheckpoint::Done { .. } => "done",
        }
    }
}
