//! Collision detection for 64-bit stream-name hashes.
//!
//! Every phase keys per-stream state by the stream name's 64-bit hash until
//! two distinct names are observed to share one. From that moment both
//! streams must be tracked by full name, and the hash never leaves the
//! collision set.

use std::collections::{HashMap, HashSet};

use crate::types::{stream_hash, CollisionResult, StreamHandle};

/// Detects 64-bit hash collisions between stream names.
///
/// Maintains the first name seen for every hash and the set of hashes known
/// to collide. The accumulator feeds every observed stream name through
/// [`CollisionDetector::record`] and migrates hash-keyed state on
/// [`CollisionResult::NewCollision`].
#[derive(Debug, Default, Clone)]
pub struct CollisionDetector {
    /// First stream name observed for each hash. Needed to identify the
    /// *other* party when a second name lands on an existing hash.
    seen: HashMap<u64, String>,
    /// Hashes with at least two distinct names. Entries are never removed.
    collisions: HashSet<u64>,
}

impl CollisionDetector {
    /// Create an empty detector.
    pub fn new() -> CollisionDetector {
        CollisionDetector::default()
    }

    /// Record a stream name's hash and classify the observation.
    ///
    /// - First sight of the hash: [`CollisionResult::NoCollision`].
    /// - A second distinct name with the same hash:
    ///   [`CollisionResult::NewCollision`]. The caller must migrate all
    ///   hash-keyed state for this hash to id-keyed state for *both* names
    ///   (the previously seen name is available via
    ///   [`CollisionDetector::first_name_for`] before this call).
    /// - A hash already in the collision set: [`CollisionResult::OldCollision`].
    pub fn record(&mut self, stream_name: &str) -> CollisionResult {
        let hash = stream_hash(stream_name);
        if self.collisions.contains(&hash) {
            return CollisionResult::OldCollision;
        }
        match self.seen.get(&hash) {
            None => {
                self.seen.insert(hash, stream_name.to_string());
                CollisionResult::NoCollision
            }
            Some(existing) if existing == stream_name => CollisionResult::NoCollision,
            Some(_) => {
                self.collisions.insert(hash);
                CollisionResult::NewCollision
            }
        }
    }

    /// The first stream name observed for `hash`, if any.
    ///
    /// Used by the migration step to identify the original party of a fresh
    /// collision.
    pub fn first_name_for(&self, hash: u64) -> Option<&str> {
        self.seen.get(&hash).map(String::as_str)
    }

    /// Whether `hash` is a member of the collision set.
    pub fn is_collision(&self, hash: u64) -> bool {
        self.collisions.contains(&hash)
    }

    /// The canonical [`StreamHandle`] for a stream name: `Id` if its hash
    /// collides, `Hash` otherwise.
    pub fn handle_for(&self, stream_name: &str) -> StreamHandle {
        let hash = stream_hash(stream_name);
        if self.collisions.contains(&hash) {
            StreamHandle::Id(stream_name.to_string())
        } else {
            StreamHandle::Hash(hash)
        }
    }

    /// Iterate the collision set.
    pub fn collisions(&self) -> impl Iterator<Item = u64> + '_ {
        self.collisions.iter().copied()
    }

    /// Iterate `(hash, first_name)` pairs of every hash seen, for snapshot
    /// serialization.
    pub(crate) fn seen_entries(&self) -> impl Iterator<Item = (u64, &str)> {
        self.seen.iter().map(|(h, n)| (*h, n.as_str()))
    }

    /// Number of distinct hashes seen, for snapshot serialization.
    pub(crate) fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Rebuild a detector from snapshot contents.
    pub(crate) fn from_parts(seen: HashMap<u64, String>, collisions: HashSet<u64>) -> Self {
        CollisionDetector { seen, collisions }
    }

    /// Test support: pre-load a first-seen name for a hash. Genuine xxh3
    /// collisions are not constructible in a test.
    #[cfg(test)]
    pub(crate) fn plant_first_name(&mut self, hash: u64, name: &str) {
        self.seen.insert(hash, name.to_string());
    }
}
