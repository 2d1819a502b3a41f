//! The stream index collaborator.
//!
//! The scavenger does not own the index; it talks to it through the
//! [`StreamIndex`] trait. The Calculator reads last-event-numbers from it,
//! and the index executor rebuilds it via a prepare/commit checkpoint pair
//! so that readers never observe a half-replaced generation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::Error;
use crate::types::StreamHandle;

/// One index entry: a stream event at a log position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// The stream the event belongs to, under its canonical handle.
    pub handle: StreamHandle,
    /// The event's number within its stream.
    pub event_number: u64,
    /// The event's position in the log.
    pub log_position: u64,
}

/// Contract between the scavenger and the stream index.
///
/// Reads are served from the current generation. A rebuild stages a full
/// replacement generation with [`StreamIndex::prepare_checkpoint`] and makes
/// it visible with [`StreamIndex::commit_checkpoint`]; between the two calls
/// readers still see the old generation in full.
pub trait StreamIndex {
    /// All entries of the current generation, ordered by handle then event
    /// number.
    fn iterate_all(&self) -> Vec<IndexEntry>;

    /// Entries of `handle` with event numbers in `from..=to`, ascending.
    fn get_range(&self, handle: &StreamHandle, from: u64, to: u64) -> Vec<IndexEntry>;

    /// The highest event number indexed for `handle`, if any.
    fn last_event_number(&self, handle: &StreamHandle) -> Option<u64>;

    /// Stage `entries` as a complete replacement generation.
    ///
    /// # Errors
    ///
    /// Implementation-defined; a failed prepare leaves the current
    /// generation untouched.
    fn prepare_checkpoint(&self, entries: Vec<IndexEntry>) -> Result<(), Error>;

    /// Atomically publish the staged generation.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if no generation is staged.
    fn commit_checkpoint(&self) -> Result<(), Error>;
}

type Generation = BTreeMap<StreamHandle, Vec<IndexEntry>>;

/// In-memory [`StreamIndex`] with whole-generation atomic swap.
///
/// The current generation lives behind an `Arc` inside an `RwLock`; readers
/// clone the `Arc` under the read lock and then read lock-free, so a commit
/// never blocks on in-flight reads and readers see either the old or the new
/// generation, never a mix.
pub struct InMemoryIndex {
    current: RwLock<Arc<Generation>>,
    staged: Mutex<Option<Generation>>,
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        InMemoryIndex::new()
    }
}

impl InMemoryIndex {
    /// Create an empty index.
    pub fn new() -> InMemoryIndex {
        InMemoryIndex {
            current: RwLock::new(Arc::new(BTreeMap::new())),
            staged: Mutex::new(None),
        }
    }

    /// Append an entry to the current generation directly.
    ///
    /// This is the write-path hook used when populating the index outside a
    /// scavenge (normal appends, test setup). Entries must arrive in event
    /// number order per stream.
    pub fn append(&self, entry: IndexEntry) {
        let mut guard = self.current.write().expect("index generation lock poisoned");
        let mut next = (**guard).clone();
        next.entry(entry.handle.clone()).or_default().push(entry);
        *guard = Arc::new(next);
    }

    fn snapshot(&self) -> Arc<Generation> {
        self.current
            .read()
            .expect("index generation lock poisoned")
            .clone()
    }
}

impl StreamIndex for InMemoryIndex {
    fn iterate_all(&self) -> Vec<IndexEntry> {
        let generation = self.snapshot();
        generation
            .values()
            .flat_map(|entries| entries.iter().cloned())
            .collect()
    }

    fn get_range(&self, handle: &StreamHandle, from: u64, to: u64) -> Vec<IndexEntry> {
        let generation = self.snapshot();
        match generation.get(handle) {
            None => Vec::new(),
            Some(entries) => entries
                .iter()
                .filter(|e| e.event_number >= from && e.event_number <= to)
                .cloned()
                .collect(),
        }
    }

    fn last_event_number(&self, handle: &StreamHandle) -> Option<u64> {
        let generation = self.snapshot();
        generation
            .get(handle)
            .and_then(|entries| entries.iter().map(|e| e.event_number).max())
    }

    fn prepare_checkpoint(&self, entries: Vec<IndexEntry>) -> Result<(), Error> {
        let mut generation: Generation = BTreeMap::new();
        for entry in entries {
            generation
                .entry(entry.handle.clone())
                .or_default()
                .push(entry);
        }
        for stream_entries in generation.values_mut() {
            stream_entries.sort_by_key(|e| e.event_number);
        }
        let mut staged = self.staged.lock().expect("staged generation lock poisoned");
        *staged = Some(generation);
        Ok(())
    }

    fn commit_checkpoint(&self) -> Result<(), Error> {
        let mut staged = self.staged.lock().expect("staged generation lock poisoned");
        let generation = staged.take().ok_or_else(|| {
            Error::InvalidArgument("commit_checkpoint without a staged generation".to_string())
        })?;
        let mut current = self.current.write().expect("index generation lock poisoned");
        *current = Arc::new(generation);
        Ok(())
    }
}
