//! Scavenger: the compaction engine for a chunked, log-structured event store.
//!
//! Reclaims space from an append-only chunked log by removing events that
//! retention policies (max-count, max-age, truncate-before) or tombstones
//! have made obsolete. The work runs as a crash-safe pipeline of phases --
//! accumulation, calculation, chunk execution, index execution, merging,
//! cleaning -- driven by [`Scavenger`] and checkpointed after every unit of
//! work, while concurrent readers keep seeing complete chunks and index
//! generations throughout.

pub mod accumulator;
pub mod calculator;
pub mod chunk;
pub mod chunk_executor;
pub mod cleaner;
pub mod codec;
pub mod collisions;
pub mod error;
pub mod index;
pub mod index_executor;
pub mod merger;
pub mod metrics;
pub mod orchestrator;
pub mod state;
pub mod types;

pub use chunk::{ChunkFile, ChunkLocator, ChunkManager, ChunkWriter};
pub use collisions::CollisionDetector;
pub use error::Error;
pub use index::{IndexEntry, InMemoryIndex, StreamIndex};
pub use orchestrator::{CancellationFlag, ScavengeConfig, Scavenger};
pub use state::ScavengeStateStore;
pub use types::{
    DiscardPoint, ScavengeCheckpoint, ScavengePoint, StreamHandle, StreamStatus,
    TOMBSTONE_EVENT_NUMBER,
};

#[cfg(test)]
mod tests {
    // Confirm the crate-root re-exports resolve via fully-qualified paths.

    #[test]
    fn reexport_discard_point() {
        let point = crate::DiscardPoint::discard_before(7);
        assert!(point.should_discard(6));
        assert!(!point.should_discard(7));
    }

    #[test]
    fn reexport_stream_handle() {
        let handle = crate::StreamHandle::Hash(42);
        assert!(handle < crate::StreamHandle::Id("z".to_string()));
    }

    #[test]
    fn reexport_cancellation_flag() {
        let flag = crate::CancellationFlag::new();
        assert!(!flag.is_cancelled());
        flag.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn reexport_error() {
        let err = crate::Error::InvalidArgument("test".into());
        assert!(err.to_string().contains("test"));
    }

    #[test]
    fn reexport_scavenge_config_default() {
        let config = crate::ScavengeConfig::default();
        assert_eq!(config.threshold, 0);
        assert!(config.merge_target_size.is_none());
    }
}
