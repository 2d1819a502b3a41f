//! Error types for the scavenger.
//!
//! This module defines the unified error enum used throughout the crate. All fallible
//! operations return `Result<T, Error>`. The caller that schedules scavenge runs maps
//! these variants to operator-facing outcomes.

use crate::types::StreamHandle;

/// Unified error type for all scavenge operations.
///
/// The taxonomy follows the failure model of the pipeline:
///
/// - Structural corruption (`CorruptRecord`, `InvalidHeader`, `InvalidFooter`,
///   `ContentHashMismatch`) aborts the current unit of work and never advances
///   the checkpoint past the failing unit.
/// - Resource errors (`Io`, `ChunkNotFound`) leave the original chunk/index
///   authoritative; candidate output files are removed before returning.
/// - `UnexpectedCollision` is an invariant violation (a collided hash was still
///   tracked by hash) and indicates an accumulation-ordering bug; it is never
///   recovered from silently.
/// - `Cancelled` is the cooperative cancellation outcome: the last successfully
///   persisted checkpoint remains in place and the run can be resumed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred during a file operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record on disk is corrupt (e.g., CRC mismatch, truncated data).
    #[error("corrupt record in chunk {chunk}: {detail}")]
    CorruptRecord {
        /// Logical number of the chunk containing the corrupt record.
        chunk: u32,
        /// Human-readable description of the corruption.
        detail: String,
    },

    /// A chunk file header is invalid or unrecognized.
    #[error("invalid chunk header: {0}")]
    InvalidHeader(String),

    /// A chunk file footer is invalid, incomplete, or unrecognized.
    #[error("invalid chunk footer: {0}")]
    InvalidFooter(String),

    /// The content hash stored in a chunk footer does not match the record region.
    #[error(
        "content hash mismatch in chunk {chunk}: stored {stored:#010X}, computed {computed:#010X}"
    )]
    ContentHashMismatch {
        /// Logical number of the failing chunk.
        chunk: u32,
        /// CRC32 stored in the footer.
        stored: u32,
        /// CRC32 computed over the record region.
        computed: u32,
    },

    /// No chunk covers the requested logical chunk number.
    #[error("chunk not found: {0}")]
    ChunkNotFound(u32),

    /// The scavenge state snapshot on disk is corrupt.
    #[error("corrupt state snapshot: {0}")]
    CorruptState(String),

    /// A collided hash was found still tracked by hash rather than by stream id.
    ///
    /// This is an invariant violation: the accumulator must migrate all state
    /// for a colliding hash to id-keyed form before any later phase reads it.
    #[error("collided hash {hash:#018X} still referenced by hash handle {handle}")]
    UnexpectedCollision {
        /// The 64-bit stream-name hash that is known to collide.
        hash: u64,
        /// The offending hash-variant handle.
        handle: StreamHandle,
    },

    /// The run was cancelled between units of work.
    #[error("scavenge cancelled")]
    Cancelled,

    /// A request argument or configuration value is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_record_display_includes_chunk_and_detail() {
        let err = Error::CorruptRecord {
            chunk: 42,
            detail: "bad crc".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("42"), "expected '42' in: {msg}");
        assert!(msg.contains("bad crc"), "expected 'bad crc' in: {msg}");
    }

    #[test]
    fn io_error_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
        let msg = err.to_string();
        assert!(msg.contains("I/O error"), "expected 'I/O error' in: {msg}");
    }

    #[test]
    fn io_error_question_mark_coercion() {
        fn fallible() -> Result<(), Error> {
            let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
            Err(io_err)?
        }

        let result = fallible();
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), Error::Io(_)));
    }

    #[test]
    fn content_hash_mismatch_display_has_hex_values() {
        let err = Error::ContentHashMismatch {
            chunk: 7,
            stored: 0xDEAD_BEEF,
            computed: 0xCAFE_BABE,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xDEADBEEF"), "expected stored hash in: {msg}");
        assert!(msg.contains("0xCAFEBABE"), "expected computed hash in: {msg}");
    }

    #[test]
    fn unexpected_collision_display_names_the_hash() {
        let err = Error::UnexpectedCollision {
            hash: 0x1234,
            handle: StreamHandle::Hash(0x1234),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x0000000000001234"), "expected hash in: {msg}");
    }

    #[test]
    fn cancelled_display() {
        assert_eq!(Error::Cancelled.to_string(), "scavenge cancelled");
    }

    #[test]
    fn all_variants_debug_non_empty() {
        let variants: Vec<Error> = vec![
            Error::Io(std::io::Error::other("test")),
            Error::CorruptRecord {
                chunk: 0,
                detail: "truncated".into(),
            },
            Error::InvalidHeader("missing magic".into()),
            Error::InvalidFooter("not completed".into()),
            Error::ContentHashMismatch {
                chunk: 1,
                stored: 1,
                computed: 2,
            },
            Error::ChunkNotFound(3),
            Error::CorruptState("short read".into()),
            Error::UnexpectedCollision {
                hash: 9,
                handle: StreamHandle::Hash(9),
            },
            Error::Cancelled,
            Error::InvalidArgument("empty".into()),
        ];

        for (i, variant) in variants.iter().enumerate() {
            let debug_str = format!("{variant:?}");
            assert!(
                !debug_str.is_empty(),
                "variant {i} produced empty Debug output"
            );
        }
    }
}
