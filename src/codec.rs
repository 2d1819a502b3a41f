//! Binary codec for chunk files and log records.
//!
//! This module handles serialization and deserialization of the fixed-size
//! chunk header and footer and of individual log records (Prepare, Commit,
//! System). It is pure data transformation -- no file I/O, no index access.
//!
//! The header and footer are fixed 128-byte blocks that round-trip
//! byte-for-byte through parse/serialize. Each record is a length-prefixed,
//! CRC32-checksummed binary frame.

use bitflags::bitflags;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::Error;

/// Magic bytes identifying a chunk file header (ASCII "SCVC").
const HEADER_MAGIC: [u8; 4] = [0x53, 0x43, 0x56, 0x43];

/// Magic bytes identifying a chunk file footer (ASCII "SCVF").
const FOOTER_MAGIC: [u8; 4] = [0x53, 0x43, 0x56, 0x46];

/// Current on-disk chunk format version.
pub const CHUNK_FORMAT_VERSION: u8 = 1;

/// Minimum reader version able to open a scavenged chunk.
///
/// Scavenged chunks may contain gaps in event numbering, which pre-scavenge
/// readers do not expect; the executor stamps this into rewritten headers.
pub const SCAVENGED_MIN_COMPATIBLE_VERSION: u8 = 1;

/// Size of the fixed chunk header block in bytes.
pub const CHUNK_HEADER_SIZE: usize = 128;

/// Size of the fixed chunk footer block in bytes.
pub const CHUNK_FOOTER_SIZE: usize = 128;

/// Size of the record length prefix field in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Record type tags on disk.
const TAG_PREPARE: u8 = 0;
const TAG_COMMIT: u8 = 1;
const TAG_SYSTEM: u8 = 2;

bitflags! {
    /// Flags carried by a [`PrepareRecord`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PrepareFlags: u16 {
        /// The record carries event data.
        const DATA = 0x0001;
        /// First prepare of an explicit transaction.
        const TRANSACTION_BEGIN = 0x0002;
        /// Last prepare of an explicit transaction.
        const TRANSACTION_END = 0x0004;
        /// The prepare is committed (implicit transaction, or replicated commit).
        const IS_COMMITTED = 0x0008;
        /// The record is a stream tombstone.
        const DELETE_TOMBSTONE = 0x0010;
        /// Event data is JSON.
        const IS_JSON = 0x0020;
    }
}

/// Fixed-size header of a chunk file.
///
/// Round-trips byte-for-byte through [`ChunkHeader::encode`] /
/// [`ChunkHeader::decode`]: the 128-byte block is fully determined by the
/// fields (padding is zeroed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// On-disk format version.
    pub version: u8,
    /// Minimum reader version able to open this chunk.
    pub min_compatible_version: u8,
    /// Declared chunk capacity in bytes (record region).
    pub chunk_size: u32,
    /// First logical chunk number this file covers.
    pub chunk_start_number: u32,
    /// Last logical chunk number this file covers (inclusive). Equal to
    /// `chunk_start_number` except for merged chunks.
    pub chunk_end_number: u32,
    /// The chunk has been rewritten by a scavenge.
    pub is_scavenged: bool,
    /// Transform/encryption type applied to the record region. `0` is
    /// identity; other values are interpreted by the transform collaborator.
    pub transform_type: u8,
    /// Unique id of this physical file, regenerated on every rewrite.
    pub chunk_id: Uuid,
}

impl ChunkHeader {
    /// Encode the header as a fixed 128-byte block.
    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        buf[0..4].copy_from_slice(&HEADER_MAGIC);
        buf[4] = self.version;
        buf[5] = self.min_compatible_version;
        buf[6..10].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf[10..14].copy_from_slice(&self.chunk_start_number.to_le_bytes());
        buf[14..18].copy_from_slice(&self.chunk_end_number.to_le_bytes());
        buf[18] = u8::from(self.is_scavenged);
        buf[19] = self.transform_type;
        buf[20..36].copy_from_slice(self.chunk_id.as_bytes());
        buf
    }

    /// Decode and validate a header block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeader`] if the magic bytes are wrong, the
    /// format version is unsupported, or the chunk number range is inverted.
    pub fn decode(buf: &[u8; CHUNK_HEADER_SIZE]) -> Result<ChunkHeader, Error> {
        if buf[0..4] != HEADER_MAGIC {
            return Err(Error::InvalidHeader(
                "wrong magic bytes: expected SCVC".to_string(),
            ));
        }
        let version = buf[4];
        if version != CHUNK_FORMAT_VERSION {
            return Err(Error::InvalidHeader(format!(
                "unsupported format version: {version}"
            )));
        }
        let chunk_start_number = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
        let chunk_end_number = u32::from_le_bytes([buf[14], buf[15], buf[16], buf[17]]);
        if chunk_end_number < chunk_start_number {
            return Err(Error::InvalidHeader(format!(
                "inverted chunk range: {chunk_start_number}..{chunk_end_number}"
            )));
        }
        Ok(ChunkHeader {
            version,
            min_compatible_version: buf[5],
            chunk_size: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            chunk_start_number,
            chunk_end_number,
            is_scavenged: buf[18] != 0,
            transform_type: buf[19],
            chunk_id: Uuid::from_bytes(
                buf[20..36].try_into().expect("16 bytes for UUID"),
            ),
        })
    }
}

/// Fixed-size footer of a completed chunk file.
///
/// Its presence with `is_completed` set signals that the record region was
/// fully written; the content hash covers the entire record region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    /// The chunk was fully written and closed.
    pub is_completed: bool,
    /// Byte length of the record region as stored on disk.
    pub physical_data_size: u64,
    /// Byte length the record region represents logically. Differs from the
    /// physical size once records have been scavenged out.
    pub logical_data_size: u64,
    /// Size of the (external) position map for this chunk, in bytes.
    pub map_size: u32,
    /// CRC32 over the record region.
    pub content_hash: u32,
}

impl ChunkFooter {
    /// Encode the footer as a fixed 128-byte block.
    pub fn encode(&self) -> [u8; CHUNK_FOOTER_SIZE] {
        let mut buf = [0u8; CHUNK_FOOTER_SIZE];
        buf[0..4].copy_from_slice(&FOOTER_MAGIC);
        buf[4] = u8::from(self.is_completed);
        buf[5..13].copy_from_slice(&self.physical_data_size.to_le_bytes());
        buf[13..21].copy_from_slice(&self.logical_data_size.to_le_bytes());
        buf[21..25].copy_from_slice(&self.map_size.to_le_bytes());
        buf[25..29].copy_from_slice(&self.content_hash.to_le_bytes());
        buf
    }

    /// Decode and validate a footer block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFooter`] if the magic bytes are wrong.
    pub fn decode(buf: &[u8; CHUNK_FOOTER_SIZE]) -> Result<ChunkFooter, Error> {
        if buf[0..4] != FOOTER_MAGIC {
            return Err(Error::InvalidFooter(
                "wrong magic bytes: expected SCVF".to_string(),
            ));
        }
        Ok(ChunkFooter {
            is_completed: buf[4] != 0,
            physical_data_size: u64::from_le_bytes(
                buf[5..13].try_into().expect("8 bytes for u64"),
            ),
            logical_data_size: u64::from_le_bytes(
                buf[13..21].try_into().expect("8 bytes for u64"),
            ),
            map_size: u32::from_le_bytes(buf[21..25].try_into().expect("4 bytes for u32")),
            content_hash: u32::from_le_bytes(buf[25..29].try_into().expect("4 bytes for u32")),
        })
    }
}

/// A prepare record: one event (or tombstone) written to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRecord {
    /// Absolute log position of this record.
    pub log_position: u64,
    /// Log position of the transaction this prepare belongs to. Equal to
    /// `log_position` for the first prepare (and for implicit transactions).
    pub transaction_position: u64,
    /// Record flags.
    pub flags: PrepareFlags,
    /// Full name of the owning stream.
    pub stream_name: String,
    /// Event number within the stream. [`TOMBSTONE_EVENT_NUMBER`] for
    /// tombstones.
    ///
    /// [`TOMBSTONE_EVENT_NUMBER`]: crate::types::TOMBSTONE_EVENT_NUMBER
    pub event_number: u64,
    /// Unix epoch milliseconds at write time.
    pub timestamp: u64,
    /// Event type tag.
    pub event_type: String,
    /// Opaque event body.
    pub data: Bytes,
    /// Opaque event metadata.
    pub metadata: Bytes,
}

impl PrepareRecord {
    /// Whether this prepare is a stream tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.flags.contains(PrepareFlags::DELETE_TOMBSTONE)
    }

    /// Whether this prepare is committed and therefore visible to readers.
    pub fn is_committed(&self) -> bool {
        self.flags.contains(PrepareFlags::IS_COMMITTED)
    }

    /// Whether this prepare belongs to an explicit (multi-record) transaction.
    pub fn is_transactional(&self) -> bool {
        self.transaction_position != self.log_position
            || self.flags.contains(PrepareFlags::TRANSACTION_BEGIN)
    }
}

/// A commit record: makes an explicit transaction's prepares visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Absolute log position of this record.
    pub log_position: u64,
    /// Log position of the transaction being committed.
    pub transaction_position: u64,
    /// Event number assigned to the transaction's first prepare.
    pub first_event_number: u64,
    /// Unix epoch milliseconds at commit time.
    pub timestamp: u64,
}

/// A system record (epoch marker). Log structure only; the scavenge keeps
/// system records verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemRecord {
    /// Absolute log position of this record.
    pub log_position: u64,
    /// Epoch number this marker opens.
    pub epoch_number: u64,
    /// Unix epoch milliseconds at write time.
    pub timestamp: u64,
}

/// One log record of any kind.
///
/// Closed sum type: every phase that walks a chunk matches exhaustively on
/// the record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// An event (or tombstone) prepare.
    Prepare(PrepareRecord),
    /// An explicit-transaction commit.
    Commit(CommitRecord),
    /// An epoch marker.
    System(SystemRecord),
}

impl LogRecord {
    /// Absolute log position of the record.
    pub fn log_position(&self) -> u64 {
        match self {
            LogRecord::Prepare(p) => p.log_position,
            LogRecord::Commit(c) => c.log_position,
            LogRecord::System(s) => s.log_position,
        }
    }

    /// Record timestamp (unix ms).
    pub fn timestamp(&self) -> u64 {
        match self {
            LogRecord::Prepare(p) => p.timestamp,
            LogRecord::Commit(c) => c.timestamp,
            LogRecord::System(s) => s.timestamp,
        }
    }
}

/// Result of attempting to decode a record from a byte buffer.
///
/// Distinguishes a successfully decoded record from a buffer that does not
/// contain enough bytes for a complete frame. A truncated trailing frame in
/// an uncompleted chunk is expected after an unclean shutdown, whereas a
/// checksum mismatch mid-chunk is corruption.
#[derive(Debug)]
pub enum DecodeOutcome<T> {
    /// A full value was successfully decoded from the buffer.
    Complete {
        /// The decoded value.
        value: T,
        /// Total number of bytes consumed from the buffer.
        consumed: usize,
    },
    /// The buffer does not contain enough bytes to form a complete frame.
    Incomplete,
}

/// Byte ceiling of the u16 length-prefixed string fields (stream name and
/// event type).
pub const MAX_STRING_FIELD_LEN: usize = u16::MAX as usize;

/// Check that a record's variable-length string fields fit their length
/// prefixes.
///
/// A longer value would truncate silently during encoding, producing a frame
/// whose CRC validates but whose fields misparse. [`ChunkWriter::append`]
/// runs this before every encode.
///
/// [`ChunkWriter::append`]: crate::chunk::ChunkWriter::append
///
/// # Errors
///
/// [`Error::InvalidArgument`] naming the offending field.
pub fn validate_record(record: &LogRecord) -> Result<(), Error> {
    if let LogRecord::Prepare(p) = record {
        if p.stream_name.len() > MAX_STRING_FIELD_LEN {
            return Err(Error::InvalidArgument(format!(
                "stream name is {} bytes; the frame's length prefix caps it at {MAX_STRING_FIELD_LEN}",
                p.stream_name.len()
            )));
        }
        if p.event_type.len() > MAX_STRING_FIELD_LEN {
            return Err(Error::InvalidArgument(format!(
                "event type is {} bytes; the frame's length prefix caps it at {MAX_STRING_FIELD_LEN}",
                p.event_type.len()
            )));
        }
    }
    Ok(())
}

/// Encode a [`LogRecord`] into its on-disk frame.
///
/// The returned buffer contains the length prefix, type tag, body, and a
/// trailing CRC32 over tag and body. The caller can append this directly to
/// a chunk's record region.
pub fn encode_record(record: &LogRecord) -> Vec<u8> {
    let mut body = Vec::with_capacity(64);
    match record {
        LogRecord::Prepare(p) => {
            body.push(TAG_PREPARE);
            body.extend_from_slice(&p.log_position.to_le_bytes());
            body.extend_from_slice(&p.transaction_position.to_le_bytes());
            body.extend_from_slice(&p.flags.bits().to_le_bytes());
            let name = p.stream_name.as_bytes();
            body.extend_from_slice(&(name.len() as u16).to_le_bytes());
            body.extend_from_slice(name);
            body.extend_from_slice(&p.event_number.to_le_bytes());
            body.extend_from_slice(&p.timestamp.to_le_bytes());
            let et = p.event_type.as_bytes();
            body.extend_from_slice(&(et.len() as u16).to_le_bytes());
            body.extend_from_slice(et);
            body.extend_from_slice(&(p.data.len() as u32).to_le_bytes());
            body.extend_from_slice(&p.data);
            body.extend_from_slice(&(p.metadata.len() as u32).to_le_bytes());
            body.extend_from_slice(&p.metadata);
        }
        LogRecord::Commit(c) => {
            body.push(TAG_COMMIT);
            body.extend_from_slice(&c.log_position.to_le_bytes());
            body.extend_from_slice(&c.transaction_position.to_le_bytes());
            body.extend_from_slice(&c.first_event_number.to_le_bytes());
            body.extend_from_slice(&c.timestamp.to_le_bytes());
        }
        LogRecord::System(s) => {
            body.push(TAG_SYSTEM);
            body.extend_from_slice(&s.log_position.to_le_bytes());
            body.extend_from_slice(&s.epoch_number.to_le_bytes());
            body.extend_from_slice(&s.timestamp.to_le_bytes());
        }
    }

    let crc = crc32fast::hash(&body);
    let frame_len = body.len() + 4; // body + checksum

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + frame_len);
    buf.extend_from_slice(&(frame_len as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Byte length `record` occupies on disk. This is the unit of chunk weight:
/// the executor sums it over discarded records.
pub fn encoded_len(record: &LogRecord) -> u64 {
    encode_record(record).len() as u64
}

/// Decode a single record from the start of a byte buffer.
///
/// Handles three cases: a complete record, an incomplete trailing frame
/// ([`DecodeOutcome::Incomplete`]), and corrupt data (checksum mismatch,
/// unknown tag, malformed field).
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] with `chunk = 0` (the caller substitutes
/// the real chunk number) if the CRC32 does not match or a field is
/// malformed.
pub fn decode_record(buf: &[u8]) -> Result<DecodeOutcome<LogRecord>, Error> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(DecodeOutcome::Incomplete);
    }

    let frame_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total = LENGTH_PREFIX_SIZE + frame_len;
    if buf.len() < total {
        return Ok(DecodeOutcome::Incomplete);
    }
    if frame_len < 5 {
        return Err(corrupt("frame too short for tag and checksum"));
    }

    let frame = &buf[LENGTH_PREFIX_SIZE..total];
    let crc_offset = frame.len() - 4;
    let stored_crc = u32::from_le_bytes([
        frame[crc_offset],
        frame[crc_offset + 1],
        frame[crc_offset + 2],
        frame[crc_offset + 3],
    ]);
    let computed_crc = crc32fast::hash(&frame[..crc_offset]);
    if stored_crc != computed_crc {
        return Err(corrupt(&format!(
            "CRC32 mismatch: stored {stored_crc:#010X}, computed {computed_crc:#010X}"
        )));
    }

    let protected = &frame[..crc_offset];
    let mut cursor = 1; // past the tag

    // Read N bytes from `protected` at `cursor` and advance, or fail as
    // corrupt if the protected region is exhausted.
    macro_rules! read_bytes {
        ($n:expr) => {{
            if cursor + $n > protected.len() {
                return Err(corrupt("unexpected end of record body"));
            }
            let start = cursor;
            cursor += $n;
            &protected[start..cursor]
        }};
    }
    macro_rules! read_u64 {
        () => {
            u64::from_le_bytes(read_bytes!(8).try_into().expect("8 bytes for u64"))
        };
    }
    macro_rules! read_u32 {
        () => {
            u32::from_le_bytes(read_bytes!(4).try_into().expect("4 bytes for u32"))
        };
    }
    macro_rules! read_u16 {
        () => {
            u16::from_le_bytes(read_bytes!(2).try_into().expect("2 bytes for u16"))
        };
    }

    let record = match protected[0] {
        TAG_PREPARE => {
            let log_position = read_u64!();
            let transaction_position = read_u64!();
            let raw_flags = read_u16!();
            let flags = PrepareFlags::from_bits(raw_flags)
                .ok_or_else(|| corrupt(&format!("unknown prepare flags: {raw_flags:#06X}")))?;
            let name_len = read_u16!() as usize;
            let stream_name = std::str::from_utf8(read_bytes!(name_len))
                .map_err(|e| corrupt(&format!("invalid UTF-8 in stream name: {e}")))?
                .to_string();
            let event_number = read_u64!();
            let timestamp = read_u64!();
            let et_len = read_u16!() as usize;
            let event_type = std::str::from_utf8(read_bytes!(et_len))
                .map_err(|e| corrupt(&format!("invalid UTF-8 in event type: {e}")))?
                .to_string();
            let data_len = read_u32!() as usize;
            let data = Bytes::copy_from_slice(read_bytes!(data_len));
            let metadata_len = read_u32!() as usize;
            let metadata = Bytes::copy_from_slice(read_bytes!(metadata_len));

            LogRecord::Prepare(PrepareRecord {
                log_position,
                transaction_position,
                flags,
                stream_name,
                event_number,
                timestamp,
                event_type,
                data,
                metadata,
            })
        }
        TAG_COMMIT => LogRecord::Commit(CommitRecord {
            log_position: read_u64!(),
            transaction_position: read_u64!(),
            first_event_number: read_u64!(),
            timestamp: read_u64!(),
        }),
        TAG_SYSTEM => LogRecord::System(SystemRecord {
            log_position: read_u64!(),
            epoch_number: read_u64!(),
            timestamp: read_u64!(),
        }),
        other => return Err(corrupt(&format!("unknown record tag: {other}"))),
    };
    let _ = cursor;

    Ok(DecodeOutcome::Complete {
        value: record,
        consumed: total,
    })
}

/// Shorthand for a chunk-number-less corruption error; callers walking a
/// specific chunk substitute the real number.
fn corrupt(detail: &str) -> Error {
    Error::CorruptRecord {
        chunk: 0,
        detail: detail.to_string(),
    }
}
