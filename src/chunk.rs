//! Chunk file layer: reading, writing, naming, and atomic replacement.
//!
//! A chunk is a fixed-capacity file holding a contiguous slice of the
//! append-only log: a 128-byte header, a sequence of framed records, and
//! (once completed) a 128-byte footer whose content hash covers the record
//! region. Chunks are never written in place -- scavenging and merging
//! produce new files that are swapped into the locator table only after
//! being fully written and verified.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use lru::LruCache;
use uuid::Uuid;

use crate::codec::{
    self, ChunkFooter, ChunkHeader, DecodeOutcome, LogRecord, CHUNK_FOOTER_SIZE, CHUNK_HEADER_SIZE,
};
use crate::error::Error;

/// Number of parsed chunk headers kept hot in the manager's cache.
const HEADER_CACHE_CAPACITY: usize = 256;

/// Prefix marking a remote/archived chunk locator.
const ARCHIVE_PREFIX: &str = "archive:";

/// Build the file name for a chunk: `chunk-NNNNNN.VVVVVV`.
///
/// `number` is the logical start chunk number; `version` increments on every
/// rewrite of the same logical range.
pub fn chunk_file_name(number: u32, version: u32) -> String {
    format!("chunk-{number:06}.{version:06}")
}

/// Parse a chunk file name back into `(number, version)`.
///
/// Returns `None` for names that are not chunk files (temp files, strays).
pub fn parse_chunk_file_name(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix("chunk-")?;
    let (number, version) = rest.split_once('.')?;
    if number.len() != 6 || version.len() != 6 {
        return None;
    }
    Some((number.parse().ok()?, version.parse().ok()?))
}

/// Where a chunk's bytes live.
///
/// Local chunks are regular files under the log directory. Archived chunks
/// live in a remote tier and are read-only collaborators: the scavenge never
/// rewrites one in place, it only flags it for external re-ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkLocator {
    /// A chunk file on the local filesystem.
    Local(PathBuf),
    /// A chunk held by the remote archive, identified by its archive key.
    Archived(String),
}

impl ChunkLocator {
    /// Parse a locator string: `archive:<key>` is remote, anything else is a
    /// local path.
    pub fn parse(s: &str) -> ChunkLocator {
        match s.strip_prefix(ARCHIVE_PREFIX) {
            Some(key) => ChunkLocator::Archived(key.to_string()),
            None => ChunkLocator::Local(PathBuf::from(s)),
        }
    }

    /// Render the locator back to its string form.
    pub fn render(&self) -> String {
        match self {
            ChunkLocator::Local(path) => path.display().to_string(),
            ChunkLocator::Archived(key) => format!("{ARCHIVE_PREFIX}{key}"),
        }
    }

    /// Whether this locator names an archived (read-only) chunk.
    pub fn is_archived(&self) -> bool {
        matches!(self, ChunkLocator::Archived(_))
    }
}

/// A fully parsed chunk file.
///
/// Opening reads and validates the whole file eagerly: header, records, and
/// footer (when present). A completed chunk's content hash is verified on
/// open; a mismatch is structural corruption and aborts the caller's unit of
/// work.
#[derive(Debug)]
pub struct ChunkFile {
    /// Parsed header block.
    pub header: ChunkHeader,
    /// Parsed footer block; `None` for a still-open tail chunk.
    pub footer: Option<ChunkFooter>,
    /// All decoded records, in log order.
    pub records: Vec<LogRecord>,
}

impl ChunkFile {
    /// Open and fully parse the chunk file at `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHeader`] / [`Error::InvalidFooter`] for unparseable
    ///   fixed blocks.
    /// - [`Error::ContentHashMismatch`] when a completed chunk's record
    ///   region does not hash to the footer's content hash.
    /// - [`Error::CorruptRecord`] for a bad frame before the end of the
    ///   record region. A truncated trailing frame in an *uncompleted* chunk
    ///   is tolerated (it is the in-flight write of the tail chunk).
    pub fn open(path: &Path) -> Result<ChunkFile, Error> {
        let data = std::fs::read(path)?;
        if data.len() < CHUNK_HEADER_SIZE {
            return Err(Error::InvalidHeader(format!(
                "file too short for header: {} bytes",
                data.len()
            )));
        }
        let header_block: &[u8; CHUNK_HEADER_SIZE] = data[..CHUNK_HEADER_SIZE]
            .try_into()
            .expect("slice is exactly CHUNK_HEADER_SIZE bytes");
        let header = ChunkHeader::decode(header_block)?;
        let chunk = header.chunk_start_number;

        // A completed chunk ends with a footer block; try to parse one and
        // fall back to tail-chunk (no footer) handling.
        let footer = if data.len() >= CHUNK_HEADER_SIZE + CHUNK_FOOTER_SIZE {
            let footer_block: &[u8; CHUNK_FOOTER_SIZE] = data[data.len() - CHUNK_FOOTER_SIZE..]
                .try_into()
                .expect("slice is exactly CHUNK_FOOTER_SIZE bytes");
            match ChunkFooter::decode(footer_block) {
                Ok(f) if f.is_completed => Some(f),
                _ => None,
            }
        } else {
            None
        };

        let region = match &footer {
            Some(f) => {
                let end = CHUNK_HEADER_SIZE + f.physical_data_size as usize;
                if end + CHUNK_FOOTER_SIZE != data.len() {
                    return Err(Error::InvalidFooter(format!(
                        "physical data size {} inconsistent with file length {}",
                        f.physical_data_size,
                        data.len()
                    )));
                }
                let region = &data[CHUNK_HEADER_SIZE..end];
                let computed = crc32fast::hash(region);
                if computed != f.content_hash {
                    return Err(Error::ContentHashMismatch {
                        chunk,
                        stored: f.content_hash,
                        computed,
                    });
                }
                region
            }
            None => &data[CHUNK_HEADER_SIZE..],
        };

        let mut records = Vec::new();
        let mut offset = 0;
        while offset < region.len() {
            match codec::decode_record(&region[offset..]) {
                Ok(DecodeOutcome::Complete { value, consumed }) => {
                    records.push(value);
                    offset += consumed;
                }
                Ok(DecodeOutcome::Incomplete) => {
                    if footer.is_some() {
                        return Err(Error::CorruptRecord {
                            chunk,
                            detail: "truncated record inside completed chunk".to_string(),
                        });
                    }
                    // In-flight tail write; everything before it is valid.
                    tracing::debug!(chunk, offset, "ignoring truncated tail frame");
                    break;
                }
                Err(Error::CorruptRecord { detail, .. }) => {
                    return Err(Error::CorruptRecord { chunk, detail });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(ChunkFile {
            header,
            footer,
            records,
        })
    }
}

/// Sequential writer producing a new chunk file.
///
/// Writes to a temporary path; [`ChunkWriter::complete`] stamps the footer,
/// fsyncs, re-opens the file to verify the header/footer/hash round-trip,
/// and hands the path back for the swap. On any error the caller discards
/// the temp file and the original chunk remains authoritative.
pub struct ChunkWriter {
    path: PathBuf,
    file: File,
    header: ChunkHeader,
    hasher: crc32fast::Hasher,
    physical_data_size: u64,
    record_count: usize,
}

impl ChunkWriter {
    /// Create a new chunk file at `path` with the given header.
    pub fn create(path: PathBuf, header: ChunkHeader) -> Result<ChunkWriter, Error> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&header.encode())?;
        Ok(ChunkWriter {
            path,
            file,
            header,
            hasher: crc32fast::Hasher::new(),
            physical_data_size: 0,
            record_count: 0,
        })
    }

    /// Append one record to the record region.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when a string field is too long for its
    /// frame's length prefix; I/O errors from the write.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), Error> {
        codec::validate_record(record)?;
        let frame = codec::encode_record(record);
        self.file.write_all(&frame)?;
        self.hasher.update(&frame);
        self.physical_data_size += frame.len() as u64;
        self.record_count += 1;
        Ok(())
    }

    /// Bytes written to the record region so far.
    pub fn physical_data_size(&self) -> u64 {
        self.physical_data_size
    }

    /// Records appended so far.
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Stamp the footer, fsync, verify the finished file, and return its path.
    ///
    /// `logical_data_size` is the byte length this region represents
    /// logically (the original, pre-scavenge size for rewritten chunks).
    ///
    /// # Errors
    ///
    /// Propagates I/O failures, and any parse/hash failure from the
    /// verification re-open -- a chunk that does not round-trip is never
    /// offered for the swap.
    pub fn complete(mut self, logical_data_size: u64) -> Result<PathBuf, Error> {
        let footer = ChunkFooter {
            is_completed: true,
            physical_data_size: self.physical_data_size,
            logical_data_size,
            map_size: 0,
            content_hash: self.hasher.clone().finalize(),
        };
        self.file.write_all(&footer.encode())?;
        self.file.sync_all()?;
        drop(self.file);

        // Verification round-trip: the file must parse back to the same
        // header and footer before it can replace anything.
        let reread = ChunkFile::open(&self.path)?;
        if reread.header != self.header {
            return Err(Error::InvalidHeader(
                "verification re-read returned a different header".to_string(),
            ));
        }
        match reread.footer {
            Some(f) if f == footer => Ok(self.path),
            _ => Err(Error::InvalidFooter(
                "verification re-read returned a different footer".to_string(),
            )),
        }
    }

    /// Abandon the writer and remove its temporary file.
    pub fn discard(self) -> Result<(), Error> {
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// One row of the locator table.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChunkEntry {
    /// First logical chunk number covered.
    start: u32,
    /// Last logical chunk number covered (inclusive).
    end: u32,
    /// File version of the current artifact.
    version: u32,
    /// Where the bytes live.
    locator: ChunkLocator,
}

/// The locator table: logical chunk number to current physical artifact.
///
/// Readers resolve chunk numbers through this table; replacement is
/// copy-then-swap, so an in-flight reader sees either the old or the new
/// artifact in full, never a mix. The table lock (the chunk-switch lock,
/// shared with the redaction feature) is held only for the table update,
/// never for a rewrite.
pub struct ChunkManager {
    dir: PathBuf,
    /// Declared chunk capacity in bytes; fixes the position -> chunk mapping.
    chunk_size: u32,
    table: RwLock<Vec<ChunkEntry>>,
    header_cache: Mutex<LruCache<u32, ChunkHeader>>,
}

impl ChunkManager {
    /// Load the locator table by scanning `dir` for chunk files.
    ///
    /// When multiple versions of the same logical range exist (a crash
    /// between swap and cleanup), the highest version wins and stale files
    /// are removed.
    pub fn load(dir: &Path, chunk_size: u32) -> Result<ChunkManager, Error> {
        let mut found: Vec<(u32, u32, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((number, version)) = parse_chunk_file_name(name) {
                found.push((number, version, entry.path()));
            }
        }
        found.sort();

        let mut entries: Vec<ChunkEntry> = Vec::new();
        for (number, version, path) in found {
            match entries.last_mut() {
                Some(last) if last.start < number && last.end >= number => {
                    // A preceding merged chunk already covers this number; the
                    // file is a leftover from a crash between merge swap and
                    // cleanup.
                    tracing::warn!(
                        chunk = number,
                        version,
                        "removing chunk superseded by a merged range"
                    );
                    std::fs::remove_file(&path)?;
                }
                Some(last) if last.start == number => {
                    // Higher version of the same range supersedes; drop the
                    // stale file left behind by an interrupted swap.
                    debug_assert!(version > last.version);
                    if let ChunkLocator::Local(stale) = &last.locator {
                        tracing::warn!(
                            chunk = number,
                            stale_version = last.version,
                            "removing stale chunk version left by interrupted swap"
                        );
                        std::fs::remove_file(stale)?;
                    }
                    last.version = version;
                    last.locator = ChunkLocator::Local(path.clone());
                    let file = ChunkFile::open(&path)?;
                    last.end = file.header.chunk_end_number;
                }
                _ => {
                    let file = ChunkFile::open(&path)?;
                    entries.push(ChunkEntry {
                        start: number,
                        end: file.header.chunk_end_number,
                        version,
                        locator: ChunkLocator::Local(path),
                    });
                }
            }
        }

        Ok(ChunkManager {
            dir: dir.to_path_buf(),
            chunk_size,
            table: RwLock::new(entries),
            header_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(HEADER_CACHE_CAPACITY).expect("capacity is nonzero"),
            )),
        })
    }

    /// Directory holding the local chunk files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Declared chunk capacity in bytes.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// The logical chunk number covering an absolute log position.
    pub fn chunk_of_position(&self, position: u64) -> u32 {
        (position / self.chunk_size as u64) as u32
    }

    /// Logical start numbers of all table rows, in order.
    pub fn chunk_numbers(&self) -> Vec<u32> {
        let table = self.table.read().expect("locator table lock poisoned");
        table.iter().map(|e| e.start).collect()
    }

    /// The highest logical chunk number covered by any row, if any.
    pub fn last_chunk_number(&self) -> Option<u32> {
        let table = self.table.read().expect("locator table lock poisoned");
        table.last().map(|e| e.end)
    }

    /// Exclusive upper bound on log positions covered by completed chunks.
    ///
    /// This is the natural `position` for a fresh scavenge point: everything
    /// below it lives in a chunk the pipeline can see.
    pub fn tail_position(&self) -> u64 {
        match self.last_chunk_number() {
            Some(last) => (last as u64 + 1) * self.chunk_size as u64,
            None => 0,
        }
    }

    /// The locator of the row covering `number`.
    ///
    /// # Errors
    ///
    /// [`Error::ChunkNotFound`] when no row covers the number.
    pub fn locator(&self, number: u32) -> Result<ChunkLocator, Error> {
        let table = self.table.read().expect("locator table lock poisoned");
        table
            .iter()
            .find(|e| e.start <= number && number <= e.end)
            .map(|e| e.locator.clone())
            .ok_or(Error::ChunkNotFound(number))
    }

    /// The `(start, end)` logical range of the row covering `number`.
    pub fn range_of(&self, number: u32) -> Result<(u32, u32), Error> {
        let table = self.table.read().expect("locator table lock poisoned");
        table
            .iter()
            .find(|e| e.start <= number && number <= e.end)
            .map(|e| (e.start, e.end))
            .ok_or(Error::ChunkNotFound(number))
    }

    /// The current file version of the row covering `number`.
    pub fn version_of(&self, number: u32) -> Result<u32, Error> {
        let table = self.table.read().expect("locator table lock poisoned");
        table
            .iter()
            .find(|e| e.start <= number && number <= e.end)
            .map(|e| e.version)
            .ok_or(Error::ChunkNotFound(number))
    }

    /// Open the chunk covering `number` for reading.
    ///
    /// # Errors
    ///
    /// [`Error::ChunkNotFound`] for uncovered numbers; [`Error::InvalidArgument`]
    /// for archived chunks (callers must check [`ChunkManager::locator`] and
    /// skip those).
    pub fn open_for_read(&self, number: u32) -> Result<ChunkFile, Error> {
        match self.locator(number)? {
            ChunkLocator::Local(path) => {
                let file = ChunkFile::open(&path)?;
                let mut cache = self.header_cache.lock().expect("header cache lock poisoned");
                cache.put(number, file.header);
                Ok(file)
            }
            ChunkLocator::Archived(key) => Err(Error::InvalidArgument(format!(
                "chunk {number} is archived ({key}); archived chunks are read via the archive tier"
            ))),
        }
    }

    /// The parsed header of the chunk covering `number`, via the LRU cache.
    pub fn header_of(&self, number: u32) -> Result<ChunkHeader, Error> {
        {
            let mut cache = self.header_cache.lock().expect("header cache lock poisoned");
            if let Some(header) = cache.get(&number) {
                return Ok(*header);
            }
        }
        Ok(self.open_for_read(number)?.header)
    }

    /// Path for a brand-new temporary chunk artifact.
    ///
    /// The temp name never parses as a chunk file, so an interrupted rewrite
    /// leaves nothing a future [`ChunkManager::load`] would pick up.
    pub fn temp_path(&self) -> PathBuf {
        self.dir.join(format!("scavenge-{}.tmp", Uuid::new_v4()))
    }

    /// Atomically swap a verified new artifact in for the rows covering
    /// `start..=end`.
    ///
    /// The verified temp file is renamed to the next version's chunk name and
    /// the directory fsynced *before* the table lock is taken; the lock is
    /// held only for the row splice. Superseded local files are deleted after
    /// the table update, when no new reader can resolve to them.
    ///
    /// # Errors
    ///
    /// [`Error::ChunkNotFound`] if no rows lie within `start..=end`;
    /// I/O errors from the rename/fsync (the temp file is left in place and
    /// the table untouched -- the old chunks remain authoritative).
    pub fn swap_in(&self, temp_path: &Path, start: u32, end: u32) -> Result<(), Error> {
        let next_version = self.version_of(start)? + 1;
        {
            // Coverage must be validated before the rename: a renamed file
            // with no rows to splice would be adopted as live by a later load.
            let table = self.table.read().expect("locator table lock poisoned");
            if !table.iter().any(|e| e.start >= start && e.end <= end) {
                return Err(Error::ChunkNotFound(start));
            }
        }
        let final_path = self.dir.join(chunk_file_name(start, next_version));
        std::fs::rename(temp_path, &final_path)?;
        let dir_handle = File::open(&self.dir)?;
        dir_handle.sync_all()?;

        let superseded: Vec<ChunkLocator> = {
            // Chunk-switch lock: held only for the table splice.
            let mut table = self.table.write().expect("locator table lock poisoned");
            let covered: Vec<usize> = table
                .iter()
                .enumerate()
                .filter(|(_, e)| e.start >= start && e.end <= end)
                .map(|(i, _)| i)
                .collect();
            let first = match covered.first() {
                Some(&i) => i,
                None => return Err(Error::ChunkNotFound(start)),
            };
            let removed: Vec<ChunkEntry> = table.drain(first..first + covered.len()).collect();
            table.insert(
                first,
                ChunkEntry {
                    start,
                    end,
                    version: next_version,
                    locator: ChunkLocator::Local(final_path),
                },
            );
            removed.into_iter().map(|e| e.locator).collect()
        };

        {
            let mut cache = self.header_cache.lock().expect("header cache lock poisoned");
            for number in start..=end {
                cache.pop(&number);
            }
        }

        for locator in superseded {
            if let ChunkLocator::Local(path) = locator {
                if let Err(e) = std::fs::remove_file(&path) {
                    // Not fatal: a stale file is reclaimed by the next load.
                    tracing::warn!(path = %path.display(), error = %e, "failed to delete superseded chunk");
                }
            }
        }

        tracing::info!(start, end, version = next_version, "chunk swap complete");
        Ok(())
    }

    /// Register an archived chunk row (used when the archive tier owns a
    /// range the local directory no longer holds).
    pub fn register_archived(&self, start: u32, end: u32, key: &str) {
        let mut table = self.table.write().expect("locator table lock poisoned");
        let position = table.iter().position(|e| e.start > start).unwrap_or(table.len());
        table.insert(
            position,
            ChunkEntry {
                start,
                end,
                version: 0,
                locator: ChunkLocator::Archived(key.to_string()),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PrepareFlags, PrepareRecord, CHUNK_FORMAT_VERSION};
    use bytes::Bytes;

    fn header_for(number: u32) -> ChunkHeader {
        ChunkHeader {
            version: CHUNK_FORMAT_VERSION,
            min_compatible_version: 1,
            chunk_size: 4096,
            chunk_start_number: number,
            chunk_end_number: number,
            is_scavenged: false,
            transform_type: 0,
            chunk_id: Uuid::new_v4(),
        }
    }

    fn record(stream: &str, event_number: u64, position: u64) -> LogRecord {
        LogRecord::Prepare(PrepareRecord {
            log_position: position,
            transaction_position: position,
            flags: PrepareFlags::DATA | PrepareFlags::IS_COMMITTED,
            stream_name: stream.to_string(),
            event_number,
            timestamp: 1_700_000_000_000,
            event_type: "TestEvent".to_string(),
            data: Bytes::from_static(b"{}"),
            metadata: Bytes::new(),
        })
    }

    /// Write a completed chunk file and return its path.
    fn write_chunk(dir: &Path, number: u32, records: &[LogRecord]) -> PathBuf {
        let path = dir.join(chunk_file_name(number, 0));
        let mut writer = ChunkWriter::create(path, header_for(number)).expect("create");
        for r in records {
            writer.append(r).expect("append");
        }
        let logical = writer.physical_data_size();
        writer.complete(logical).expect("complete")
    }

    // File naming.

    #[test]
    fn chunk_file_name_round_trips() {
        let name = chunk_file_name(42, 7);
        assert_eq!(name, "chunk-000042.000007");
        assert_eq!(parse_chunk_file_name(&name), Some((42, 7)));
    }

    #[test]
    fn non_chunk_names_do_not_parse() {
        assert_eq!(parse_chunk_file_name("scavenge-abc.tmp"), None);
        assert_eq!(parse_chunk_file_name("chunk-1.2"), None);
        assert_eq!(parse_chunk_file_name("events.log"), None);
    }

    // Locators.

    #[test]
    fn locator_codec_distinguishes_archive() {
        let local = ChunkLocator::parse("/data/chunk-000001.000000");
        assert!(!local.is_archived());
        let archived = ChunkLocator::parse("archive:bucket/chunk-000001");
        assert!(archived.is_archived());
        assert_eq!(archived.render(), "archive:bucket/chunk-000001");
        assert_eq!(ChunkLocator::parse(&archived.render()), archived);
    }

    // Write then read back.

    #[test]
    fn writer_round_trip_with_verification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = vec![record("orders", 0, 0), record("orders", 1, 100)];
        let path = write_chunk(dir.path(), 0, &records);

        let file = ChunkFile::open(&path).expect("open");
        assert_eq!(file.records, records);
        let footer = file.footer.expect("completed chunk has a footer");
        assert!(footer.is_completed);
        assert!(footer.physical_data_size > 0);
    }

    #[test]
    fn open_rejects_flipped_bit_in_completed_chunk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_chunk(dir.path(), 0, &[record("orders", 0, 0)]);

        let mut data = std::fs::read(&path).expect("read");
        let mid = CHUNK_HEADER_SIZE + 10;
        data[mid] ^= 0x01;
        std::fs::write(&path, &data).expect("write");

        let err = ChunkFile::open(&path).expect_err("corrupt chunk should fail");
        assert!(
            matches!(
                err,
                Error::ContentHashMismatch { .. } | Error::CorruptRecord { .. }
            ),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn open_tolerates_truncated_tail_in_uncompleted_chunk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(chunk_file_name(0, 0));
        let mut writer = ChunkWriter::create(path.clone(), header_for(0)).expect("create");
        writer.append(&record("orders", 0, 0)).expect("append");
        // No complete(): simulate an in-flight tail chunk with a torn frame.
        drop(writer);
        let mut data = std::fs::read(&path).expect("read");
        data.extend_from_slice(&[0x10, 0x00, 0x00, 0x00, 0xAA]); // partial frame
        std::fs::write(&path, &data).expect("write");

        let file = ChunkFile::open(&path).expect("open should tolerate torn tail");
        assert_eq!(file.records.len(), 1);
        assert!(file.footer.is_none());
    }

    #[test]
    fn append_rejects_stream_name_longer_than_its_length_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("candidate.tmp");
        let mut writer = ChunkWriter::create(path, header_for(0)).expect("create");

        let long_name = "x".repeat(u16::MAX as usize + 1);
        let err = writer
            .append(&record(&long_name, 0, 0))
            .expect_err("overlong stream name must not encode");
        assert!(matches!(err, Error::InvalidArgument(_)), "got: {err:?}");

        // The writer is still usable for well-formed records.
        writer.append(&record("orders", 0, 0)).expect("append");
        assert_eq!(writer.record_count(), 1);
        writer.discard().expect("discard");
    }

    #[test]
    fn writer_discard_removes_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("candidate.tmp");
        let mut writer = ChunkWriter::create(path.clone(), header_for(0)).expect("create");
        writer.append(&record("orders", 0, 0)).expect("append");
        writer.discard().expect("discard");
        assert!(!path.exists());
    }

    // Manager.

    #[test]
    fn load_builds_table_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_chunk(dir.path(), 1, &[record("a", 0, 4096)]);
        write_chunk(dir.path(), 0, &[record("a", 0, 0)]);
        write_chunk(dir.path(), 2, &[record("a", 1, 8192)]);

        let manager = ChunkManager::load(dir.path(), 4096).expect("load");
        assert_eq!(manager.chunk_numbers(), vec![0, 1, 2]);
        assert_eq!(manager.last_chunk_number(), Some(2));
        assert_eq!(manager.tail_position(), 3 * 4096);
    }

    #[test]
    fn load_prefers_highest_version_and_removes_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let v0 = write_chunk(dir.path(), 0, &[record("old", 0, 0)]);
        // Write version 1 of the same logical chunk.
        let path = dir.path().join(chunk_file_name(0, 1));
        let mut writer = ChunkWriter::create(path, header_for(0)).expect("create");
        writer.append(&record("new", 0, 0)).expect("append");
        let logical = writer.physical_data_size();
        writer.complete(logical).expect("complete");

        let manager = ChunkManager::load(dir.path(), 4096).expect("load");
        assert_eq!(manager.version_of(0).expect("version"), 1);
        assert!(!v0.exists(), "stale version should be deleted");

        let file = manager.open_for_read(0).expect("open");
        match &file.records[0] {
            LogRecord::Prepare(p) => assert_eq!(p.stream_name, "new"),
            other => panic!("expected prepare, got {other:?}"),
        }
    }

    #[test]
    fn chunk_of_position_uses_declared_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = ChunkManager::load(dir.path(), 4096).expect("load");
        assert_eq!(manager.chunk_of_position(0), 0);
        assert_eq!(manager.chunk_of_position(4095), 0);
        assert_eq!(manager.chunk_of_position(4096), 1);
    }

    #[test]
    fn swap_in_replaces_row_and_deletes_old_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old_path = write_chunk(dir.path(), 0, &[record("orders", 0, 0)]);
        let manager = ChunkManager::load(dir.path(), 4096).expect("load");

        // Build a scavenged replacement at a temp path.
        let temp = manager.temp_path();
        let mut h = header_for(0);
        h.is_scavenged = true;
        let mut writer = ChunkWriter::create(temp.clone(), h).expect("create");
        writer.append(&record("orders", 1, 50)).expect("append");
        let logical = writer.physical_data_size();
        let verified = writer.complete(logical).expect("complete");

        manager.swap_in(&verified, 0, 0).expect("swap");
        assert!(!old_path.exists(), "superseded file should be deleted");
        assert_eq!(manager.version_of(0).expect("version"), 1);

        let file = manager.open_for_read(0).expect("open");
        assert!(file.header.is_scavenged);
        assert_eq!(file.records.len(), 1);
    }

    #[test]
    fn swap_in_merged_range_collapses_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_chunk(dir.path(), 0, &[record("a", 0, 0)]);
        write_chunk(dir.path(), 1, &[record("a", 1, 4096)]);
        let manager = ChunkManager::load(dir.path(), 4096).expect("load");

        let temp = manager.temp_path();
        let mut h = header_for(0);
        h.chunk_end_number = 1;
        h.is_scavenged = true;
        let mut writer = ChunkWriter::create(temp, h).expect("create");
        writer.append(&record("a", 0, 0)).expect("append");
        writer.append(&record("a", 1, 4096)).expect("append");
        let logical = writer.physical_data_size();
        let verified = writer.complete(logical).expect("complete");

        manager.swap_in(&verified, 0, 1).expect("swap");
        assert_eq!(manager.chunk_numbers(), vec![0]);
        assert_eq!(manager.range_of(0).expect("range"), (0, 1));
        assert_eq!(manager.range_of(1).expect("range"), (0, 1));
        assert_eq!(manager.last_chunk_number(), Some(1));
    }

    #[test]
    fn swap_in_rejects_uncovered_range_before_renaming() {
        let dir = tempfile::tempdir().expect("tempdir");
        // One merged row covering 0..=1: a swap targeting only chunk 0 has
        // no rows inside its range to splice out.
        let path = dir.path().join(chunk_file_name(0, 0));
        let mut h = header_for(0);
        h.chunk_end_number = 1;
        let mut writer = ChunkWriter::create(path, h).expect("create");
        writer.append(&record("a", 0, 0)).expect("append");
        let logical = writer.physical_data_size();
        writer.complete(logical).expect("complete");

        let manager = ChunkManager::load(dir.path(), 4096).expect("load");
        let temp = manager.temp_path();
        std::fs::write(&temp, b"candidate").expect("write temp");

        let err = manager
            .swap_in(&temp, 0, 0)
            .expect_err("uncovered range must be rejected");
        assert!(matches!(err, Error::ChunkNotFound(0)), "got: {err:?}");
        assert!(temp.exists(), "the temp file must not have been renamed");
        assert!(
            !dir.path().join(chunk_file_name(0, 1)).exists(),
            "no versioned artifact may be left for a later load to adopt"
        );
    }

    #[test]
    fn archived_rows_are_not_opened_locally() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = ChunkManager::load(dir.path(), 4096).expect("load");
        manager.register_archived(0, 0, "bucket/chunk-0");

        let locator = manager.locator(0).expect("locator");
        assert!(locator.is_archived());
        let err = manager.open_for_read(0).expect_err("archived open should fail");
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn missing_chunk_is_chunk_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = ChunkManager::load(dir.path(), 4096).expect("load");
        assert!(matches!(manager.locator(5), Err(Error::ChunkNotFound(5))));
    }
}
