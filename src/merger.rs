//! Chunk merging phase.
//!
//! Scavenged chunks shrink; many small files cost file handles and seeks.
//! This pass collapses consecutive runs of small scavenged chunks into one
//! file spanning the combined logical range, using the same
//! write-verify-swap discipline as chunk execution. Purely physical: no
//! discard decision is revisited.

use crate::chunk::{ChunkLocator, ChunkManager, ChunkWriter};
use crate::codec::{
    ChunkHeader, CHUNK_FOOTER_SIZE, CHUNK_HEADER_SIZE, SCAVENGED_MIN_COMPATIBLE_VERSION,
};
use crate::error::Error;
use crate::orchestrator::CancellationFlag;

/// Run the merge phase.
///
/// A run of consecutive local scavenged chunks is merged when the combined
/// record regions still fit within `target_size` bytes. Archived and
/// unscavenged chunks break runs.
///
/// # Errors
///
/// [`Error::Cancelled`] between runs; I/O or verification failures abort
/// with the source chunks untouched.
pub fn merge_chunks(
    chunks: &ChunkManager,
    target_size: u64,
    cancel: &CancellationFlag,
) -> Result<(), Error> {
    let numbers = chunks.chunk_numbers();
    let mut i = 0;
    while i < numbers.len() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let run = collect_run(chunks, target_size, &numbers[i..])?;
        if run.len() >= 2 {
            merge_run(chunks, &run)?;
            metrics::counter!(crate::metrics::CHUNKS_MERGED).increment(run.len() as u64);
            i += run.len();
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// Greedily extend a run of mergeable chunks from the front of `numbers`.
fn collect_run(
    chunks: &ChunkManager,
    capacity: u64,
    numbers: &[u32],
) -> Result<Vec<u32>, Error> {
    let fixed = (CHUNK_HEADER_SIZE + CHUNK_FOOTER_SIZE) as u64;
    let mut run = Vec::new();
    let mut total = 0u64;
    for &number in numbers {
        let locator = chunks.locator(number)?;
        let ChunkLocator::Local(path) = locator else {
            break;
        };
        if !chunks.header_of(number)?.is_scavenged {
            break;
        }
        let data_len = std::fs::metadata(&path)?.len().saturating_sub(fixed);
        if total + data_len > capacity {
            break;
        }
        total += data_len;
        run.push(number);
    }
    Ok(run)
}

fn merge_run(chunks: &ChunkManager, run: &[u32]) -> Result<(), Error> {
    let (start, _) = chunks.range_of(run[0])?;
    let (_, end) = chunks.range_of(run[run.len() - 1])?;
    let first = chunks.header_of(run[0])?;

    let header = ChunkHeader {
        version: first.version,
        min_compatible_version: SCAVENGED_MIN_COMPATIBLE_VERSION,
        chunk_size: chunks.chunk_size(),
        chunk_start_number: start,
        chunk_end_number: end,
        is_scavenged: true,
        transform_type: first.transform_type,
        chunk_id: uuid::Uuid::new_v4(),
    };
    let mut writer = ChunkWriter::create(chunks.temp_path(), header)?;
    let mut logical = 0u64;
    let result = (|| {
        for &number in run {
            let file = chunks.open_for_read(number)?;
            for record in &file.records {
                writer.append(record)?;
            }
            logical += match &file.footer {
                Some(footer) => footer.logical_data_size,
                None => file
                    .records
                    .iter()
                    .map(crate::codec::encoded_len)
                    .sum::<u64>(),
            };
        }
        Ok::<(), Error>(())
    })();
    if let Err(error) = result {
        if let Err(cleanup) = writer.discard() {
            tracing::warn!(error = %cleanup, "failed to remove candidate merge file");
        }
        return Err(error);
    }
    let temp = writer.complete(logical)?;
    chunks.swap_in(&temp, start, end)?;
    tracing::info!(
        first = start,
        last = end,
        sources = run.len(),
        "merged chunk run"
    );
    Ok(())
}
