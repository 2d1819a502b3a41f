//! The scavenge orchestrator: a crash-safe phase state machine.
//!
//! Drives Accumulating -> Calculating -> ExecutingChunks -> ExecutingIndex
//! -> MergingChunks -> Cleaning -> Done. The current phase and its progress
//! live in the state store's checkpoint; every transition is persisted
//! before the next phase starts, so a restart resumes exactly where the
//! last run stopped, under the same scavenge point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chunk::ChunkManager;
use crate::error::Error;
use crate::index::StreamIndex;
use crate::state::ScavengeStateStore;
use crate::types::{ScavengeCheckpoint, ScavengePoint};

/// Cooperative cancellation signal.
///
/// Phases poll it between units of work (chunk, stream handle); raising it
/// makes the in-flight phase return [`Error::Cancelled`] with the last
/// completed checkpoint intact.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    inner: Arc<AtomicBool>,
}

impl CancellationFlag {
    /// Create a flag in the not-cancelled state.
    pub fn new() -> CancellationFlag {
        CancellationFlag::default()
    }

    /// Raise the flag. Idempotent; there is no way to lower it again.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// Tuning knobs for a scavenge run.
#[derive(Debug, Clone)]
pub struct ScavengeConfig {
    /// Declared chunk capacity in bytes; callers pass the same value to
    /// [`ChunkManager::load`].
    pub chunk_size: u32,
    /// Minimum removable weight in bytes before a chunk is physically
    /// rewritten. Zero rewrites on any gain.
    pub threshold: u64,
    /// Maximum combined record-region size for a merged chunk; defaults to
    /// `chunk_size` when `None`.
    pub merge_target_size: Option<u64>,
}

impl Default for ScavengeConfig {
    fn default() -> Self {
        ScavengeConfig {
            chunk_size: 256 * 1024 * 1024,
            threshold: 0,
            merge_target_size: None,
        }
    }
}

/// Drives one scavenge run across all phases.
pub struct Scavenger<'a> {
    state: &'a mut ScavengeStateStore,
    chunks: &'a ChunkManager,
    index: &'a dyn StreamIndex,
    config: ScavengeConfig,
}

impl<'a> Scavenger<'a> {
    /// Assemble a scavenger over its collaborators.
    pub fn new(
        state: &'a mut ScavengeStateStore,
        chunks: &'a ChunkManager,
        index: &'a dyn StreamIndex,
        config: ScavengeConfig,
    ) -> Scavenger<'a> {
        Scavenger {
            state,
            chunks,
            index,
            config,
        }
    }

    /// Run the pipeline to `Done`, resuming from a persisted checkpoint if
    /// one exists, otherwise minting a fresh scavenge point at the current
    /// log tail.
    ///
    /// Returns the scavenge point the completed run was pinned to.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] when `cancel` is raised; any phase error
    /// propagates with the last good checkpoint still persisted, so a later
    /// call resumes rather than restarts.
    pub fn run(&mut self, cancel: &CancellationFlag) -> Result<ScavengePoint, Error> {
        match self.state.checkpoint() {
            None | Some(ScavengeCheckpoint::Done { .. }) => {
                let point = self.mint_point();
                tracing::info!(
                    position = point.position,
                    scavenge = point.event_number,
                    "starting fresh scavenge"
                );
                self.state.set_checkpoint(ScavengeCheckpoint::Accumulating {
                    point,
                    done_chunk: None,
                })?;
            }
            Some(checkpoint) => {
                tracing::info!(
                    phase = checkpoint.phase_name(),
                    scavenge = checkpoint.point().event_number,
                    "resuming scavenge from checkpoint"
                );
            }
        }

        loop {
            let checkpoint = self
                .state
                .checkpoint()
                .cloned()
                .ok_or_else(|| Error::CorruptState("checkpoint vanished mid-run".to_string()))?;
            match checkpoint {
                ScavengeCheckpoint::Accumulating { point, .. } => {
                    crate::accumulator::accumulate(self.state, self.chunks, &point, cancel)?;
                    self.state.set_checkpoint(ScavengeCheckpoint::Calculating {
                        point,
                        done: None,
                    })?;
                }
                ScavengeCheckpoint::Calculating { point, .. } => {
                    crate::calculator::calculate(
                        self.state,
                        self.index,
                        self.chunks,
                        &point,
                        cancel,
                    )?;
                    self.state
                        .set_checkpoint(ScavengeCheckpoint::ExecutingChunks {
                            point,
                            done_chunk: None,
                        })?;
                }
                ScavengeCheckpoint::ExecutingChunks { point, .. } => {
                    crate::chunk_executor::execute_chunks(self.state, self.chunks, &point, cancel)?;
                    self.state
                        .set_checkpoint(ScavengeCheckpoint::ExecutingIndex { point })?;
                }
                ScavengeCheckpoint::ExecutingIndex { point } => {
                    crate::index_executor::execute_index(self.state, self.index, &point, cancel)?;
                    self.state
                        .set_checkpoint(ScavengeCheckpoint::MergingChunks { point })?;
                }
                ScavengeCheckpoint::MergingChunks { point } => {
                    let target = self
                        .config
                        .merge_target_size
                        .unwrap_or(u64::from(self.config.chunk_size));
                    crate::merger::merge_chunks(self.chunks, target, cancel)?;
                    self.state
                        .set_checkpoint(ScavengeCheckpoint::Cleaning { point })?;
                }
                ScavengeCheckpoint::Cleaning { point } => {
                    // Non-fatal: a failed clean only leaves extra state behind.
                    if let Err(error) = crate::cleaner::clean(self.state) {
                        tracing::warn!(%error, "cleaning failed; entries remain until next run");
                    }
                    self.state
                        .set_checkpoint(ScavengeCheckpoint::Done { point })?;
                }
                ScavengeCheckpoint::Done { point } => {
                    tracing::info!(scavenge = point.event_number, "scavenge complete");
                    metrics::counter!(crate::metrics::RUNS_COMPLETED).increment(1);
                    return Ok(point);
                }
            }
        }
    }

    /// Pin a fresh scavenge point at the current log tail.
    fn mint_point(&self) -> ScavengePoint {
        let event_number = match self.state.checkpoint() {
            Some(ScavengeCheckpoint::Done { point }) => point.event_number + 1,
            _ => 1,
        };
        ScavengePoint {
            position: self.chunks.tail_position(),
            event_number,
            effective_now: unix_now_ms(),
            threshold: self.config.threshold,
        }
    }
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
