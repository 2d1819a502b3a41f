//! Metric names emitted by the scavenge pipeline.
//!
//! The pipeline records counters through the `metrics` facade; whichever
//! recorder the embedding process installs (Prometheus exporter, test
//! recorder, none at all) receives them. Only names and descriptions live
//! here so dashboards and code cannot drift apart.

/// Chunks fully accumulated (counter).
pub const CHUNKS_ACCUMULATED: &str = "scavenge_chunks_accumulated_total";

/// Stream handles processed by the calculator (counter).
pub const STREAMS_CALCULATED: &str = "scavenge_streams_calculated_total";

/// Chunks processed by the chunk executor, rewritten or not (counter).
pub const CHUNKS_EXECUTED: &str = "scavenge_chunks_executed_total";

/// Archived chunks skipped by the chunk executor (counter).
pub const CHUNKS_SKIPPED_ARCHIVED: &str = "scavenge_chunks_skipped_archived_total";

/// Records removed by chunk rewrites (counter).
pub const RECORDS_DISCARDED: &str = "scavenge_records_discarded_total";

/// Bytes of record frames removed by chunk rewrites (counter).
pub const BYTES_RECLAIMED: &str = "scavenge_bytes_reclaimed_total";

/// Index entries dropped while rebuilding the index generation (counter).
pub const INDEX_ENTRIES_DISCARDED: &str = "scavenge_index_entries_discarded_total";

/// Source chunks collapsed by the merger (counter).
pub const CHUNKS_MERGED: &str = "scavenge_chunks_merged_total";

/// State store entries deleted by the cleaner (counter).
pub const STATE_ENTRIES_CLEANED: &str = "scavenge_state_entries_cleaned_total";

/// Scavenge runs driven to `Done` (counter).
pub const RUNS_COMPLETED: &str = "scavenge_runs_completed_total";

/// Register descriptions for every metric the pipeline emits.
///
/// Optional; call once after installing a recorder so exposition output
/// carries help texts.
pub fn describe_metrics() {
    metrics::describe_counter!(CHUNKS_ACCUMULATED, "Chunks fully accumulated");
    metrics::describe_counter!(
        STREAMS_CALCULATED,
        "Stream handles processed by the calculator"
    );
    metrics::describe_counter!(
        CHUNKS_EXECUTED,
        "Chunks processed by the chunk executor, rewritten or not"
    );
    metrics::describe_counter!(
        CHUNKS_SKIPPED_ARCHIVED,
        "Archived chunks skipped by the chunk executor"
    );
    metrics::describe_counter!(RECORDS_DISCARDED, "Records removed by chunk rewrites");
    metrics::describe_counter!(
        BYTES_RECLAIMED,
        "Bytes of record frames removed by chunk rewrites"
    );
    metrics::describe_counter!(
        INDEX_ENTRIES_DISCARDED,
        "Index entries dropped while rebuilding the index generation"
    );
    metrics::describe_counter!(CHUNKS_MERGED, "Source chunks collapsed by the merger");
    metrics::describe_counter!(
        STATE_ENTRIES_CLEANED,
        "State store entries deleted by the cleaner"
    );
    metrics::describe_counter!(RUNS_COMPLETED, "Scavenge runs driven to Done");
}
