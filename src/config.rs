//! Run configuration for export and import pipelines.
//!
//! Everything here is a plain value snapshot taken at job start. Shared
//! mutable state (failure slot, counters, latches) lives in
//! [`crate::context`] instead, so a config can be freely cloned into
//! every worker.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default size of one file block claimed by a reader worker: 2 MiB.
pub const DEFAULT_READ_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Lookahead appended to every block read so a record straddling the block
/// boundary can be framed without a second seek: 4 KiB.
///
/// This is a fixed heuristic, not derived from an actual maximum record
/// length. A single record longer than the padding is silently truncated;
/// callers with wider rows must raise the block size accordingly.
pub const READ_PADDING: usize = 4 * 1024;

/// Number of records accumulated into one published batch.
pub const DEFAULT_EMIT_BATCH_SIZE: usize = 200;

/// Default slot count of the bounded handoff ring (rounded up to a power
/// of two by the ring itself).
pub const DEFAULT_RING_SIZE: usize = 512;

/// Default number of file-reader producers.
pub const DEFAULT_PRODUCER_SIZE: usize = 4;

/// Field separator used when none is configured.
pub const DEFAULT_SEPARATOR: &str = ",";

/// How long the orchestrator waits on the producer latch before re-checking
/// the shared failure slot.
pub const LATCH_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Poll interval for the emitted-but-not-drained counter.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Quote enclosure policy for exported fields.
///
/// The byte-level escape rules are the formatter's concern; this only
/// decides *when* a field is enclosed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuoteMode {
    /// Never enclose.
    None,
    /// Enclose every field.
    Force,
    /// Enclose a string-typed field only when its bytes contain the
    /// separator, a quote character, or a line terminator.
    #[default]
    Auto,
}

/// Source/sink text encoding. Only byte-transparent charsets are handled
/// in-process; anything else is a collaborator's concern.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Charset {
    #[default]
    Utf8,
    Latin1,
}

impl Charset {
    /// BOM stripping only applies to UTF encodings.
    #[must_use]
    pub fn is_utf(self) -> bool {
        matches!(self, Charset::Utf8)
    }
}

/// How exported rows are distributed over output files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileSplitPolicy {
    /// One output file per shard, unbounded length.
    PerShard,
    /// Roll to a new file whenever the current one reaches this many lines.
    LineCapped(u64),
    /// Exactly this many output files, decoupled from the shard count.
    FixedCount(usize),
}

/// Cross-shard ordering strategy for an ordered export.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeMode {
    /// Forward the ORDER BY to the store per shard and concatenate shard
    /// outputs sequentially. No global order across shards.
    PushDown,
    /// Stream per-shard sorted rows through bounded queues and interleave
    /// them with a single k-way merge consumer. Memory is bounded by
    /// `shards * queue capacity`.
    Streaming,
    /// Read every shard to completion into memory, then merge with a heap.
    /// Trades memory for load-stage parallelism.
    ParallelBuffered,
}

/// ORDER BY specification for an ordered export.
#[derive(Clone, Debug)]
pub struct OrderSpec {
    pub columns: Vec<String>,
    pub descending: bool,
    pub merge: MergeMode,
}

/// Configuration for one export run (database to files).
#[derive(Clone, Debug)]
pub struct ExportConfig {
    /// Output path prefix; each file gets a numeric suffix.
    pub file_prefix: String,
    pub separator: String,
    pub quote: QuoteMode,
    pub with_header: bool,
    pub split: FileSplitPolicy,
    /// Maximum number of shards queried concurrently. Defaults to the
    /// shard count when unset.
    pub parallelism: Option<usize>,
    /// Opaque predicate text appended verbatim by the SQL builder.
    pub where_clause: Option<String>,
    pub order_by: Option<OrderSpec>,
    /// Rows accumulated per published batch in fixed-file-count mode.
    pub batch_size: usize,
    /// Global rows/sec target, divided evenly across consumers.
    pub rate_limit: Option<u64>,
    pub ring_size: usize,
}

impl ExportConfig {
    #[must_use]
    pub fn new(file_prefix: impl Into<String>) -> Self {
        Self {
            file_prefix: file_prefix.into(),
            separator: DEFAULT_SEPARATOR.to_string(),
            quote: QuoteMode::default(),
            with_header: false,
            split: FileSplitPolicy::PerShard,
            parallelism: None,
            where_clause: None,
            order_by: None,
            batch_size: DEFAULT_EMIT_BATCH_SIZE,
            rate_limit: None,
            ring_size: DEFAULT_RING_SIZE,
        }
    }
}

/// Configuration for one import run (files to database).
#[derive(Clone, Debug)]
pub struct ImportConfig {
    pub separator: String,
    pub charset: Charset,
    /// Skip the first record of the first block of each file.
    pub with_header: bool,
    /// Route rows by partition key instead of plain inserts.
    pub sharded: bool,
    /// Use insert-ignore semantics and verify resumability through the
    /// block ledger and history file.
    pub insert_ignore_and_resume: bool,
    /// Frame and parse everything, execute nothing.
    pub read_only: bool,
    /// Number of file-reader producers.
    pub producers: usize,
    /// Requested consumer count. Unless [`Self::force_consumer_parallelism`]
    /// is set, the effective count is at least the CPU count.
    pub consumers: usize,
    pub force_consumer_parallelism: bool,
    pub block_size: usize,
    pub batch_size: usize,
    pub ring_size: usize,
    /// Global rows/sec target, divided evenly across consumers.
    pub rate_limit: Option<u64>,
    /// Resume journal location; required for
    /// [`Self::insert_ignore_and_resume`] to survive restarts.
    pub history_file: Option<std::path::PathBuf>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR.to_string(),
            charset: Charset::default(),
            with_header: false,
            sharded: false,
            insert_ignore_and_resume: false,
            read_only: false,
            producers: DEFAULT_PRODUCER_SIZE,
            consumers: DEFAULT_PRODUCER_SIZE,
            force_consumer_parallelism: false,
            block_size: DEFAULT_READ_BLOCK_SIZE,
            batch_size: DEFAULT_EMIT_BATCH_SIZE,
            ring_size: DEFAULT_RING_SIZE,
            rate_limit: None,
            history_file: None,
        }
    }
}

impl ImportConfig {
    /// Effective consumer pool size.
    #[must_use]
    pub fn effective_consumers(&self) -> usize {
        if self.force_consumer_parallelism {
            self.consumers.max(1)
        } else {
            self.consumers.max(num_cpus::get())
        }
    }
}

/// Configuration for file-driven UPDATE/DELETE runs. Reuses the import
/// pipeline settings for the file-reading side.
#[derive(Clone, Debug, Default)]
pub struct DmlConfig {
    pub pipeline: ImportConfig,
}

/// Per-consumer pacing budget: the global rows/sec target divided across
/// consumers and batch size. `None` disables throttling.
#[must_use]
pub fn batch_rate_per_consumer(
    rate_limit: Option<u64>,
    consumers: usize,
    batch_size: usize,
) -> Option<f64> {
    let tps = rate_limit?;
    let denom = (consumers.max(1) * batch_size.max(1)) as f64;
    Some(tps as f64 / denom)
}
