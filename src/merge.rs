//! Ordered export: globally ordered output across shards.
//!
//! The ORDER BY is always pushed down to the store, so each shard yields
//! its rows already sorted; what varies is how the sorted shard streams
//! become one output:
//!
//! - [`MergeMode::PushDown`]: concatenate shard outputs in shard order.
//!   Cheap, ordered within each shard only.
//! - [`MergeMode::Streaming`]: one bounded queue per shard and a single
//!   k-way merge consumer. Memory stays bounded by `shards * queue depth`.
//! - [`MergeMode::ParallelBuffered`]: load every shard to completion in
//!   parallel, then heap-merge in memory. Fastest load, highest memory.
//!
//! Ties between shards resolve to the lowest shard index, so repeated runs
//! produce byte-identical output.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::{Receiver, bounded};
use rayon::prelude::*;
use tracing::info;

use crate::config::{ExportConfig, FileSplitPolicy, MergeMode, OrderSpec};
use crate::context::FailureSlot;
use crate::db::{ConnectionProvider, FieldMeta, FieldType, Row, SchemaService, Shard, SqlBuilder};
use crate::error::{Result, TransferError};
use crate::export::ShardFileWriter;
use crate::format::RowFormatter;
use crate::transform::BlockTransform;

/// Compares rows by the ordering columns. NULL sorts before every value;
/// numeric columns compare by value, everything else by raw bytes.
#[derive(Clone)]
pub struct KeyComparator {
    keys: Vec<(usize, FieldType)>,
    descending: bool,
}

impl KeyComparator {
    pub fn new(columns: &[FieldMeta], spec: &OrderSpec) -> Result<Self> {
        let mut keys = Vec::with_capacity(spec.columns.len());
        for name in &spec.columns {
            let column = columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    TransferError::config(format!("unknown ORDER BY column: {name}"))
                })?;
            keys.push((column.index, column.ty));
        }
        if keys.is_empty() {
            return Err(TransferError::config("ORDER BY requires at least one column"));
        }
        Ok(Self {
            keys,
            descending: spec.descending,
        })
    }

    pub fn compare(&self, a: &Row, b: &Row) -> CmpOrdering {
        for &(index, ty) in &self.keys {
            let left = a.get(index).and_then(|v| v.as_deref());
            let right = b.get(index).and_then(|v| v.as_deref());
            let ord = match (left, right) {
                (None, None) => CmpOrdering::Equal,
                (None, Some(_)) => CmpOrdering::Less,
                (Some(_), None) => CmpOrdering::Greater,
                (Some(l), Some(r)) => compare_values(l, r, ty),
            };
            if ord != CmpOrdering::Equal {
                return if self.descending { ord.reverse() } else { ord };
            }
        }
        CmpOrdering::Equal
    }
}

fn compare_values(left: &[u8], right: &[u8], ty: FieldType) -> CmpOrdering {
    if ty == FieldType::Numeric {
        let l = std::str::from_utf8(left).ok().and_then(|s| s.trim().parse::<f64>().ok());
        let r = std::str::from_utf8(right).ok().and_then(|s| s.trim().parse::<f64>().ok());
        if let (Some(l), Some(r)) = (l, r) {
            if let Some(ord) = l.partial_cmp(&r) {
                return ord;
            }
        }
    }
    left.cmp(right)
}

struct MergeOutput {
    formatter: RowFormatter,
    writer: ShardFileWriter,
    line: Vec<u8>,
}

impl MergeOutput {
    fn write(&mut self, row: &Row) -> Result<()> {
        self.line.clear();
        self.formatter.write_row(&mut self.line, row);
        self.writer.write_line(&self.line)
    }
}

/// Export one logical table with a global ORDER BY. Returns the files
/// written.
pub fn run_ordered_export(
    provider: &Arc<dyn ConnectionProvider>,
    schema: &dyn SchemaService,
    builder: &Arc<dyn SqlBuilder>,
    table: &str,
    config: &ExportConfig,
    transform: Option<Arc<dyn BlockTransform>>,
) -> Result<Vec<PathBuf>> {
    let Some(spec) = &config.order_by else {
        return Err(TransferError::config("ordered export without an ORDER BY"));
    };
    let topology = schema.topology(table)?;
    let columns = schema.fields(table)?;
    let comparator = KeyComparator::new(&columns, spec)?;
    let formatter = RowFormatter::new(&config.separator, config.quote, &columns);
    let header = config.with_header.then(|| formatter.header_row(&columns));

    let cap = match config.split {
        FileSplitPolicy::PerShard => None,
        FileSplitPolicy::LineCapped(cap) => Some(cap.max(1)),
        FileSplitPolicy::FixedCount(files) => {
            let total = schema.total_row_count(table)?;
            Some(total.div_ceil(files.max(1) as u64).max(1))
        }
    };
    let mut output = MergeOutput {
        formatter,
        writer: ShardFileWriter::new(config.file_prefix.clone(), cap, header, transform),
        line: Vec::new(),
    };

    match spec.merge {
        MergeMode::PushDown => {
            pushdown_concat(provider, builder, &topology.shards, &columns, spec, config, &mut output)?;
        }
        MergeMode::Streaming => {
            streaming_merge(
                provider,
                builder,
                &topology.shards,
                &columns,
                spec,
                config,
                &comparator,
                &mut output,
            )?;
        }
        MergeMode::ParallelBuffered => {
            parallel_buffered_merge(
                provider,
                builder,
                &topology.shards,
                &columns,
                spec,
                config,
                &comparator,
                &mut output,
            )?;
        }
    }
    info!(table, "ordered export finished");
    output.writer.finish()
}

fn shard_sql(
    builder: &dyn SqlBuilder,
    shard: &Shard,
    columns: &[FieldMeta],
    spec: &OrderSpec,
    config: &ExportConfig,
) -> String {
    builder.select(
        shard,
        columns,
        config.where_clause.as_deref(),
        &spec.columns,
        spec.descending,
    )
}

fn pushdown_concat(
    provider: &Arc<dyn ConnectionProvider>,
    builder: &Arc<dyn SqlBuilder>,
    shards: &[Shard],
    columns: &[FieldMeta],
    spec: &OrderSpec,
    config: &ExportConfig,
    output: &mut MergeOutput,
) -> Result<()> {
    for shard in shards {
        let sql = shard_sql(builder.as_ref(), shard, columns, spec, config);
        let mut conn = provider.connect()?;
        let mut stream = conn.query(&sql)?;
        while let Some(row) = stream.next_row()? {
            output.write(&row)?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn streaming_merge(
    provider: &Arc<dyn ConnectionProvider>,
    builder: &Arc<dyn SqlBuilder>,
    shards: &[Shard],
    columns: &[FieldMeta],
    spec: &OrderSpec,
    config: &ExportConfig,
    comparator: &KeyComparator,
    output: &mut MergeOutput,
) -> Result<()> {
    let failure = Arc::new(FailureSlot::default());
    let mut result = Ok(());
    std::thread::scope(|scope| {
        let receivers: Vec<Receiver<Row>> = shards
            .iter()
            .map(|shard| {
                let (tx, rx) = bounded::<Row>(config.ring_size.max(1));
                let sql = shard_sql(builder.as_ref(), shard, columns, spec, config);
                let provider = Arc::clone(provider);
                let failure = Arc::clone(&failure);
                scope.spawn(move || {
                    let stream = || -> Result<()> {
                        let mut conn = provider.connect()?;
                        let mut rows = conn.query(&sql)?;
                        while let Some(row) = rows.next_row()? {
                            if tx.send(row).is_err() {
                                break;
                            }
                        }
                        Ok(())
                    };
                    if let Err(err) = stream() {
                        failure.fail(err);
                    }
                    // Sender drop marks this shard exhausted.
                });
                rx
            })
            .collect();
        result = merge_receivers(&receivers, comparator, &failure, output);
    });
    result?;
    match Arc::into_inner(failure).and_then(|mut slot| slot.take()) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Scan the shard heads in index order and repeatedly take the first
/// minimal head. First shard wins ties, keeping the merge stable.
fn merge_receivers(
    receivers: &[Receiver<Row>],
    comparator: &KeyComparator,
    failure: &FailureSlot,
    output: &mut MergeOutput,
) -> Result<()> {
    let mut heads: Vec<Option<Row>> = Vec::with_capacity(receivers.len());
    for rx in receivers {
        heads.push(rx.recv().ok());
    }
    loop {
        if failure.is_set() {
            // Keep draining so no producer stays blocked on a full queue.
            for rx in receivers {
                while rx.recv().is_ok() {}
            }
            return Ok(());
        }
        let mut best: Option<usize> = None;
        for shard in 0..heads.len() {
            let Some(row) = &heads[shard] else { continue };
            best = match best {
                None => Some(shard),
                Some(current) => match &heads[current] {
                    Some(current_row)
                        if comparator.compare(row, current_row) == CmpOrdering::Less =>
                    {
                        Some(shard)
                    }
                    _ => Some(current),
                },
            };
        }
        let Some(shard) = best else {
            return Ok(());
        };
        if let Some(row) = heads[shard].take() {
            output.write(&row)?;
        }
        heads[shard] = receivers[shard].recv().ok();
    }
}

struct HeapEntry {
    row: Row,
    shard: usize,
    pos: usize,
    comparator: Arc<KeyComparator>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.shard == other.shard && self.pos == other.pos
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap: reverse the row ordering so the smallest
    // key pops first, with the lowest shard index winning ties.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match self.comparator.compare(&self.row, &other.row) {
            CmpOrdering::Equal => other.shard.cmp(&self.shard),
            ord => ord.reverse(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn parallel_buffered_merge(
    provider: &Arc<dyn ConnectionProvider>,
    builder: &Arc<dyn SqlBuilder>,
    shards: &[Shard],
    columns: &[FieldMeta],
    spec: &OrderSpec,
    config: &ExportConfig,
    comparator: &KeyComparator,
    output: &mut MergeOutput,
) -> Result<()> {
    let buffered: Vec<Vec<Row>> = shards
        .par_iter()
        .map(|shard| -> Result<Vec<Row>> {
            let sql = shard_sql(builder.as_ref(), shard, columns, spec, config);
            let mut conn = provider.connect()?;
            let mut stream = conn.query(&sql)?;
            let mut rows = Vec::new();
            while let Some(row) = stream.next_row()? {
                rows.push(row);
            }
            Ok(rows)
        })
        .collect::<Result<_>>()?;

    let comparator = Arc::new(comparator.clone());
    let mut cursors: Vec<std::vec::IntoIter<Row>> =
        buffered.into_iter().map(Vec::into_iter).collect();
    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (shard, cursor) in cursors.iter_mut().enumerate() {
        if let Some(row) = cursor.next() {
            heap.push(HeapEntry {
                row,
                shard,
                pos: 0,
                comparator: Arc::clone(&comparator),
            });
        }
    }
    while let Some(entry) = heap.pop() {
        output.write(&entry.row)?;
        if let Some(row) = cursors[entry.shard].next() {
            heap.push(HeapEntry {
                row,
                shard: entry.shard,
                pos: entry.pos + 1,
                comparator: Arc::clone(&comparator),
            });
        }
    }
    Ok(())
}
