//! Run orchestration: commands, file resolution, and the shared
//! file-reading pipeline behind import, update, and delete.
//!
//! A command names one or more logical tables. Tables are processed one
//! after another; a table that fails is reported and the run moves on to
//! the next, so one bad file never blocks the rest of a batch.

use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use tracing::{error, info};

use crate::config::{
    DRAIN_POLL_INTERVAL, DmlConfig, ExportConfig, ImportConfig, LATCH_POLL_INTERVAL,
    batch_rate_per_consumer,
};
use crate::context::{ConsumerContext, ProducerContext, SharedProgress};
use crate::db::{ConnectionProvider, SchemaService, SqlBuilder};
use crate::error::{Result, TransferError};
use crate::export::run_sharded_export;
use crate::import::{
    BatchParser, DirectImportConsumer, DmlConsumer, DmlKind, DryRunConsumer,
    ShardedImportConsumer,
};
use crate::merge::run_ordered_export;
use crate::pipeline::{RingBuffer, WorkHandler, WorkerPool};
use crate::progress::ProgressHistory;
use crate::reader::BlockReader;
use crate::source::{BlockLedger, LineBatch, SourceFileSet};
use crate::sync::RateLimiter;
use crate::transform::BlockTransform;

/// One unit of work handed to the [`Engine`].
pub enum Command {
    /// Database to files. Ordered when the config carries an ORDER BY.
    Export {
        tables: Vec<String>,
        config: ExportConfig,
    },
    /// Files to database.
    Import {
        tables: Vec<String>,
        files: Vec<PathBuf>,
        config: ImportConfig,
    },
    /// File-driven UPDATE by primary key.
    Update {
        tables: Vec<String>,
        files: Vec<PathBuf>,
        config: DmlConfig,
    },
    /// File-driven DELETE by primary key.
    Delete {
        tables: Vec<String>,
        files: Vec<PathBuf>,
        config: DmlConfig,
    },
}

/// Per-table result of a run.
pub struct TableOutcome {
    pub table: String,
    /// Files written (export) or fully settled input files (import/DML).
    pub result: Result<Vec<PathBuf>>,
}

/// Aggregated result of one command.
#[derive(Default)]
pub struct RunReport {
    pub outcomes: Vec<TableOutcome>,
}

impl RunReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    #[must_use]
    pub fn first_error(&self) -> Option<&TransferError> {
        self.outcomes.iter().find_map(|o| o.result.as_ref().err())
    }
}

/// Expand shell-style patterns into concrete input paths.
pub fn expand_patterns(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let matches = glob::glob(pattern)
            .map_err(|e| TransferError::config(format!("bad file pattern {pattern}: {e}")))?;
        for entry in matches {
            let path = entry
                .map_err(|e| TransferError::config(format!("unreadable match: {e}")))?;
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Files belonging to `table` by the `<table>_<digits>` name convention.
fn resolve_table_files(table: &str, candidates: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let pattern = format!("^{}_\\d+$", regex::escape(table));
    let matcher = Regex::new(&pattern)
        .map_err(|e| TransferError::config(format!("bad table name {table}: {e}")))?;
    Ok(candidates
        .iter()
        .filter(|path| {
            path.file_name()
                .map(|name| matcher.is_match(&name.to_string_lossy()))
                .unwrap_or(false)
        })
        .cloned()
        .collect())
}

struct PipelineRun {
    settled: Vec<PathBuf>,
    failure: Option<TransferError>,
}

/// The shared configure-and-run core of every file-driven operation:
/// reader producers on one side of the ring, a consumer pool on the other.
fn run_file_pipeline(
    paths: Vec<PathBuf>,
    config: &ImportConfig,
    transform: Option<Arc<dyn BlockTransform>>,
    mut make_consumer: impl FnMut(
        &Arc<SourceFileSet>,
        &Arc<BlockLedger>,
    ) -> Result<Box<dyn WorkHandler<LineBatch>>>,
) -> Result<PipelineRun> {
    let files = Arc::new(SourceFileSet::open(paths)?);
    let ledger = Arc::new(BlockLedger::new(files.len()));
    let ring = Arc::new(RingBuffer::with_capacity(
        config.ring_size,
        LineBatch::default,
    ));
    let producers = config.producers.max(1);
    let shared = Arc::new(SharedProgress::new(producers));

    let consumer_count = config.effective_consumers();
    let mut handlers = Vec::with_capacity(consumer_count);
    for _ in 0..consumer_count {
        handlers.push(make_consumer(&files, &ledger)?);
    }
    let pool = WorkerPool::start(Arc::clone(&ring), handlers, Arc::clone(&shared));

    let ctx = ProducerContext {
        block_size: config.block_size.max(1),
        batch_size: config.batch_size.max(1),
        charset: config.charset,
        with_header: config.with_header,
    };
    std::thread::scope(|scope| {
        for _ in 0..producers {
            let mut reader = BlockReader::new(
                Arc::clone(&files),
                Arc::clone(&ledger),
                Arc::clone(&ring),
                Arc::clone(&shared),
                ctx,
                transform.clone(),
            );
            let shared = Arc::clone(&shared);
            scope.spawn(move || {
                if let Err(err) = reader.run() {
                    shared.failure().fail(err);
                }
                shared.producers_done().count_down();
            });
        }
    });
    shared.wait_for_finish(LATCH_POLL_INTERVAL, DRAIN_POLL_INTERVAL);
    pool.drain_and_halt();

    let settled = (0..files.len())
        .filter(|&i| ledger.file_settled(i))
        .map(|i| files.path(i).to_path_buf())
        .collect();
    let failure = Arc::into_inner(shared).and_then(SharedProgress::into_failure);
    let failure = match failure {
        None if !ledger.all_settled() => Some(TransferError::config(
            "pipeline finished with unsettled blocks",
        )),
        other => other,
    };
    Ok(PipelineRun { settled, failure })
}

/// Ties the database traits and transform together and runs commands.
pub struct Engine {
    provider: Arc<dyn ConnectionProvider>,
    schema: Arc<dyn SchemaService>,
    builder: Arc<dyn SqlBuilder>,
    transform: Option<Arc<dyn BlockTransform>>,
}

impl Engine {
    #[must_use]
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        schema: Arc<dyn SchemaService>,
        builder: Arc<dyn SqlBuilder>,
    ) -> Self {
        Self {
            provider,
            schema,
            builder,
            transform: None,
        }
    }

    /// Attach a byte transform applied to every file block.
    #[must_use]
    pub fn with_transform(mut self, transform: Arc<dyn BlockTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Execute one command, table by table.
    pub fn run(&self, command: &Command) -> RunReport {
        let mut report = RunReport::default();
        match command {
            Command::Export { tables, config } => {
                for table in tables {
                    let config = self.table_export_config(table, tables.len(), config);
                    let result = self.export_table(table, &config);
                    self.note_outcome(&mut report, table, result);
                }
            }
            Command::Import {
                tables,
                files,
                config,
            } => {
                for table in tables {
                    let result = self
                        .table_files(table, tables, files)
                        .and_then(|paths| self.import_table(table, paths, config));
                    self.note_outcome(&mut report, table, result);
                }
            }
            Command::Update {
                tables,
                files,
                config,
            } => {
                for table in tables {
                    let result = self
                        .table_files(table, tables, files)
                        .and_then(|paths| self.dml_table(table, paths, config, DmlKind::Update));
                    self.note_outcome(&mut report, table, result);
                }
            }
            Command::Delete {
                tables,
                files,
                config,
            } => {
                for table in tables {
                    let result = self
                        .table_files(table, tables, files)
                        .and_then(|paths| self.dml_table(table, paths, config, DmlKind::Delete));
                    self.note_outcome(&mut report, table, result);
                }
            }
        }
        report
    }

    fn note_outcome(&self, report: &mut RunReport, table: &str, result: Result<Vec<PathBuf>>) {
        match &result {
            Ok(files) => info!(table, files = files.len(), "table finished"),
            Err(err) => error!(table, error = %err, "table failed"),
        }
        report.outcomes.push(TableOutcome {
            table: table.to_string(),
            result,
        });
    }

    fn table_export_config(
        &self,
        table: &str,
        table_count: usize,
        config: &ExportConfig,
    ) -> ExportConfig {
        let mut config = config.clone();
        if table_count > 1 {
            config.file_prefix = format!("{}_{table}", config.file_prefix);
        }
        config
    }

    /// A single explicit file is taken as-is; otherwise files are matched
    /// to the table by name.
    fn table_files(
        &self,
        table: &str,
        tables: &[String],
        files: &[PathBuf],
    ) -> Result<Vec<PathBuf>> {
        if tables.len() == 1 && files.len() == 1 {
            return Ok(files.to_vec());
        }
        let matched = resolve_table_files(table, files)?;
        if matched.is_empty() {
            return Err(TransferError::config(format!(
                "no input files match table {table}"
            )));
        }
        Ok(matched)
    }

    fn export_table(&self, table: &str, config: &ExportConfig) -> Result<Vec<PathBuf>> {
        if config.order_by.is_some() {
            run_ordered_export(
                &self.provider,
                self.schema.as_ref(),
                &self.builder,
                table,
                config,
                self.transform.clone(),
            )
        } else {
            run_sharded_export(
                &self.provider,
                self.schema.as_ref(),
                &self.builder,
                table,
                config,
                self.transform.clone(),
            )
        }
    }

    fn import_table(
        &self,
        table: &str,
        paths: Vec<PathBuf>,
        config: &ImportConfig,
    ) -> Result<Vec<PathBuf>> {
        let columns = self.schema.fields(table)?;
        let mut history = self.open_history(table, &paths, config)?;
        let paths: Vec<PathBuf> = match &history {
            Some(history) => paths
                .into_iter()
                .filter(|p| !history.is_finished(p))
                .collect(),
            None => paths,
        };
        if paths.is_empty() {
            info!(table, "nothing left to import");
            return Ok(Vec::new());
        }

        let consumer_count = config.effective_consumers();
        let batch_rate =
            batch_rate_per_consumer(config.rate_limit, consumer_count, config.batch_size);
        let ctx = ConsumerContext {
            read_only: config.read_only,
            insert_ignore: config.insert_ignore_and_resume,
            batch_rate,
        };
        let sharded = config.sharded;
        let topology = sharded.then(|| self.schema.topology(table)).transpose()?;
        let key = sharded.then(|| self.schema.partition_key(table)).transpose()?;

        let run = run_file_pipeline(paths, config, self.transform.clone(), |files, ledger| {
            let parser = BatchParser::new(
                config.separator.clone(),
                columns.len(),
                Arc::clone(files),
                config.block_size,
            );
            let limiter = ctx.batch_rate.map(RateLimiter::new);
            let handler: Box<dyn WorkHandler<LineBatch>> = if config.read_only {
                Box::new(DryRunConsumer {
                    parser,
                    ledger: Arc::clone(ledger),
                })
            } else if sharded {
                Box::new(ShardedImportConsumer {
                    conn: self.provider.connect()?,
                    builder: Arc::clone(&self.builder),
                    columns: columns.clone(),
                    topology: topology.clone().ok_or_else(|| {
                        TransferError::config("sharded import without topology")
                    })?,
                    key: key.clone().ok_or_else(|| {
                        TransferError::config("sharded import without a partition key")
                    })?,
                    parser,
                    ledger: Arc::clone(ledger),
                    ctx,
                    limiter,
                })
            } else {
                Box::new(DirectImportConsumer {
                    conn: self.provider.connect()?,
                    builder: Arc::clone(&self.builder),
                    table: table.to_string(),
                    columns: columns.clone(),
                    parser,
                    ledger: Arc::clone(ledger),
                    ctx,
                    limiter,
                })
            };
            Ok(handler)
        })?;

        if let Some(history) = history.as_mut() {
            for file in &run.settled {
                history.record_finished(file)?;
            }
        }
        match run.failure {
            Some(err) => Err(err),
            None => Ok(run.settled),
        }
    }

    fn open_history(
        &self,
        table: &str,
        paths: &[PathBuf],
        config: &ImportConfig,
    ) -> Result<Option<ProgressHistory>> {
        if !config.insert_ignore_and_resume {
            return Ok(None);
        }
        let Some(history_file) = &config.history_file else {
            return Ok(None);
        };
        let mut parts: Vec<String> = vec![
            table.to_string(),
            config.separator.clone(),
            format!("{:?}", config.charset),
            config.sharded.to_string(),
            config.block_size.to_string(),
        ];
        parts.extend(paths.iter().map(|p| p.display().to_string()));
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let fingerprint = ProgressHistory::fingerprint(&refs);
        ProgressHistory::load_or_create(history_file, fingerprint).map(Some)
    }

    fn dml_table(
        &self,
        table: &str,
        paths: Vec<PathBuf>,
        config: &DmlConfig,
        kind: DmlKind,
    ) -> Result<Vec<PathBuf>> {
        let columns = self.schema.fields(table)?;
        let pk = self.schema.primary_key(table)?;
        if pk.is_empty() {
            return Err(TransferError::config(format!(
                "table {table} has no primary key; file-driven DML needs one"
            )));
        }
        let pipeline = &config.pipeline;
        let consumer_count = pipeline.effective_consumers();
        let batch_rate =
            batch_rate_per_consumer(pipeline.rate_limit, consumer_count, pipeline.batch_size);

        let run = run_file_pipeline(paths, pipeline, self.transform.clone(), |files, ledger| {
            Ok(Box::new(DmlConsumer {
                conn: self.provider.connect()?,
                builder: Arc::clone(&self.builder),
                table: table.to_string(),
                columns: columns.clone(),
                pk: pk.clone(),
                kind,
                parser: BatchParser::new(
                    pipeline.separator.clone(),
                    columns.len(),
                    Arc::clone(files),
                    pipeline.block_size,
                ),
                ledger: Arc::clone(ledger),
                limiter: batch_rate.map(RateLimiter::new),
            }) as Box<dyn WorkHandler<LineBatch>>)
        })?;
        match run.failure {
            Some(err) => Err(err),
            None => Ok(run.settled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_files_match_by_name_convention() {
        let files = vec![
            PathBuf::from("/data/users_0"),
            PathBuf::from("/data/users_1"),
            PathBuf::from("/data/orders_0"),
            PathBuf::from("/data/users_extra"),
        ];
        let matched = resolve_table_files("users", &files).unwrap();
        assert_eq!(
            matched,
            vec![PathBuf::from("/data/users_0"), PathBuf::from("/data/users_1")]
        );
    }

    #[test]
    fn table_name_regex_is_escaped() {
        let files = vec![PathBuf::from("/data/a.b_0")];
        assert_eq!(resolve_table_files("a.b", &files).unwrap().len(), 1);
        assert!(resolve_table_files("axb", &files).unwrap().is_empty());
    }
}
