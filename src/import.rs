//! Import consumers: framed record batches into the store.
//!
//! Every consumer owns its own connection and processes whole batches:
//! parse the delimited records, hand them to the SQL builder, execute, and
//! settle the batch's block in the ledger. A field-count mismatch is fatal
//! for the run; silently dropping or padding records would corrupt the
//! table.

use std::sync::Arc;

use tracing::debug;

use crate::context::ConsumerContext;
use crate::db::{
    Connection, FieldMeta, PartitionKey, ShardTopology, SqlBuilder, partition_index,
};
use crate::error::{Result, TransferError};
use crate::format::split_fields;
use crate::pipeline::WorkHandler;
use crate::source::{BlockLedger, LineBatch, SourceFileSet};
use crate::sync::RateLimiter;

/// Shared parsing and bookkeeping for all import-side consumers.
pub struct BatchParser {
    separator: String,
    columns: usize,
    files: Arc<SourceFileSet>,
    block_size: usize,
}

impl BatchParser {
    #[must_use]
    pub fn new(
        separator: impl Into<String>,
        columns: usize,
        files: Arc<SourceFileSet>,
        block_size: usize,
    ) -> Self {
        Self {
            separator: separator.into(),
            columns,
            files,
            block_size,
        }
    }

    /// Split every record of the batch, verifying the table shape.
    pub fn parse(&self, event: &LineBatch) -> Result<Vec<Vec<String>>> {
        let mut rows = Vec::with_capacity(event.lines.len());
        for line in &event.lines {
            let fields = split_fields(line, &self.separator);
            if fields.len() != self.columns {
                let (path, offset) = match event.block {
                    Some(block) => (
                        self.files.path(block.file).display().to_string(),
                        block.block * self.block_size as u64,
                    ),
                    None => (String::from("<unknown>"), 0),
                };
                return Err(TransferError::MalformedRecord {
                    path,
                    offset,
                    reason: format!(
                        "expected {} fields, found {}: {line}",
                        self.columns,
                        fields.len()
                    ),
                });
            }
            rows.push(fields);
        }
        Ok(rows)
    }
}

/// Plain batched INSERT through one connection.
pub struct DirectImportConsumer {
    pub(crate) conn: Box<dyn Connection>,
    pub(crate) builder: Arc<dyn SqlBuilder>,
    pub(crate) table: String,
    pub(crate) columns: Vec<FieldMeta>,
    pub(crate) parser: BatchParser,
    pub(crate) ledger: Arc<BlockLedger>,
    pub(crate) ctx: ConsumerContext,
    pub(crate) limiter: Option<RateLimiter>,
}

impl WorkHandler<LineBatch> for DirectImportConsumer {
    fn on_event(&mut self, event: &mut LineBatch) -> Result<()> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire();
        }
        let rows = self.parser.parse(event)?;
        if !rows.is_empty() {
            let sql = self
                .builder
                .insert(&self.table, &self.columns, &rows, self.ctx.insert_ignore);
            let affected = self.conn.execute(&sql)?;
            debug!(affected, "insert batch applied");
        }
        settle(&self.ledger, event);
        Ok(())
    }
}

/// Partition-routed INSERT: each record goes to the shard its partition
/// key hashes to, one statement per touched shard.
pub struct ShardedImportConsumer {
    pub(crate) conn: Box<dyn Connection>,
    pub(crate) builder: Arc<dyn SqlBuilder>,
    pub(crate) columns: Vec<FieldMeta>,
    pub(crate) topology: ShardTopology,
    pub(crate) key: PartitionKey,
    pub(crate) parser: BatchParser,
    pub(crate) ledger: Arc<BlockLedger>,
    pub(crate) ctx: ConsumerContext,
    pub(crate) limiter: Option<RateLimiter>,
}

impl WorkHandler<LineBatch> for ShardedImportConsumer {
    fn on_event(&mut self, event: &mut LineBatch) -> Result<()> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire();
        }
        let rows = self.parser.parse(event)?;
        let mut routed: Vec<Vec<Vec<String>>> = vec![Vec::new(); self.topology.shards.len()];
        for row in rows {
            let value = &row[self.key.field.index];
            let partition =
                partition_index(value, self.key.field.ty, self.topology.partition_count());
            routed[partition % self.topology.shards.len()].push(row);
        }
        for (shard, rows) in self.topology.shards.iter().zip(&routed) {
            if rows.is_empty() {
                continue;
            }
            let sql =
                self.builder
                    .insert_sharded(shard, &self.columns, rows, self.ctx.insert_ignore);
            self.conn.execute(&sql)?;
        }
        settle(&self.ledger, event);
        Ok(())
    }
}

/// Parse and validate everything, execute nothing.
pub struct DryRunConsumer {
    pub(crate) parser: BatchParser,
    pub(crate) ledger: Arc<BlockLedger>,
}

impl WorkHandler<LineBatch> for DryRunConsumer {
    fn on_event(&mut self, event: &mut LineBatch) -> Result<()> {
        self.parser.parse(event)?;
        settle(&self.ledger, event);
        Ok(())
    }
}

/// Which DML statement a [`DmlConsumer`] issues per record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmlKind {
    Update,
    Delete,
}

/// File-driven UPDATE or DELETE: each record's primary-key values
/// parameterize one statement.
pub struct DmlConsumer {
    pub(crate) conn: Box<dyn Connection>,
    pub(crate) builder: Arc<dyn SqlBuilder>,
    pub(crate) table: String,
    pub(crate) columns: Vec<FieldMeta>,
    pub(crate) pk: Vec<FieldMeta>,
    pub(crate) kind: DmlKind,
    pub(crate) parser: BatchParser,
    pub(crate) ledger: Arc<BlockLedger>,
    pub(crate) limiter: Option<RateLimiter>,
}

impl WorkHandler<LineBatch> for DmlConsumer {
    fn on_event(&mut self, event: &mut LineBatch) -> Result<()> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire();
        }
        let rows = self.parser.parse(event)?;
        for row in &rows {
            let sql = match self.kind {
                DmlKind::Update => {
                    self.builder
                        .update(&self.table, &self.columns, &self.pk, row)
                }
                DmlKind::Delete => self.builder.delete(&self.table, &self.pk, row),
            };
            self.conn.execute(&sql)?;
        }
        settle(&self.ledger, event);
        Ok(())
    }
}

fn settle(ledger: &BlockLedger, event: &mut LineBatch) {
    if let Some(block) = event.block.take() {
        ledger.note_consumed(block);
    }
    event.lines.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionProvider, FieldType, SchemaService};
    use crate::source::BlockRef;
    use crate::testing::MemoryDb;

    fn fixture() -> (MemoryDb, Arc<SourceFileSet>, Arc<BlockLedger>, tempfile::TempDir) {
        let db = MemoryDb::new();
        db.create_table(
            "users",
            &[("id", FieldType::Numeric), ("region", FieldType::String)],
            4,
            1,
            Some("region"),
        );
        let dir = tempfile::tempdir().unwrap();
        let path = crate::testing::write_temp_file(dir.path(), "users_0", b"placeholder\n");
        let files = Arc::new(SourceFileSet::open(vec![path]).unwrap());
        let ledger = Arc::new(BlockLedger::new(1));
        (db, files, ledger, dir)
    }

    fn batch(lines: &[&str]) -> LineBatch {
        let mut event = LineBatch::default();
        event.refill(
            lines.iter().map(|l| l.to_string()).collect(),
            Some(BlockRef { file: 0, block: 0 }),
        );
        event
    }

    #[test]
    fn direct_consumer_inserts_batches() {
        let (db, files, ledger, _dir) = fixture();
        let mut consumer = DirectImportConsumer {
            conn: db.connect().unwrap(),
            builder: Arc::new(db.sql_builder()),
            table: "users".into(),
            columns: db.fields("users").unwrap(),
            parser: BatchParser::new(",", 2, files, 1024),
            ledger,
            ctx: ConsumerContext::default(),
            limiter: None,
        };
        consumer.on_event(&mut batch(&["1,US", "2,EU"])).unwrap();
        assert_eq!(db.all_rows("users").len(), 2);
    }

    #[test]
    fn sharded_consumer_routes_stably_by_key() {
        let (db, files, ledger, _dir) = fixture();
        let mut consumer = ShardedImportConsumer {
            conn: db.connect().unwrap(),
            builder: Arc::new(db.sql_builder()),
            columns: db.fields("users").unwrap(),
            topology: db.topology("users").unwrap(),
            key: db.partition_key("users").unwrap(),
            parser: BatchParser::new(",", 2, files, 1024),
            ledger,
            ctx: ConsumerContext::default(),
            limiter: None,
        };
        consumer
            .on_event(&mut batch(&["1,US", "2,EU", "3,US", "4,EU"]))
            .unwrap();

        let us = partition_index("US", FieldType::String, 4);
        let eu = partition_index("EU", FieldType::String, 4);
        assert_eq!(db.shard_rows("users", us).len(), 2);
        assert_eq!(db.shard_rows("users", eu).len(), 2);
        assert_eq!(db.all_rows("users").len(), 4);
    }

    #[test]
    fn arity_mismatch_is_a_malformed_record() {
        let (db, files, ledger, _dir) = fixture();
        let mut consumer = DirectImportConsumer {
            conn: db.connect().unwrap(),
            builder: Arc::new(db.sql_builder()),
            table: "users".into(),
            columns: db.fields("users").unwrap(),
            parser: BatchParser::new(",", 2, files, 1024),
            ledger,
            ctx: ConsumerContext::default(),
            limiter: None,
        };
        let err = consumer
            .on_event(&mut batch(&["1,US,extra"]))
            .unwrap_err();
        assert!(matches!(err, TransferError::MalformedRecord { .. }));
        assert!(db.all_rows("users").is_empty());
    }

    #[test]
    fn dry_run_settles_without_writing() {
        let (db, files, ledger, _dir) = fixture();
        let mut consumer = DryRunConsumer {
            parser: BatchParser::new(",", 2, files, 1024),
            ledger: Arc::clone(&ledger),
        };
        let mut event = batch(&["1,US"]);
        let counter = ledger.begin_block(BlockRef { file: 0, block: 0 });
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        consumer.on_event(&mut event).unwrap();
        assert!(ledger.file_settled(0));
        assert!(db.all_rows("users").is_empty());
    }

    #[test]
    fn update_and_delete_match_by_primary_key() {
        let (db, files, ledger, _dir) = fixture();
        db.push_row("users", 0, vec![Some("1".into()), Some("US".into())]);
        db.push_row("users", 0, vec![Some("2".into()), Some("EU".into())]);

        let columns = db.fields("users").unwrap();
        let pk = vec![columns[0].clone()];
        let mut update = DmlConsumer {
            conn: db.connect().unwrap(),
            builder: Arc::new(db.sql_builder()),
            table: "users".into(),
            columns: columns.clone(),
            pk: pk.clone(),
            kind: DmlKind::Update,
            parser: BatchParser::new(",", 2, Arc::clone(&files), 1024),
            ledger: Arc::clone(&ledger),
            limiter: None,
        };
        update.on_event(&mut batch(&["1,APAC"])).unwrap();
        let rows = db.all_rows("users");
        assert!(rows.contains(&vec![Some("1".into()), Some("APAC".into())]));

        let mut delete = DmlConsumer {
            conn: db.connect().unwrap(),
            builder: Arc::new(db.sql_builder()),
            table: "users".into(),
            columns,
            pk,
            kind: DmlKind::Delete,
            parser: BatchParser::new(",", 2, files, 1024),
            ledger,
            limiter: None,
        };
        delete.on_event(&mut batch(&["2,EU"])).unwrap();
        assert_eq!(db.all_rows("users").len(), 1);
    }
}
