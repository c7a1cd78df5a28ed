//! Database-facing interfaces.
//!
//! The pipeline never speaks a wire protocol. Everything it needs from a
//! store is behind these traits: a way to get connections, a way to ask
//! about schema and shard topology, and a builder that turns batches into
//! opaque SQL text. Real drivers live outside this crate; tests use the
//! in-memory implementation in [`crate::testing`].

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One result row: column values in column order, `None` for SQL NULL.
pub type Row = Vec<Option<Vec<u8>>>;

/// Broad value classification, enough to pick quote and comparison rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Numeric,
    Other,
}

/// Column metadata in table order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    pub ty: FieldType,
    /// Zero-based position within the table.
    pub index: usize,
}

/// One physical shard: the group (physical database) it lives in and the
/// physical table name within that group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shard {
    pub group: String,
    pub table: String,
}

/// Shard layout of one logical table.
#[derive(Clone, Debug)]
pub struct ShardTopology {
    pub shards: Vec<Shard>,
    pub db_partitions: usize,
    pub tb_partitions: usize,
}

impl ShardTopology {
    /// Total partition count rows are routed across.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        (self.db_partitions * self.tb_partitions).max(1)
    }
}

/// The partitioning column of a sharded table.
#[derive(Clone, Debug)]
pub struct PartitionKey {
    pub field: FieldMeta,
}

/// Forward-only cursor over a query result.
pub trait RowStream: Send {
    fn columns(&self) -> &[FieldMeta];

    /// Fetch the next row, or `None` at end of stream.
    fn next_row(&mut self) -> Result<Option<Row>>;
}

/// One live connection. Not thread-safe; each worker owns its own.
pub trait Connection: Send {
    fn query(&mut self, sql: &str) -> Result<Box<dyn RowStream>>;

    /// Execute a statement, returning the affected row count.
    fn execute(&mut self, sql: &str) -> Result<u64>;
}

/// Hands out connections. Shared by every worker of a run.
pub trait ConnectionProvider: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// Schema and topology lookups performed once, before workers start.
pub trait SchemaService: Send + Sync {
    fn fields(&self, table: &str) -> Result<Vec<FieldMeta>>;

    fn topology(&self, table: &str) -> Result<ShardTopology>;

    fn partition_key(&self, table: &str) -> Result<PartitionKey>;

    /// Primary key columns, used by file-driven UPDATE and DELETE.
    fn primary_key(&self, table: &str) -> Result<Vec<FieldMeta>>;

    /// Row count used to size fixed-file-count exports.
    fn total_row_count(&self, table: &str) -> Result<u64>;
}

/// Builds SQL text for the workers. The pipeline treats the output as an
/// opaque string; dialect differences live entirely in the implementor.
pub trait SqlBuilder: Send + Sync {
    /// Full-shard SELECT with optional verbatim WHERE text and ORDER BY.
    fn select(
        &self,
        shard: &Shard,
        columns: &[FieldMeta],
        where_clause: Option<&str>,
        order_by: &[String],
        descending: bool,
    ) -> String;

    /// Multi-row INSERT for one batch of parsed records.
    fn insert(&self, table: &str, columns: &[FieldMeta], rows: &[Vec<String>], ignore: bool)
    -> String;

    /// Multi-row INSERT addressed at one physical shard.
    fn insert_sharded(
        &self,
        shard: &Shard,
        columns: &[FieldMeta],
        rows: &[Vec<String>],
        ignore: bool,
    ) -> String;

    /// UPDATE of one record, matched by primary key values taken from the
    /// record itself.
    fn update(&self, table: &str, columns: &[FieldMeta], pk: &[FieldMeta], row: &[String])
    -> String;

    /// DELETE of one record matched by primary key values.
    fn delete(&self, table: &str, pk: &[FieldMeta], row: &[String]) -> String;
}

/// Route one partition-key value to its partition index.
///
/// String keys use the 31-based polynomial hash over the raw bytes, so a
/// resumed run routes every record to the same shard as the original run.
/// Numeric keys route by value.
#[must_use]
pub fn partition_index(value: &str, ty: FieldType, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    match ty {
        FieldType::Numeric => {
            let parsed: i64 = value.trim().parse().unwrap_or_else(|_| {
                string_hash(value.as_bytes()) as i64
            });
            (parsed.unsigned_abs() % partitions as u64) as usize
        }
        _ => (string_hash(value.as_bytes()).unsigned_abs() as usize) % partitions,
    }
}

fn string_hash(bytes: &[u8]) -> i32 {
    let mut hash: i32 = 0;
    for &b in bytes {
        hash = hash.wrapping_mul(31).wrapping_add(i32::from(b));
    }
    hash
}
