//! Hermetic test support: an in-memory database implementing the
//! database-facing traits, plus small file fixtures.
//!
//! [`MemoryDb`] pairs with [`JsonSqlBuilder`], which encodes every
//! statement as a JSON envelope. The pipeline still treats the result as
//! opaque SQL text; only the fake connection on the other end decodes it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use crate::db::{
    Connection, ConnectionProvider, FieldMeta, FieldType, PartitionKey, Row, RowStream,
    SchemaService, Shard, ShardTopology, SqlBuilder,
};
use crate::error::{Result, TransferError};

/// Write a fixture file and return its path.
pub fn write_temp_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write fixture file");
    path
}

type StoredRow = Vec<Option<String>>;

struct TableState {
    fields: Vec<FieldMeta>,
    shards: Vec<Shard>,
    db_partitions: usize,
    tb_partitions: usize,
    partition_key: Option<usize>,
    pk: Vec<usize>,
    shard_rows: Vec<Vec<StoredRow>>,
    logical_rows: Vec<StoredRow>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, TableState>,
}

/// Thread-safe in-memory database shared by all its connections.
#[derive(Clone, Default)]
pub struct MemoryDb {
    state: Arc<Mutex<State>>,
}

impl MemoryDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a table with `db_partitions * tb_partitions` physical
    /// shards. The first column doubles as the primary key.
    pub fn create_table(
        &self,
        table: &str,
        columns: &[(&str, FieldType)],
        db_partitions: usize,
        tb_partitions: usize,
        partition_key: Option<&str>,
    ) {
        let fields: Vec<FieldMeta> = columns
            .iter()
            .enumerate()
            .map(|(index, (name, ty))| FieldMeta {
                name: (*name).to_string(),
                ty: *ty,
                index,
            })
            .collect();
        let partition_key =
            partition_key.map(|key| fields.iter().position(|f| f.name == key).expect("key column"));
        let shard_count = (db_partitions * tb_partitions).max(1);
        let shards: Vec<Shard> = (0..shard_count)
            .map(|i| Shard {
                group: format!("GROUP_{:02}", i / tb_partitions.max(1)),
                table: format!("{table}_{i:02}"),
            })
            .collect();
        let mut state = self.state.lock().unwrap();
        state.tables.insert(
            table.to_string(),
            TableState {
                fields,
                shard_rows: vec![Vec::new(); shards.len()],
                shards,
                db_partitions: db_partitions.max(1),
                tb_partitions: tb_partitions.max(1),
                partition_key,
                pk: vec![0],
                logical_rows: Vec::new(),
            },
        );
    }

    /// Seed one row directly into a physical shard.
    pub fn push_row(&self, table: &str, shard: usize, values: StoredRow) {
        let mut state = self.state.lock().unwrap();
        let table = state.tables.get_mut(table).expect("unknown table");
        table.shard_rows[shard].push(values);
    }

    #[must_use]
    pub fn shard_rows(&self, table: &str, shard: usize) -> Vec<StoredRow> {
        let state = self.state.lock().unwrap();
        state.tables[table].shard_rows[shard].clone()
    }

    /// Every stored row of the table, logical inserts included.
    #[must_use]
    pub fn all_rows(&self, table: &str) -> Vec<StoredRow> {
        let state = self.state.lock().unwrap();
        let table = &state.tables[table];
        let mut rows = table.logical_rows.clone();
        for shard in &table.shard_rows {
            rows.extend(shard.clone());
        }
        rows
    }

    #[must_use]
    pub fn sql_builder(&self) -> JsonSqlBuilder {
        JsonSqlBuilder
    }

    fn with_table<R>(
        &self,
        table: &str,
        f: impl FnOnce(&mut TableState) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock().unwrap();
        let table = state
            .tables
            .get_mut(table)
            .ok_or_else(|| TransferError::database(format!("unknown table: {table}")))?;
        f(table)
    }
}

impl ConnectionProvider for MemoryDb {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MemoryConnection {
            db: self.clone(),
        }))
    }
}

impl SchemaService for MemoryDb {
    fn fields(&self, table: &str) -> Result<Vec<FieldMeta>> {
        self.with_table(table, |t| Ok(t.fields.clone()))
    }

    fn topology(&self, table: &str) -> Result<ShardTopology> {
        self.with_table(table, |t| {
            Ok(ShardTopology {
                shards: t.shards.clone(),
                db_partitions: t.db_partitions,
                tb_partitions: t.tb_partitions,
            })
        })
    }

    fn partition_key(&self, table: &str) -> Result<PartitionKey> {
        let name = table.to_string();
        self.with_table(table, |t| {
            let index = t.partition_key.ok_or_else(|| {
                TransferError::database(format!("table {name} has no partition key"))
            })?;
            Ok(PartitionKey {
                field: t.fields[index].clone(),
            })
        })
    }

    fn primary_key(&self, table: &str) -> Result<Vec<FieldMeta>> {
        self.with_table(table, |t| {
            Ok(t.pk.iter().map(|&i| t.fields[i].clone()).collect())
        })
    }

    fn total_row_count(&self, table: &str) -> Result<u64> {
        self.with_table(table, |t| {
            let shard_total: usize = t.shard_rows.iter().map(Vec::len).sum();
            Ok((t.logical_rows.len() + shard_total) as u64)
        })
    }
}

/// Encodes statements as JSON envelopes for [`MemoryDb`].
pub struct JsonSqlBuilder;

impl SqlBuilder for JsonSqlBuilder {
    fn select(
        &self,
        shard: &Shard,
        columns: &[FieldMeta],
        where_clause: Option<&str>,
        order_by: &[String],
        descending: bool,
    ) -> String {
        json!({
            "op": "select",
            "group": shard.group,
            "table": shard.table,
            "columns": columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
            "where": where_clause,
            "order_by": order_by,
            "desc": descending,
        })
        .to_string()
    }

    fn insert(
        &self,
        table: &str,
        _columns: &[FieldMeta],
        rows: &[Vec<String>],
        ignore: bool,
    ) -> String {
        json!({ "op": "insert", "table": table, "ignore": ignore, "rows": rows }).to_string()
    }

    fn insert_sharded(
        &self,
        shard: &Shard,
        _columns: &[FieldMeta],
        rows: &[Vec<String>],
        ignore: bool,
    ) -> String {
        json!({
            "op": "insert_sharded",
            "group": shard.group,
            "table": shard.table,
            "ignore": ignore,
            "rows": rows,
        })
        .to_string()
    }

    fn update(
        &self,
        table: &str,
        _columns: &[FieldMeta],
        pk: &[FieldMeta],
        row: &[String],
    ) -> String {
        json!({
            "op": "update",
            "table": table,
            "pk_indices": pk.iter().map(|f| f.index).collect::<Vec<_>>(),
            "row": row,
        })
        .to_string()
    }

    fn delete(&self, table: &str, pk: &[FieldMeta], row: &[String]) -> String {
        json!({
            "op": "delete",
            "table": table,
            "pk_indices": pk.iter().map(|f| f.index).collect::<Vec<_>>(),
            "row": row,
        })
        .to_string()
    }
}

struct MemoryConnection {
    db: MemoryDb,
}

fn decode(sql: &str) -> Result<Value> {
    serde_json::from_str(sql)
        .map_err(|e| TransferError::database(format!("unparseable statement: {e}")))
}

fn field(value: &Value, key: &str) -> Result<String> {
    value[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| TransferError::database(format!("statement missing {key}")))
}

fn decode_rows(value: &Value) -> Result<Vec<StoredRow>> {
    let rows = value["rows"]
        .as_array()
        .ok_or_else(|| TransferError::database("statement missing rows"))?;
    Ok(rows
        .iter()
        .map(|row| {
            row.as_array()
                .map(|fields| {
                    fields
                        .iter()
                        .map(|f| match f.as_str() {
                            Some("NULL") | None => None,
                            Some(text) => Some(text.to_string()),
                        })
                        .collect()
                })
                .unwrap_or_default()
        })
        .collect())
}

fn decode_pk(value: &Value) -> Vec<usize> {
    value["pk_indices"]
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_u64).map(|i| i as usize).collect())
        .unwrap_or_default()
}

fn pk_matches(stored: &StoredRow, incoming: &StoredRow, pk: &[usize]) -> bool {
    pk.iter()
        .all(|&i| stored.get(i).cloned().flatten() == incoming.get(i).cloned().flatten())
}

impl MemoryConnection {
    fn find_table_and_shard(state: &State, group: &str, physical: &str) -> Option<(String, usize)> {
        for (name, table) in &state.tables {
            if let Some(idx) = table
                .shards
                .iter()
                .position(|s| s.group == group && s.table == physical)
            {
                return Some((name.clone(), idx));
            }
        }
        None
    }
}

impl Connection for MemoryConnection {
    fn query(&mut self, sql: &str) -> Result<Box<dyn RowStream>> {
        let stmt = decode(sql)?;
        if field(&stmt, "op")? != "select" {
            return Err(TransferError::database("query expects a select"));
        }
        let group = field(&stmt, "group")?;
        let physical = field(&stmt, "table")?;

        let state = self.db.state.lock().unwrap();
        let Some((name, shard)) = Self::find_table_and_shard(&state, &group, &physical) else {
            return Err(TransferError::database(format!(
                "unknown shard {group}.{physical}"
            )));
        };
        let table = &state.tables[&name];
        let mut rows = table.shard_rows[shard].clone();

        let order_by: Vec<String> = stmt["order_by"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if !order_by.is_empty() {
            let keys: Vec<(usize, FieldType)> = order_by
                .iter()
                .filter_map(|name| {
                    table
                        .fields
                        .iter()
                        .find(|f| f.name.eq_ignore_ascii_case(name))
                        .map(|f| (f.index, f.ty))
                })
                .collect();
            rows.sort_by(|a, b| {
                for &(index, ty) in &keys {
                    let left = a.get(index).cloned().flatten();
                    let right = b.get(index).cloned().flatten();
                    let ord = match (left, right) {
                        (None, None) => std::cmp::Ordering::Equal,
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (Some(l), Some(r)) => {
                            if ty == FieldType::Numeric {
                                let l: f64 = l.trim().parse().unwrap_or(f64::MAX);
                                let r: f64 = r.trim().parse().unwrap_or(f64::MAX);
                                l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal)
                            } else {
                                l.cmp(&r)
                            }
                        }
                    };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
            if stmt["desc"].as_bool().unwrap_or(false) {
                rows.reverse();
            }
        }

        let columns = table.fields.clone();
        let rows: Vec<Row> = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|v| v.map(String::into_bytes))
                    .collect()
            })
            .collect();
        Ok(Box::new(MemoryRowStream {
            columns,
            rows: rows.into_iter(),
        }))
    }

    fn execute(&mut self, sql: &str) -> Result<u64> {
        let stmt = decode(sql)?;
        let op = field(&stmt, "op")?;
        match op.as_str() {
            "insert" => {
                let table = field(&stmt, "table")?;
                let rows = decode_rows(&stmt)?;
                let ignore = stmt["ignore"].as_bool().unwrap_or(false);
                self.db.with_table(&table, |t| {
                    let mut affected = 0;
                    for row in rows {
                        if ignore
                            && t.logical_rows
                                .iter()
                                .any(|stored| pk_matches(stored, &row, &t.pk))
                        {
                            continue;
                        }
                        t.logical_rows.push(row);
                        affected += 1;
                    }
                    Ok(affected)
                })
            }
            "insert_sharded" => {
                let group = field(&stmt, "group")?;
                let physical = field(&stmt, "table")?;
                let rows = decode_rows(&stmt)?;
                let ignore = stmt["ignore"].as_bool().unwrap_or(false);
                let mut state = self.db.state.lock().unwrap();
                let Some((name, shard)) = Self::find_table_and_shard(&state, &group, &physical)
                else {
                    return Err(TransferError::database(format!(
                        "unknown shard {group}.{physical}"
                    )));
                };
                let table = state.tables.get_mut(&name).expect("table just found");
                let mut affected = 0;
                for row in rows {
                    if ignore
                        && table.shard_rows[shard]
                            .iter()
                            .any(|stored| pk_matches(stored, &row, &table.pk))
                    {
                        continue;
                    }
                    table.shard_rows[shard].push(row);
                    affected += 1;
                }
                Ok(affected)
            }
            "update" => {
                let table = field(&stmt, "table")?;
                let pk = decode_pk(&stmt);
                let row = stmt["row"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .map(|v| match v.as_str() {
                                Some("NULL") | None => None,
                                Some(text) => Some(text.to_string()),
                            })
                            .collect::<StoredRow>()
                    })
                    .ok_or_else(|| TransferError::database("update missing row"))?;
                self.db.with_table(&table, |t| {
                    let mut affected = 0;
                    for stored in t
                        .logical_rows
                        .iter_mut()
                        .chain(t.shard_rows.iter_mut().flatten())
                    {
                        if pk_matches(stored, &row, &pk) {
                            *stored = row.clone();
                            affected += 1;
                        }
                    }
                    Ok(affected)
                })
            }
            "delete" => {
                let table = field(&stmt, "table")?;
                let pk = decode_pk(&stmt);
                let row = stmt["row"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .map(|v| match v.as_str() {
                                Some("NULL") | None => None,
                                Some(text) => Some(text.to_string()),
                            })
                            .collect::<StoredRow>()
                    })
                    .ok_or_else(|| TransferError::database("delete missing row"))?;
                self.db.with_table(&table, |t| {
                    let before: usize = t.logical_rows.len()
                        + t.shard_rows.iter().map(Vec::len).sum::<usize>();
                    t.logical_rows.retain(|stored| !pk_matches(stored, &row, &pk));
                    for shard in &mut t.shard_rows {
                        shard.retain(|stored| !pk_matches(stored, &row, &pk));
                    }
                    let after: usize = t.logical_rows.len()
                        + t.shard_rows.iter().map(Vec::len).sum::<usize>();
                    Ok((before - after) as u64)
                })
            }
            other => Err(TransferError::database(format!("unknown op: {other}"))),
        }
    }
}

struct MemoryRowStream {
    columns: Vec<FieldMeta>,
    rows: std::vec::IntoIter<Row>,
}

impl RowStream for MemoryRowStream {
    fn columns(&self) -> &[FieldMeta] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        Ok(self.rows.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_round_trips_seeded_rows() {
        let db = MemoryDb::new();
        db.create_table("t", &[("id", FieldType::Numeric)], 2, 1, None);
        db.push_row("t", 1, vec![Some("42".into())]);

        let builder = db.sql_builder();
        let topology = db.topology("t").unwrap();
        let sql = builder.select(&topology.shards[1], &db.fields("t").unwrap(), None, &[], false);
        let mut conn = db.connect().unwrap();
        let mut stream = conn.query(&sql).unwrap();
        let row = stream.next_row().unwrap().unwrap();
        assert_eq!(row, vec![Some(b"42".to_vec())]);
        assert!(stream.next_row().unwrap().is_none());
    }

    #[test]
    fn insert_ignore_skips_existing_primary_keys() {
        let db = MemoryDb::new();
        db.create_table("t", &[("id", FieldType::Numeric)], 1, 1, None);
        let builder = db.sql_builder();
        let columns = db.fields("t").unwrap();
        let mut conn = db.connect().unwrap();

        let rows = vec![vec!["1".to_string()], vec!["2".to_string()]];
        assert_eq!(conn.execute(&builder.insert("t", &columns, &rows, true)).unwrap(), 2);
        assert_eq!(conn.execute(&builder.insert("t", &columns, &rows, true)).unwrap(), 0);
        assert_eq!(db.all_rows("t").len(), 2);
    }
}
