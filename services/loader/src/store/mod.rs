//! The relational store behind the CDF.
//!
//! Every component receives the store explicitly; nothing holds a global
//! handle. `PgStore` is the production backend, `MemoryStore` backs dry runs
//! and tests.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::LoadResult;
use crate::frame::{Frame, Value};
use crate::schema::Table;
use crate::upsert::{UpsertField, UpsertStatus};

/// Contents of one table at one point in time. `frame` has `Id` first, then
/// the table's columns in schema order.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub table: Table,
    /// Changes with every mutation of the table.
    pub version: u64,
    pub frame: Frame,
}

impl TableSnapshot {
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// `column` text -> `Id`. On repeated text the first row wins.
    pub fn ids_by(&self, column: &str) -> HashMap<String, i64> {
        let mut map = HashMap::new();
        for row in self.frame.iter() {
            if let (Some(Value::Int(id)), Some(v)) = (row.get("Id"), row.get(column)) {
                if !v.is_null() {
                    map.entry(v.to_string()).or_insert(*id);
                }
            }
        }
        map
    }
}

#[async_trait]
pub trait CdfStore: Send + Sync {
    async fn read_table(&self, table: Table) -> LoadResult<TableSnapshot>;

    /// Insert every row of `rows` or none of them, returning the new ids in
    /// row order. A natural-key collision is a `UniquenessConflict`.
    async fn append_rows(&self, table: Table, rows: &Frame) -> LoadResult<Vec<i64>>;

    /// Atomic insert-or-select; callers go through `upsert::get_or_create`.
    async fn upsert(
        &self,
        table: Table,
        required: &UpsertField,
        others: &[UpsertField],
    ) -> LoadResult<(i64, UpsertStatus)>;

    async fn truncate(&self, tables: &[Table]) -> LoadResult<()>;

    /// Delete the rows with the given ids, batch by batch in slice order,
    /// all in one unit of work. Rows not listed are never touched.
    async fn delete_rows(&self, batches: &[(Table, Vec<i64>)]) -> LoadResult<()>;

    /// Release connections. Called once at the end of every run.
    async fn close(&self);
}
