use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CdfStore, TableSnapshot};
use crate::error::{LoadError, LoadResult};
use crate::frame::{Frame, Value};
use crate::schema::{EnumTable, Table};
use crate::upsert::{UpsertField, UpsertStatus};

#[derive(Debug, Default)]
struct MemTable {
    next_id: i64,
    version: u64,
    rows: Vec<(i64, Vec<Value>)>,
}

impl MemTable {
    fn take_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process store. All mutations are serialised behind one lock, which
/// makes each call atomic.
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Table, MemTable>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    /// Empty element tables, with every enumeration seeded from its
    /// canonical values.
    pub fn new() -> Self {
        MemoryStore {
            tables: Mutex::new(seeded()),
        }
    }

    /// Store whose enumeration `e` holds `texts` instead of the canonical seed.
    pub fn with_enum_rows(e: EnumTable, texts: &[&str]) -> Self {
        let mut tables = seeded();
        let t = tables.entry(Table::Enumeration(e)).or_default();
        t.rows.clear();
        seed(t, texts);
        MemoryStore {
            tables: Mutex::new(tables),
        }
    }
}

fn seed(t: &mut MemTable, texts: &[&str]) {
    for txt in texts {
        let id = t.take_id();
        t.rows.push((id, vec![Value::text(*txt)]));
    }
}

fn seeded() -> HashMap<Table, MemTable> {
    let mut tables: HashMap<Table, MemTable> =
        Table::all().map(|t| (t, MemTable::default())).collect();
    for e in EnumTable::ALL {
        seed(tables.entry(Table::Enumeration(e)).or_default(), e.canonical_values());
    }
    tables
}

/// Positions of the natural-key columns within `columns`.
fn key_positions(table: Table, columns: &[String]) -> Vec<Option<usize>> {
    table
        .natural_key()
        .iter()
        .map(|k| columns.iter().position(|c| c == k))
        .collect()
}

/// Natural key of a row; `None` when a key column is null, since nulls never
/// collide in a unique index.
fn row_key(positions: &[Option<usize>], row: &[Value]) -> Option<Vec<Value>> {
    positions
        .iter()
        .map(|p| match p.map(|i| &row[i]) {
            Some(Value::Null) | None => None,
            Some(v) => Some(v.clone()),
        })
        .collect()
}

fn table_columns(table: Table) -> Vec<String> {
    table.columns().into_iter().map(|c| c.name).collect()
}

#[async_trait]
impl CdfStore for MemoryStore {
    async fn read_table(&self, table: Table) -> LoadResult<TableSnapshot> {
        let tables = self.tables.lock().await;
        let columns = table_columns(table);
        let mut rows = Vec::new();
        let mut version = 0;
        if let Some(t) = tables.get(&table) {
            version = t.version;
            for (id, values) in &t.rows {
                let mut row = Vec::with_capacity(values.len() + 1);
                row.push(Value::Int(*id));
                row.extend(values.iter().cloned());
                rows.push(row);
            }
        }
        let frame = Frame::from_rows(
            std::iter::once("Id".to_string()).chain(columns.iter().cloned()),
            rows,
        )?;
        Ok(TableSnapshot {
            table,
            version,
            frame,
        })
    }

    async fn append_rows(&self, table: Table, rows: &Frame) -> LoadResult<Vec<i64>> {
        let columns = table_columns(table);
        if let Some(bad) = rows.columns().iter().find(|c| !columns.contains(c)) {
            return Err(LoadError::Configuration(format!(
                "{table} has no column {bad}"
            )));
        }
        let aligned = rows.select(&columns)?.rows();
        let positions = key_positions(table, &columns);

        let mut tables = self.tables.lock().await;
        let t = tables.entry(table).or_default();
        let mut seen: HashSet<Vec<Value>> = t
            .rows
            .iter()
            .filter_map(|(_, values)| row_key(&positions, values))
            .collect();
        for row in &aligned {
            if let Some(key) = row_key(&positions, row) {
                if !seen.insert(key.clone()) {
                    let shown: Vec<String> = key.iter().map(Value::to_string).collect();
                    return Err(LoadError::UniquenessConflict {
                        table: table.name().to_string(),
                        detail: format!(
                            "duplicate key ({})=({})",
                            table.natural_key().join(", "),
                            shown.join(", ")
                        ),
                    });
                }
            }
        }

        let mut ids = Vec::with_capacity(aligned.len());
        for row in aligned {
            let id = t.take_id();
            t.rows.push((id, row));
            ids.push(id);
        }
        if !ids.is_empty() {
            t.version += 1;
        }
        Ok(ids)
    }

    async fn upsert(
        &self,
        table: Table,
        required: &UpsertField,
        others: &[UpsertField],
    ) -> LoadResult<(i64, UpsertStatus)> {
        let columns = table_columns(table);
        let key_pos = columns
            .iter()
            .position(|c| *c == required.name)
            .ok_or_else(|| {
                LoadError::Configuration(format!("{table} has no column {}", required.name))
            })?;

        let mut tables = self.tables.lock().await;
        let t = tables.entry(table).or_default();
        if let Some((id, _)) = t
            .rows
            .iter()
            .find(|(_, values)| values[key_pos] == required.value)
        {
            return Ok((*id, UpsertStatus::Selected));
        }

        let mut row = vec![Value::Null; columns.len()];
        for f in std::iter::once(required).chain(others) {
            if let Some(i) = columns.iter().position(|c| *c == f.name) {
                row[i] = f.value.clone();
            }
        }
        let id = t.take_id();
        t.rows.push((id, row));
        t.version += 1;
        Ok((id, UpsertStatus::Inserted))
    }

    async fn truncate(&self, tables: &[Table]) -> LoadResult<()> {
        let mut all = self.tables.lock().await;
        for table in tables {
            if let Some(t) = all.get_mut(table) {
                t.rows.clear();
                t.version += 1;
            }
        }
        Ok(())
    }

    async fn delete_rows(&self, batches: &[(Table, Vec<i64>)]) -> LoadResult<()> {
        let mut all = self.tables.lock().await;
        for (table, ids) in batches {
            let ids: HashSet<i64> = ids.iter().copied().collect();
            if let Some(t) = all.get_mut(table) {
                let before = t.rows.len();
                t.rows.retain(|(id, _)| !ids.contains(id));
                if t.rows.len() != before {
                    t.version += 1;
                }
            }
        }
        Ok(())
    }

    async fn close(&self) {}
}
