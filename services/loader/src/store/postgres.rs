use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};

use super::{CdfStore, TableSnapshot};
use crate::error::{LoadError, LoadResult};
use crate::frame::{Frame, Value};
use crate::schema::{Column, DataType, Table};
use crate::upsert::{self, UpsertField, UpsertStatus};

/// Postgres-backed CDF. Schema creation and enum seeding happen elsewhere;
/// `connect` only checks that the tables exist.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn cast(dtype: DataType) -> &'static str {
    match dtype {
        DataType::Text => "TEXT",
        DataType::Integer => "BIGINT",
        DataType::Date => "DATE",
    }
}

/// Bind a cell, typing nulls after the column they go into.
fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
    dtype: Option<DataType>,
) -> Query<'q, Postgres, PgArguments> {
    match (value, dtype) {
        (Value::Int(i), _) => query.bind(*i),
        (Value::Text(s), _) => query.bind(s.clone()),
        (Value::Date(d), _) => query.bind(*d),
        (Value::Null, Some(DataType::Integer)) => query.bind(None::<i64>),
        (Value::Null, Some(DataType::Date)) => query.bind(None::<NaiveDate>),
        (Value::Null, _) => query.bind(None::<String>),
    }
}

fn decode(row: &PgRow, idx: usize, dtype: DataType) -> Result<Value, sqlx::Error> {
    Ok(match dtype {
        DataType::Text => row
            .try_get::<Option<String>, _>(idx)?
            .map_or(Value::Null, Value::Text),
        DataType::Integer => row.try_get::<Option<i64>, _>(idx)?.into(),
        DataType::Date => row
            .try_get::<Option<NaiveDate>, _>(idx)?
            .map_or(Value::Null, Value::Date),
    })
}

fn conflict_or_database(table: Table, e: sqlx::Error) -> LoadError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return LoadError::UniquenessConflict {
                table: table.name().to_string(),
                detail: db.message().to_string(),
            };
        }
    }
    LoadError::Database(e)
}

impl PgStore {
    pub async fn connect(db_url: &str, max_connections: u32) -> LoadResult<PgStore> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;
        let store = PgStore { pool };
        store.verify_schema().await?;
        Ok(store)
    }

    /// Every table the engine knows about must exist.
    pub async fn verify_schema(&self) -> LoadResult<()> {
        let existing: Vec<(String,)> = sqlx::query_as(
            "SELECT table_name::TEXT FROM information_schema.tables \
             WHERE table_schema = current_schema()",
        )
        .fetch_all(&self.pool)
        .await?;
        let missing: Vec<&str> = Table::all()
            .map(Table::name)
            .filter(|t| !existing.iter().any(|(e,)| e == t))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(LoadError::Configuration(format!(
                "database is missing CDF tables: {}",
                missing.join(", ")
            )))
        }
    }
}

#[async_trait]
impl CdfStore for PgStore {
    async fn read_table(&self, table: Table) -> LoadResult<TableSnapshot> {
        let columns = table.columns();
        let select = std::iter::once("\"Id\"::BIGINT".to_string())
            .chain(
                columns
                    .iter()
                    .map(|c| format!("{}::{}", quote(&c.name), cast(c.dtype))),
            )
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {select} FROM {} ORDER BY \"Id\"", quote(table.name()));
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut cells = Vec::with_capacity(rows.len());
        let mut max_id = 0;
        for row in &rows {
            let id: i64 = row.try_get(0)?;
            max_id = max_id.max(id);
            let mut values = vec![Value::Int(id)];
            for (i, c) in columns.iter().enumerate() {
                values.push(decode(row, i + 1, c.dtype)?);
            }
            cells.push(values);
        }
        let frame = Frame::from_rows(
            std::iter::once("Id".to_string()).chain(columns.iter().map(|c| c.name.clone())),
            cells,
        )?;
        // ids only grow, so this changes on every append and every truncate
        let version = max_id as u64 + rows.len() as u64;
        Ok(TableSnapshot {
            table,
            version,
            frame,
        })
    }

    async fn append_rows(&self, table: Table, rows: &Frame) -> LoadResult<Vec<i64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let schema = table.columns();
        let header = rows.columns();
        let columns: Vec<&Column> = header
            .iter()
            .map(|name| {
                schema.iter().find(|c| &c.name == name).ok_or_else(|| {
                    LoadError::Configuration(format!("{table} has no column {name}"))
                })
            })
            .collect::<LoadResult<_>>()?;
        let names = columns
            .iter()
            .map(|c| quote(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({names}) VALUES ({placeholders}) RETURNING \"Id\"::BIGINT",
            quote(table.name())
        );

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows.rows() {
            let mut query = sqlx::query(&sql);
            for (value, column) in row.iter().zip(&columns) {
                query = bind_value(query, value, Some(column.dtype));
            }
            let inserted = query
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| conflict_or_database(table, e))?;
            ids.push(inserted.try_get::<i64, _>(0)?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn upsert(
        &self,
        table: Table,
        required: &UpsertField,
        others: &[UpsertField],
    ) -> LoadResult<(i64, UpsertStatus)> {
        let sql = upsert::upsert_statement(table, required, others)?;
        // a row committed by a concurrent run after our snapshot was taken is
        // invisible to both branches; the second attempt sees it
        for _ in 0..2 {
            let mut query = sqlx::query(&sql);
            for f in std::iter::once(required).chain(others) {
                query = bind_value(query, &f.value, f.dtype);
            }
            if let Some(row) = query.fetch_optional(&self.pool).await? {
                let id: i64 = row.try_get("Id")?;
                let status: String = row.try_get("status")?;
                return Ok((id, status.parse()?));
            }
        }
        Err(LoadError::UniquenessConflict {
            table: table.name().to_string(),
            detail: format!("no row returned for {} = {}", required.name, required.value),
        })
    }

    async fn truncate(&self, tables: &[Table]) -> LoadResult<()> {
        if tables.is_empty() {
            return Ok(());
        }
        let names = tables
            .iter()
            .map(|t| quote(t.name()))
            .collect::<Vec<_>>()
            .join(", ");
        sqlx::query(&format!("TRUNCATE {names}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_rows(&self, batches: &[(Table, Vec<i64>)]) -> LoadResult<()> {
        let mut tx = self.pool.begin().await?;
        for (table, ids) in batches.iter().filter(|(_, ids)| !ids.is_empty()) {
            let sql = format!("DELETE FROM {} WHERE \"Id\" = ANY($1)", quote(table.name()));
            let deleted = sqlx::query(&sql).bind(ids.clone()).execute(&mut *tx).await?;
            tracing::debug!(table = %table, rows = deleted.rows_affected(), "rows deleted");
        }
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("_datafile"), "\"_datafile\"");
        assert_eq!(quote("a\"b"), "\"a\"\"b\"");
    }
}
