//! Dimension upsert: atomic insert-or-select on a natural key.
//!
//! The insert and the select are one statement, so two runs racing to create
//! the same dimension row converge on one `Id`:
//!
//! ```text
//! WITH input_rows("k", "a") AS (VALUES (CAST($1 AS TEXT), $2)),
//!      ins AS (INSERT INTO "T" ("k", "a") SELECT * FROM input_rows
//!              ON CONFLICT ("k") DO NOTHING RETURNING "Id")
//! SELECT "Id", 'inserted' FROM ins
//! UNION ALL
//! SELECT c."Id", 'selected' FROM input_rows JOIN "T" AS c USING ("k")
//! ```
//!
//! Integer columns are bound without a cast; the driver already types the
//! parameter, and an explicit cast breaks on nullable integer columns.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{LoadError, LoadResult};
use crate::frame::Value;
use crate::schema::{DataType, Table};
use crate::store::CdfStore;

/// One column of an upsert, with its declared type (`None` = untyped).
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertField {
    pub name: String,
    pub dtype: Option<DataType>,
    pub value: Value,
}

impl UpsertField {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        UpsertField {
            name: name.into(),
            dtype: Some(DataType::Text),
            value: Value::Text(value.into()),
        }
    }

    pub fn integer(name: impl Into<String>, value: Option<i64>) -> Self {
        UpsertField {
            name: name.into(),
            dtype: Some(DataType::Integer),
            value: value.into(),
        }
    }

    pub fn untyped(name: impl Into<String>, value: Value) -> Self {
        UpsertField {
            name: name.into(),
            dtype: None,
            value,
        }
    }

    fn placeholder(&self, n: usize) -> String {
        match self.dtype {
            Some(DataType::Text) => format!("CAST(${n} AS TEXT)"),
            _ => format!("${n}"),
        }
    }
}

/// Which branch of the upsert produced the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertStatus {
    Inserted,
    Selected,
}

impl UpsertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UpsertStatus::Inserted => "inserted",
            UpsertStatus::Selected => "selected",
        }
    }
}

impl FromStr for UpsertStatus {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inserted" => Ok(UpsertStatus::Inserted),
            "selected" => Ok(UpsertStatus::Selected),
            other => Err(LoadError::Configuration(format!(
                "unexpected upsert status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for UpsertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reject declared types the statement cannot express, and fields that are
/// not columns of `table`.
pub fn validate(table: Table, required: &UpsertField, others: &[UpsertField]) -> LoadResult<()> {
    let columns = table.columns();
    for f in std::iter::once(required).chain(others) {
        if let Some(DataType::Date) = f.dtype {
            return Err(LoadError::Configuration(format!(
                "upsert into {table}: field {} has unsupported type Date",
                f.name
            )));
        }
        if !columns.iter().any(|c| c.name == f.name) {
            return Err(LoadError::Configuration(format!(
                "upsert into {table}: {} is not a column",
                f.name
            )));
        }
    }
    Ok(())
}

/// The single-statement upsert. Parameters are numbered `required` first,
/// then `others` in order.
pub fn upsert_statement(
    table: Table,
    required: &UpsertField,
    others: &[UpsertField],
) -> LoadResult<String> {
    validate(table, required, others)?;
    let fields: Vec<&UpsertField> = std::iter::once(required).chain(others).collect();
    let names = fields
        .iter()
        .map(|f| format!("\"{}\"", f.name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = fields
        .iter()
        .enumerate()
        .map(|(i, f)| f.placeholder(i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let t = table.name();
    let key = &required.name;
    Ok(format!(
        "WITH input_rows({names}) AS (VALUES ({placeholders})), \
         ins AS (INSERT INTO \"{t}\" ({names}) SELECT * FROM input_rows \
         ON CONFLICT (\"{key}\") DO NOTHING RETURNING \"Id\") \
         SELECT \"Id\"::BIGINT AS \"Id\", 'inserted' AS status FROM ins \
         UNION ALL \
         SELECT c.\"Id\"::BIGINT AS \"Id\", 'selected' AS status \
         FROM input_rows JOIN \"{t}\" AS c USING (\"{key}\")"
    ))
}

/// Return the id of the row whose `required` value matches, creating it
/// with `others` if none exists.
pub async fn get_or_create<S: CdfStore + ?Sized>(
    store: &S,
    table: Table,
    required: &UpsertField,
    others: &[UpsertField],
) -> LoadResult<(i64, UpsertStatus)> {
    validate(table, required, others)?;
    let (id, status) = store.upsert(table, required, others).await?;
    tracing::debug!(%table, field = %required.name, value = %required.value, id, %status, "upsert");
    Ok((id, status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CdfElement;

    fn datafile() -> Table {
        CdfElement::Datafile.into()
    }

    #[test]
    fn test_statement_casts_text_only() {
        let sql = upsert_statement(
            datafile(),
            &UpsertField::text("short_name", "nc_2020"),
            &[
                UpsertField::text("file_name", "results.txt"),
                UpsertField::integer("Election_Id", Some(3)),
            ],
        )
        .unwrap();
        assert!(sql.contains("VALUES (CAST($1 AS TEXT), CAST($2 AS TEXT), $3)"), "{sql}");
        assert!(sql.contains("ON CONFLICT (\"short_name\") DO NOTHING"));
        assert!(sql.contains("JOIN \"_datafile\" AS c USING (\"short_name\")"));
        assert!(!sql.contains("AS INTEGER"));
    }

    #[test]
    fn test_untyped_field_has_no_cast() {
        let sql = upsert_statement(
            datafile(),
            &UpsertField::untyped("short_name", Value::text("x")),
            &[],
        )
        .unwrap();
        assert!(sql.contains("VALUES ($1)"), "{sql}");
    }

    #[test]
    fn test_unsupported_type_rejected_before_statement() {
        let bad = UpsertField {
            name: "StartDate".into(),
            dtype: Some(DataType::Date),
            value: Value::Null,
        };
        let err = upsert_statement(CdfElement::Election.into(), &bad, &[]).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_unknown_column_rejected() {
        let err = upsert_statement(datafile(), &UpsertField::text("nope", "x"), &[]).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_status_parses() {
        assert_eq!("inserted".parse::<UpsertStatus>().unwrap(), UpsertStatus::Inserted);
        assert!("updated".parse::<UpsertStatus>().is_err());
    }
}
