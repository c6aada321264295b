//! Tables passed between pipeline stages, backed by a polars `DataFrame`.
//!
//! Every transform takes `&self` and returns a new `Frame`, so the input of a
//! stage is still intact when the stage fails. Cells cross the boundary as
//! `Value`s: the store binds them and the resolver reads them row by row.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use polars::prelude::{
    col, lit, AnyValue, BooleanChunked, Column, DataFrame, DataType as PolarsType, Expr,
    IntoColumn, IntoLazy, JoinArgs, JoinType, LazyFrame, NamedFrom, NewChunkedArray, Series,
    SortMultipleOptions, UniqueKeepStrategy,
};

use crate::error::LoadResult;
use crate::schema::DataType;

/// Days from 0001-01-01 to 1970-01-01; polars dates count from the latter.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Stand-in for null in join keys, so that null matches null.
const NULL_KEY: &str = "\u{0}null";

const ROW_INDEX: &str = "__row";

/// One cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Convert to `dtype`, or `None` if the value cannot be represented.
    pub fn coerce(&self, dtype: DataType) -> Option<Value> {
        match (self, dtype) {
            (Value::Null, _) => Some(Value::Null),
            (Value::Text(_), DataType::Text)
            | (Value::Int(_), DataType::Integer)
            | (Value::Date(_), DataType::Date) => Some(self.clone()),
            (Value::Int(i), DataType::Text) => Some(Value::Text(i.to_string())),
            (Value::Date(d), DataType::Text) => Some(Value::Text(d.format("%Y-%m-%d").to_string())),
            (Value::Text(s), DataType::Integer) => {
                let s = s.trim();
                s.parse::<i64>().ok().map(Value::Int).or_else(|| {
                    // "12.0" from spreadsheets
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| Value::Int(f as i64))
                })
            }
            (Value::Text(s), DataType::Date) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .ok()
                .map(Value::Date),
            (Value::Int(_), DataType::Date) | (Value::Date(_), DataType::Integer) => None,
        }
    }

    fn from_any(value: AnyValue<'_>) -> Value {
        match value {
            AnyValue::Null => Value::Null,
            AnyValue::Int64(i) => Value::Int(i),
            AnyValue::Int32(i) => Value::Int(i64::from(i)),
            AnyValue::UInt32(i) => Value::Int(i64::from(i)),
            AnyValue::UInt64(i) => i64::try_from(i).map_or(Value::Null, Value::Int),
            AnyValue::String(s) => Value::Text(s.to_string()),
            AnyValue::StringOwned(s) => Value::Text(s.to_string()),
            AnyValue::Date(days) => {
                NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
                    .map_or(Value::Null, Value::Date)
            }
            other => Value::Text(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(i) => write!(f, "{i}"),
            Value::Text(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<Option<i64>> for Value {
    fn from(i: Option<i64>) -> Self {
        i.map_or(Value::Null, Value::Int)
    }
}

/// Build a typed column. Ints and dates keep their polars type; a column
/// that mixes kinds, or holds only nulls, is stored as text.
fn to_column(name: &str, values: &[Value]) -> LoadResult<Column> {
    let only = |pred: fn(&Value) -> bool| {
        values.iter().all(|v| v.is_null() || pred(v)) && values.iter().any(pred)
    };
    let series = if only(|v| matches!(v, Value::Int(_))) {
        Series::new(name.into(), values.iter().map(Value::as_int).collect::<Vec<_>>())
    } else if only(|v| matches!(v, Value::Date(_))) {
        let days: Vec<Option<i32>> = values
            .iter()
            .map(|v| match v {
                Value::Date(d) => Some(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE),
                _ => None,
            })
            .collect();
        Series::new(name.into(), days).cast(&PolarsType::Date)?
    } else {
        let text: Vec<Option<String>> = values
            .iter()
            .map(|v| (!v.is_null()).then(|| v.to_string()))
            .collect();
        Series::new(name.into(), text)
    };
    Ok(series.into_column())
}

fn column_values(column: &Column) -> Vec<Value> {
    (0..column.len())
        .map(|i| column.get(i).map_or(Value::Null, Value::from_any))
        .collect()
}

/// Text key expressions for `columns`, with nulls made comparable.
fn key_exprs<S: AsRef<str>>(columns: &[S]) -> Vec<Expr> {
    columns
        .iter()
        .map(|c| {
            col(c.as_ref())
                .cast(PolarsType::String)
                .fill_null(lit(NULL_KEY))
                .alias(c.as_ref())
        })
        .collect()
}

/// One materialized row. Cheap to send across an `.await`.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Column-named table of cells.
#[derive(Debug, Clone)]
pub struct Frame {
    df: DataFrame,
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.columns() == other.columns() && self.rows() == other.rows()
    }
}

impl From<DataFrame> for Frame {
    fn from(df: DataFrame) -> Self {
        Frame { df }
    }
}

impl Frame {
    /// Frame with `columns` and no rows.
    pub fn empty<S: AsRef<str>>(columns: &[S]) -> LoadResult<Frame> {
        Frame::from_rows(columns.iter().map(|c| c.as_ref().to_string()), Vec::new())
    }

    /// Build from row-major cells. Short rows are padded with nulls and long
    /// rows are cut to the width of `columns`.
    pub fn from_rows<S: Into<String>>(
        columns: impl IntoIterator<Item = S>,
        rows: Vec<Vec<Value>>,
    ) -> LoadResult<Frame> {
        let names: Vec<String> = columns.into_iter().map(Into::into).collect();
        let mut by_column: Vec<Vec<Value>> = vec![Vec::with_capacity(rows.len()); names.len()];
        for row in rows {
            let mut row = row.into_iter();
            for cells in by_column.iter_mut() {
                cells.push(row.next().unwrap_or(Value::Null));
            }
        }
        let columns = names
            .iter()
            .zip(&by_column)
            .map(|(name, values)| to_column(name, values))
            .collect::<LoadResult<Vec<_>>>()?;
        Ok(Frame {
            df: DataFrame::new(columns)?,
        })
    }

    pub fn columns(&self) -> Vec<String> {
        self.df
            .get_column_names()
            .into_iter()
            .map(|c| c.to_string())
            .collect()
    }

    /// Row-major copy of every cell.
    pub fn rows(&self) -> Vec<Vec<Value>> {
        let columns: Vec<Vec<Value>> = self.df.get_columns().iter().map(column_values).collect();
        (0..self.len())
            .map(|i| columns.iter().map(|c| c[i].clone()).collect())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.df.height()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.df.column(name).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = Row> {
        let columns: Arc<[String]> = self.columns().into();
        self.rows().into_iter().map(move |values| Row {
            columns: Arc::clone(&columns),
            values,
        })
    }

    pub fn get(&self, row: usize, column: &str) -> Option<Value> {
        let column = self.df.column(column).ok()?;
        column.get(row).ok().map(Value::from_any)
    }

    /// Values of one column; empty if the column does not exist.
    pub fn column(&self, name: &str) -> Vec<Value> {
        self.df.column(name).map(column_values).unwrap_or_default()
    }

    /// Project onto `columns` in that order; absent columns come back null.
    pub fn select<S: AsRef<str>>(&self, columns: &[S]) -> LoadResult<Frame> {
        let nulls = vec![Value::Null; self.len()];
        let columns = columns
            .iter()
            .map(|c| match self.df.column(c.as_ref()) {
                Ok(existing) => Ok(existing.clone()),
                Err(_) => to_column(c.as_ref(), &nulls),
            })
            .collect::<LoadResult<Vec<_>>>()?;
        Ok(Frame {
            df: DataFrame::new(columns)?,
        })
    }

    pub fn drop_columns<S: AsRef<str>>(&self, columns: &[S]) -> LoadResult<Frame> {
        let keep: Vec<String> = self
            .columns()
            .into_iter()
            .filter(|c| !columns.iter().any(|d| d.as_ref() == c.as_str()))
            .collect();
        self.select(&keep)
    }

    /// Add `name` with `values`, replacing an existing column of that name.
    pub fn with_column(&self, name: &str, values: Vec<Value>) -> LoadResult<Frame> {
        let mut df = self.df.clone();
        df.with_column(to_column(name, &values)?)?;
        Ok(Frame { df })
    }

    pub fn with_constant(&self, name: &str, value: Value) -> LoadResult<Frame> {
        self.with_column(name, vec![value; self.len()])
    }

    pub fn map_column(&self, name: &str, f: impl Fn(&Value) -> Value) -> LoadResult<Frame> {
        if !self.has_column(name) {
            return Ok(self.clone());
        }
        let values = self.column(name).iter().map(f).collect();
        self.with_column(name, values)
    }

    pub fn rename(&self, from: &str, to: &str) -> LoadResult<Frame> {
        let mut df = self.df.clone();
        if self.has_column(from) {
            df.rename(from, to.into())?;
        }
        Ok(Frame { df })
    }

    pub fn filter(&self, keep: impl Fn(&Row) -> bool) -> LoadResult<Frame> {
        let mask: Vec<bool> = self.iter().map(|row| keep(&row)).collect();
        self.filter_mask(&mask)
    }

    fn filter_mask(&self, mask: &[bool]) -> LoadResult<Frame> {
        let mask = BooleanChunked::from_slice("keep".into(), mask);
        Ok(Frame {
            df: self.df.filter(&mask)?,
        })
    }

    /// Drop repeated rows, keeping first occurrences in order.
    pub fn distinct(&self) -> LoadResult<Frame> {
        if self.df.width() == 0 {
            return Ok(self.clone());
        }
        Ok(Frame {
            df: self
                .df
                .unique_stable(None::<&[String]>, UniqueKeepStrategy::First, None)?,
        })
    }

    /// Rows of `self` stacked above the rows of `other`. Both must have the
    /// same columns in the same order.
    pub fn vstack(&self, other: &Frame) -> LoadResult<Frame> {
        if self.df.width() == 0 {
            return Ok(other.clone());
        }
        Ok(Frame {
            df: self.df.vstack(&other.df)?,
        })
    }

    fn keys_lazy<S: AsRef<str>>(&self, keys: &[S], with_index: bool) -> LazyFrame {
        let mut exprs = key_exprs(keys);
        let lazy = if with_index {
            exprs.insert(0, col(ROW_INDEX));
            self.df.clone().lazy().with_row_index(ROW_INDEX, None)
        } else {
            self.df.clone().lazy()
        };
        lazy.select(exprs)
    }

    /// Rows of `self` whose `on` columns match no row of `other`. Values are
    /// compared as text and null matches null.
    pub fn anti_join<S: AsRef<str>>(&self, other: &Frame, on: &[S]) -> LoadResult<Frame> {
        if on.is_empty() {
            return if other.is_empty() {
                Ok(self.clone())
            } else {
                self.filter_mask(&vec![false; self.len()])
            };
        }
        let on_exprs: Vec<Expr> = on.iter().map(|c| col(c.as_ref())).collect();
        let kept: Frame = self
            .keys_lazy(on, true)
            .join(
                other.keys_lazy(on, false),
                on_exprs.clone(),
                on_exprs,
                JoinArgs::new(JoinType::Anti),
            )
            .select([col(ROW_INDEX)])
            .collect()?
            .into();
        let kept: BTreeSet<i64> = kept
            .column(ROW_INDEX)
            .iter()
            .filter_map(Value::as_int)
            .collect();
        let mask: Vec<bool> = (0..self.len()).map(|i| kept.contains(&(i as i64))).collect();
        self.filter_mask(&mask)
    }

    /// Every row of `self` with the non-key columns of the `other` row whose
    /// `right_on` columns equal its `left_on` columns; null where none does.
    /// Row order of `self` is kept.
    pub fn left_join<S: AsRef<str>>(
        &self,
        other: &Frame,
        left_on: &[S],
        right_on: &[S],
    ) -> LoadResult<Frame> {
        let left_exprs: Vec<Expr> = left_on.iter().map(|c| col(c.as_ref())).collect();
        let right_exprs: Vec<Expr> = right_on.iter().map(|c| col(c.as_ref())).collect();
        let left = self
            .df
            .clone()
            .lazy()
            .with_row_index(ROW_INDEX, None)
            .with_columns(key_exprs(left_on));
        let right = other.df.clone().lazy().with_columns(key_exprs(right_on));
        let joined: Frame = left
            .join(right, left_exprs, right_exprs, JoinArgs::new(JoinType::Left))
            .sort([ROW_INDEX], SortMultipleOptions::default())
            .collect()?
            .into();
        // key columns were cast to text for matching; restore the originals
        let mut out = joined;
        for key in left_on {
            out = out.with_column(key.as_ref(), self.column(key.as_ref()))?;
        }
        let mut dropped: Vec<&str> = vec![ROW_INDEX];
        dropped.extend(
            right_on
                .iter()
                .map(AsRef::as_ref)
                .filter(|k| !left_on.iter().any(|l| l.as_ref() == *k)),
        );
        out.drop_columns(&dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame::from_rows(
            ["County", "Precinct"],
            vec![
                vec!["Wake".into(), "12".into()],
                vec!["Wake".into(), "12".into()],
                vec!["Durham".into(), "3".into()],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_coerce_failure_is_none() {
        assert_eq!(Value::text("x").coerce(DataType::Integer), None);
        assert_eq!(Value::Int(3).coerce(DataType::Text), Some(Value::text("3")));
    }

    #[test]
    fn test_distinct_keeps_first_occurrence() {
        let d = sample().distinct().unwrap();
        assert_eq!(d.len(), 2);
        assert_eq!(d.get(1, "County"), Some(Value::text("Durham")));
    }

    #[test]
    fn test_select_fills_missing_with_null() {
        let s = sample().select(&["Precinct", "Ward"]).unwrap();
        assert_eq!(s.columns(), vec!["Precinct".to_string(), "Ward".to_string()]);
        assert_eq!(s.get(0, "Ward"), Some(Value::Null));
    }

    #[test]
    fn test_transforms_leave_input_untouched() {
        let f = sample();
        let g = f
            .with_constant("State", "NC".into())
            .unwrap()
            .drop_columns(&["County"])
            .unwrap();
        assert_eq!(f.columns().len(), 2);
        assert_eq!(g.columns(), vec!["Precinct".to_string(), "State".to_string()]);
    }

    #[test]
    fn test_typed_cells_survive_the_dataframe() {
        let day = NaiveDate::from_ymd_opt(2020, 11, 3).unwrap();
        let f = Frame::from_rows(
            ["Id", "StartDate", "Name"],
            vec![
                vec![Value::Int(1), Value::Date(day), Value::Null],
                vec![Value::Null, Value::Null, Value::text("x")],
            ],
        )
        .unwrap();
        assert_eq!(f.get(0, "Id"), Some(Value::Int(1)));
        assert_eq!(f.get(0, "StartDate"), Some(Value::Date(day)));
        assert_eq!(f.get(0, "Name"), Some(Value::Null));
        assert_eq!(f.get(1, "Id"), Some(Value::Null));
    }

    #[test]
    fn test_anti_join_matches_null_to_null() {
        let stored = Frame::from_rows(
            ["Name", "Code"],
            vec![vec!["Wake".into(), Value::Null], vec!["Durham".into(), Value::Int(3)]],
        )
        .unwrap();
        let incoming = Frame::from_rows(
            ["Name", "Code"],
            vec![
                vec!["Wake".into(), Value::Null],
                vec!["Durham".into(), Value::Int(4)],
                vec!["Orange".into(), Value::Null],
            ],
        )
        .unwrap();
        let novel = incoming.anti_join(&stored, &["Name", "Code"]).unwrap();
        assert_eq!(novel.column("Name"), vec![Value::text("Durham"), Value::text("Orange")]);
        assert_eq!(novel.get(0, "Code"), Some(Value::Int(4)));
    }

    #[test]
    fn test_left_join_keeps_order_and_fills_null() {
        let left = Frame::from_rows(
            ["Precinct"],
            vec![vec!["3".into()], vec!["1".into()], vec!["9".into()]],
        )
        .unwrap();
        let right = Frame::from_rows(
            ["id", "name"],
            vec![vec!["1".into(), "North".into()], vec!["3".into(), "South".into()]],
        )
        .unwrap();
        let joined = left.left_join(&right, &["Precinct"], &["id"]).unwrap();
        assert_eq!(joined.columns(), vec!["Precinct".to_string(), "name".to_string()]);
        assert_eq!(
            joined.column("name"),
            vec![Value::text("South"), Value::text("North"), Value::Null]
        );
    }

    #[test]
    fn test_vstack_appends_rows() {
        let f = sample();
        assert_eq!(f.vstack(&f).unwrap().len(), 6);
    }
}
