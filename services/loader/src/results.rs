//! Raw results files: reading them and munging them into long format.
//!
//! A results file has `header_row_count` header lines followed by data rows.
//! Each data row holds one vote count per count column; munging produces one
//! output row per (data row, count column) with the munger's raw identifiers
//! for every element it describes, plus `Count`.
//!
//! Auxiliary files are read into frames of `abbrev[field]` columns and
//! left-joined onto the data rows before formulas are evaluated.

use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};

use crate::error::{LoadError, LoadResult};
use crate::files;
use crate::formula::SourceMode;
use crate::frame::{Frame, Value};
use crate::munger::{AuxSource, FileFormat, Munger};

pub const COUNT_COLUMN: &str = "Count";

/// Data row number carried through the auxiliary joins.
const LINE_COLUMN: &str = "__line";

/// A results file split into header lines and data rows, every row padded to
/// the same width.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResults {
    pub headers: Vec<Vec<String>>,
    pub field_names: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawResults {
    pub fn from_lines(lines: Vec<Vec<String>>, format: &FileFormat) -> RawResults {
        let width = lines
            .iter()
            .map(Vec::len)
            .chain(std::iter::once(format.field_names.len()))
            .max()
            .unwrap_or(0);
        let mut lines: Vec<Vec<String>> = lines
            .into_iter()
            .map(|mut l| {
                l.resize(width, String::new());
                l
            })
            .collect();
        let split = format.header_row_count.min(lines.len());
        let rows: Vec<Vec<String>> = lines
            .split_off(split)
            .into_iter()
            .filter(|r| r.iter().any(|c| !c.is_empty()))
            .collect();
        let headers = lines;
        let mut field_names = match format.field_name_row {
            Some(i) => headers.get(i).cloned().unwrap_or_default(),
            None => format.field_names.clone(),
        };
        field_names.resize(width, String::new());
        RawResults {
            headers,
            field_names,
            rows,
        }
    }

    pub fn width(&self) -> usize {
        self.field_names.len()
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.fract() == 0.0 => format!("{}", *f as i64),
        other => format!("{}", other),
    }
}

fn read_spreadsheet(path: &Path) -> LoadResult<Vec<Vec<String>>> {
    let spreadsheet_error = |detail: String| LoadError::Spreadsheet {
        path: path.display().to_string(),
        detail,
    };
    let mut workbook = open_workbook_auto(path).map_err(|e| spreadsheet_error(e.to_string()))?;
    let sheet_names = workbook.sheet_names().to_vec();
    let first = sheet_names
        .first()
        .ok_or_else(|| spreadsheet_error("workbook has no sheets".to_string()))?;
    let range = workbook
        .worksheet_range(first)
        .map_err(|e| spreadsheet_error(e.to_string()))?;
    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_text).collect())
        .collect())
}

/// Read `path` according to the munger's file format.
pub async fn read_results(path: &Path, format: &FileFormat) -> LoadResult<RawResults> {
    let lines = match format.file_type.delimiter() {
        Some(delimiter) => {
            let text = files::read_decoded(path, format.encoding).await?;
            files::read_all_lines(&text, delimiter, &path.display().to_string())?
        }
        None => {
            let owned = path.to_path_buf();
            tokio::task::spawn_blocking(move || read_spreadsheet(&owned))
                .await
                .map_err(|e| LoadError::Spreadsheet {
                    path: path.display().to_string(),
                    detail: e.to_string(),
                })??
        }
    };
    let raw = RawResults::from_lines(lines, format);
    tracing::info!(
        path = %path.display(),
        file_type = %format.file_type,
        header_rows = raw.headers.len(),
        rows = raw.rows.len(),
        "results file read"
    );
    Ok(raw)
}

// =============================================================================
// AUXILIARY FILES
// =============================================================================

/// An auxiliary file read into a frame. Columns are `abbrev[field]` for every
/// named field, plus one key column per primary key field.
#[derive(Debug, Clone)]
pub struct AuxTable {
    pub source: AuxSource,
    pub frame: Frame,
}

fn key_columns(source: &AuxSource) -> Vec<String> {
    (0..source.primary_key.len())
        .map(|i| format!("{}#key{i}", source.abbrev))
        .collect()
}

impl AuxTable {
    /// Copies of the primary key, matched against the foreign key.
    pub fn key_columns(&self) -> Vec<String> {
        key_columns(&self.source)
    }

    /// Build from a read file, checking that the key and `fields` exist and
    /// that no primary key repeats.
    pub fn from_raw(source: &AuxSource, raw: &RawResults, fields: &[&str]) -> LoadResult<AuxTable> {
        let position = |f: &str| raw.field_names.iter().position(|n| n == f);
        let mut missing: Vec<&str> = source
            .primary_key
            .iter()
            .map(String::as_str)
            .chain(fields.iter().copied())
            .filter(|f| position(*f).is_none())
            .collect();
        missing.sort_unstable();
        missing.dedup();
        if !missing.is_empty() {
            return Err(LoadError::Datafile(format!(
                "auxiliary file {} has no columns named {}",
                source.abbrev,
                missing.join(", ")
            )));
        }

        let mut named: Vec<(usize, String)> = Vec::new();
        for (i, name) in raw.field_names.iter().enumerate() {
            if !name.is_empty() && !named.iter().any(|(_, n)| n == name) {
                named.push((i, name.clone()));
            }
        }
        let key_positions: Vec<usize> = source.primary_key.iter().filter_map(|k| position(k.as_str())).collect();
        let mut columns: Vec<String> = named.iter().map(|(_, n)| source.column(n)).collect();
        columns.extend(key_columns(source));
        let rows: Vec<Vec<Value>> = raw
            .rows
            .iter()
            .map(|row| {
                named
                    .iter()
                    .map(|(i, _)| *i)
                    .chain(key_positions.iter().copied())
                    .map(|i| Value::text(row[i].as_str()))
                    .collect()
            })
            .collect();
        let frame = Frame::from_rows(columns, rows)?;

        let keys = frame.select(&key_columns(source))?;
        if keys.distinct()?.len() != keys.len() {
            return Err(LoadError::Datafile(format!(
                "auxiliary file {} repeats a primary key ({})",
                source.abbrev,
                source.primary_key.join(",")
            )));
        }
        Ok(AuxTable {
            source: source.clone(),
            frame,
        })
    }
}

/// The one file in `dir` whose name contains `abbrev`.
async fn find_aux_file(dir: &Path, abbrev: &str) -> LoadResult<PathBuf> {
    let mut found = Vec::new();
    let io = |e| LoadError::io(dir.display().to_string(), e);
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io)?;
    while let Some(entry) = entries.next_entry().await.map_err(io)? {
        let path = entry.path();
        if path.is_file() && entry.file_name().to_string_lossy().contains(abbrev) {
            found.push(path);
        }
    }
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(LoadError::Datafile(format!(
            "no file in {} has a name containing {abbrev}",
            dir.display()
        ))),
        n => Err(LoadError::Datafile(format!(
            "{n} files in {} have names containing {abbrev}",
            dir.display()
        ))),
    }
}

/// Read every auxiliary file the munger lists from `dir`.
pub async fn read_aux(munger: &Munger, dir: &Path) -> LoadResult<Vec<AuxTable>> {
    let (_, referenced) = munger.row_fields();
    let mut tables = Vec::with_capacity(munger.aux.len());
    for source in &munger.aux {
        let path = find_aux_file(dir, &source.abbrev).await?;
        let raw = read_results(&path, &source.format).await?;
        let fields: Vec<&str> = referenced
            .iter()
            .filter(|(s, _)| s.abbrev == source.abbrev)
            .map(|(_, f)| *f)
            .collect();
        let table = AuxTable::from_raw(source, &raw, &fields)?;
        tracing::info!(
            aux = %source.abbrev,
            path = %path.display(),
            rows = table.frame.len(),
            "auxiliary file read"
        );
        tables.push(table);
    }
    Ok(tables)
}

// =============================================================================
// MUNGE
// =============================================================================

/// One output row per (data row, count column). Columns: the table name of
/// each munger element holding its raw identifier, then `Count`.
pub fn munge(munger: &Munger, raw: &RawResults) -> LoadResult<Frame> {
    munge_with_aux(munger, raw, &[])
}

/// Data rows as a frame of the columns the formulas and joins need, plus the
/// row number.
fn wide_frame(munger: &Munger, raw: &RawResults) -> LoadResult<Frame> {
    let (own, _) = munger.row_fields();
    let mut needed: Vec<&str> = vec![LINE_COLUMN];
    for f in own
        .into_iter()
        .chain(munger.aux.iter().flat_map(|a| a.foreign_key.iter().map(String::as_str)))
    {
        if !needed.contains(&f) {
            needed.push(f);
        }
    }
    let positions: Vec<Option<usize>> = needed
        .iter()
        .map(|f| raw.field_names.iter().position(|n| n == f))
        .collect();
    let rows = raw
        .rows
        .iter()
        .enumerate()
        .map(|(line, row)| {
            positions
                .iter()
                .map(|p| match p {
                    Some(i) => Value::text(row[*i].as_str()),
                    None => Value::Int(line as i64),
                })
                .collect()
        })
        .collect();
    Frame::from_rows(needed, rows)
}

/// Left-join one auxiliary table. Every data row must find its key.
fn join_aux(wide: &Frame, aux: &AuxTable) -> LoadResult<Frame> {
    let joined = wide.left_join(&aux.frame, &aux.source.foreign_key, &aux.key_columns())?;
    // a matched row always carries its primary key
    let key_column = aux.source.column(&aux.source.primary_key[0]);
    if let Some(row) = joined.iter().find(|r| r.get(&key_column).map_or(true, Value::is_null)) {
        let key: Vec<String> = aux
            .source
            .foreign_key
            .iter()
            .map(|k| format!("{k}={}", row.get(k).map(Value::to_string).unwrap_or_default()))
            .collect();
        let line = row.get(LINE_COLUMN).and_then(Value::as_int).unwrap_or(0) + 1;
        return Err(LoadError::Datafile(format!(
            "no row of auxiliary file {} matches {} on data row {line}",
            aux.source.abbrev,
            key.join(", ")
        )));
    }
    Ok(joined)
}

/// Munge with auxiliary data joined in. The long format is one piece per
/// count column, stacked in count-column order.
pub fn munge_with_aux(munger: &Munger, raw: &RawResults, aux: &[AuxTable]) -> LoadResult<Frame> {
    let format = &munger.format;
    if let Some(bad) = format.count_columns.iter().find(|c| **c >= raw.width()) {
        return Err(LoadError::Datafile(format!(
            "count column {bad} does not exist; only {} columns read from file, check file_type in format.txt",
            raw.width()
        )));
    }
    munger.check_field_names(&raw.field_names)?;
    for source in &munger.aux {
        if !aux.iter().any(|t| t.source.abbrev == source.abbrev) {
            return Err(LoadError::Configuration(format!(
                "munger {}: auxiliary file {} was not read",
                munger.name, source.abbrev
            )));
        }
    }

    let mut wide = wide_frame(munger, raw)?;
    for table in aux {
        wide = join_aux(&wide, table)?;
    }

    // row-mode identifiers, one per data row and element
    let row_values: Vec<Vec<Option<String>>> = wide
        .iter()
        .map(|row| {
            let lookup = |field: &str| row.get(field).and_then(Value::as_str);
            munger
                .elements
                .iter()
                .map(|e| match e.source {
                    SourceMode::Row => e.formula.eval_with(lookup).map(Some),
                    SourceMode::Column => Ok(None),
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<_, _>>()?;

    let mut columns: Vec<String> = munger
        .elements
        .iter()
        .map(|e| e.table.name().to_string())
        .collect();
    columns.push(COUNT_COLUMN.to_string());

    let mut pieces: Vec<Frame> = Vec::with_capacity(format.count_columns.len());
    for &c in &format.count_columns {
        let header_values = munger
            .elements
            .iter()
            .map(|e| match e.source {
                SourceMode::Column => e.formula.eval_column(&raw.headers, c).map(Some),
                SourceMode::Row => Ok(None),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut rows = Vec::with_capacity(raw.rows.len());
        for (line, (row, values)) in raw.rows.iter().zip(&row_values).enumerate() {
            let count = format.parse_count(&row[c]).ok_or_else(|| {
                LoadError::Datafile(format!(
                    "column {c} ({}) cannot be parsed as an integer on data row {}: '{}'",
                    raw.field_names[c],
                    line + 1,
                    row[c]
                ))
            })?;
            let mut out: Vec<Value> = values
                .iter()
                .zip(&header_values)
                .map(|(v, h)| Value::text(v.as_deref().or(h.as_deref()).unwrap_or_default()))
                .collect();
            out.push(Value::Int(count));
            rows.push(out);
        }
        pieces.push(Frame::from_rows(columns.clone(), rows)?);
    }

    let mut pieces = pieces.into_iter();
    let Some(first) = pieces.next() else {
        return Frame::empty(&columns);
    };
    pieces.try_fold(first, |long, piece| long.vstack(&piece))
}
