//! Jurisdiction directory: one `<Element>.txt` per CDF element, tab-separated.
//!
//! Responsibilities:
//! - Read element files into frames, with blanks read as `none or unknown`
//! - Add the sentinel `none or unknown` row every element except
//!   `ExternalIdentifier` carries
//! - Check cross-file dependencies (every `ElectionDistrict` is a
//!   `ReportingUnit`, ...), duplicates and blank required fields

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use encoding_rs::Encoding;
use serde::Serialize;

use crate::error::{ErrorEntry, LoadError, LoadResult};
use crate::files;
use crate::frame::{Frame, Value};
use crate::schema::{CdfElement, JURISDICTION_DEPENDENCIES, NONE_OR_UNKNOWN};

/// Elements a jurisdiction directory can hold, in load order. Whatever has no
/// file is skipped; `ExternalIdentifier` is always last.
pub const LOAD_ORDER: &[CdfElement] = &[
    CdfElement::ReportingUnit,
    CdfElement::Office,
    CdfElement::Party,
    CdfElement::CandidateContest,
    CdfElement::Election,
    CdfElement::Candidate,
    CdfElement::CandidateSelection,
    CdfElement::BallotMeasureContest,
    CdfElement::BallotMeasureSelection,
    CdfElement::ExternalIdentifier,
];

/// A jurisdiction directory and the encoding its files are written in.
#[derive(Debug, Clone)]
pub struct Jurisdiction {
    pub name: String,
    pub dir: PathBuf,
    pub encoding: &'static Encoding,
}

impl Jurisdiction {
    pub fn new(dir: impl Into<PathBuf>, encoding: &'static Encoding) -> Self {
        let dir = dir.into();
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        Jurisdiction {
            name,
            dir,
            encoding,
        }
    }

    pub fn element_path(&self, element: CdfElement) -> PathBuf {
        self.dir.join(format!("{}.txt", element.name()))
    }

    pub fn has_file(&self, element: CdfElement) -> bool {
        self.element_path(element).is_file()
    }

    /// Elements with a file in this directory, in load order.
    pub fn elements(&self) -> Vec<CdfElement> {
        LOAD_ORDER
            .iter()
            .copied()
            .filter(|e| self.has_file(*e))
            .collect()
    }

    /// The element file exactly as written: text cells, blanks as null.
    pub async fn read_raw(&self, element: CdfElement) -> LoadResult<Frame> {
        let path = self.element_path(element);
        if !path.is_file() {
            return Err(LoadError::Jurisdiction(format!(
                "{}: file not found",
                path.display()
            )));
        }
        read_tsv_frame(&path, self.encoding).await
    }

    /// The element file prepared for loading: blanks filled with the
    /// sentinel, sentinel row added, duplicates dropped. Also returns the
    /// number of duplicate rows removed.
    pub async fn read_element(&self, element: CdfElement) -> LoadResult<(Frame, usize)> {
        let raw = self.read_raw(element).await?;
        prepare(&raw, element)
    }
}

async fn read_tsv_frame(path: &Path, encoding: &'static Encoding) -> LoadResult<Frame> {
    let text = files::read_decoded(path, encoding).await?;
    let (headers, records) = files::read_records(&text, b'\t', &path.display().to_string())?;
    let rows = records
        .into_iter()
        .map(|r| {
            r.into_iter()
                .map(|cell| {
                    if cell.is_empty() {
                        Value::Null
                    } else {
                        Value::Text(cell)
                    }
                })
                .collect()
        })
        .collect();
    Frame::from_rows(headers, rows)
}

/// The sentinel row for `element` over `columns`: every cell
/// `none or unknown`, typed attributes set to their typed default.
pub fn sentinel_row(element: CdfElement, columns: &[String]) -> Vec<Value> {
    columns.iter().map(|c| sentinel_for(element, c)).collect()
}

fn sentinel_for(element: CdfElement, column: &str) -> Value {
    element
        .schema()
        .fields
        .iter()
        .find(|f| f.name == column)
        .map_or_else(|| Value::text(NONE_OR_UNKNOWN), |f| f.dtype.sentinel())
}

/// Fill blanks, add the sentinel row, and drop duplicate rows.
pub fn prepare(raw: &Frame, element: CdfElement) -> LoadResult<(Frame, usize)> {
    let columns = raw.columns();
    let mut frame = raw.clone();
    for c in &columns {
        let sentinel = sentinel_for(element, c);
        frame = frame.map_column(c, |v| {
            if v.is_null() {
                sentinel.clone()
            } else {
                v.clone()
            }
        })?;
    }
    if element != CdfElement::ExternalIdentifier {
        let mut rows = frame.rows();
        rows.push(sentinel_row(element, &columns));
        frame = Frame::from_rows(columns.iter().cloned(), rows)?;
    }
    let before = frame.len();
    let deduped = frame.distinct()?;
    let duplicates = before - deduped.len();
    if duplicates > 0 {
        tracing::warn!(%element, duplicates, "duplicates removed from jurisdiction file");
    }
    Ok((deduped, duplicates))
}

// =============================================================================
// CHECKS
// =============================================================================

/// Values of each dependent column in `element`'s file that are missing from
/// the name column of the file it depends on. Blank values are allowed.
pub async fn check_dependencies(
    juris: &Jurisdiction,
    element: CdfElement,
) -> LoadResult<Vec<LoadError>> {
    let frame = juris.read_raw(element).await?;
    let mut violations = Vec::new();
    for (column, target) in JURISDICTION_DEPENDENCIES {
        if !frame.has_column(column) {
            continue;
        }
        let Some(name_field) = target.name_field() else {
            continue;
        };
        let known: HashSet<String> = if juris.has_file(*target) {
            juris
                .read_raw(*target)
                .await?
                .column(name_field)
                .into_iter()
                .filter(|v| !v.is_null())
                .map(|v| v.to_string())
                .collect()
        } else {
            HashSet::new()
        };
        let mut missing: Vec<String> = frame
            .column(column)
            .into_iter()
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .filter(|v| v != NONE_OR_UNKNOWN && !known.contains(v))
            .collect();
        missing.sort();
        missing.dedup();
        if !missing.is_empty() {
            violations.push(LoadError::DependencyViolation {
                element: element.to_string(),
                column: column.to_string(),
                target: target.to_string(),
                values: missing,
            });
        }
    }
    Ok(violations)
}

/// Required attributes left blank in `raw`.
pub fn null_fields(raw: &Frame, element: CdfElement) -> Vec<String> {
    element
        .schema()
        .fields
        .iter()
        .filter(|f| f.not_null && raw.has_column(f.name))
        .filter(|f| raw.column(f.name).iter().any(|v| v.is_null()))
        .map(|f| f.name.to_string())
        .collect()
}

/// Result of checking a jurisdiction directory without loading it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JurisdictionCheck {
    pub jurisdiction: String,
    pub elements: Vec<String>,
    pub problems: BTreeMap<String, Vec<ErrorEntry>>,
    pub duplicates: BTreeMap<String, usize>,
}

impl JurisdictionCheck {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Check every element file: dependencies, duplicates, blank required fields.
pub async fn check_jurisdiction(juris: &Jurisdiction) -> LoadResult<JurisdictionCheck> {
    if !juris.dir.is_dir() {
        return Err(LoadError::Jurisdiction(format!(
            "{} is not a directory",
            juris.dir.display()
        )));
    }
    let mut check = JurisdictionCheck {
        jurisdiction: juris.name.clone(),
        ..Default::default()
    };
    for element in juris.elements() {
        check.elements.push(element.to_string());
        let mut problems: Vec<ErrorEntry> = check_dependencies(juris, element)
            .await?
            .iter()
            .map(ErrorEntry::from)
            .collect();

        let raw = juris.read_raw(element).await?;
        let blanks = null_fields(&raw, element);
        if !blanks.is_empty() {
            problems.push(ErrorEntry::from(&LoadError::Jurisdiction(format!(
                "{element}.txt has blank values in required columns: {}",
                blanks.join(", ")
            ))));
        }
        let (_, duplicates) = prepare(&raw, element)?;
        if duplicates > 0 {
            check.duplicates.insert(element.to_string(), duplicates);
        }
        if !problems.is_empty() {
            check.problems.insert(element.to_string(), problems);
        }
    }
    Ok(check)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_sentinel_row_is_typed() {
        let cols: Vec<String> = ["Name", "VotesAllowed", "Office"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let row = sentinel_row(CdfElement::CandidateContest, &cols);
        assert_eq!(
            row,
            vec![
                Value::text(NONE_OR_UNKNOWN),
                Value::Int(-1),
                Value::text(NONE_OR_UNKNOWN)
            ]
        );
        let row = sentinel_row(CdfElement::Election, &["StartDate".to_string()]);
        assert_eq!(
            row,
            vec![Value::Date(NaiveDate::from_ymd_opt(1000, 1, 1).unwrap())]
        );
    }

    #[test]
    fn test_prepare_fills_blanks_and_dedupes() {
        let raw = Frame::from_rows(
            ["Name", "PrimaryParty"],
            vec![
                vec![Value::text("Governor"), Value::Null],
                vec![Value::text("Governor"), Value::Null],
            ],
        )
        .unwrap();
        let (frame, dupes) = prepare(&raw, CdfElement::CandidateContest).unwrap();
        assert_eq!(dupes, 1);
        // one contest plus the sentinel row
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.get(0, "PrimaryParty"), Some(Value::text(NONE_OR_UNKNOWN)));
    }

    #[test]
    fn test_external_identifier_has_no_sentinel() {
        let raw = Frame::from_rows(
            ["cdf_element", "internal_name"],
            vec![vec![Value::text("Party"), Value::text("Green")]],
        )
        .unwrap();
        let (frame, _) = prepare(&raw, CdfElement::ExternalIdentifier).unwrap();
        assert_eq!(frame.len(), 1);
    }

    #[test]
    fn test_null_fields() {
        let raw = Frame::from_rows(["Name"], vec![vec![Value::Null]]).unwrap();
        assert_eq!(null_fields(&raw, CdfElement::Party), vec!["Name"]);
    }
}
