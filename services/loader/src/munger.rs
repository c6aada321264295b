//! Munger: the configuration bundle describing one raw results-file layout.
//!
//! A munger directory holds three tab-separated files:
//! - `cdf_elements.txt`: `name`, `source` (`row`/`column`), `raw_identifier_formula`
//! - `format.txt`: `item`, `value` pairs describing the file layout
//! - `raw_identifiers.txt`: the raw-identifier dictionary
//!
//! It may also hold `aux_meta.txt`, listing auxiliary files joined onto the
//! results file by key. Each one gets a sub-directory named by its
//! abbreviation with its own `format.txt`. Row formulas read an auxiliary
//! column as `<abbrev[field]>`.
//!
//! Everything is validated once, when the munger is built. A `Munger` value is
//! immutable afterwards.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use encoding_rs::{Encoding, UTF_8};
use serde::Deserialize;

use crate::error::{LoadError, LoadResult};
use crate::files;
use crate::formula::{self, aux_field, Formula, SourceMode};
use crate::schema::Table;
use crate::translate::Dictionary;

pub const CDF_ELEMENTS_FILE: &str = "cdf_elements.txt";
pub const FORMAT_FILE: &str = "format.txt";
pub const RAW_IDENTIFIERS_FILE: &str = "raw_identifiers.txt";
pub const AUX_META_FILE: &str = "aux_meta.txt";

/// Items every `format.txt` must define.
pub const FORMAT_ITEMS: &[&str] = &[
    "header_row_count",
    "field_name_row",
    "field_names_if_no_field_name_row",
    "count_columns",
    "file_type",
    "encoding",
    "thousands_separator",
];

// =============================================================================
// FILE ROWS
// =============================================================================

#[derive(Debug, Deserialize)]
struct ElementRow {
    name: String,
    source: String,
    #[serde(default)]
    raw_identifier_formula: String,
}

#[derive(Debug, Deserialize)]
struct FormatRow {
    item: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct AuxMetaRow {
    abbreviated_file_name: String,
    primary_key: String,
    #[serde(default)]
    foreign_key: String,
}

#[derive(Debug, Deserialize)]
struct RawIdentifierRow {
    cdf_element: String,
    raw_identifier_value: String,
    cdf_internal_name: String,
}

// =============================================================================
// FORMAT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Csv,
    Txt,
    Xls,
}

impl FileType {
    /// Field delimiter for text files; `None` for spreadsheets.
    pub fn delimiter(self) -> Option<u8> {
        match self {
            FileType::Csv => Some(b','),
            FileType::Txt => Some(b'\t'),
            FileType::Xls => None,
        }
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(FileType::Csv),
            "txt" | "tsv" => Ok(FileType::Txt),
            "xls" | "xlsx" => Ok(FileType::Xls),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileType::Csv => "csv",
            FileType::Txt => "txt",
            FileType::Xls => "xls",
        })
    }
}

/// Parsed `format.txt`.
#[derive(Debug, Clone)]
pub struct FileFormat {
    pub header_row_count: usize,
    /// Header row holding column names, if the file has one.
    pub field_name_row: Option<usize>,
    /// Column names to use when `field_name_row` is absent.
    pub field_names: Vec<String>,
    /// Zero-based indices of the columns holding vote counts.
    pub count_columns: Vec<usize>,
    pub file_type: FileType,
    pub encoding: &'static Encoding,
    pub thousands_separator: Option<String>,
}

impl FileFormat {
    /// Strip the thousands separator and parse a count.
    pub fn parse_count(&self, raw: &str) -> Option<i64> {
        let mut cleaned = raw.trim().to_string();
        if let Some(sep) = &self.thousands_separator {
            cleaned = cleaned.replace(sep.as_str(), "");
        }
        if cleaned.is_empty() {
            return Some(0);
        }
        cleaned.parse::<i64>().ok().or_else(|| {
            cleaned
                .parse::<f64>()
                .ok()
                .filter(|f| f.fract() == 0.0)
                .map(|f| f as i64)
        })
    }
}

fn parse_format(
    rows: &[FormatRow],
    problems: &mut Vec<String>,
    warnings: &mut Vec<String>,
) -> Option<FileFormat> {
    let items: HashMap<&str, &str> = rows
        .iter()
        .map(|r| (r.item.as_str(), r.value.as_str()))
        .collect();

    let missing: Vec<&str> = FORMAT_ITEMS
        .iter()
        .copied()
        .filter(|i| !items.contains_key(i))
        .collect();
    if !missing.is_empty() {
        problems.push(format!(
            "format file is missing some items: {}",
            missing.join(",")
        ));
        return None;
    }
    let item = |name: &str| items.get(name).copied().unwrap_or("").trim();

    let header_row_count = match item("header_row_count").parse::<usize>() {
        Ok(n) => Some(n),
        Err(_) => {
            problems.push(format!(
                "in format file, header_row_count must be an integer ({} is not)",
                item("header_row_count")
            ));
            None
        }
    };

    let field_name_row = item("field_name_row").parse::<usize>().ok();
    let field_names: Vec<String> = item("field_names_if_no_field_name_row")
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if field_name_row.is_none() && field_names.is_empty() {
        problems.push(
            "in format file, field_name_row is not an integer, but no field names are given \
             in field_names_if_no_field_name_row"
                .to_string(),
        );
    }
    if let (Some(row), Some(count)) = (field_name_row, header_row_count) {
        if row >= count {
            problems.push(format!(
                "in format file, field_name_row {row} is not one of the {count} header rows"
            ));
        }
    }

    let count_columns = match item("count_columns") {
        "" | "None" => Vec::new(),
        raw => {
            let parsed: Result<Vec<usize>, _> =
                raw.split(',').map(|s| s.trim().parse::<usize>()).collect();
            match parsed {
                Ok(cols) => cols,
                Err(_) => {
                    problems.push(format!(
                        "in format file, count_columns must be comma-separated integers ({raw} is not)"
                    ));
                    Vec::new()
                }
            }
        }
    };

    let file_type = match item("file_type").parse::<FileType>() {
        Ok(t) => Some(t),
        Err(bad) => {
            problems.push(format!("in format file, file_type '{bad}' is not recognized"));
            None
        }
    };

    let encoding = match files::encoding_for_label(item("encoding")) {
        Some(e) => e,
        None => {
            warnings.push(format!(
                "encoding '{}' in format file is not recognized; using utf-8",
                item("encoding")
            ));
            UTF_8
        }
    };

    let thousands_separator = match item("thousands_separator") {
        "" | "None" => None,
        sep => Some(sep.to_string()),
    };

    Some(FileFormat {
        header_row_count: header_row_count?,
        field_name_row,
        field_names,
        count_columns,
        file_type: file_type?,
        encoding,
        thousands_separator,
    })
}

// =============================================================================
// AUXILIARY FILES
// =============================================================================

/// An auxiliary file: rows keyed by `primary_key`, matched against the
/// `foreign_key` columns of the results file.
#[derive(Debug, Clone)]
pub struct AuxSource {
    pub abbrev: String,
    pub primary_key: Vec<String>,
    pub foreign_key: Vec<String>,
    pub format: FileFormat,
}

impl AuxSource {
    /// Name of `field` once the file is joined onto the results file.
    pub fn column(&self, field: &str) -> String {
        format!("{}[{}]", self.abbrev, field)
    }
}

fn key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Abbreviations listed in `aux_meta.txt`, in file order.
pub fn aux_abbreviations(aux_meta: &str) -> LoadResult<Vec<String>> {
    let rows: Vec<AuxMetaRow> = files::read_tsv_as(aux_meta, AUX_META_FILE)?;
    Ok(rows
        .into_iter()
        .map(|r| r.abbreviated_file_name.trim().to_string())
        .collect())
}

fn parse_aux(
    aux_meta: &str,
    formats: &HashMap<String, String>,
    problems: &mut Vec<String>,
    warnings: &mut Vec<String>,
) -> LoadResult<Vec<AuxSource>> {
    let rows: Vec<AuxMetaRow> = files::read_tsv_as(aux_meta, AUX_META_FILE)?;
    let mut sources: Vec<AuxSource> = Vec::new();
    for row in rows {
        let abbrev = row.abbreviated_file_name.trim().to_string();
        if abbrev.is_empty() || abbrev.contains(['[', ']', '<', '>']) {
            problems.push(format!("{AUX_META_FILE} has a bad abbreviation: '{abbrev}'"));
            continue;
        }
        if sources.iter().any(|s| s.abbrev == abbrev) {
            problems.push(format!("{AUX_META_FILE} lists {abbrev} twice"));
            continue;
        }
        let primary_key = key_list(&row.primary_key);
        let foreign_key = match key_list(&row.foreign_key) {
            fk if fk.is_empty() => primary_key.clone(),
            fk => fk,
        };
        if primary_key.is_empty() {
            problems.push(format!("{AUX_META_FILE}: {abbrev} has no primary_key"));
            continue;
        }
        if primary_key.len() != foreign_key.len() {
            problems.push(format!(
                "{AUX_META_FILE}: {abbrev} has {} primary key fields but {} foreign key fields",
                primary_key.len(),
                foreign_key.len()
            ));
            continue;
        }
        let Some(text) = formats.get(&abbrev) else {
            problems.push(format!("auxiliary file {abbrev} has no {abbrev}/{FORMAT_FILE}"));
            continue;
        };
        let format_rows: Vec<FormatRow> = files::read_tsv_as(text, FORMAT_FILE)?;
        let mut aux_problems = Vec::new();
        let format = parse_format(&format_rows, &mut aux_problems, warnings);
        problems.extend(aux_problems.into_iter().map(|p| format!("{abbrev}: {p}")));
        if let Some(format) = format {
            sources.push(AuxSource {
                abbrev,
                primary_key,
                foreign_key,
                format,
            });
        }
    }
    Ok(sources)
}

// =============================================================================
// MUNGER
// =============================================================================

/// How one CDF element's raw identifier is read from a results file.
#[derive(Debug, Clone)]
pub struct ElementFormula {
    pub table: Table,
    pub source: SourceMode,
    pub formula: Formula,
}

#[derive(Debug, Clone)]
pub struct Munger {
    pub name: String,
    pub format: FileFormat,
    pub elements: Vec<ElementFormula>,
    pub dictionary: Dictionary,
    /// Auxiliary files, empty unless the munger has `aux_meta.txt`.
    pub aux: Vec<AuxSource>,
    /// Non-fatal findings from validation, e.g. an unknown encoding.
    pub warnings: Vec<String>,
}

impl Munger {
    /// Build and validate a munger from the text of its three files. All
    /// problems are gathered into one configuration error.
    pub fn from_parts(
        name: &str,
        cdf_elements: &str,
        format: &str,
        raw_identifiers: &str,
    ) -> LoadResult<Munger> {
        let element_rows: Vec<ElementRow> = files::read_tsv_as(cdf_elements, CDF_ELEMENTS_FILE)?;
        let format_rows: Vec<FormatRow> = files::read_tsv_as(format, FORMAT_FILE)?;
        let dictionary_rows: Vec<RawIdentifierRow> =
            files::read_tsv_as(raw_identifiers, RAW_IDENTIFIERS_FILE)?;

        let mut problems = Vec::new();
        let mut warnings = Vec::new();
        let format = parse_format(&format_rows, &mut problems, &mut warnings);
        let header_row_count = format.as_ref().map_or(0, |f| f.header_row_count);

        let mut elements = Vec::new();
        let mut bad_sources = Vec::new();
        let mut bad_formulas = Vec::new();
        let mut bad_column_formulas = Vec::new();
        for row in &element_rows {
            let table = match row.name.trim().parse::<Table>() {
                Ok(t) => t,
                Err(_) => {
                    problems.push(format!(
                        "{CDF_ELEMENTS_FILE} names an unknown element: {}",
                        row.name
                    ));
                    continue;
                }
            };
            let source = match row.source.parse::<SourceMode>() {
                Ok(s) => s,
                Err(bad) => {
                    bad_sources.push(bad);
                    continue;
                }
            };
            let text = row.raw_identifier_formula.as_str();
            if !formula::good_syntax(text) {
                bad_formulas.push(text.to_string());
                continue;
            }
            match Formula::parse_for(text, source, header_row_count) {
                Ok(formula) => elements.push(ElementFormula {
                    table,
                    source,
                    formula,
                }),
                Err(_) => bad_column_formulas.push(text.to_string()),
            }
        }
        if !bad_sources.is_empty() {
            problems.push(format!(
                "at least one source in {CDF_ELEMENTS_FILE} is not recognized: {}",
                bad_sources.join(",")
            ));
        }
        if !bad_formulas.is_empty() {
            problems.push(format!(
                "at least one formula in {CDF_ELEMENTS_FILE} has bad syntax: {}",
                bad_formulas.join(",")
            ));
        }
        if !bad_column_formulas.is_empty() {
            problems.push(format!(
                "at least one column-source formula in {CDF_ELEMENTS_FILE} does not address a \
                 header row below {header_row_count}: {}",
                bad_column_formulas.join(",")
            ));
        }

        let mut dictionary = Dictionary::new();
        for row in dictionary_rows {
            match row.cdf_element.trim().parse::<Table>() {
                Ok(table) => dictionary.insert(table, row.raw_identifier_value, row.cdf_internal_name),
                Err(_) => problems.push(format!(
                    "{RAW_IDENTIFIERS_FILE} names an unknown element: {}",
                    row.cdf_element
                )),
            }
        }

        match format {
            Some(format) if problems.is_empty() => {
                for w in &warnings {
                    tracing::warn!(munger = name, "{w}");
                }
                Ok(Munger {
                    name: name.to_string(),
                    format,
                    elements,
                    dictionary,
                    aux: Vec::new(),
                    warnings,
                })
            }
            _ => Err(LoadError::Configuration(format!(
                "munger {name}: {}",
                problems.join("; ")
            ))),
        }
    }

    /// Attach auxiliary files described by the text of `aux_meta.txt` and of
    /// each file's `format.txt`, keyed by abbreviation.
    pub fn with_aux(mut self, aux_meta: &str, formats: &HashMap<String, String>) -> LoadResult<Munger> {
        let mut problems = Vec::new();
        let mut warnings = Vec::new();
        let aux = parse_aux(aux_meta, formats, &mut problems, &mut warnings)?;
        if !problems.is_empty() {
            return Err(LoadError::Configuration(format!(
                "munger {}: {}",
                self.name,
                problems.join("; ")
            )));
        }
        for w in &warnings {
            tracing::warn!(munger = %self.name, "{w}");
        }
        self.aux = aux;
        self.warnings.extend(warnings);
        Ok(self)
    }

    /// Read and validate the munger in `dir`; its name is the directory name.
    pub async fn load(dir: &Path) -> LoadResult<Munger> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        let mut missing = Vec::new();
        for f in [CDF_ELEMENTS_FILE, FORMAT_FILE, RAW_IDENTIFIERS_FILE] {
            if !dir.join(f).is_file() {
                missing.push(f);
            }
        }
        if !missing.is_empty() {
            return Err(LoadError::Configuration(format!(
                "munger {name} is missing files: {}",
                missing.join(", ")
            )));
        }
        let cdf_elements = files::read_utf8(&dir.join(CDF_ELEMENTS_FILE)).await?;
        let format = files::read_utf8(&dir.join(FORMAT_FILE)).await?;
        let raw_identifiers = files::read_utf8(&dir.join(RAW_IDENTIFIERS_FILE)).await?;
        let mut munger = Munger::from_parts(&name, &cdf_elements, &format, &raw_identifiers)?;

        let meta_path = dir.join(AUX_META_FILE);
        if meta_path.is_file() {
            let aux_meta = files::read_utf8(&meta_path).await?;
            let mut formats = HashMap::new();
            for abbrev in aux_abbreviations(&aux_meta)? {
                let path = dir.join(&abbrev).join(FORMAT_FILE);
                if path.is_file() {
                    let text = files::read_utf8(&path).await?;
                    formats.insert(abbrev, text);
                }
            }
            munger = munger.with_aux(&aux_meta, &formats)?;
        }
        tracing::info!(
            munger = %munger.name,
            elements = munger.elements.len(),
            dictionary = munger.dictionary.len(),
            aux = munger.aux.len(),
            "munger loaded"
        );
        Ok(munger)
    }

    pub fn element(&self, table: Table) -> Option<&ElementFormula> {
        self.elements.iter().find(|e| e.table == table)
    }

    pub fn aux_source(&self, abbrev: &str) -> Option<&AuxSource> {
        self.aux.iter().find(|a| a.abbrev == abbrev)
    }

    /// Row-mode fields, split into results-file columns and auxiliary
    /// references `(source, field)`.
    pub fn row_fields(&self) -> (Vec<&str>, Vec<(&AuxSource, &str)>) {
        let mut own = Vec::new();
        let mut aux = Vec::new();
        let fields = self
            .elements
            .iter()
            .filter(|e| e.source == SourceMode::Row)
            .flat_map(|e| e.formula.fields());
        for f in fields {
            match aux_field(f).and_then(|(abbrev, field)| Some((self.aux_source(abbrev)?, field))) {
                Some(pair) => aux.push(pair),
                None => own.push(f),
            }
        }
        (own, aux)
    }

    /// Row-mode fields and auxiliary foreign keys must name columns of the
    /// results file. Checked before any row is processed.
    pub fn check_field_names(&self, columns: &[String]) -> LoadResult<()> {
        let (own, _) = self.row_fields();
        let mut missing: Vec<String> = own
            .into_iter()
            .chain(self.aux.iter().flat_map(|a| a.foreign_key.iter().map(String::as_str)))
            .filter(|f| !columns.iter().any(|c| c == f))
            .map(str::to_string)
            .collect();
        missing.sort();
        missing.dedup();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(LoadError::Configuration(format!(
                "munger {}: formula fields not found in file columns: {}",
                self.name,
                missing.join(", ")
            )))
        }
    }
}
