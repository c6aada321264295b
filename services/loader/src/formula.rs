//! Formula interpreter for the munger's `raw_identifier_formula` column.
//!
//! A formula is literal text interleaved with `<field>` tokens. In `row` mode a
//! field names a column of the current data row; in `column` mode it is the
//! index of a header row, read in the column being evaluated.

use std::fmt;
use std::str::FromStr;

/// Where a formula's fields come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Row,
    Column,
}

impl FromStr for SourceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "row" => Ok(SourceMode::Row),
            "column" => Ok(SourceMode::Column),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceMode::Row => f.write_str("row"),
            SourceMode::Column => f.write_str("column"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("bad formula '{formula}': cannot resolve '{token}'")]
pub struct FormulaError {
    pub formula: String,
    pub token: String,
}

impl FormulaError {
    fn new(formula: &str, token: impl Into<String>) -> Self {
        FormulaError {
            formula: formula.to_string(),
            token: token.into(),
        }
    }
}

/// A parsed formula: `(text, field)` fragments followed by trailing text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    source: String,
    fragments: Vec<(String, String)>,
    tail: String,
}

impl Formula {
    /// Parse and check bracket syntax: brackets alternate, never nest, and
    /// always enclose a non-empty field.
    pub fn parse(formula: &str) -> Result<Formula, FormulaError> {
        let mut fragments = Vec::new();
        let mut rest = formula;
        loop {
            match (rest.find('<'), rest.find('>')) {
                (None, None) => break,
                (Some(open), Some(close)) if open < close => {
                    let field = &rest[open + 1..close];
                    if field.is_empty() || field.contains('<') {
                        return Err(FormulaError::new(formula, &rest[open..=close]));
                    }
                    fragments.push((rest[..open].to_string(), field.to_string()));
                    rest = &rest[close + 1..];
                }
                (Some(open), _) => return Err(FormulaError::new(formula, &rest[open..])),
                (None, Some(close)) => return Err(FormulaError::new(formula, &rest[..=close])),
            }
        }
        Ok(Formula {
            source: formula.to_string(),
            fragments,
            tail: rest.to_string(),
        })
    }

    /// Parse and, for `column` mode, require every field to be a header row
    /// index below `header_row_count`.
    pub fn parse_for(
        formula: &str,
        mode: SourceMode,
        header_row_count: usize,
    ) -> Result<Formula, FormulaError> {
        let parsed = Formula::parse(formula)?;
        if mode == SourceMode::Column {
            parsed.header_rows(header_row_count)?;
        }
        Ok(parsed)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Field names in order of appearance.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fragments.iter().map(|(_, f)| f.as_str())
    }

    fn header_rows(&self, header_row_count: usize) -> Result<Vec<usize>, FormulaError> {
        self.fields()
            .map(|f| match f.parse::<usize>() {
                Ok(i) if i < header_row_count => Ok(i),
                _ => Err(FormulaError::new(&self.source, f)),
            })
            .collect()
    }

    fn render<'a>(
        &self,
        mut lookup: impl FnMut(&str) -> Result<&'a str, FormulaError>,
    ) -> Result<String, FormulaError> {
        let mut out = String::new();
        for (text, field) in &self.fragments {
            out.push_str(text);
            out.push_str(lookup(field)?);
        }
        out.push_str(&self.tail);
        Ok(out)
    }

    /// Row mode over a plain `column -> text` lookup.
    pub fn eval_with<'a>(
        &self,
        lookup: impl Fn(&str) -> Option<&'a str>,
    ) -> Result<String, FormulaError> {
        self.render(|f| lookup(f).ok_or_else(|| FormulaError::new(&self.source, f)))
    }

    /// Column mode: `headers[i][column]` is the text of header row `i` above
    /// the column being evaluated.
    pub fn eval_column(&self, headers: &[Vec<String>], column: usize) -> Result<String, FormulaError> {
        self.render(|f| {
            f.parse::<usize>()
                .ok()
                .and_then(|i| headers.get(i))
                .and_then(|row| row.get(column))
                .map(String::as_str)
                .ok_or_else(|| FormulaError::new(&self.source, f))
        })
    }
}

/// Split a field of the form `abbrev[field]`, which reads `field` from the
/// auxiliary file `abbrev`.
pub fn aux_field(field: &str) -> Option<(&str, &str)> {
    let (abbrev, rest) = field.split_once('[')?;
    let inner = rest.strip_suffix(']')?;
    if abbrev.is_empty() || inner.is_empty() || inner.contains(['[', ']']) {
        return None;
    }
    Some((abbrev, inner))
}

/// True if `formula` has well-formed brackets.
pub fn good_syntax(formula: &str) -> bool {
    Formula::parse(formula).is_ok()
}
