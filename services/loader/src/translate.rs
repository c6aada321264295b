//! Raw identifier dictionary: raw text from a results file to internal CDF names.

use std::collections::{BTreeSet, HashMap};

use crate::error::{LoadError, LoadResult};
use crate::frame::{Frame, Value};
use crate::schema::{Table, NONE_OR_UNKNOWN};

/// `(cdf_element, raw_identifier_value) -> cdf_internal_name`.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    entries: HashMap<(Table, String), String>,
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary::default()
    }

    /// Later duplicates of the same `(element, raw)` pair are ignored.
    pub fn from_entries<I, R, N>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Table, R, N)>,
        R: Into<String>,
        N: Into<String>,
    {
        let mut dict = Dictionary::new();
        for (table, raw, internal) in entries {
            dict.insert(table, raw, internal);
        }
        dict
    }

    pub fn insert(&mut self, table: Table, raw: impl Into<String>, internal: impl Into<String>) {
        self.entries
            .entry((table, raw.into()))
            .or_insert_with(|| internal.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact lookup, or `None` if the dictionary has no entry.
    pub fn lookup(&self, table: Table, raw: &str) -> Option<&str> {
        self.entries
            .get(&(table, raw.to_string()))
            .map(String::as_str)
    }

    /// Internal name for `raw`, or the `none or unknown` sentinel. Never fails.
    pub fn translate(&self, table: Table, raw: &str) -> &str {
        if raw == NONE_OR_UNKNOWN {
            return NONE_OR_UNKNOWN;
        }
        self.lookup(table, raw).unwrap_or(NONE_OR_UNKNOWN)
    }

    /// The candidates with no entry for `table`, deduplicated and sorted.
    pub fn untranslatable<'a, I>(&self, table: Table, candidates: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        candidates
            .into_iter()
            .filter(|raw| *raw != NONE_OR_UNKNOWN && self.lookup(table, raw).is_none())
            .map(str::to_string)
            .collect()
    }

    /// Replace raw text in `column` with internal names, returning the new
    /// frame and the raw values that fell back to the sentinel.
    pub fn translate_column(
        &self,
        frame: &Frame,
        table: Table,
        column: &str,
    ) -> LoadResult<(Frame, BTreeSet<String>)> {
        let translated =
            frame.map_column(column, |v| Value::text(self.translate(table, &v.to_string())))?;
        let gaps = self.column_gaps(frame, table, column);
        Ok((translated, gaps))
    }

    /// Raw values of `column` with no entry for `table`.
    pub fn column_gaps(&self, frame: &Frame, table: Table, column: &str) -> BTreeSet<String> {
        let raw: Vec<String> = frame.column(column).iter().map(|v| v.to_string()).collect();
        self.untranslatable(table, raw.iter().map(String::as_str))
    }
}

/// One `TranslationGap` per untranslatable value, in order.
pub fn gap_errors(table: Table, gaps: &BTreeSet<String>) -> Vec<LoadError> {
    gaps.iter()
        .map(|value| LoadError::TranslationGap {
            element: table.name().to_string(),
            value: value.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CdfElement;

    fn dict() -> Dictionary {
        Dictionary::from_entries([
            (Table::Element(CdfElement::Party), "DEM", "Democratic Party"),
            (Table::Element(CdfElement::Party), "REP", "Republican Party"),
            (
                Table::Element(CdfElement::ReportingUnit),
                "WAKE",
                "North Carolina;Wake County",
            ),
        ])
    }

    #[test]
    fn test_translate_exact_match() {
        let d = dict();
        assert_eq!(
            d.translate(CdfElement::Party.into(), "DEM"),
            "Democratic Party"
        );
    }

    #[test]
    fn test_translate_falls_back_to_sentinel() {
        let d = dict();
        assert_eq!(d.translate(CdfElement::Party.into(), "LIB"), NONE_OR_UNKNOWN);
        // entries are scoped to their element
        assert_eq!(
            d.translate(CdfElement::ReportingUnit.into(), "DEM"),
            NONE_OR_UNKNOWN
        );
    }

    #[test]
    fn test_untranslatable_subset() {
        let d = dict();
        let missing = d.untranslatable(CdfElement::Party.into(), ["DEM", "LIB", "GRN", "LIB"]);
        assert_eq!(
            missing.into_iter().collect::<Vec<_>>(),
            vec!["GRN".to_string(), "LIB".to_string()]
        );
    }

    #[test]
    fn test_first_entry_wins() {
        let mut d = dict();
        d.insert(CdfElement::Party.into(), "DEM", "Other Name");
        assert_eq!(d.translate(CdfElement::Party.into(), "DEM"), "Democratic Party");
        assert_eq!(d.len(), 3);
    }

    #[test]
    fn test_translate_column_reports_gaps() {
        let d = dict();
        let f = Frame::from_rows(
            ["Party"],
            vec![vec![Value::text("DEM")], vec![Value::text("LIB")]],
        )
        .unwrap();
        let (out, gaps) = d.translate_column(&f, CdfElement::Party.into(), "Party").unwrap();
        assert_eq!(out.get(0, "Party"), Some(Value::text("Democratic Party")));
        assert_eq!(out.get(1, "Party"), Some(Value::text(NONE_OR_UNKNOWN)));
        assert!(gaps.contains("LIB"));
    }

    #[test]
    fn test_gap_errors_name_element_and_value() {
        let gaps: BTreeSet<String> = ["LIB".to_string()].into();
        let errors = gap_errors(CdfElement::Party.into(), &gaps);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind(), "translation_gap");
        assert_eq!(
            errors[0].to_string(),
            "no Party dictionary entry for raw value 'LIB'"
        );
    }
}
