//! Enum Codec: free text <-> `(Id, other_text)` against `{Id, Txt}` tables.

use std::collections::HashMap;

use crate::error::{LoadError, LoadResult};
use crate::frame::{Frame, Value};
use crate::schema::{EnumTable, Table};
use crate::store::CdfStore;

const OTHER: &str = "other";

/// In-memory view of one enumeration table.
#[derive(Debug, Clone)]
pub struct EnumCodec {
    table: EnumTable,
    by_text: HashMap<String, i64>,
    by_id: HashMap<i64, String>,
    other_id: i64,
}

impl EnumCodec {
    /// Build from `(Id, Txt)` pairs. The table must hold exactly one `other`.
    pub fn from_pairs<I, S>(table: EnumTable, pairs: I) -> LoadResult<EnumCodec>
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        let mut by_text = HashMap::new();
        let mut by_id = HashMap::new();
        let mut others = Vec::new();
        for (id, txt) in pairs {
            let txt = txt.into();
            if txt == OTHER {
                others.push(id);
            }
            by_text.insert(txt.clone(), id);
            by_id.insert(id, txt);
        }
        match others.as_slice() {
            [other_id] => Ok(EnumCodec {
                table,
                by_text,
                by_id,
                other_id: *other_id,
            }),
            _ => Err(LoadError::Configuration(format!(
                "enumeration {table} must have exactly one '{OTHER}' row, found {}",
                others.len()
            ))),
        }
    }

    /// Read the enumeration's current contents from the store.
    pub async fn load<S: CdfStore + ?Sized>(store: &S, table: EnumTable) -> LoadResult<EnumCodec> {
        let snapshot = store.read_table(Table::Enumeration(table)).await?;
        let pairs = snapshot.frame.iter().filter_map(|row| {
            let id = row.get("Id").and_then(Value::as_int)?;
            let txt = row.get("Txt").and_then(Value::as_str)?;
            Some((id, txt.to_string()))
        });
        EnumCodec::from_pairs(table, pairs)
    }

    pub fn table(&self) -> EnumTable {
        self.table
    }

    pub fn other_id(&self) -> i64 {
        self.other_id
    }

    /// `(id, "")` for a canonical member, `(other_id, text)` otherwise.
    pub fn to_id(&self, text: &str) -> (i64, String) {
        match self.by_text.get(text) {
            Some(id) if *id != self.other_id => (*id, String::new()),
            _ => (self.other_id, text.to_string()),
        }
    }

    /// Canonical text for `id`, or `other_text` when `id` is the `other` row.
    pub fn from_id_othertext(&self, id: i64, other_text: &str) -> String {
        if id == self.other_id {
            return other_text.to_string();
        }
        self.by_id.get(&id).cloned().unwrap_or_else(|| other_text.to_string())
    }

    /// Replace the text column named after the enumeration with its
    /// `<Enum>_Id` and `Other<Enum>` columns.
    pub fn encode_column(&self, frame: &Frame, text_column: &str) -> LoadResult<Frame> {
        if !frame.has_column(text_column) {
            return Ok(frame.clone());
        }
        let (ids, others): (Vec<Value>, Vec<Value>) = frame
            .column(text_column)
            .into_iter()
            .map(|v| {
                let (id, other) = self.to_id(&v.to_string());
                (Value::Int(id), Value::Text(other))
            })
            .unzip();
        frame
            .with_column(&self.table.id_column(), ids)?
            .with_column(&self.table.other_column(), others)?
            .drop_columns(&[text_column])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> EnumCodec {
        EnumCodec::from_pairs(
            EnumTable::CountItemType,
            EnumTable::CountItemType
                .canonical_values()
                .iter()
                .enumerate()
                .map(|(i, t)| (i as i64 + 1, *t)),
        )
        .unwrap()
    }

    #[test]
    fn test_canonical_round_trip() {
        let c = codec();
        for t in EnumTable::CountItemType.canonical_values() {
            let (id, other) = c.to_id(t);
            assert_eq!(c.from_id_othertext(id, &other), *t);
        }
    }

    #[test]
    fn test_non_canonical_preserved_in_other() {
        let c = codec();
        let (id, other) = c.to_id("mail-in (late)");
        assert_eq!(id, c.other_id());
        assert_eq!(other, "mail-in (late)");
        assert_eq!(c.from_id_othertext(id, &other), "mail-in (late)");
    }

    #[test]
    fn test_missing_other_row_is_configuration_error() {
        let err = EnumCodec::from_pairs(EnumTable::ElectionType, [(1, "general")]).unwrap_err();
        assert!(err.is_configuration());
        let err = EnumCodec::from_pairs(EnumTable::ElectionType, [(1, "other"), (2, "other")])
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_encode_column() {
        let c = codec();
        let f = Frame::from_rows(
            ["Count", "CountItemType"],
            vec![
                vec![Value::Int(5), Value::text("total")],
                vec![Value::Int(7), Value::text("by-phone")],
            ],
        )
        .unwrap();
        let out = c.encode_column(&f, "CountItemType").unwrap();
        assert!(!out.has_column("CountItemType"));
        assert_eq!(out.get(1, "CountItemType_Id"), Some(Value::Int(c.other_id())));
        assert_eq!(out.get(1, "OtherCountItemType"), Some(Value::text("by-phone")));
        assert_eq!(out.get(0, "OtherCountItemType"), Some(Value::text("")));
    }
}
