//! Bulk Loader: append only the genuinely new rows of a frame to a table.

use crate::error::{LoadError, LoadResult};
use crate::frame::{Frame, Value};
use crate::hierarchy::{self, HierarchyReport};
use crate::schema::{CdfElement, Table};
use crate::store::{CdfStore, TableSnapshot};

#[derive(Debug)]
pub struct AppendOutcome {
    /// Table contents after the append (before it, if the append failed).
    pub snapshot: TableSnapshot,
    pub inserted: usize,
    /// Ids of the appended rows, in row order.
    pub ids: Vec<i64>,
    pub error: Option<LoadError>,
    /// Set when new ReportingUnits triggered a hierarchy update.
    pub hierarchy: Option<HierarchyReport>,
}

/// Align `incoming` with the stored columns of `table`: extra columns are
/// dropped, missing ones added as null, shared ones coerced to the stored
/// type where possible.
pub fn reconcile(incoming: &Frame, table: Table) -> LoadResult<Frame> {
    let columns = table.columns();
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let mut out = incoming.select(&names)?;
    for c in &columns {
        out = out.map_column(&c.name, |v| v.coerce(c.dtype).unwrap_or_else(|| v.clone()))?;
    }
    Ok(out)
}

/// Rows of `incoming` (deduplicated) that match no stored row on the columns
/// both sides share.
pub fn novel_rows(incoming: &Frame, shared: &[String], stored: &Frame) -> LoadResult<Frame> {
    incoming.distinct()?.anti_join(stored, shared)
}

/// Reconcile, drop rows already stored, and append the rest in one
/// all-or-nothing call. New ReportingUnits extend the hierarchy.
pub async fn append_new<S: CdfStore + ?Sized>(
    store: &S,
    incoming: &Frame,
    table: Table,
) -> LoadResult<AppendOutcome> {
    let before = store.read_table(table).await?;
    let shared: Vec<String> = table
        .columns()
        .into_iter()
        .map(|c| c.name)
        .filter(|c| incoming.has_column(c))
        .collect();
    let aligned = reconcile(incoming, table)?;
    let novel = novel_rows(&aligned, &shared, &before.frame)?;
    if novel.is_empty() {
        tracing::debug!(%table, incoming = incoming.len(), "nothing new to append");
        return Ok(AppendOutcome {
            snapshot: before,
            inserted: 0,
            ids: Vec::new(),
            error: None,
            hierarchy: None,
        });
    }

    let ids = match store.append_rows(table, &novel).await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(%table, rows = novel.len(), error = %e, "append failed");
            return Ok(AppendOutcome {
                snapshot: before,
                inserted: 0,
                ids: Vec::new(),
                error: Some(e),
                hierarchy: None,
            });
        }
    };
    tracing::info!(%table, inserted = ids.len(), "rows appended");

    let mut error = None;
    let mut hierarchy = None;
    if table == Table::Element(CdfElement::ReportingUnit) {
        let names: Vec<String> = novel
            .column("Name")
            .iter()
            .map(Value::to_string)
            .collect();
        match hierarchy::apply(store, &names).await {
            Ok(report) => hierarchy = Some(report),
            Err(e) => error = Some(e),
        }
    }

    Ok(AppendOutcome {
        snapshot: store.read_table(table).await?,
        inserted: ids.len(),
        ids,
        error,
        hierarchy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_drops_adds_and_coerces() {
        let incoming = Frame::from_rows(
            ["Name", "VotesAllowed", "Comment"],
            vec![vec![Value::text("Governor"), Value::text("1"), Value::text("x")]],
        )
        .unwrap();
        let out = reconcile(&incoming, CdfElement::CandidateContest.into()).unwrap();
        assert!(!out.has_column("Comment"));
        assert_eq!(out.get(0, "VotesAllowed"), Some(Value::Int(1)));
        assert_eq!(out.get(0, "Office_Id"), Some(Value::Null));
    }

    #[test]
    fn test_reconcile_keeps_uncoercible_value() {
        let incoming = Frame::from_rows(
            ["Name", "VotesAllowed"],
            vec![vec![Value::text("Governor"), Value::text("one")]],
        )
        .unwrap();
        let out = reconcile(&incoming, CdfElement::CandidateContest.into()).unwrap();
        assert_eq!(out.get(0, "VotesAllowed"), Some(Value::text("one")));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_novelty_ignores_order_and_in_frame_duplicates() {
        let stored = Frame::from_rows(
            ["Id", "Txt"],
            vec![vec![Value::Int(1), Value::text("total")]],
        )
        .unwrap();
        let incoming = Frame::from_rows(
            ["Txt"],
            vec![
                vec![Value::text("early")],
                vec![Value::text("total")],
                vec![Value::text("early")],
            ],
        )
        .unwrap();
        let shared = vec!["Txt".to_string()];
        let novel = novel_rows(&incoming, &shared, &stored).unwrap();
        assert_eq!(novel.len(), 1);
        assert_eq!(novel.get(0, "Txt"), Some(Value::text("early")));
    }
}
