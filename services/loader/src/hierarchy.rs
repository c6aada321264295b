//! Hierarchy Builder: `ComposingReportingUnitJoin` edges from `;`-delimited
//! ReportingUnit names.
//!
//! A unit named `A;B;C` gets one edge from each stored prefix (`A`, `A;B`,
//! `A;B;C`) to itself; the last one is the reflexive edge. A prefix that is not
//! a stored unit is reported as a missing ancestor.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::error::LoadResult;
use crate::frame::{Frame, Value};
use crate::schema::{CdfElement, Table};
use crate::store::CdfStore;

pub const DELIMITER: &str = ";";

const PARENT: &str = "ParentReportingUnit_Id";
const CHILD: &str = "ChildReportingUnit_Id";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct MissingAncestor {
    pub unit: String,
    pub ancestor: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HierarchyReport {
    pub edges_added: usize,
    pub missing_ancestors: Vec<MissingAncestor>,
    /// Ids of the join rows written.
    #[serde(skip)]
    pub edge_ids: Vec<i64>,
}

/// Every prefix of `name`, shortest first, ending with `name` itself.
pub fn prefixes(name: &str) -> Vec<String> {
    let parts: Vec<&str> = name.split(DELIMITER).collect();
    (1..=parts.len())
        .map(|i| parts[..i].join(DELIMITER))
        .collect()
}

/// Units whose edges can change when `new_units` appear: the new units and
/// every stored unit descending from one.
pub fn affected<'a>(new_units: &[String], all_units: impl Iterator<Item = &'a String>) -> BTreeSet<String> {
    let new: HashSet<&str> = new_units.iter().map(String::as_str).collect();
    let mut out: BTreeSet<String> = new_units.iter().cloned().collect();
    for unit in all_units {
        if prefixes(unit).iter().any(|p| new.contains(p.as_str())) {
            out.insert(unit.clone());
        }
    }
    out
}

/// `(parent_id, child_id)` edges for `units`, plus the prefixes not found in
/// `ids`. Pure.
pub fn rebuild<'a>(
    units: impl IntoIterator<Item = &'a String>,
    ids: &HashMap<String, i64>,
) -> (Vec<(i64, i64)>, Vec<MissingAncestor>) {
    let mut edges = Vec::new();
    let mut missing = Vec::new();
    for unit in units {
        let Some(child) = ids.get(unit) else {
            continue;
        };
        for prefix in prefixes(unit) {
            match ids.get(&prefix) {
                Some(parent) => edges.push((*parent, *child)),
                None => missing.push(MissingAncestor {
                    unit: unit.clone(),
                    ancestor: prefix,
                }),
            }
        }
    }
    (edges, missing)
}

async fn write_edges<S: CdfStore + ?Sized>(
    store: &S,
    edges: Vec<(i64, i64)>,
    missing: Vec<MissingAncestor>,
) -> LoadResult<HierarchyReport> {
    let join = Table::Element(CdfElement::ComposingReportingUnitJoin);
    let existing: HashSet<(i64, i64)> = store
        .read_table(join)
        .await?
        .frame
        .iter()
        .filter_map(|r| {
            Some((
                r.get(PARENT).and_then(Value::as_int)?,
                r.get(CHILD).and_then(Value::as_int)?,
            ))
        })
        .collect();

    let mut seen = HashSet::new();
    let rows: Vec<Vec<Value>> = edges
        .into_iter()
        .filter(|edge| !existing.contains(edge) && seen.insert(*edge))
        .map(|(parent, child)| vec![Value::Int(parent), Value::Int(child)])
        .collect();
    let edge_ids = store
        .append_rows(join, &Frame::from_rows([PARENT, CHILD], rows)?)
        .await?;

    for m in &missing {
        tracing::warn!(unit = %m.unit, ancestor = %m.ancestor, "reporting unit ancestor not found");
    }
    let mut missing_ancestors = missing;
    missing_ancestors.sort();
    missing_ancestors.dedup();
    Ok(HierarchyReport {
        edges_added: edge_ids.len(),
        missing_ancestors,
        edge_ids,
    })
}

/// Add the edges made possible by the newly inserted units `new_units`.
pub async fn apply<S: CdfStore + ?Sized>(
    store: &S,
    new_units: &[String],
) -> LoadResult<HierarchyReport> {
    let units = store
        .read_table(CdfElement::ReportingUnit.into())
        .await?
        .ids_by("Name");
    let targets = affected(new_units, units.keys());
    let (edges, missing) = rebuild(&targets, &units);
    let report = write_edges(store, edges, missing).await?;
    tracing::info!(
        new_units = new_units.len(),
        edges = report.edges_added,
        missing = report.missing_ancestors.len(),
        "hierarchy updated"
    );
    Ok(report)
}

/// Drop every edge and derive them again from all stored units.
pub async fn reset<S: CdfStore + ?Sized>(store: &S) -> LoadResult<HierarchyReport> {
    store
        .truncate(&[CdfElement::ComposingReportingUnitJoin.into()])
        .await?;
    let units = store
        .read_table(CdfElement::ReportingUnit.into())
        .await?
        .ids_by("Name");
    let (edges, missing) = rebuild(units.keys(), &units);
    write_edges(store, edges, missing).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> HashMap<String, i64> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), i as i64 + 1))
            .collect()
    }

    #[test]
    fn test_prefixes() {
        assert_eq!(prefixes("A;B;C"), vec!["A", "A;B", "A;B;C"]);
        assert_eq!(prefixes("A"), vec!["A"]);
    }

    #[test]
    fn test_complete_hierarchy_edges() {
        let ids = ids(&["A", "A;B", "A;B;C", "X"]);
        let units: Vec<String> = ids.keys().cloned().collect();
        let (mut edges, missing) = rebuild(&units, &ids);
        edges.sort();
        assert!(missing.is_empty());
        let (a, ab, abc, x) = (ids["A"], ids["A;B"], ids["A;B;C"], ids["X"]);
        let mut expected = vec![
            (a, a),
            (ab, ab),
            (abc, abc),
            (x, x),
            (a, ab),
            (a, abc),
            (ab, abc),
        ];
        expected.sort();
        assert_eq!(edges, expected);
    }

    #[test]
    fn test_missing_ancestor_reported() {
        let ids = ids(&["NC", "NC;Wake;Raleigt"]);
        let (edges, missing) = rebuild(&vec!["NC;Wake;Raleigt".to_string()], &ids);
        assert_eq!(
            missing,
            vec![MissingAncestor {
                unit: "NC;Wake;Raleigt".into(),
                ancestor: "NC;Wake".into()
            }]
        );
        // NC -> unit and the reflexive edge still exist
        assert_eq!(edges.len(), 2);
    }

    #[test]
    fn test_affected_includes_stored_descendants() {
        let stored = vec!["NC".to_string(), "NC;Wake".to_string(), "NC;Wake;Raleigt".to_string()];
        let a = affected(&["NC;Wake".to_string()], stored.iter());
        assert_eq!(
            a.into_iter().collect::<Vec<_>>(),
            vec!["NC;Wake".to_string(), "NC;Wake;Raleigt".to_string()]
        );
    }
}
