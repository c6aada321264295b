//! Foreign Key Resolver: names in an incoming frame to surrogate ids.
//!
//! For a foreign key `X_Id`, the frame carries the referenced entity's name in
//! column `X`. Each candidate target is searched in declared order and the
//! first match wins. `ExternalIdentifier` is keyed on the
//! `(cdf_element, internal_name)` pair instead.
//!
//! Missing names are not an error here: they come back as
//! `MissingReference`s so the pipeline can load the targets and retry.

use std::collections::{BTreeSet, HashMap};

use crate::error::{LoadError, LoadResult};
use crate::frame::{Frame, Value};
use crate::schema::{CdfElement, ForeignKey};
use crate::store::CdfStore;

/// Columns an `ExternalIdentifier` file uses to name its referent.
pub const EXTERNAL_ELEMENT_COLUMN: &str = "cdf_element";
pub const EXTERNAL_NAME_COLUMN: &str = "internal_name";

/// Names referenced through `field` that no target holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingReference {
    pub element: CdfElement,
    pub field: &'static str,
    /// Elements the unresolved names were looked up in.
    pub targets: Vec<CdfElement>,
    pub values: BTreeSet<String>,
}

impl MissingReference {
    pub fn to_error(&self) -> LoadError {
        LoadError::UnresolvedForeignKey {
            element: self.element.to_string(),
            field: self.field.to_string(),
            targets: self
                .targets
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join(";"),
            values: self.values.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub frame: Frame,
    pub missing: Vec<MissingReference>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Every target element some missing reference points at, deduplicated,
    /// in declared order.
    pub fn missing_targets(&self) -> Vec<CdfElement> {
        let mut out = Vec::new();
        for m in &self.missing {
            for t in &m.targets {
                if !out.contains(t) {
                    out.push(*t);
                }
            }
        }
        out
    }
}

/// Name -> id for each target, as read from the store.
pub type TargetIds = HashMap<CdfElement, HashMap<String, i64>>;

fn needs_resolution(frame: &Frame, element: CdfElement, fk: &ForeignKey) -> bool {
    if element == CdfElement::ExternalIdentifier {
        return frame.has_column(EXTERNAL_ELEMENT_COLUMN) && frame.has_column(EXTERNAL_NAME_COLUMN);
    }
    frame.has_column(fk.name_column())
}

/// Read the name -> id maps of every target `element`'s foreign keys need.
pub async fn target_ids<S: CdfStore + ?Sized>(
    store: &S,
    frame: &Frame,
    element: CdfElement,
) -> LoadResult<TargetIds> {
    let mut ids = TargetIds::new();
    for fk in element.schema().foreign_keys {
        if !needs_resolution(frame, element, fk) {
            continue;
        }
        for target in fk.refers_to {
            if ids.contains_key(target) {
                continue;
            }
            let map = match target.name_field() {
                Some(name_field) => store.read_table((*target).into()).await?.ids_by(name_field),
                None => HashMap::new(),
            };
            ids.insert(*target, map);
        }
    }
    Ok(ids)
}

fn lookup(ids: &TargetIds, targets: &[CdfElement], name: &str) -> Option<i64> {
    targets
        .iter()
        .find_map(|t| ids.get(t).and_then(|m| m.get(name)).copied())
}

/// Pure resolution against already-read target maps.
pub fn resolve_with(frame: &Frame, element: CdfElement, ids: &TargetIds) -> LoadResult<Resolution> {
    let mut out = frame.clone();
    let mut missing = Vec::new();
    for fk in element.schema().foreign_keys {
        if !needs_resolution(&out, element, fk) {
            continue;
        }
        let mut unresolved = BTreeSet::new();
        let mut resolved = Vec::with_capacity(out.len());
        let consumed: Vec<&str>;
        let mut targets: Vec<CdfElement> = fk.refers_to.to_vec();

        if element == CdfElement::ExternalIdentifier {
            let mut named = BTreeSet::new();
            for row in out.iter() {
                let target = row.get(EXTERNAL_ELEMENT_COLUMN).map(Value::to_string).unwrap_or_default();
                let name = row.get(EXTERNAL_NAME_COLUMN).map(Value::to_string).unwrap_or_default();
                let id = fk
                    .refers_to
                    .iter()
                    .find(|t| t.name() == target)
                    .and_then(|t| lookup(ids, std::slice::from_ref(t), &name));
                if id.is_none() {
                    unresolved.insert(format!("{target}:{name}"));
                    named.insert(target);
                }
                resolved.push(Value::from(id));
            }
            // only the elements the unresolved rows point at
            targets.retain(|t| named.contains(t.name()));
            consumed = vec![EXTERNAL_ELEMENT_COLUMN, EXTERNAL_NAME_COLUMN];
        } else {
            for value in out.column(fk.name_column()) {
                if value.is_null() {
                    resolved.push(Value::Null);
                    continue;
                }
                let name = value.to_string();
                let id = lookup(ids, fk.refers_to, &name);
                if id.is_none() {
                    unresolved.insert(name);
                }
                resolved.push(Value::from(id));
            }
            consumed = vec![fk.name_column()];
        }

        out = out.with_column(fk.field, resolved)?.drop_columns(&consumed)?;
        if !unresolved.is_empty() {
            missing.push(MissingReference {
                element,
                field: fk.field,
                targets,
                values: unresolved,
            });
        }
    }
    Ok(Resolution {
        frame: out,
        missing,
    })
}

/// Replace each name column with its foreign-key id column.
pub async fn resolve<S: CdfStore + ?Sized>(
    store: &S,
    frame: &Frame,
    element: CdfElement,
) -> LoadResult<Resolution> {
    let ids = target_ids(store, frame, element).await?;
    let resolution = resolve_with(frame, element, &ids)?;
    for m in &resolution.missing {
        tracing::debug!(%element, field = m.field, count = m.values.len(), "unresolved references");
    }
    Ok(resolution)
}
