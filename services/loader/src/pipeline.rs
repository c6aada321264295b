//! Pipeline Orchestrator - jurisdiction runs and results runs
//!
//! Responsibilities:
//! - Load enumerations up front; a malformed one aborts before any element
//! - Walk elements in load order, loading missing foreign-key targets first
//!   and retrying an element at most once
//! - Collect element-level errors instead of stopping at the first one
//! - Delete every row the run wrote when anything failed, newest first
//!
//! A run moves through `Start -> Loading(e) -> [Retrying(e)] -> Committed |
//! Aborted`; the trail of states is part of the report.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use serde::Serialize;

use crate::bulk::{self, AppendOutcome};
use crate::config::UntranslatedPolicy;
use crate::enums::EnumCodec;
use crate::error::{ErrorEntry, LoadError, LoadResult};
use crate::frame::{Frame, Row, Value};
use crate::hierarchy::MissingAncestor;
use crate::jurisdiction::{self, Jurisdiction, LOAD_ORDER};
use crate::munger::Munger;
use crate::resolve;
use crate::results;
use crate::schema::{CdfElement, EnumTable, Table, NONE_OR_UNKNOWN};
use crate::store::CdfStore;
use crate::translate;
use crate::upsert::{self, UpsertField, UpsertStatus};

/// Report key for errors that belong to the run rather than one element.
pub const RUN_KEY: &str = "_run";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Start,
    Loading(CdfElement),
    Retrying(CdfElement),
    Committed,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Start => f.write_str("start"),
            RunState::Loading(e) => write!(f, "loading {e}"),
            RunState::Retrying(e) => write!(f, "retrying {e}"),
            RunState::Committed => f.write_str("committed"),
            RunState::Aborted => f.write_str("aborted"),
        }
    }
}

/// Everything a run did, serialized as the CLI's JSON output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub run: String,
    pub states: Vec<String>,
    /// Element (or `_run`) -> errors, in the order they happened.
    pub errors: BTreeMap<String, Vec<ErrorEntry>>,
    pub warnings: Vec<String>,
    /// Table -> rows inserted.
    pub inserted: BTreeMap<String, usize>,
    /// Table -> raw values with no dictionary entry.
    pub translation_gaps: BTreeMap<String, Vec<String>>,
    pub missing_ancestors: Vec<MissingAncestor>,
    /// Table -> rows deleted again because the run failed.
    pub rolled_back: BTreeMap<String, usize>,
    pub committed: bool,
}

impl LoadReport {
    pub fn new(run: impl Into<String>) -> Self {
        LoadReport {
            run: run.into(),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Error entries recorded under `key`.
    pub fn errors_for(&self, key: &str) -> &[ErrorEntry] {
        self.errors.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn inserted_into(&self, table: Table) -> usize {
        self.inserted.get(table.name()).copied().unwrap_or(0)
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// One run against one store: the report being built and the rows written,
/// in the order they were written.
struct Session<'a, S: CdfStore + ?Sized> {
    store: &'a S,
    report: LoadReport,
    written: Vec<(Table, Vec<i64>)>,
}

impl<'a, S: CdfStore + ?Sized> Session<'a, S> {
    fn new(store: &'a S, run: &str) -> Self {
        let mut session = Session {
            store,
            report: LoadReport::new(run),
            written: Vec::new(),
        };
        session.enter(RunState::Start);
        session
    }

    fn enter(&mut self, state: RunState) {
        tracing::debug!(run = %self.report.run, %state, "state");
        self.report.states.push(state.to_string());
    }

    fn record(&mut self, key: &str, error: &LoadError) {
        tracing::warn!(run = %self.report.run, key, kind = error.kind(), "{error}");
        self.report
            .errors
            .entry(key.to_string())
            .or_default()
            .push(ErrorEntry::from(error));
    }

    fn warn(&mut self, message: String) {
        tracing::warn!(run = %self.report.run, "{message}");
        self.report.warnings.push(message);
    }

    fn wrote(&mut self, table: Table, ids: Vec<i64>) {
        if ids.is_empty() {
            return;
        }
        *self.report.inserted.entry(table.name().to_string()).or_default() += ids.len();
        self.written.push((table, ids));
    }

    /// Fold an append into the report. Returns false if it failed.
    fn appended(&mut self, key: &str, table: Table, outcome: AppendOutcome) -> bool {
        self.wrote(table, outcome.ids);
        if let Some(h) = outcome.hierarchy {
            self.wrote(CdfElement::ComposingReportingUnitJoin.into(), h.edge_ids);
            self.report.missing_ancestors.extend(h.missing_ancestors);
        }
        match outcome.error {
            Some(e) => {
                self.record(key, &e);
                false
            }
            None => true,
        }
    }

    /// Commit, or delete the run's rows and abort. Rows that were in the
    /// store before the run are never touched.
    async fn finish(mut self) -> LoadReport {
        if self.report.is_ok() {
            self.report.committed = true;
            self.enter(RunState::Committed);
            tracing::info!(run = %self.report.run, inserted = ?self.report.inserted, "run committed");
            return self.report;
        }
        let mut batches = std::mem::take(&mut self.written);
        batches.reverse();
        if !batches.is_empty() {
            match self.store.delete_rows(&batches).await {
                Ok(()) => {
                    for (table, ids) in &batches {
                        *self
                            .report
                            .rolled_back
                            .entry(table.name().to_string())
                            .or_default() += ids.len();
                    }
                }
                Err(e) => self.record(RUN_KEY, &e),
            }
        }
        self.enter(RunState::Aborted);
        tracing::warn!(
            run = %self.report.run,
            errors = self.report.errors.len(),
            rolled_back = ?self.report.rolled_back,
            "run aborted"
        );
        self.report
    }
}

// =============================================================================
// JURISDICTION RUN
// =============================================================================

/// Targets to load before retrying `element`, and the reference cycles found
/// on the way. A target already in the active chain is a cycle; one already
/// attempted in this run is not loaded again.
pub fn plan_retry(
    chain: &[CdfElement],
    element: CdfElement,
    missing_targets: &[CdfElement],
    attempted: &HashSet<CdfElement>,
) -> (Vec<CdfElement>, Vec<LoadError>) {
    let mut active: Vec<CdfElement> = chain.to_vec();
    active.push(element);
    let mut load = Vec::new();
    let mut cycles = Vec::new();
    for target in missing_targets {
        if active.contains(target) {
            let mut names: Vec<String> = active.iter().map(|e| e.to_string()).collect();
            names.push(target.to_string());
            cycles.push(LoadError::ReferenceCycle { chain: names });
        } else if !attempted.contains(target) {
            load.push(*target);
        }
    }
    (load, cycles)
}

struct JurisdictionRun<'a, S: CdfStore + ?Sized> {
    session: Session<'a, S>,
    juris: &'a Jurisdiction,
    codecs: HashMap<EnumTable, EnumCodec>,
    attempted: HashSet<CdfElement>,
}

impl<'a, S: CdfStore + ?Sized> JurisdictionRun<'a, S> {
    fn encode_enums(&self, frame: &Frame, element: CdfElement) -> LoadResult<Frame> {
        let mut out = frame.clone();
        for e in element.schema().enums {
            if let Some(codec) = self.codecs.get(e) {
                out = codec.encode_column(&out, e.text_column())?;
            }
        }
        Ok(out)
    }

    fn load_element<'b>(
        &'b mut self,
        element: CdfElement,
        chain: Vec<CdfElement>,
    ) -> Pin<Box<dyn Future<Output = ()> + 'b>> {
        Box::pin(async move {
            if let Err(e) = self.try_load(element, &chain).await {
                self.session.record(element.name(), &e);
            }
        })
    }

    async fn try_load(&mut self, element: CdfElement, chain: &[CdfElement]) -> LoadResult<()> {
        if !self.attempted.insert(element) || !self.juris.has_file(element) {
            return Ok(());
        }
        self.session.enter(RunState::Loading(element));

        let violations = jurisdiction::check_dependencies(self.juris, element).await?;
        if !violations.is_empty() {
            for v in &violations {
                self.session.record(element.name(), v);
            }
            return Ok(());
        }

        let (prepared, duplicates) = self.juris.read_element(element).await?;
        if duplicates > 0 {
            self.session
                .warn(format!("{element}.txt: {duplicates} duplicate rows removed"));
        }
        let encoded = self.encode_enums(&prepared, element)?;
        let store = self.session.store;

        let mut resolution = resolve::resolve(store, &encoded, element).await?;
        if !resolution.is_complete() {
            let (targets, cycles) =
                plan_retry(chain, element, &resolution.missing_targets(), &self.attempted);
            for c in &cycles {
                self.session.record(element.name(), c);
            }
            let mut next_chain = chain.to_vec();
            next_chain.push(element);
            let mut loaded = false;
            for target in targets {
                if self.juris.has_file(target) {
                    self.load_element(target, next_chain.clone()).await;
                    loaded = true;
                }
            }
            if loaded {
                self.session.enter(RunState::Retrying(element));
                resolution = resolve::resolve(store, &encoded, element).await?;
            }
            if !resolution.is_complete() {
                for m in &resolution.missing {
                    self.session.record(element.name(), &m.to_error());
                }
                return Ok(());
            }
        }

        let outcome = bulk::append_new(store, &resolution.frame, element.into()).await?;
        tracing::info!(%element, inserted = outcome.inserted, total = outcome.snapshot.len(), "element loaded");
        self.session.appended(element.name(), element.into(), outcome);
        Ok(())
    }
}

/// Load every element file of `juris`, in load order.
pub async fn load_jurisdiction<S: CdfStore + ?Sized>(store: &S, juris: &Jurisdiction) -> LoadReport {
    let elements = juris.elements();
    load_elements(store, juris, &elements).await
}

/// Load the given elements of `juris`. Foreign-key targets with a file in the
/// directory are pulled in as needed even when not listed.
pub async fn load_elements<S: CdfStore + ?Sized>(
    store: &S,
    juris: &Jurisdiction,
    elements: &[CdfElement],
) -> LoadReport {
    let mut session = Session::new(store, &juris.name);
    if !juris.dir.is_dir() {
        session.record(
            RUN_KEY,
            &LoadError::Jurisdiction(format!("{} is not a directory", juris.dir.display())),
        );
        return session.finish().await;
    }

    let mut codecs = HashMap::new();
    for e in EnumTable::ALL {
        match EnumCodec::load(store, e).await {
            Ok(codec) => {
                codecs.insert(e, codec);
            }
            Err(err) => {
                session.record(RUN_KEY, &err);
                return session.finish().await;
            }
        }
    }

    let mut run = JurisdictionRun {
        session,
        juris,
        codecs,
        attempted: HashSet::new(),
    };
    let mut ordered: Vec<CdfElement> = LOAD_ORDER
        .iter()
        .copied()
        .filter(|e| elements.contains(e))
        .collect();
    ordered.extend(elements.iter().filter(|e| !LOAD_ORDER.contains(e)));
    for element in ordered {
        run.load_element(element, Vec::new()).await;
    }
    run.session.finish().await
}

// =============================================================================
// RESULTS RUN
// =============================================================================

/// Munger elements a results run needs; Party and CountItemType default to
/// the sentinel when the munger does not describe them.
const RESULTS_REQUIRED: &[CdfElement] = &[
    CdfElement::ReportingUnit,
    CdfElement::CandidateContest,
    CdfElement::Candidate,
];
const RESULTS_DEFAULTED: &[Table] = &[
    Table::Element(CdfElement::Party),
    Table::Enumeration(EnumTable::CountItemType),
];

/// One results file to load.
#[derive(Debug, Clone)]
pub struct ResultsRun<'a> {
    pub munger: &'a Munger,
    pub path: &'a Path,
    /// Registered in `_datafile`; loading the same short name twice reuses
    /// the row and adds no VoteCounts.
    pub short_name: &'a str,
    pub election: &'a str,
    /// ReportingUnit the whole file covers, recorded on the `_datafile` row.
    pub top_reporting_unit: Option<&'a str>,
    /// Directory holding the auxiliary files named in the munger's `aux_meta.txt`.
    pub aux_dir: Option<&'a Path>,
    pub untranslated: UntranslatedPolicy,
}

/// Read the results file and any auxiliary files, then munge to long format.
async fn munge_file(munger: &Munger, path: &Path, aux_dir: Option<&Path>) -> LoadResult<Frame> {
    let raw = results::read_results(path, &munger.format).await?;
    let aux = match aux_dir {
        Some(dir) => results::read_aux(munger, dir).await?,
        None if munger.aux.is_empty() => Vec::new(),
        None => {
            return Err(LoadError::Configuration(format!(
                "munger {} reads auxiliary files but no auxiliary directory was given",
                munger.name
            )))
        }
    };
    results::munge_with_aux(munger, &raw, &aux)
}

/// Translation diagnostics for one results file. Nothing is written.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultsCheck {
    pub file: String,
    pub rows: usize,
    /// Element -> one `translation_gap` entry per raw value with no
    /// dictionary entry.
    pub gaps: BTreeMap<String, Vec<ErrorEntry>>,
}

impl ResultsCheck {
    pub fn is_ok(&self) -> bool {
        self.gaps.is_empty()
    }
}

/// Munge `path` and list, per element, the raw values the munger's
/// dictionary cannot translate.
pub async fn check_results(
    munger: &Munger,
    path: &Path,
    aux_dir: Option<&Path>,
) -> LoadResult<ResultsCheck> {
    let frame = munge_file(munger, path, aux_dir).await?;
    let mut check = ResultsCheck {
        file: path.display().to_string(),
        rows: frame.len(),
        ..Default::default()
    };
    for e in &munger.elements {
        let gaps = munger.dictionary.column_gaps(&frame, e.table, e.table.name());
        if !gaps.is_empty() {
            let entries = translate::gap_errors(e.table, &gaps)
                .iter()
                .map(ErrorEntry::from)
                .collect();
            check.gaps.insert(e.table.name().to_string(), entries);
        }
    }
    tracing::info!(file = %check.file, rows = check.rows, elements_with_gaps = check.gaps.len(), "results checked");
    Ok(check)
}

/// Translate each munged column in place, recording what had no entry.
fn translate_all(munger: &Munger, frame: &Frame, report: &mut LoadReport) -> LoadResult<Frame> {
    let mut out = frame.clone();
    for e in &munger.elements {
        let column = e.table.name();
        let (translated, gaps) = munger.dictionary.translate_column(&out, e.table, column)?;
        out = translated;
        for gap in translate::gap_errors(e.table, &gaps) {
            tracing::warn!(kind = gap.kind(), "{gap}");
        }
        if !gaps.is_empty() {
            report
                .translation_gaps
                .insert(column.to_string(), gaps.into_iter().collect());
        }
    }
    for t in RESULTS_DEFAULTED {
        if !out.has_column(t.name()) {
            out = out.with_constant(t.name(), Value::text(NONE_OR_UNKNOWN))?;
        }
    }
    Ok(out)
}

fn has_sentinel(row: &Row, columns: &[&str]) -> bool {
    columns
        .iter()
        .any(|c| row.get(c).and_then(Value::as_str) == Some(NONE_OR_UNKNOWN))
}

/// Rows where a translated column fell back to the sentinel.
fn untranslated_rows(frame: &Frame, columns: &[&str]) -> usize {
    frame.iter().filter(|row| has_sentinel(row, columns)).count()
}

/// `Id` of the row of `element` named `name`, or an unresolved reference
/// from `_datafile`.
async fn datafile_reference<S: CdfStore + ?Sized>(
    store: &S,
    element: CdfElement,
    field: &str,
    name: &str,
) -> LoadResult<i64> {
    let name_field = element.name_field().unwrap_or("Name");
    store
        .read_table(element.into())
        .await?
        .ids_by(name_field)
        .get(name)
        .copied()
        .ok_or_else(|| LoadError::UnresolvedForeignKey {
            element: CdfElement::Datafile.to_string(),
            field: field.to_string(),
            targets: element.to_string(),
            values: vec![name.to_string()],
        })
}

async fn run_results<S: CdfStore + ?Sized>(
    session: &mut Session<'_, S>,
    run: &ResultsRun<'_>,
) -> LoadResult<()> {
    let store = session.store;
    let missing: Vec<&str> = RESULTS_REQUIRED
        .iter()
        .filter(|e| run.munger.element((**e).into()).is_none())
        .map(|e| e.name())
        .collect();
    if !missing.is_empty() {
        return Err(LoadError::Configuration(format!(
            "munger {} does not describe {}",
            run.munger.name,
            missing.join(", ")
        )));
    }
    let count_items = EnumCodec::load(store, EnumTable::CountItemType).await?;

    // register the datafile
    session.enter(RunState::Loading(CdfElement::Datafile));
    let election_id =
        datafile_reference(store, CdfElement::Election, "Election_Id", run.election).await?;
    let top_unit_id = match run.top_reporting_unit {
        Some(unit) => Some(
            datafile_reference(store, CdfElement::ReportingUnit, "ReportingUnit_Id", unit).await?,
        ),
        None => None,
    };
    let file_name = run
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let datafile = Table::Element(CdfElement::Datafile);
    let (datafile_id, status) = upsert::get_or_create(
        store,
        datafile,
        &UpsertField::text("short_name", run.short_name),
        &[
            UpsertField::text("file_name", file_name),
            UpsertField::integer("Election_Id", Some(election_id)),
            UpsertField::integer("ReportingUnit_Id", top_unit_id),
        ],
    )
    .await?;
    if status == UpsertStatus::Inserted {
        session.wrote(datafile, vec![datafile_id]);
    }
    tracing::info!(short_name = run.short_name, datafile_id, %status, "datafile registered");

    // munge and translate
    let munged = munge_file(run.munger, run.path, run.aux_dir).await?;
    let mut frame = translate_all(run.munger, &munged, &mut session.report)?;

    let translated: Vec<&str> = run.munger.elements.iter().map(|e| e.table.name()).collect();
    let flagged = untranslated_rows(&frame, &translated);
    if flagged > 0 {
        match run.untranslated {
            UntranslatedPolicy::Flag => session.warn(format!(
                "{flagged} rows reference untranslated raw identifiers and load as {NONE_OR_UNKNOWN}"
            )),
            UntranslatedPolicy::Block => {
                frame = frame.filter(|row| !has_sentinel(row, &translated))?;
                session.warn(format!(
                    "{flagged} rows with untranslated raw identifiers dropped"
                ));
            }
        }
    }
    let frame = count_items.encode_column(&frame, EnumTable::CountItemType.name())?;

    // candidate selections
    session.enter(RunState::Loading(CdfElement::CandidateSelection));
    let pairs = frame.select(&["Candidate", "Party"])?.distinct()?;
    let selections = resolve::resolve(store, &pairs, CdfElement::CandidateSelection).await?;
    if !selections.is_complete() {
        for m in &selections.missing {
            session.record(CdfElement::CandidateSelection.name(), &m.to_error());
        }
        return Ok(());
    }
    let selection_table = Table::Element(CdfElement::CandidateSelection);
    let outcome = bulk::append_new(store, &selections.frame, selection_table).await?;
    let selection_ids: HashMap<(i64, i64), i64> = outcome
        .snapshot
        .frame
        .iter()
        .filter_map(|r| {
            Some((
                (
                    r.get("Candidate_Id").and_then(Value::as_int)?,
                    r.get("Party_Id").and_then(Value::as_int)?,
                ),
                r.get("Id").and_then(Value::as_int)?,
            ))
        })
        .collect();
    if !session.appended(CdfElement::CandidateSelection.name(), selection_table, outcome) {
        return Ok(());
    }

    // vote counts
    session.enter(RunState::Loading(CdfElement::VoteCount));
    let with_pairs = resolve::resolve(store, &frame, CdfElement::CandidateSelection)
        .await?
        .frame;
    let selection_column: Vec<Value> = with_pairs
        .iter()
        .map(|r| {
            let key = (
                r.get("Candidate_Id").and_then(Value::as_int),
                r.get("Party_Id").and_then(Value::as_int),
            );
            match key {
                (Some(c), Some(p)) => Value::from(selection_ids.get(&(c, p)).copied()),
                _ => Value::Null,
            }
        })
        .collect();
    let counts = with_pairs
        .with_column("Selection_Id", selection_column)?
        .drop_columns(&["Candidate_Id", "Party_Id"])?
        .rename(CdfElement::CandidateContest.name(), "Contest")?
        .with_constant("Election_Id", Value::Int(election_id))?
        .with_constant("_datafile_Id", Value::Int(datafile_id))?;

    let resolution = resolve::resolve(store, &counts, CdfElement::VoteCount).await?;
    if !resolution.is_complete() {
        for m in &resolution.missing {
            session.record(CdfElement::VoteCount.name(), &m.to_error());
        }
        return Ok(());
    }
    let vote_count = Table::Element(CdfElement::VoteCount);
    let outcome = bulk::append_new(store, &resolution.frame, vote_count).await?;
    session.appended(CdfElement::VoteCount.name(), vote_count, outcome);
    Ok(())
}

/// Munge one results file and load its vote counts.
pub async fn load_results<S: CdfStore + ?Sized>(store: &S, run: &ResultsRun<'_>) -> LoadReport {
    let mut session = Session::new(store, run.short_name);
    session.report.warnings.extend(run.munger.warnings.iter().cloned());
    if let Err(e) = run_results(&mut session, run).await {
        session.record(RUN_KEY, &e);
    }
    session.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_retry_skips_attempted_targets() {
        let attempted: HashSet<CdfElement> = [CdfElement::Party].into_iter().collect();
        let (load, cycles) = plan_retry(
            &[],
            CdfElement::CandidateContest,
            &[CdfElement::Office, CdfElement::Party],
            &attempted,
        );
        assert_eq!(load, vec![CdfElement::Office]);
        assert!(cycles.is_empty());
    }

    #[test]
    fn test_plan_retry_reports_cycle() {
        let (load, cycles) = plan_retry(
            &[CdfElement::ReportingUnit],
            CdfElement::Office,
            &[CdfElement::ReportingUnit],
            &HashSet::new(),
        );
        assert!(load.is_empty());
        assert_eq!(cycles.len(), 1);
        assert_eq!(
            cycles[0].to_string(),
            "reference cycle while loading ReportingUnit -> Office -> ReportingUnit"
        );
    }

    #[test]
    fn test_untranslated_rows_counts_sentinel_cells() {
        let frame = Frame::from_rows(
            ["Party", "Candidate"],
            vec![
                vec![Value::text("Democratic Party"), Value::text("Smith")],
                vec![Value::text(NONE_OR_UNKNOWN), Value::text("Jones")],
            ],
        )
        .unwrap();
        assert_eq!(untranslated_rows(&frame, &["Party", "Candidate"]), 1);
        assert_eq!(untranslated_rows(&frame, &["Candidate"]), 0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RunState::Retrying(CdfElement::Office).to_string(), "retrying Office");
        assert_eq!(RunState::Aborted.to_string(), "aborted");
    }
}
