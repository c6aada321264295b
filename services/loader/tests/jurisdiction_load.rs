mod common;

use common::*;
use loader::hierarchy::MissingAncestor;
use loader::pipeline::{self, RUN_KEY};
use loader::{CdfElement, CdfStore, EnumTable, MemoryStore, Table, Value};

async fn table_len(store: &MemoryStore, element: CdfElement) -> usize {
    store.read_table(element.into()).await.unwrap().len()
}

// =============================================================================
// FULL RUNS
// =============================================================================

#[tokio::test]
async fn test_full_jurisdiction_load() {
    let dir = dir_with(&nc_files());
    let store = MemoryStore::new();
    let report = pipeline::load_jurisdiction(&store, &jurisdiction(&dir)).await;

    assert!(report.committed, "{:?}", report.errors);
    assert_eq!(report.states.first().map(String::as_str), Some("start"));
    assert_eq!(report.states.last().map(String::as_str), Some("committed"));

    // every element but ExternalIdentifier gets a sentinel row
    assert_eq!(report.inserted_into(CdfElement::ReportingUnit.into()), 3);
    assert_eq!(report.inserted_into(CdfElement::Party.into()), 3);
    assert_eq!(report.inserted_into(CdfElement::CandidateSelection.into()), 3);
    assert_eq!(report.inserted_into(CdfElement::ExternalIdentifier.into()), 1);
    // NC, NC;Wake County and the sentinel: three reflexive edges plus NC -> Wake
    assert_eq!(
        report.inserted_into(CdfElement::ComposingReportingUnitJoin.into()),
        4
    );
    assert!(report.missing_ancestors.is_empty());
}

#[tokio::test]
async fn test_loading_twice_adds_nothing() {
    let dir = dir_with(&nc_files());
    let store = MemoryStore::new();
    let juris = jurisdiction(&dir);
    let first = pipeline::load_jurisdiction(&store, &juris).await;
    assert!(first.committed);
    let offices = table_len(&store, CdfElement::Office).await;

    let second = pipeline::load_jurisdiction(&store, &juris).await;
    assert!(second.committed, "{:?}", second.errors);
    assert!(second.inserted.is_empty(), "{:?}", second.inserted);
    assert_eq!(table_len(&store, CdfElement::Office).await, offices);
}

#[tokio::test]
async fn test_enum_columns_encoded() {
    let dir = dir_with(&nc_files());
    let store = MemoryStore::new();
    let report = pipeline::load_jurisdiction(&store, &jurisdiction(&dir)).await;
    assert!(report.committed);

    let units = store
        .read_table(CdfElement::ReportingUnit.into())
        .await
        .unwrap();
    let state_id = store
        .read_table(EnumTable::ReportingUnitType.into())
        .await
        .unwrap()
        .ids_by("Txt")["state"];
    let nc = units
        .frame
        .iter()
        .find(|r| r.get("Name") == Some(&Value::text("North Carolina")))
        .unwrap();
    assert_eq!(nc.get("ReportingUnitType_Id"), Some(&Value::Int(state_id)));
    assert_eq!(nc.get("OtherReportingUnitType"), Some(&Value::text("")));
}

// =============================================================================
// RETRY AND FAILURE
// =============================================================================

#[tokio::test]
async fn test_missing_targets_loaded_then_retried() {
    let dir = dir_with(&nc_files());
    let store = MemoryStore::new();
    let report =
        pipeline::load_elements(&store, &jurisdiction(&dir), &[CdfElement::CandidateContest])
            .await;

    assert!(report.committed, "{:?}", report.errors);
    assert!(report.states.contains(&"retrying Office".to_string()));
    assert!(report.states.contains(&"retrying CandidateContest".to_string()));
    assert_eq!(table_len(&store, CdfElement::ReportingUnit).await, 3);
    assert_eq!(table_len(&store, CdfElement::CandidateContest).await, 2);
    // not needed by any reference, so never loaded
    assert_eq!(table_len(&store, CdfElement::Candidate).await, 0);
}

#[tokio::test]
async fn test_unresolved_reference_rolls_back_run() {
    let dir = dir_with(&nc_files_with(
        "CandidateSelection.txt",
        "Candidate\tParty\nNobody\tDemocratic Party\n",
    ));
    let store = MemoryStore::new();
    let report = pipeline::load_jurisdiction(&store, &jurisdiction(&dir)).await;

    assert!(!report.committed);
    assert_eq!(report.states.last().map(String::as_str), Some("aborted"));
    let errors = report.errors_for("CandidateSelection");
    assert_eq!(errors[0].kind, "foreign_key");
    assert!(errors[0].message.contains("Nobody"), "{}", errors[0].message);

    assert_eq!(report.rolled_back.get("ReportingUnit"), Some(&3));
    assert_eq!(report.rolled_back.get("ComposingReportingUnitJoin"), Some(&4));
    assert_eq!(table_len(&store, CdfElement::ReportingUnit).await, 0);
    assert_eq!(table_len(&store, CdfElement::Candidate).await, 0);
}

#[tokio::test]
async fn test_failed_reload_keeps_rows_from_earlier_runs() {
    let store = MemoryStore::new();
    let first = dir_with(&nc_files());
    let report = pipeline::load_jurisdiction(&store, &jurisdiction(&first)).await;
    assert!(report.committed, "{:?}", report.errors);
    let units = table_len(&store, CdfElement::ReportingUnit).await;
    let edges = table_len(&store, CdfElement::ComposingReportingUnitJoin).await;
    let candidates = table_len(&store, CdfElement::Candidate).await;

    // a new county is appended before the bad selection fails the run
    let files: Vec<(&str, &str)> = nc_files()
        .into_iter()
        .map(|(n, c)| match n {
            "ReportingUnit.txt" => (
                n,
                "Name\tReportingUnitType\n\
                 North Carolina\tstate\n\
                 North Carolina;Wake County\tcounty\n\
                 North Carolina;Durham County\tcounty\n",
            ),
            "CandidateSelection.txt" => (n, "Candidate\tParty\nNobody\tDemocratic Party\n"),
            _ => (n, c),
        })
        .collect();
    let second = dir_with(&files);
    let report = pipeline::load_jurisdiction(&store, &jurisdiction(&second)).await;

    assert!(!report.committed);
    assert_eq!(report.rolled_back.get("ReportingUnit"), Some(&1));
    assert_eq!(report.rolled_back.get("ComposingReportingUnitJoin"), Some(&2));
    assert_eq!(table_len(&store, CdfElement::ReportingUnit).await, units);
    assert_eq!(table_len(&store, CdfElement::ComposingReportingUnitJoin).await, edges);
    assert_eq!(table_len(&store, CdfElement::Candidate).await, candidates);
    let names = store
        .read_table(CdfElement::ReportingUnit.into())
        .await
        .unwrap()
        .ids_by("Name");
    assert!(names.contains_key("North Carolina;Wake County"));
    assert!(!names.contains_key("North Carolina;Durham County"));
}

#[tokio::test]
async fn test_dependency_violation_reported() {
    let dir = dir_with(&nc_files_with(
        "Office.txt",
        "Name\tElectionDistrict\nNC Governor\tSouth Carolina\n",
    ));
    let store = MemoryStore::new();
    let report = pipeline::load_jurisdiction(&store, &jurisdiction(&dir)).await;

    assert!(!report.committed);
    let errors = report.errors_for("Office");
    assert_eq!(errors[0].kind, "failed_dependency");
    assert!(errors[0].message.contains("South Carolina"));
    assert_eq!(table_len(&store, CdfElement::Office).await, 0);
}

#[tokio::test]
async fn test_malformed_enum_aborts_before_any_element() {
    let dir = dir_with(&nc_files());
    let store = MemoryStore::with_enum_rows(EnumTable::CountItemType, &["total", "early"]);
    let report = pipeline::load_jurisdiction(&store, &jurisdiction(&dir)).await;

    assert_eq!(report.states, vec!["start", "aborted"]);
    assert_eq!(report.errors_for(RUN_KEY)[0].kind, "configuration");
    assert_eq!(table_len(&store, CdfElement::ReportingUnit).await, 0);
}

#[tokio::test]
async fn test_missing_directory_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let juris = loader::Jurisdiction::new(dir.path().join("nowhere"), encoding_rs::UTF_8);
    let report = pipeline::load_jurisdiction(&MemoryStore::new(), &juris).await;
    assert!(!report.committed);
    assert_eq!(report.errors_for(RUN_KEY)[0].kind, "jurisdiction");
}

// =============================================================================
// HIERARCHY
// =============================================================================

#[tokio::test]
async fn test_missing_ancestor_filled_by_later_load() {
    let store = MemoryStore::new();
    let first = dir_with(&[("ReportingUnit.txt", "Name\nNC\nNC;Wake;Raleigt\n")]);
    let report = pipeline::load_jurisdiction(&store, &jurisdiction(&first)).await;
    assert!(report.committed);
    assert_eq!(
        report.missing_ancestors,
        vec![MissingAncestor {
            unit: "NC;Wake;Raleigt".into(),
            ancestor: "NC;Wake".into(),
        }]
    );

    let second = dir_with(&[("ReportingUnit.txt", "Name\nNC;Wake\n")]);
    let report = pipeline::load_jurisdiction(&store, &jurisdiction(&second)).await;
    assert!(report.committed);
    assert!(report.missing_ancestors.is_empty());

    let ids = store
        .read_table(CdfElement::ReportingUnit.into())
        .await
        .unwrap()
        .ids_by("Name");
    let edges: Vec<(i64, i64)> = store
        .read_table(Table::Element(CdfElement::ComposingReportingUnitJoin))
        .await
        .unwrap()
        .frame
        .iter()
        .map(|r| {
            (
                r.get("ParentReportingUnit_Id").and_then(Value::as_int).unwrap(),
                r.get("ChildReportingUnit_Id").and_then(Value::as_int).unwrap(),
            )
        })
        .collect();
    assert!(edges.contains(&(ids["NC;Wake"], ids["NC;Wake;Raleigt"])));
    assert!(edges.contains(&(ids["NC"], ids["NC;Wake"])));
}
