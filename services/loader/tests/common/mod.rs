//! On-disk fixtures shared by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use encoding_rs::UTF_8;
use tempfile::TempDir;

use loader::Jurisdiction;

pub const ELECTION: &str = "2020 General";

pub fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (name, content) in files {
        fs::write(dir.join(name), content).unwrap();
    }
}

pub fn dir_with(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_files(dir.path(), files);
    dir
}

pub fn jurisdiction(dir: &TempDir) -> Jurisdiction {
    Jurisdiction::new(dir.path(), UTF_8)
}

pub const REPORTING_UNITS: &str = "Name\tReportingUnitType\n\
    North Carolina\tstate\n\
    North Carolina;Wake County\tcounty\n";
pub const OFFICES: &str = "Name\tElectionDistrict\n\
    NC Governor\tNorth Carolina\n";
pub const PARTIES: &str = "Name\n\
    Democratic Party\n\
    Republican Party\n";
pub const CANDIDATE_CONTESTS: &str =
    "Name\tVotesAllowed\tNumberElected\tNumberRunoff\tOffice\tPrimaryParty\n\
    NC Governor\t1\t1\t\tNC Governor\t\n";
pub const ELECTIONS: &str = "Name\tStartDate\tEndDate\tElectionType\n\
    2020 General\t2020-11-03\t2020-11-03\tgeneral\n";
pub const CANDIDATES: &str = "BallotName\n\
    Roy Cooper\n\
    Dan Forest\n";
pub const CANDIDATE_SELECTIONS: &str = "Candidate\tParty\n\
    Roy Cooper\tDemocratic Party\n\
    Dan Forest\tRepublican Party\n";
pub const EXTERNAL_IDENTIFIERS: &str = "cdf_element\tinternal_name\tExternalIdentifierType\tValue\n\
    ReportingUnit\tNorth Carolina\tfips\t37\n";

/// A small but complete North Carolina jurisdiction.
pub fn nc_files() -> Vec<(&'static str, &'static str)> {
    vec![
        ("ReportingUnit.txt", REPORTING_UNITS),
        ("Office.txt", OFFICES),
        ("Party.txt", PARTIES),
        ("CandidateContest.txt", CANDIDATE_CONTESTS),
        ("Election.txt", ELECTIONS),
        ("Candidate.txt", CANDIDATES),
        ("CandidateSelection.txt", CANDIDATE_SELECTIONS),
        ("ExternalIdentifier.txt", EXTERNAL_IDENTIFIERS),
    ]
}

/// `nc_files` with one file replaced.
pub fn nc_files_with(name: &'static str, content: &'static str) -> Vec<(&'static str, &'static str)> {
    nc_files()
        .into_iter()
        .map(|(n, c)| if n == name { (n, content) } else { (n, c) })
        .collect()
}

pub const CDF_ELEMENTS: &str = "name\tsource\traw_identifier_formula\n\
    ReportingUnit\trow\tNorth Carolina;<County>\n\
    CandidateContest\trow\t<Contest>\n\
    Candidate\trow\t<Choice>\n\
    Party\trow\t<Party>\n\
    CountItemType\tcolumn\t<0>\n";

pub const FORMAT: &str = "item\tvalue\n\
    header_row_count\t1\n\
    field_name_row\t0\n\
    field_names_if_no_field_name_row\t\n\
    count_columns\t4,5\n\
    file_type\ttxt\n\
    encoding\tutf-8\n\
    thousands_separator\t,\n";

pub const RAW_IDENTIFIERS: &str = "cdf_element\traw_identifier_value\tcdf_internal_name\n\
    ReportingUnit\tNorth Carolina;Wake\tNorth Carolina;Wake County\n\
    CandidateContest\tGovernor\tNC Governor\n\
    Candidate\tCooper\tRoy Cooper\n\
    Candidate\tForest\tDan Forest\n\
    Party\tDEM\tDemocratic Party\n\
    Party\tREP\tRepublican Party\n\
    CountItemType\tElection Day\telection-day\n\
    CountItemType\tAbsentee\tabsentee-mail\n";

pub fn munger_dir() -> TempDir {
    dir_with(&[
        ("cdf_elements.txt", CDF_ELEMENTS),
        ("format.txt", FORMAT),
        ("raw_identifiers.txt", RAW_IDENTIFIERS),
    ])
}

pub const RESULTS: &str = "County\tContest\tChoice\tParty\tElection Day\tAbsentee\n\
    Wake\tGovernor\tCooper\tDEM\t1,200\t300\n\
    Wake\tGovernor\tForest\tREP\t900\t250\n";

pub const RESULTS_WITH_WRITE_INS: &str = "County\tContest\tChoice\tParty\tElection Day\tAbsentee\n\
    Wake\tGovernor\tCooper\tDEM\t1,200\t300\n\
    Wake\tGovernor\tForest\tREP\t900\t250\n\
    Wake\tGovernor\tWrite-ins\tDEM\t7\t1\n";

pub const AUX_CDF_ELEMENTS: &str = "name\tsource\traw_identifier_formula\n\
    ReportingUnit\trow\tNorth Carolina;<County>\n\
    CandidateContest\trow\t<Contest>\n\
    Candidate\trow\t<cands[name]>\n\
    Party\trow\t<cands[party]>\n\
    CountItemType\tcolumn\t<0>\n";

pub const AUX_META: &str = "abbreviated_file_name\tprimary_key\tforeign_key\n\
    cands\tcode\tChoice\n";

pub const AUX_FORMAT: &str = "item\tvalue\n\
    header_row_count\t1\n\
    field_name_row\t0\n\
    field_names_if_no_field_name_row\t\n\
    count_columns\tNone\n\
    file_type\tcsv\n\
    encoding\tutf-8\n\
    thousands_separator\tNone\n";

/// Results that name candidates by code, resolved through `cands`.
pub const AUX_RESULTS: &str = "County\tContest\tChoice\tElection Day\tAbsentee\n\
    Wake\tGovernor\t11\t1,200\t300\n\
    Wake\tGovernor\t12\t900\t250\n";

pub const AUX_CANDIDATES: &str = "code,name,party\n\
    11,Cooper,DEM\n\
    12,Forest,REP\n";

/// The standard munger plus the `cands` auxiliary file.
pub fn aux_munger_dir() -> TempDir {
    let format = FORMAT.replace("count_columns\t4,5", "count_columns\t3,4");
    let dir = dir_with(&[
        ("cdf_elements.txt", AUX_CDF_ELEMENTS),
        ("format.txt", format.as_str()),
        ("raw_identifiers.txt", RAW_IDENTIFIERS),
        ("aux_meta.txt", AUX_META),
    ]);
    fs::create_dir(dir.path().join("cands")).unwrap();
    write_files(&dir.path().join("cands"), &[("format.txt", AUX_FORMAT)]);
    dir
}
