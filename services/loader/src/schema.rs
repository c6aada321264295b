//! The Common Data Format tables the engine knows about.
//!
//! Every table is a variant of a closed enumeration carrying its schema as
//! static data, so dispatch on table kind is a `match`, not a string lookup.

use std::fmt;
use std::str::FromStr;

use crate::error::LoadError;

/// Internal name used for anything the munger could not recognise.
pub const NONE_OR_UNKNOWN: &str = "none or unknown";

/// Scalar column types stored in the CDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Text,
    Integer,
    Date,
}

impl DataType {
    /// Value used for the sentinel `none or unknown` row.
    pub fn sentinel(self) -> crate::frame::Value {
        use crate::frame::Value;
        match self {
            DataType::Text => Value::Text(NONE_OR_UNKNOWN.to_string()),
            DataType::Integer => Value::Int(-1),
            DataType::Date => Value::Date(
                chrono::NaiveDate::from_ymd_opt(1000, 1, 1).unwrap_or(chrono::NaiveDate::MIN),
            ),
        }
    }
}

/// A stored column (never the surrogate `Id`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub dtype: DataType,
}

impl Column {
    fn new(name: impl Into<String>, dtype: DataType) -> Self {
        Column {
            name: name.into(),
            dtype,
        }
    }
}

/// Ordinary attribute of an element.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub dtype: DataType,
    pub not_null: bool,
}

const fn text(name: &'static str) -> Field {
    Field {
        name,
        dtype: DataType::Text,
        not_null: true,
    }
}

const fn int(name: &'static str) -> Field {
    Field {
        name,
        dtype: DataType::Integer,
        not_null: false,
    }
}

const fn date(name: &'static str) -> Field {
    Field {
        name,
        dtype: DataType::Date,
        not_null: false,
    }
}

/// `field` holds the `Id` of a row in one of `refers_to`.
#[derive(Debug, Clone, Copy)]
pub struct ForeignKey {
    pub field: &'static str,
    pub refers_to: &'static [CdfElement],
}

impl ForeignKey {
    /// Column that carries the referenced entity's name before resolution,
    /// e.g. `ElectionDistrict` for `ElectionDistrict_Id`.
    pub fn name_column(&self) -> &'static str {
        self.field.strip_suffix("_Id").unwrap_or(self.field)
    }
}

/// Static description of one element table.
#[derive(Debug)]
pub struct ElementSchema {
    pub fields: &'static [Field],
    pub foreign_keys: &'static [ForeignKey],
    pub enums: &'static [EnumTable],
    pub natural_key: &'static [&'static str],
    pub name_field: Option<&'static str>,
}

/// Three-way classification of tables in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Element,
    Enumeration,
    Join,
}

impl TableKind {
    /// Classify a table from its name and column names: joins end in `Join`,
    /// enumerations hold exactly `{Id, Txt}`, everything else is an element.
    pub fn classify<S: AsRef<str>>(name: &str, columns: &[S]) -> TableKind {
        if name.ends_with("Join") {
            return TableKind::Join;
        }
        let mut cols: Vec<&str> = columns.iter().map(AsRef::as_ref).collect();
        cols.sort_unstable();
        if cols == ["Id", "Txt"] {
            TableKind::Enumeration
        } else {
            TableKind::Element
        }
    }
}

// =============================================================================
// ELEMENTS
// =============================================================================

/// Entity and join tables with a surrogate `Id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CdfElement {
    ReportingUnit,
    Party,
    Office,
    Election,
    CandidateContest,
    BallotMeasureContest,
    Candidate,
    CandidateSelection,
    BallotMeasureSelection,
    ExternalIdentifier,
    VoteCount,
    Datafile,
    ComposingReportingUnitJoin,
}

/// Elements an `ExternalIdentifier` may point at.
const NAMED_ELEMENTS: &[CdfElement] = &[
    CdfElement::ReportingUnit,
    CdfElement::Party,
    CdfElement::Office,
    CdfElement::Election,
    CdfElement::CandidateContest,
    CdfElement::BallotMeasureContest,
    CdfElement::Candidate,
    CdfElement::BallotMeasureSelection,
];

static REPORTING_UNIT: ElementSchema = ElementSchema {
    fields: &[text("Name")],
    foreign_keys: &[],
    enums: &[EnumTable::ReportingUnitType],
    natural_key: &["Name"],
    name_field: Some("Name"),
};

static PARTY: ElementSchema = ElementSchema {
    fields: &[text("Name")],
    foreign_keys: &[],
    enums: &[],
    natural_key: &["Name"],
    name_field: Some("Name"),
};

static OFFICE: ElementSchema = ElementSchema {
    fields: &[text("Name")],
    foreign_keys: &[ForeignKey {
        field: "ElectionDistrict_Id",
        refers_to: &[CdfElement::ReportingUnit],
    }],
    enums: &[],
    natural_key: &["Name"],
    name_field: Some("Name"),
};

static ELECTION: ElementSchema = ElementSchema {
    fields: &[text("Name"), date("StartDate"), date("EndDate")],
    foreign_keys: &[],
    enums: &[EnumTable::ElectionType],
    natural_key: &["Name"],
    name_field: Some("Name"),
};

static CANDIDATE_CONTEST: ElementSchema = ElementSchema {
    fields: &[
        text("Name"),
        int("VotesAllowed"),
        int("NumberElected"),
        int("NumberRunoff"),
    ],
    foreign_keys: &[
        ForeignKey {
            field: "Office_Id",
            refers_to: &[CdfElement::Office],
        },
        ForeignKey {
            field: "PrimaryParty_Id",
            refers_to: &[CdfElement::Party],
        },
    ],
    enums: &[],
    natural_key: &["Name"],
    name_field: Some("Name"),
};

static BALLOT_MEASURE_CONTEST: ElementSchema = ElementSchema {
    fields: &[text("Name")],
    foreign_keys: &[ForeignKey {
        field: "ElectionDistrict_Id",
        refers_to: &[CdfElement::ReportingUnit],
    }],
    enums: &[],
    natural_key: &["Name"],
    name_field: Some("Name"),
};

static CANDIDATE: ElementSchema = ElementSchema {
    fields: &[text("BallotName")],
    foreign_keys: &[],
    enums: &[],
    natural_key: &["BallotName"],
    name_field: Some("BallotName"),
};

static CANDIDATE_SELECTION: ElementSchema = ElementSchema {
    fields: &[],
    foreign_keys: &[
        ForeignKey {
            field: "Candidate_Id",
            refers_to: &[CdfElement::Candidate],
        },
        ForeignKey {
            field: "Party_Id",
            refers_to: &[CdfElement::Party],
        },
    ],
    enums: &[],
    natural_key: &["Candidate_Id", "Party_Id"],
    name_field: None,
};

static BALLOT_MEASURE_SELECTION: ElementSchema = ElementSchema {
    fields: &[text("Selection")],
    foreign_keys: &[],
    enums: &[],
    natural_key: &["Selection"],
    name_field: Some("Selection"),
};

static EXTERNAL_IDENTIFIER: ElementSchema = ElementSchema {
    fields: &[text("Value")],
    foreign_keys: &[ForeignKey {
        field: "ForeignId",
        refers_to: NAMED_ELEMENTS,
    }],
    enums: &[EnumTable::IdentifierType],
    natural_key: &["ForeignId", "IdentifierType_Id", "OtherIdentifierType"],
    name_field: None,
};

static VOTE_COUNT: ElementSchema = ElementSchema {
    fields: &[int("Count")],
    foreign_keys: &[
        ForeignKey {
            field: "ReportingUnit_Id",
            refers_to: &[CdfElement::ReportingUnit],
        },
        ForeignKey {
            field: "Contest_Id",
            refers_to: &[CdfElement::CandidateContest, CdfElement::BallotMeasureContest],
        },
        ForeignKey {
            field: "Selection_Id",
            refers_to: &[CdfElement::CandidateSelection],
        },
        ForeignKey {
            field: "Election_Id",
            refers_to: &[CdfElement::Election],
        },
        ForeignKey {
            field: "_datafile_Id",
            refers_to: &[CdfElement::Datafile],
        },
    ],
    enums: &[EnumTable::CountItemType],
    natural_key: &[
        "ReportingUnit_Id",
        "Contest_Id",
        "Selection_Id",
        "Election_Id",
        "CountItemType_Id",
        "OtherCountItemType",
        "_datafile_Id",
    ],
    name_field: None,
};

static DATAFILE: ElementSchema = ElementSchema {
    fields: &[text("short_name"), text("file_name")],
    foreign_keys: &[
        ForeignKey {
            field: "Election_Id",
            refers_to: &[CdfElement::Election],
        },
        // top reporting unit the file covers
        ForeignKey {
            field: "ReportingUnit_Id",
            refers_to: &[CdfElement::ReportingUnit],
        },
    ],
    enums: &[],
    natural_key: &["short_name"],
    name_field: Some("short_name"),
};

static COMPOSING_REPORTING_UNIT_JOIN: ElementSchema = ElementSchema {
    fields: &[],
    foreign_keys: &[
        ForeignKey {
            field: "ParentReportingUnit_Id",
            refers_to: &[CdfElement::ReportingUnit],
        },
        ForeignKey {
            field: "ChildReportingUnit_Id",
            refers_to: &[CdfElement::ReportingUnit],
        },
    ],
    enums: &[],
    natural_key: &["ParentReportingUnit_Id", "ChildReportingUnit_Id"],
    name_field: None,
};

impl CdfElement {
    pub const ALL: [CdfElement; 13] = [
        CdfElement::ReportingUnit,
        CdfElement::Party,
        CdfElement::Office,
        CdfElement::Election,
        CdfElement::CandidateContest,
        CdfElement::BallotMeasureContest,
        CdfElement::Candidate,
        CdfElement::CandidateSelection,
        CdfElement::BallotMeasureSelection,
        CdfElement::ExternalIdentifier,
        CdfElement::VoteCount,
        CdfElement::Datafile,
        CdfElement::ComposingReportingUnitJoin,
    ];

    /// Table name in the store.
    pub fn name(self) -> &'static str {
        match self {
            CdfElement::ReportingUnit => "ReportingUnit",
            CdfElement::Party => "Party",
            CdfElement::Office => "Office",
            CdfElement::Election => "Election",
            CdfElement::CandidateContest => "CandidateContest",
            CdfElement::BallotMeasureContest => "BallotMeasureContest",
            CdfElement::Candidate => "Candidate",
            CdfElement::CandidateSelection => "CandidateSelection",
            CdfElement::BallotMeasureSelection => "BallotMeasureSelection",
            CdfElement::ExternalIdentifier => "ExternalIdentifier",
            CdfElement::VoteCount => "VoteCount",
            CdfElement::Datafile => "_datafile",
            CdfElement::ComposingReportingUnitJoin => "ComposingReportingUnitJoin",
        }
    }

    pub fn schema(self) -> &'static ElementSchema {
        match self {
            CdfElement::ReportingUnit => &REPORTING_UNIT,
            CdfElement::Party => &PARTY,
            CdfElement::Office => &OFFICE,
            CdfElement::Election => &ELECTION,
            CdfElement::CandidateContest => &CANDIDATE_CONTEST,
            CdfElement::BallotMeasureContest => &BALLOT_MEASURE_CONTEST,
            CdfElement::Candidate => &CANDIDATE,
            CdfElement::CandidateSelection => &CANDIDATE_SELECTION,
            CdfElement::BallotMeasureSelection => &BALLOT_MEASURE_SELECTION,
            CdfElement::ExternalIdentifier => &EXTERNAL_IDENTIFIER,
            CdfElement::VoteCount => &VOTE_COUNT,
            CdfElement::Datafile => &DATAFILE,
            CdfElement::ComposingReportingUnitJoin => &COMPOSING_REPORTING_UNIT_JOIN,
        }
    }

    pub fn kind(self) -> TableKind {
        if self.name().ends_with("Join") {
            TableKind::Join
        } else {
            TableKind::Element
        }
    }

    /// Column holding the internal name, if the element has one.
    pub fn name_field(self) -> Option<&'static str> {
        self.schema().name_field
    }

    /// Every stored column except `Id`, in a fixed order: attributes,
    /// foreign keys, then `<Enum>_Id` / `Other<Enum>` pairs.
    pub fn columns(self) -> Vec<Column> {
        let schema = self.schema();
        let mut cols: Vec<Column> = schema
            .fields
            .iter()
            .map(|f| Column::new(f.name, f.dtype))
            .collect();
        cols.extend(
            schema
                .foreign_keys
                .iter()
                .map(|fk| Column::new(fk.field, DataType::Integer)),
        );
        for e in schema.enums {
            cols.push(Column::new(e.id_column(), DataType::Integer));
            cols.push(Column::new(e.other_column(), DataType::Text));
        }
        cols
    }

    pub fn foreign_key(self, field: &str) -> Option<&'static ForeignKey> {
        self.schema().foreign_keys.iter().find(|fk| fk.field == field)
    }
}

impl fmt::Display for CdfElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CdfElement {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CdfElement::ALL
            .iter()
            .copied()
            .find(|e| e.name() == s)
            .ok_or_else(|| LoadError::Configuration(format!("unknown CDF element '{s}'")))
    }
}

// =============================================================================
// ENUMERATIONS
// =============================================================================

/// `{Id, Txt}` lookup tables, each with exactly one `other` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EnumTable {
    ReportingUnitType,
    CountItemType,
    ElectionType,
    IdentifierType,
}

impl EnumTable {
    pub const ALL: [EnumTable; 4] = [
        EnumTable::ReportingUnitType,
        EnumTable::CountItemType,
        EnumTable::ElectionType,
        EnumTable::IdentifierType,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EnumTable::ReportingUnitType => "ReportingUnitType",
            EnumTable::CountItemType => "CountItemType",
            EnumTable::ElectionType => "ElectionType",
            EnumTable::IdentifierType => "IdentifierType",
        }
    }

    /// Column name used by jurisdiction files that carry the plain text.
    /// ExternalIdentifier files call their type column `ExternalIdentifierType`.
    pub fn text_column(self) -> &'static str {
        match self {
            EnumTable::IdentifierType => "ExternalIdentifierType",
            other => other.name(),
        }
    }

    pub fn id_column(self) -> String {
        format!("{}_Id", self.name())
    }

    pub fn other_column(self) -> String {
        format!("Other{}", self.name())
    }

    /// Canonical members as seeded into a fresh database, `other` included.
    pub fn canonical_values(self) -> &'static [&'static str] {
        match self {
            EnumTable::ReportingUnitType => &[
                "ballot-batch",
                "ballot-style-area",
                "borough",
                "city",
                "city-council",
                "combined-precinct",
                "congressional",
                "country",
                "county",
                "county-council",
                "drop-box",
                "judicial",
                "municipality",
                "polling-place",
                "precinct",
                "school",
                "special",
                "split-precinct",
                "state",
                "state-house",
                "state-senate",
                "town",
                "township",
                "utility",
                "village",
                "vote-center",
                "ward",
                "water",
                "other",
            ],
            EnumTable::CountItemType => &[
                "absentee",
                "absentee-fwab",
                "absentee-in-person",
                "absentee-mail",
                "early",
                "election-day",
                "provisional",
                "seats",
                "total",
                "uocava",
                "write-in",
                "other",
            ],
            EnumTable::ElectionType => &[
                "general",
                "partisan-primary-closed",
                "partisan-primary-open",
                "primary",
                "runoff",
                "special",
                "other",
            ],
            EnumTable::IdentifierType => &[
                "fips",
                "local-level",
                "national-level",
                "ocd-id",
                "state-level",
                "other",
            ],
        }
    }
}

impl fmt::Display for EnumTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EnumTable {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnumTable::ALL
            .iter()
            .copied()
            .find(|e| e.name() == s)
            .ok_or_else(|| LoadError::Configuration(format!("unknown enumeration '{s}'")))
    }
}

// =============================================================================
// TABLES
// =============================================================================

/// Any table in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Element(CdfElement),
    Enumeration(EnumTable),
}

impl Table {
    pub fn all() -> impl Iterator<Item = Table> {
        CdfElement::ALL
            .into_iter()
            .map(Table::Element)
            .chain(EnumTable::ALL.into_iter().map(Table::Enumeration))
    }

    pub fn name(self) -> &'static str {
        match self {
            Table::Element(e) => e.name(),
            Table::Enumeration(e) => e.name(),
        }
    }

    pub fn kind(self) -> TableKind {
        match self {
            Table::Element(e) => e.kind(),
            Table::Enumeration(_) => TableKind::Enumeration,
        }
    }

    pub fn columns(self) -> Vec<Column> {
        match self {
            Table::Element(e) => e.columns(),
            Table::Enumeration(_) => vec![Column::new("Txt", DataType::Text)],
        }
    }

    /// Columns whose combined value identifies a row.
    pub fn natural_key(self) -> Vec<&'static str> {
        match self {
            Table::Element(e) => e.schema().natural_key.to_vec(),
            Table::Enumeration(_) => vec!["Txt"],
        }
    }
}

impl From<CdfElement> for Table {
    fn from(e: CdfElement) -> Self {
        Table::Element(e)
    }
}

impl From<EnumTable> for Table {
    fn from(e: EnumTable) -> Self {
        Table::Enumeration(e)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Table {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::all()
            .find(|t| t.name() == s)
            .ok_or_else(|| LoadError::Configuration(format!("unknown CDF table '{s}'")))
    }
}

/// Columns of jurisdiction files that must name a row of another file.
pub const JURISDICTION_DEPENDENCIES: &[(&str, CdfElement)] = &[
    ("ElectionDistrict", CdfElement::ReportingUnit),
    ("Office", CdfElement::Office),
    ("PrimaryParty", CdfElement::Party),
    ("Party", CdfElement::Party),
    ("Election", CdfElement::Election),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_include_fk_and_enum_pairs() {
        let names: Vec<String> = CdfElement::ReportingUnit
            .columns()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(
            names,
            vec!["Name", "ReportingUnitType_Id", "OtherReportingUnitType"]
        );
        let office: Vec<String> = CdfElement::Office.columns().into_iter().map(|c| c.name).collect();
        assert_eq!(office, vec!["Name", "ElectionDistrict_Id"]);
    }

    #[test]
    fn test_datafile_records_election_and_top_unit() {
        let names: Vec<String> = CdfElement::Datafile.columns().into_iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            vec!["short_name", "file_name", "Election_Id", "ReportingUnit_Id"]
        );
        let fk = CdfElement::Datafile.foreign_key("ReportingUnit_Id").unwrap();
        assert_eq!(fk.refers_to, &[CdfElement::ReportingUnit]);
    }

    #[test]
    fn test_table_kind_classification() {
        assert_eq!(
            TableKind::classify("ComposingReportingUnitJoin", &["Id", "x"]),
            TableKind::Join
        );
        assert_eq!(
            TableKind::classify("CountItemType", &["Txt", "Id"]),
            TableKind::Enumeration
        );
        assert_eq!(
            TableKind::classify("Party", &["Id", "Name"]),
            TableKind::Element
        );
        assert_eq!(
            Table::Element(CdfElement::ComposingReportingUnitJoin).kind(),
            TableKind::Join
        );
    }

    #[test]
    fn test_names_round_trip_through_from_str() {
        for t in Table::all() {
            assert_eq!(t.name().parse::<Table>().unwrap(), t);
        }
        assert!("Precinct".parse::<CdfElement>().is_err());
    }

    #[test]
    fn test_every_enum_has_one_other() {
        for e in EnumTable::ALL {
            let others = e.canonical_values().iter().filter(|v| **v == "other").count();
            assert_eq!(others, 1, "{e}");
        }
    }

    #[test]
    fn test_name_column_strips_id_suffix() {
        let fk = CdfElement::Office.foreign_key("ElectionDistrict_Id").unwrap();
        assert_eq!(fk.name_column(), "ElectionDistrict");
        let ext = CdfElement::ExternalIdentifier.foreign_key("ForeignId").unwrap();
        assert_eq!(ext.name_column(), "ForeignId");
    }
}
