//! Error taxonomy for the load engine.
//!
//! Element-level failures are collected into the run report instead of being
//! raised, so most variants here end up as entries in `LoadReport::errors`.
//! Only `Configuration` / `Formula` abort a run before any element is touched.

use crate::formula::FormulaError;
use serde::Serialize;

/// Anything that can go wrong while munging or loading.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Malformed munger, missing enum `other` row, unsupported field type.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Formula(#[from] FormulaError),

    /// Raw value with no dictionary entry. Reported, never fatal.
    #[error("no {element} dictionary entry for raw value '{value}'")]
    TranslationGap { element: String, value: String },

    #[error("for some {element} records, {field} was not found in {targets}: {}", .values.join(", "))]
    UnresolvedForeignKey {
        element: String,
        field: String,
        targets: String,
        values: Vec<String>,
    },

    #[error("reference cycle while loading {}", .chain.join(" -> "))]
    ReferenceCycle { chain: Vec<String> },

    #[error("error uploading {table}: {detail}")]
    UniquenessConflict { table: String, detail: String },

    #[error("every {column} in {element}.txt must be a {target}; missing: {}", .values.join(", "))]
    DependencyViolation {
        element: String,
        column: String,
        target: String,
        values: Vec<String>,
    },

    #[error("{0}")]
    Jurisdiction(String),

    /// Results file does not fit its munger, e.g. a non-numeric count.
    #[error("datafile: {0}")]
    Datafile(String),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("{path}: {detail}")]
    Spreadsheet { path: String, detail: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("frame error: {0}")]
    Frame(#[from] polars::prelude::PolarsError),
}

impl LoadError {
    /// True for errors that must stop a run before any element is loaded.
    pub fn is_configuration(&self) -> bool {
        matches!(self, LoadError::Configuration(_) | LoadError::Formula(_))
    }

    /// Stable short name used as the `kind` field in serialized reports.
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::Configuration(_) | LoadError::Formula(_) => "configuration",
            LoadError::TranslationGap { .. } => "translation_gap",
            LoadError::UnresolvedForeignKey { .. } => "foreign_key",
            LoadError::ReferenceCycle { .. } => "reference_cycle",
            LoadError::UniquenessConflict { .. } => "database",
            LoadError::DependencyViolation { .. } => "failed_dependency",
            LoadError::Jurisdiction(_) => "jurisdiction",
            LoadError::Datafile(_) => "datafile",
            LoadError::Io { .. } | LoadError::Csv { .. } | LoadError::Spreadsheet { .. } => {
                "file"
            }
            LoadError::Database(_) => "database",
            LoadError::Frame(_) => "frame",
        }
    }

    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        LoadError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn csv(path: impl Into<String>, source: csv::Error) -> Self {
        LoadError::Csv {
            path: path.into(),
            source,
        }
    }
}

/// Serializable view of an error for the JSON run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    pub kind: &'static str,
    pub message: String,
}

impl From<&LoadError> for ErrorEntry {
    fn from(e: &LoadError) -> Self {
        ErrorEntry {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

pub type LoadResult<T> = Result<T, LoadError>;
