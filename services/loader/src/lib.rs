//! CDF Loader - munges raw election results into a Common Data Format store
//!
//! Responsibilities:
//! - Validate munger directories and parse raw results files with them
//! - Load jurisdiction directories (reporting units, offices, parties,
//!   contests, candidates, ...) with foreign keys resolved by name
//! - Keep the ReportingUnit hierarchy join in step with new units
//! - Append only genuinely new rows, and roll a failed run back by
//!   deleting the rows it wrote

pub mod bulk;
pub mod config;
pub mod enums;
pub mod error;
pub mod files;
pub mod formula;
pub mod frame;
pub mod hierarchy;
pub mod jurisdiction;
pub mod munger;
pub mod pipeline;
pub mod resolve;
pub mod results;
pub mod schema;
pub mod store;
pub mod translate;
pub mod upsert;

pub use config::{Settings, UntranslatedPolicy};
pub use error::{ErrorEntry, LoadError, LoadResult};
pub use frame::{Frame, Value};
pub use jurisdiction::Jurisdiction;
pub use munger::Munger;
pub use pipeline::{
    check_results, load_elements, load_jurisdiction, load_results, LoadReport, ResultsCheck,
    ResultsRun,
};
pub use schema::{CdfElement, EnumTable, Table};
pub use store::{CdfStore, MemoryStore, PgStore};
