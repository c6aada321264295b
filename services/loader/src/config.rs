//! Runtime settings for a load run.
//!
//! Connection details come from the environment (`DB_URL`, optionally via a
//! `.env` file); everything else is passed on the command line.

use encoding_rs::{Encoding, UTF_8};
use serde::Serialize;

use crate::error::{LoadError, LoadResult};
use crate::files;

pub const DB_URL_VAR: &str = "DB_URL";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// What a results run does with rows whose raw identifiers have no
/// dictionary entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UntranslatedPolicy {
    /// Load them against `none or unknown` and list the raw values.
    #[default]
    Flag,
    /// Drop them before any VoteCount is created and list the raw values.
    Block,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub untranslated: UntranslatedPolicy,
    /// Encoding of jurisdiction files. Results files use their munger's.
    pub encoding: &'static Encoding,
    pub max_connections: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            untranslated: UntranslatedPolicy::default(),
            encoding: UTF_8,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl Settings {
    pub fn new(untranslated: UntranslatedPolicy, encoding_label: &str) -> LoadResult<Settings> {
        let encoding = files::encoding_for_label(encoding_label).ok_or_else(|| {
            LoadError::Configuration(format!("unknown encoding '{encoding_label}'"))
        })?;
        Ok(Settings {
            untranslated,
            encoding,
            ..Settings::default()
        })
    }

    /// Pool size for the Postgres store; zero is rejected.
    pub fn with_max_connections(mut self, max_connections: u32) -> LoadResult<Settings> {
        if max_connections == 0 {
            return Err(LoadError::Configuration(
                "max_connections must be at least 1".to_string(),
            ));
        }
        self.max_connections = max_connections;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_accepts_known_labels() {
        let s = Settings::new(UntranslatedPolicy::Block, "latin1").unwrap();
        assert_eq!(s.encoding.name(), "windows-1252");
        assert_eq!(s.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn test_max_connections_override() {
        let s = Settings::default().with_max_connections(12).unwrap();
        assert_eq!(s.max_connections, 12);
        assert!(Settings::default().with_max_connections(0).unwrap_err().is_configuration());
    }

    #[test]
    fn test_settings_rejects_unknown_label() {
        let err = Settings::new(UntranslatedPolicy::Flag, "klingon").unwrap_err();
        assert!(err.is_configuration());
    }
}
