//! Include/exclude filtering of captured connections.
//!
//! Filters are declared per field (`database_name`, `username`, `pid`) with an
//! `include` set (default `'*'`) and an `exclude` set. A connection is retained
//! iff every field's include rule matches and no exclude rule does.

use crate::capture::ConnectionLog;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Error validating a filter specification.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("unknown filter field(s): {0:?}")]
    UnknownFields(Vec<String>),

    #[error("include filter for {0} must not be empty")]
    EmptyInclude(String),

    #[error("value(s) {values:?} appear in both include and exclude for {field}")]
    Overlap { field: String, values: Vec<String> },

    #[error("'*' can not be combined with other values in a filter for {0}")]
    WildcardMix(String),
}

/// Raw filter specification as it appears in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub include: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub exclude: HashMap<String, Vec<String>>,
}

/// Normalized include/exclude rule for one field.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FieldRule {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl FieldRule {
    fn matches(&self, value: &str) -> bool {
        if self.exclude.iter().any(|v| v == value) {
            return false;
        }
        self.include.iter().any(|v| v == "*" || v == value)
    }
}

/// Validated filters, one rule per supported field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filters {
    rules: HashMap<String, FieldRule>,
}

impl Default for Filters {
    fn default() -> Self {
        // wildcard include, nothing excluded
        Filters::from_spec(&FilterSpec::default())
            .expect("an empty filter spec always validates")
    }
}

impl Filters {
    /// Validate a raw spec and fill in defaults (`include: ['*']`, empty
    /// exclude) for fields not mentioned.
    pub fn from_spec(spec: &FilterSpec) -> Result<Self, FilterError> {
        let supported = ConnectionLog::supported_filters();

        let unknown: Vec<String> = spec
            .include
            .keys()
            .chain(spec.exclude.keys())
            .filter(|k| !supported.contains(&k.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(FilterError::UnknownFields(unknown));
        }

        let mut rules = HashMap::new();
        for field in supported {
            let include = spec
                .include
                .get(field)
                .cloned()
                .unwrap_or_else(|| vec!["*".to_string()]);
            let exclude = spec.exclude.get(field).cloned().unwrap_or_default();

            if include.is_empty() {
                return Err(FilterError::EmptyInclude(field.to_string()));
            }
            let overlap: Vec<String> = include
                .iter()
                .filter(|v| exclude.contains(v))
                .cloned()
                .collect();
            if !overlap.is_empty() {
                return Err(FilterError::Overlap {
                    field: field.to_string(),
                    values: overlap,
                });
            }
            for set in [&include, &exclude] {
                if set.len() > 1 && set.iter().any(|v| v == "*") {
                    return Err(FilterError::WildcardMix(field.to_string()));
                }
            }

            rules.insert(field.to_string(), FieldRule { include, exclude });
        }

        Ok(Filters { rules })
    }

    /// Whether a connection passes every field's include/exclude rule.
    pub fn matches(&self, connection: &ConnectionLog) -> bool {
        self.matches_fields(
            &connection.database_name,
            &connection.username,
            connection.pid,
        )
    }

    /// Field-level form, usable before a full [`ConnectionLog`] exists.
    pub fn matches_fields(&self, database_name: &str, username: &str, pid: u32) -> bool {
        self.rules["database_name"].matches(database_name)
            && self.rules["username"].matches(username)
            && self.rules["pid"].matches(&pid.to_string())
    }
}
