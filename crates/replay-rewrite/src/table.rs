//! The COPY replacement table (`copy_replacements.csv`).

use std::collections::HashMap;
use tracing::info;

/// Replacement entry for one captured object-storage path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    /// New source path; empty means "keep the original path"
    pub path: String,
    /// Authorization role for the rewritten COPY; empty is only an error if
    /// the path is actually referenced by the workload
    pub role: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplacementTableError {
    #[error("replacement table row {row} is malformed: {source}")]
    Malformed {
        row: usize,
        source: csv::Error,
    },

    #[error("replacement table row {row} has {found} fields, expected 3 (original_path, replacement_path, replacement_role)")]
    WrongFieldCount { row: usize, found: usize },
}

/// Mapping from captured object-storage path to its replacement.
#[derive(Debug, Clone, Default)]
pub struct ReplacementTable {
    entries: HashMap<String, Replacement>,
}

impl ReplacementTable {
    /// Parse the CSV form: header row, then `original, replacement, role`.
    /// A malformed row is a configuration error, not a skippable record.
    pub fn parse_csv(contents: &str) -> Result<Self, ReplacementTableError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(contents.as_bytes());

        let mut entries = HashMap::new();
        for (idx, record) in reader.records().enumerate() {
            let record =
                record.map_err(|source| ReplacementTableError::Malformed { row: idx, source })?;
            if record.len() != 3 {
                return Err(ReplacementTableError::WrongFieldCount {
                    row: idx,
                    found: record.len(),
                });
            }
            entries.insert(
                record[0].to_string(),
                Replacement {
                    path: record[1].to_string(),
                    role: record[2].to_string(),
                },
            );
        }

        info!("Loaded {} COPY replacements", entries.len());
        Ok(ReplacementTable { entries })
    }

    pub fn get(&self, original_path: &str) -> Option<&Replacement> {
        self.entries.get(original_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn from_entries<I: IntoIterator<Item = (String, Replacement)>>(iter: I) -> Self {
        ReplacementTable {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv() {
        let csv = "\
original_path,replacement_path,replacement_role
s3://old/a,s3://new/a,arn:aws:iam::123:role/loader
s3://old/b,,arn:aws:iam::123:role/loader
";
        let table = ReplacementTable::parse_csv(csv).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("s3://old/a").unwrap().path, "s3://new/a");
        assert_eq!(table.get("s3://old/b").unwrap().path, "");
    }

    #[test]
    fn test_wrong_field_count_rejected() {
        let csv = "original_path,replacement_path,replacement_role\ns3://old/a,s3://new/a\n";
        let err = ReplacementTable::parse_csv(csv).unwrap_err();
        assert!(matches!(err, ReplacementTableError::WrongFieldCount { .. }));
    }
}
