//! Static mapping from model class codes to canonical intent labels.
//!
//! Loaded once at startup from a JSON object such as
//! `{"0": "greeting", "1": "shopping"}` and shared read-only across requests.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use tracing::{info, warn};

use crate::error::{ClassifyError, MappingError};
use crate::types::{ABSTAIN_LABEL, LabelCode};

/// Class code → intent label table.
#[derive(Debug, Clone)]
pub struct LabelMapping {
    by_code: HashMap<String, String>,
}

/// Summary statistics for a LabelMapping.
pub struct MappingSummary {
    pub codes: usize,
    pub distinct_labels: usize,
}

impl LabelMapping {
    /// Load a mapping from a JSON file.
    pub fn load(path: &Path) -> Result<Self, MappingError> {
        let json = std::fs::read_to_string(path).map_err(|source| MappingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mapping = Self::from_json_str(&json)?;
        info!(
            codes = mapping.len(),
            path = %path.display(),
            "loaded label mapping"
        );
        Ok(mapping)
    }

    /// Parse a mapping from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self, MappingError> {
        let raw: HashMap<String, String> = serde_json::from_str(json)?;
        Self::from_entries(raw)
    }

    /// Build a mapping from `(code, label)` pairs.
    ///
    /// Codes must be string-encoded integers and labels non-empty.
    pub fn from_entries<I, K, V>(entries: I) -> Result<Self, MappingError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut by_code = HashMap::new();

        for (code, label) in entries {
            let code = code.into();
            let label = label.into();

            let Ok(parsed) = code.trim().parse::<i64>() else {
                return Err(MappingError::InvalidKey(code));
            };
            if label.trim().is_empty() {
                return Err(MappingError::InvalidLabel(code));
            }
            if label == ABSTAIN_LABEL {
                warn!(code = %code, "label mapping uses the reserved abstention label");
            }

            // "01" and " 1" both name code 1.
            if by_code.insert(parsed.to_string(), label).is_some() {
                return Err(MappingError::DuplicateKey(parsed));
            }
        }

        if by_code.is_empty() {
            return Err(MappingError::Empty);
        }

        Ok(Self { by_code })
    }

    /// Resolve a model's raw code to its label.
    ///
    /// A code with no entry means the model and mapping are out of sync;
    /// it is reported as [`ClassifyError::Configuration`].
    pub fn resolve(&self, model: &str, code: &LabelCode) -> Result<&str, ClassifyError> {
        let key = code.key();
        self.get(&key).ok_or_else(|| ClassifyError::Configuration {
            model: model.to_string(),
            code: key,
        })
    }

    pub fn get(&self, code: &str) -> Option<&str> {
        self.by_code.get(code).map(|s| s.as_str())
    }

    /// Distinct labels, sorted.
    pub fn labels(&self) -> Vec<&str> {
        let set: BTreeSet<&str> = self.by_code.values().map(|s| s.as_str()).collect();
        set.into_iter().collect()
    }

    /// `(code, label)` pairs ordered by numeric code.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .by_code
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        entries.sort_by_key(|(code, _)| code.parse::<i64>().unwrap_or(i64::MAX));
        entries
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.by_code.values().any(|l| l == label)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Summary statistics.
    pub fn summary(&self) -> MappingSummary {
        MappingSummary {
            codes: self.len(),
            distinct_labels: self.labels().len(),
        }
    }
}
