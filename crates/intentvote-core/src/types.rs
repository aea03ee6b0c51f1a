//! Per-request data flowing from model runners to the ensemble result.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{ClassifyError, InferenceError};
use crate::labels::LabelMapping;

/// Label emitted when aggregate confidence falls below the threshold.
pub const ABSTAIN_LABEL: &str = "others";

/// Threshold used when the caller does not supply one.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Raw class code as emitted by a model, before label resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelCode {
    Int(i64),
    Str(String),
}

impl LabelCode {
    /// Key form used by [`LabelMapping`]. Integer strings are canonicalized,
    /// so `"07"` and `7` share a key.
    pub fn key(&self) -> String {
        match self {
            Self::Str(code) => match code.trim().parse::<i64>() {
                Ok(n) => n.to_string(),
                Err(_) => code.clone(),
            },
            Self::Int(_) => self.to_string(),
        }
    }
}

impl fmt::Display for LabelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(code) => write!(f, "{code}"),
            Self::Str(code) => f.write_str(code),
        }
    }
}

impl From<i64> for LabelCode {
    fn from(code: i64) -> Self {
        Self::Int(code)
    }
}

impl From<&str> for LabelCode {
    fn from(code: &str) -> Self {
        Self::Str(code.to_string())
    }
}

impl From<String> for LabelCode {
    fn from(code: String) -> Self {
        Self::Str(code)
    }
}

/// What a runner's verdict should be when the model exposes no probabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingProbabilities {
    /// Treat the single output as fully confident (confidence 1.0).
    #[default]
    AssumeCertain,
    /// Fail the request with [`InferenceError::MissingProbabilities`].
    Reject,
}

/// Normalized output of one model runner.
#[derive(Debug, Clone, PartialEq)]
pub struct RawModelOutput {
    pub label_code: LabelCode,
    /// One value per class, summing to roughly 1.0.
    pub probabilities: Option<Vec<f32>>,
}

impl RawModelOutput {
    pub fn new(label_code: impl Into<LabelCode>) -> Self {
        Self {
            label_code: label_code.into(),
            probabilities: None,
        }
    }

    pub fn with_probabilities(mut self, probabilities: Vec<f32>) -> Self {
        self.probabilities = Some(probabilities);
        self
    }

    /// Confidence of this output under the given policy: the largest class
    /// probability, or the policy's fallback when there is no distribution.
    pub fn confidence(&self, policy: MissingProbabilities) -> Result<f32, InferenceError> {
        let Some(probs) = self.probabilities.as_deref() else {
            return match policy {
                MissingProbabilities::AssumeCertain => Ok(1.0),
                MissingProbabilities::Reject => Err(InferenceError::MissingProbabilities),
            };
        };

        if probs.is_empty() {
            return Err(InferenceError::InvalidProbabilities(
                "empty distribution".into(),
            ));
        }
        if let Some(bad) = probs
            .iter()
            .find(|p| !p.is_finite() || **p < 0.0 || **p > 1.0)
        {
            return Err(InferenceError::InvalidProbabilities(format!(
                "value {bad} outside [0, 1]"
            )));
        }

        Ok(probs.iter().copied().fold(0.0f32, f32::max))
    }
}

/// One model's resolved label and confidence for a single request.
///
/// Only constructed through validation, so `confidence` is always in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedVerdict")]
pub struct ModelVerdict {
    label: String,
    confidence: f32,
}

#[derive(Deserialize)]
struct UncheckedVerdict {
    label: String,
    confidence: f32,
}

impl TryFrom<UncheckedVerdict> for ModelVerdict {
    type Error = InferenceError;

    fn try_from(raw: UncheckedVerdict) -> Result<Self, Self::Error> {
        Self::new(raw.label, raw.confidence)
    }
}

impl ModelVerdict {
    /// Build a verdict, rejecting confidences outside [0, 1].
    pub fn new(label: impl Into<String>, confidence: f32) -> Result<Self, InferenceError> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(InferenceError::InvalidProbabilities(format!(
                "confidence {confidence} outside [0, 1]"
            )));
        }
        Ok(Self {
            label: label.into(),
            confidence,
        })
    }

    /// Resolve a runner's raw output into a verdict.
    ///
    /// Applies the runner's [`MissingProbabilities`] policy, then looks the
    /// label code up in `mapping`. An unknown code is a
    /// [`ClassifyError::Configuration`], never a silent `"others"`.
    pub fn from_output(
        model: &str,
        output: &RawModelOutput,
        policy: MissingProbabilities,
        mapping: &LabelMapping,
    ) -> Result<Self, ClassifyError> {
        let confidence = output
            .confidence(policy)
            .map_err(|e| ClassifyError::inference(model, e))?;
        let label = mapping.resolve(model, &output.label_code)?;
        Ok(Self {
            label: label.to_string(),
            confidence,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// Final outcome of one classification request.
///
/// `verdicts` keeps the order the models were queried in and `votes` keeps
/// the order labels were first seen; both serialize as JSON objects in that
/// order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleResult {
    #[serde(serialize_with = "ordered_map")]
    pub verdicts: Vec<(String, ModelVerdict)>,
    pub label: String,
    pub confidence: f32,
    #[serde(serialize_with = "ordered_map")]
    pub votes: Vec<(String, usize)>,
    /// Set when the mean confidence fell below the threshold.
    pub abstained: bool,
}

impl EnsembleResult {
    /// Whether the ensemble returned [`ABSTAIN_LABEL`] for lack of confidence.
    ///
    /// Distinct from a majority that is itself labelled `"others"`.
    pub fn abstained(&self) -> bool {
        self.abstained
    }

    /// Majority label before the abstention rule, with its vote count.
    pub fn majority(&self) -> Option<(&str, usize)> {
        let mut best: Option<(&str, usize)> = None;
        for (label, count) in &self.votes {
            if best.is_none_or(|(_, c)| *count > c) {
                best = Some((label.as_str(), *count));
            }
        }
        best
    }

    pub fn verdict(&self, model: &str) -> Option<&ModelVerdict> {
        self.verdicts
            .iter()
            .find(|(name, _)| name == model)
            .map(|(_, v)| v)
    }

    pub fn votes_for(&self, label: &str) -> usize {
        self.votes
            .iter()
            .find(|(l, _)| l == label)
            .map_or(0, |(_, c)| *c)
    }
}

fn ordered_map<K, V, S>(entries: &[(K, V)], serializer: S) -> Result<S::Ok, S::Error>
where
    K: Serialize,
    V: Serialize,
    S: Serializer,
{
    serializer.collect_map(entries.iter().map(|(k, v)| (k, v)))
}
