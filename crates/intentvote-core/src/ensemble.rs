//! Majority-vote aggregation of per-model verdicts.
//!
//! One vote per model for its resolved label. The label with the highest
//! count wins; ties go to the label first seen in query order. Confidence
//! is the unweighted mean over all models, and when it falls below the
//! threshold the ensemble abstains with [`ABSTAIN_LABEL`].

use std::collections::HashSet;

use tracing::debug;

use crate::error::ClassifyError;
use crate::types::{ABSTAIN_LABEL, DEFAULT_THRESHOLD, EnsembleResult, ModelVerdict};

/// Aggregate verdicts with the given threshold, requiring at least one verdict.
pub fn aggregate(
    verdicts: &[(String, ModelVerdict)],
    threshold: f32,
) -> Result<EnsembleResult, ClassifyError> {
    Aggregator::new(threshold)?.aggregate(verdicts)
}

/// Configured aggregation step: abstention threshold plus minimum quorum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregator {
    threshold: f32,
    min_verdicts: usize,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_verdicts: 1,
        }
    }
}

impl Aggregator {
    /// `threshold` must lie in [0, 1]. Both bounds are valid: 0.0 always
    /// accepts the majority, 1.0 abstains unless every model is certain.
    pub fn new(threshold: f32) -> Result<Self, ClassifyError> {
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(ClassifyError::InvalidThreshold(threshold));
        }
        Ok(Self {
            threshold,
            min_verdicts: 1,
        })
    }

    /// Require at least `min_verdicts` verdicts (never less than one).
    pub fn with_quorum(mut self, min_verdicts: usize) -> Self {
        self.min_verdicts = min_verdicts.max(1);
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn min_verdicts(&self) -> usize {
        self.min_verdicts
    }

    /// Aggregate `verdicts`, given in the order the models were queried.
    pub fn aggregate(
        &self,
        verdicts: &[(String, ModelVerdict)],
    ) -> Result<EnsembleResult, ClassifyError> {
        if verdicts.len() < self.min_verdicts {
            return Err(ClassifyError::Quorum {
                got: verdicts.len(),
                need: self.min_verdicts,
            });
        }

        let mut seen = HashSet::with_capacity(verdicts.len());
        for (model, _) in verdicts {
            if !seen.insert(model.as_str()) {
                return Err(ClassifyError::DuplicateModel(model.clone()));
            }
        }

        let votes = tally(verdicts);
        let majority = majority_label(&votes);

        let sum: f64 = verdicts.iter().map(|(_, v)| f64::from(v.confidence())).sum();
        let confidence = (sum / verdicts.len() as f64) as f32;

        let abstained = confidence < self.threshold;
        let label = if abstained {
            ABSTAIN_LABEL.to_string()
        } else {
            majority.to_string()
        };

        debug!(
            models = verdicts.len(),
            majority,
            label = %label,
            confidence,
            threshold = self.threshold,
            "aggregated verdicts"
        );

        Ok(EnsembleResult {
            verdicts: verdicts.to_vec(),
            label,
            confidence,
            votes,
            abstained,
        })
    }
}

/// Count one vote per verdict, keeping labels in first-seen order.
fn tally(verdicts: &[(String, ModelVerdict)]) -> Vec<(String, usize)> {
    let mut votes: Vec<(String, usize)> = Vec::new();
    for (_, verdict) in verdicts {
        match votes.iter_mut().find(|(label, _)| label == verdict.label()) {
            Some((_, count)) => *count += 1,
            None => votes.push((verdict.label().to_string(), 1)),
        }
    }
    votes
}

/// First label reaching the maximum count. `votes` must be non-empty.
fn majority_label(votes: &[(String, usize)]) -> &str {
    let mut best = &votes[0];
    for entry in &votes[1..] {
        if entry.1 > best.1 {
            best = entry;
        }
    }
    &best.0
}
