use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ensemble::Aggregator;
use crate::error::ConfigError;
use crate::types::DEFAULT_THRESHOLD;

/// Ensemble behaviour shared by every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Minimum mean confidence for the majority label to stand.
    pub threshold: f32,
    /// Verdicts required before aggregating. `None` requires every model,
    /// so any runner failure fails the request.
    pub min_models: Option<usize>,
    /// Per-model inference deadline in milliseconds.
    ///
    /// A model that misses it is abandoned, not cancelled: its blocking task
    /// runs to completion and keeps the runner busy (an ONNX session stays
    /// locked), so later requests to that model wait behind it.
    pub timeout_ms: Option<u64>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_models: None,
            timeout_ms: None,
        }
    }
}

impl EnsembleConfig {
    /// Check the config against the number of configured models.
    pub fn validate(&self, model_count: usize) -> Result<(), ConfigError> {
        if model_count == 0 {
            return Err(ConfigError::NoModels);
        }
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::Threshold(self.threshold));
        }
        match self.min_models {
            Some(0) => Err(ConfigError::ZeroQuorum),
            Some(min) if min > model_count => Err(ConfigError::QuorumTooLarge {
                min,
                available: model_count,
            }),
            _ => Ok(()),
        }
    }

    /// Verdicts required out of `model_count`.
    pub fn quorum(&self, model_count: usize) -> usize {
        self.min_models.unwrap_or(model_count).max(1)
    }

    /// Whether requests may proceed without every model.
    pub fn partial_quorum(&self, model_count: usize) -> bool {
        self.quorum(model_count) < model_count
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Aggregator for `model_count` models with an explicit threshold.
    pub fn aggregator(&self, model_count: usize, threshold: f32) -> Result<Aggregator, ConfigError> {
        let aggregator = Aggregator::new(threshold).map_err(|_| ConfigError::Threshold(threshold))?;
        Ok(aggregator.with_quorum(self.quorum(model_count)))
    }
}
