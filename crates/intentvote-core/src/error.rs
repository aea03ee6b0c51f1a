use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Embedding generation failed. Never retried here.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("embedding service unreachable: {0}")]
    Unreachable(String),

    #[error("embedding service returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("malformed embedding response: {0}")]
    Malformed(String),
}

/// A model runner failed or produced output of an unexpected shape.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("embedding has {got} dimensions, model expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("model output '{0}' not found")]
    MissingOutput(String),

    #[error("model produced no probability distribution and its policy rejects that")]
    MissingProbabilities,

    #[error("invalid probability distribution: {0}")]
    InvalidProbabilities(String),

    #[error("inference runtime error: {0}")]
    Runtime(String),

    #[error("inference task panicked")]
    Panicked,

    #[error("inference did not finish within {0:?}")]
    TimedOut(Duration),
}

/// Failure of a single classification request.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("embedding provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("model '{model}' failed: {source}")]
    Inference {
        model: String,
        #[source]
        source: InferenceError,
    },

    #[error("model '{model}' returned label code '{code}' which has no entry in the label mapping")]
    Configuration { model: String, code: String },

    #[error("quorum not met: {got} verdicts available, {need} required")]
    Quorum { got: usize, need: usize },

    #[error("threshold {0} is outside [0, 1]")]
    InvalidThreshold(f32),

    #[error("model '{0}' contributed more than one verdict")]
    DuplicateModel(String),
}

impl ClassifyError {
    pub fn inference(model: impl Into<String>, source: InferenceError) -> Self {
        Self::Inference {
            model: model.into(),
            source,
        }
    }

    /// Pipeline stage the error originated in.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Provider(_) => "embedding",
            Self::Inference { .. } => "inference",
            Self::Configuration { .. } => "label-resolution",
            Self::Quorum { .. } | Self::InvalidThreshold(_) | Self::DuplicateModel(_) => {
                "aggregation"
            }
        }
    }

    /// Model the error is attributed to, if any.
    pub fn model(&self) -> Option<&str> {
        match self {
            Self::Inference { model, .. }
            | Self::Configuration { model, .. }
            | Self::DuplicateModel(model) => Some(model.as_str()),
            _ => None,
        }
    }
}

/// Label mapping could not be loaded. Fatal at startup.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("cannot read label mapping {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("label mapping is not a JSON object of strings: {0}")]
    Json(#[from] serde_json::Error),

    #[error("label mapping key '{0}' is not an integer")]
    InvalidKey(String),

    #[error("label mapping entry '{0}' has an empty label")]
    InvalidLabel(String),

    #[error("label mapping has more than one entry for code {0}")]
    DuplicateKey(i64),

    #[error("label mapping is empty")]
    Empty,
}

/// Invalid ensemble configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("threshold {0} is outside [0, 1]")]
    Threshold(f32),

    #[error("min_models must be at least 1")]
    ZeroQuorum,

    #[error("min_models {min} exceeds the {available} configured models")]
    QuorumTooLarge { min: usize, available: usize },

    #[error("no models configured")]
    NoModels,

    #[error("model '{0}' is configured more than once")]
    DuplicateModel(String),

    #[error("model '{model}' expects {dim}-dimensional embeddings, '{first}' expects {expected}")]
    DimensionDisagreement {
        model: String,
        dim: usize,
        first: String,
        expected: usize,
    },
}
