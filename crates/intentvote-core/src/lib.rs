//! Core types for ensemble intent classification: label mapping, verdicts,
//! majority-vote aggregation, configuration and the collaborator traits.

pub mod config;
pub mod ensemble;
pub mod error;
pub mod labels;
pub mod runner;
pub mod types;

pub use config::EnsembleConfig;
pub use ensemble::{Aggregator, aggregate};
pub use error::{ClassifyError, ConfigError, InferenceError, MappingError, ProviderError};
pub use labels::{LabelMapping, MappingSummary};
pub use runner::{EmbeddingProvider, ModelRunner, check_dim};
pub use types::{
    ABSTAIN_LABEL, DEFAULT_THRESHOLD, EnsembleResult, LabelCode, MissingProbabilities,
    ModelVerdict, RawModelOutput,
};
