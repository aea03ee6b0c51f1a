//! Collaborator contracts: embedding providers and model runners.

use async_trait::async_trait;

use crate::error::{InferenceError, ProviderError};
use crate::types::{MissingProbabilities, RawModelOutput};

/// Maps text to a fixed-length embedding.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// One trained classifier, loaded once and shared across requests.
pub trait ModelRunner: Send + Sync {
    /// Name used in results and error reports.
    fn name(&self) -> &str;

    /// Embedding dimensionality the model was built for.
    fn dim(&self) -> usize;

    /// Policy applied when [`infer`](Self::infer) returns no probabilities.
    fn missing_probabilities(&self) -> MissingProbabilities {
        MissingProbabilities::AssumeCertain
    }

    /// Run the model on one embedding.
    fn infer(&self, embedding: &[f32]) -> Result<RawModelOutput, InferenceError>;
}

/// Fail with [`InferenceError::DimensionMismatch`] unless `embedding` has `dim` values.
pub fn check_dim(embedding: &[f32], dim: usize) -> Result<(), InferenceError> {
    if embedding.len() != dim {
        return Err(InferenceError::DimensionMismatch {
            expected: dim,
            got: embedding.len(),
        });
    }
    Ok(())
}
