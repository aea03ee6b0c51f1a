//! ONNX Runtime model runner for scikit-learn classifiers exported with skl2onnx.
//!
//! The model takes a `[1, dim]` float tensor named `float_input` and emits an
//! int64 class label plus, for probabilistic models, a `[1, n_classes]`
//! probability tensor. Output names differ between exporters, so both the
//! `output_*` and bare spellings are accepted.

use std::path::Path;
use std::sync::Mutex;

use intentvote_core::{
    InferenceError, LabelCode, MissingProbabilities, ModelRunner, RawModelOutput, check_dim,
};
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

const INPUT_NAME: &str = "float_input";
const LABEL_OUTPUTS: &[&str] = &["output_label", "label"];
const PROBABILITY_OUTPUTS: &[&str] = &["output_probability", "probability"];

/// A trained classifier loaded into an ONNX Runtime session.
///
/// The session is loaded once and guarded by a mutex so the runner can be
/// shared across concurrent requests.
pub struct OnnxRunner {
    name: String,
    session: Mutex<Session>,
    dim: usize,
    missing_probabilities: MissingProbabilities,
}

impl OnnxRunner {
    /// Load a classifier from an `.onnx` file.
    ///
    /// The embedding dimension is read from the model's input shape.
    pub fn load(name: &str, model_path: &Path) -> anyhow::Result<Self> {
        anyhow::ensure!(model_path.exists(), "model file not found: {model_path:?}");

        let session = Session::builder()?.commit_from_file(model_path)?;

        let dim = session
            .inputs()
            .first()
            .and_then(|input| infer_dim(input.dtype()))
            .ok_or_else(|| {
                anyhow::anyhow!("cannot infer input dimension of {}", model_path.display())
            })?;

        info!(model = name, dim, path = %model_path.display(), "loaded classifier");
        Ok(Self {
            name: name.to_string(),
            session: Mutex::new(session),
            dim,
            missing_probabilities: MissingProbabilities::default(),
        })
    }

    /// Set the policy for models that emit no probability tensor.
    pub fn with_missing_probabilities(mut self, policy: MissingProbabilities) -> Self {
        self.missing_probabilities = policy;
        self
    }
}

impl ModelRunner for OnnxRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn missing_probabilities(&self) -> MissingProbabilities {
        self.missing_probabilities
    }

    fn infer(&self, embedding: &[f32]) -> Result<RawModelOutput, InferenceError> {
        check_dim(embedding, self.dim)?;

        let shape = [1i64, self.dim as i64];
        let input =
            Tensor::from_array((shape, embedding.to_vec().into_boxed_slice())).map_err(runtime)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| InferenceError::Runtime(format!("session mutex poisoned: {e}")))?;
        let outputs = session
            .run(ort::inputs![INPUT_NAME => input])
            .map_err(runtime)?;

        let label_value = LABEL_OUTPUTS
            .iter()
            .find_map(|name| outputs.get(*name))
            .ok_or_else(|| InferenceError::MissingOutput(LABEL_OUTPUTS.join(" | ")))?;
        let (_, labels) = label_value.try_extract_tensor::<i64>().map_err(runtime)?;
        let code = *labels
            .first()
            .ok_or_else(|| InferenceError::MissingOutput("empty label tensor".into()))?;

        // Only the first row: the batch is always one embedding.
        let probabilities = match PROBABILITY_OUTPUTS.iter().find_map(|name| outputs.get(*name)) {
            Some(value) => {
                let (prob_shape, data) = value.try_extract_tensor::<f32>().map_err(runtime)?;
                let dims: &[i64] = prob_shape;
                let classes = dims
                    .last()
                    .and_then(|&d| usize::try_from(d).ok())
                    .unwrap_or(data.len())
                    .min(data.len());
                Some(data[..classes].to_vec())
            }
            None => None,
        };

        debug!(model = %self.name, code, has_probabilities = probabilities.is_some(), "inference done");
        Ok(RawModelOutput {
            label_code: LabelCode::Int(code),
            probabilities,
        })
    }
}

fn runtime(e: impl std::fmt::Display) -> InferenceError {
    InferenceError::Runtime(e.to_string())
}

/// Try to infer the input dimension from the ONNX model input type.
fn infer_dim(input_type: &ort::value::ValueType) -> Option<usize> {
    match input_type {
        ort::value::ValueType::Tensor { shape, .. } => {
            // Last dimension is the feature count; the batch axis is usually dynamic.
            shape
                .last()
                .and_then(|&d| if d > 0 { Some(d as usize) } else { None })
        }
        _ => None,
    }
}
