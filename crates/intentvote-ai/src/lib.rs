//! Model runners and the ensemble classification pipeline.

mod classifier;
pub use classifier::{IntentClassifier, IntentClassifierBuilder};

#[cfg(feature = "onnx")]
mod runner;
#[cfg(feature = "onnx")]
pub use runner::OnnxRunner;
