mod display;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use intentvote_ai::IntentClassifier;
use intentvote_core::{EnsembleConfig, LabelMapping, MissingProbabilities, ModelRunner};
use intentvote_embed::HttpEmbedder;

const MODEL_FILE_PREFIX: &str = "intent_classifier_";
const LABEL_FILE: &str = "label_mapping.json";

#[derive(Parser)]
#[command(name = "intentvote", version, about = "Ensemble intent classification")]
struct Cli {
    /// Directory holding `intent_classifier_<model>.onnx` and `label_mapping.json`.
    #[arg(long, env = "INTENTVOTE_MODELS_DIR", default_value = "models", global = true)]
    models_dir: PathBuf,

    /// Label mapping file (defaults to `<models-dir>/label_mapping.json`).
    #[arg(long, env = "INTENTVOTE_LABELS", global = true)]
    labels: Option<PathBuf>,

    /// Models to query, in query order. Ties go to the earliest model's label.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "logistic_regression,svm,knn",
        global = true
    )]
    models: Vec<String>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify one or more queries.
    Classify {
        /// Query texts.
        #[arg(required = true)]
        texts: Vec<String>,

        /// Embedding service endpoint.
        #[arg(long, env = "INTENTVOTE_EMBED_URL")]
        embed_url: String,

        /// Bearer token for the embedding service.
        #[arg(long, env = "INTENTVOTE_EMBED_TOKEN", hide_env_values = true)]
        embed_token: Option<String>,

        /// Abstain with "others" when mean confidence is below this.
        #[arg(long, env = "INTENTVOTE_THRESHOLD", default_value_t = intentvote_core::DEFAULT_THRESHOLD)]
        threshold: f32,

        /// Proceed with at least this many models when some fail (default: all).
        #[arg(long, env = "INTENTVOTE_MIN_MODELS")]
        min_models: Option<usize>,

        /// Per-request inference deadline in milliseconds.
        #[arg(long, env = "INTENTVOTE_TIMEOUT_MS")]
        timeout_ms: Option<u64>,

        /// Fail models that expose no probabilities instead of assuming confidence 1.0.
        #[arg(long)]
        reject_missing_probabilities: bool,

        /// Print results as JSON, one object per line.
        #[arg(long)]
        json: bool,
    },
    /// Show the label mapping.
    Labels,
    /// Load every model and the label mapping and report what was found.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let labels_path = cli
        .labels
        .clone()
        .unwrap_or_else(|| cli.models_dir.join(LABEL_FILE));

    match cli.command {
        Command::Classify {
            texts,
            embed_url,
            embed_token,
            threshold,
            min_models,
            timeout_ms,
            reject_missing_probabilities,
            json,
        } => {
            let labels = load_labels(&labels_path)?;
            let policy = if reject_missing_probabilities {
                MissingProbabilities::Reject
            } else {
                MissingProbabilities::AssumeCertain
            };
            let runners = load_runners(&cli.models_dir, &cli.models, policy)?;

            let mut embedder = HttpEmbedder::new(embed_url);
            if let Some(token) = embed_token {
                embedder = embedder.bearer_token(token);
            }

            let config = EnsembleConfig {
                threshold,
                min_models,
                timeout_ms,
            };
            let classifier = IntentClassifier::builder(Arc::new(embedder), Arc::new(labels))
                .runners(runners)
                .config(config)
                .build()
                .context("invalid ensemble configuration")?;

            let mut failed = 0usize;
            for text in &texts {
                match classifier.classify(text).await {
                    Ok(result) if json => {
                        let line = serde_json::json!({ "query": text, "result": result });
                        println!("{line}");
                    }
                    Ok(result) => println!("{}", display::render_result(text, &result)),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}", display::render_error(text, &e));
                    }
                }
            }

            anyhow::ensure!(failed == 0, "{failed} of {} queries failed", texts.len());
        }
        Command::Labels => {
            let labels = load_labels(&labels_path)?;
            print!("{}", display::render_labels(&labels));
        }
        Command::Check => {
            let labels = load_labels(&labels_path)?;
            let runners = load_runners(
                &cli.models_dir,
                &cli.models,
                MissingProbabilities::AssumeCertain,
            )?;
            let summary = labels.summary();
            println!(
                "labels: {} codes, {} distinct labels ({})",
                summary.codes,
                summary.distinct_labels,
                labels_path.display()
            );
            for runner in &runners {
                println!("model {:<24} dim {}", runner.name(), runner.dim());
            }
            if let Some((first, rest)) = runners.split_first() {
                for other in rest {
                    anyhow::ensure!(
                        other.dim() == first.dim(),
                        "model '{}' expects {} dimensions but '{}' expects {}",
                        other.name(),
                        other.dim(),
                        first.name(),
                        first.dim()
                    );
                }
            }
            println!("ok");
        }
    }

    Ok(())
}

fn load_labels(path: &Path) -> anyhow::Result<LabelMapping> {
    LabelMapping::load(path).with_context(|| format!("loading labels from {}", path.display()))
}

fn model_path(models_dir: &Path, name: &str) -> PathBuf {
    models_dir.join(format!("{MODEL_FILE_PREFIX}{name}.onnx"))
}

#[cfg(feature = "onnx")]
fn load_runners(
    models_dir: &Path,
    names: &[String],
    policy: MissingProbabilities,
) -> anyhow::Result<Vec<Arc<dyn ModelRunner>>> {
    use intentvote_ai::OnnxRunner;

    names
        .iter()
        .map(|name| {
            let path = model_path(models_dir, name);
            let runner = OnnxRunner::load(name, &path)
                .with_context(|| format!("loading model '{name}'"))?
                .with_missing_probabilities(policy);
            Ok(Arc::new(runner) as Arc<dyn ModelRunner>)
        })
        .collect()
}

#[cfg(not(feature = "onnx"))]
fn load_runners(
    models_dir: &Path,
    names: &[String],
    _policy: MissingProbabilities,
) -> anyhow::Result<Vec<Arc<dyn ModelRunner>>> {
    let first = names.first().map(|n| model_path(models_dir, n));
    anyhow::bail!("built without the `onnx` feature; cannot load {first:?}")
}
