//! End-to-end intent classification.
//!
//! Embeds the query once, fans the embedding out to every model runner in
//! parallel, resolves each raw output to a verdict, and aggregates the
//! verdicts once every runner has answered (or the deadline has passed).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use intentvote_core::{
    Aggregator, ClassifyError, ConfigError, EmbeddingProvider, EnsembleConfig, EnsembleResult,
    InferenceError, LabelMapping, ModelRunner, ModelVerdict, RawModelOutput,
};
use tracing::{debug, info, warn};

/// Ensemble intent classifier.
///
/// Built once at startup; the provider, runners, and label mapping are
/// shared read-only by every request.
pub struct IntentClassifier {
    provider: Arc<dyn EmbeddingProvider>,
    runners: Vec<Arc<dyn ModelRunner>>,
    labels: Arc<LabelMapping>,
    config: EnsembleConfig,
}

/// Builder for [`IntentClassifier`]. Runners are queried in the order added.
pub struct IntentClassifierBuilder {
    provider: Arc<dyn EmbeddingProvider>,
    runners: Vec<Arc<dyn ModelRunner>>,
    labels: Arc<LabelMapping>,
    config: EnsembleConfig,
}

impl IntentClassifierBuilder {
    pub fn runner(mut self, runner: Arc<dyn ModelRunner>) -> Self {
        self.runners.push(runner);
        self
    }

    pub fn runners(mut self, runners: impl IntoIterator<Item = Arc<dyn ModelRunner>>) -> Self {
        self.runners.extend(runners);
        self
    }

    pub fn config(mut self, config: EnsembleConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and assemble the classifier.
    ///
    /// Runner names must be unique and every runner must expect the same
    /// embedding dimension.
    pub fn build(self) -> Result<IntentClassifier, ConfigError> {
        self.config.validate(self.runners.len())?;

        let mut names = HashSet::new();
        for runner in &self.runners {
            if !names.insert(runner.name()) {
                return Err(ConfigError::DuplicateModel(runner.name().to_string()));
            }
        }

        if let Some((first, rest)) = self.runners.split_first()
            && let Some(other) = rest.iter().find(|r| r.dim() != first.dim())
        {
            return Err(ConfigError::DimensionDisagreement {
                model: other.name().to_string(),
                dim: other.dim(),
                first: first.name().to_string(),
                expected: first.dim(),
            });
        }

        info!(
            models = self.runners.len(),
            quorum = self.config.quorum(self.runners.len()),
            threshold = self.config.threshold,
            "intent classifier ready"
        );
        Ok(IntentClassifier {
            provider: self.provider,
            runners: self.runners,
            labels: self.labels,
            config: self.config,
        })
    }
}

impl IntentClassifier {
    pub fn builder(
        provider: Arc<dyn EmbeddingProvider>,
        labels: Arc<LabelMapping>,
    ) -> IntentClassifierBuilder {
        IntentClassifierBuilder {
            provider,
            runners: Vec::new(),
            labels,
            config: EnsembleConfig::default(),
        }
    }

    /// Classify `text` with the configured threshold.
    pub async fn classify(&self, text: &str) -> Result<EnsembleResult, ClassifyError> {
        self.classify_with_threshold(text, self.config.threshold).await
    }

    /// Classify `text` with a caller-supplied threshold in [0, 1].
    pub async fn classify_with_threshold(
        &self,
        text: &str,
        threshold: f32,
    ) -> Result<EnsembleResult, ClassifyError> {
        // Reject a bad threshold before spending an embedding call on it.
        let aggregator = self.aggregator(threshold)?;
        let embedding = self.provider.embed(text).await?;
        debug!(dim = embedding.len(), "embedded query");
        self.run_ensemble(embedding.into(), aggregator).await
    }

    /// Classify a precomputed embedding with the configured threshold.
    pub async fn classify_embedding(
        &self,
        embedding: Vec<f32>,
    ) -> Result<EnsembleResult, ClassifyError> {
        let aggregator = self.aggregator(self.config.threshold)?;
        self.run_ensemble(embedding.into(), aggregator).await
    }

    /// Model names in query order.
    pub fn model_names(&self) -> Vec<&str> {
        self.runners.iter().map(|r| r.name()).collect()
    }

    /// Embedding dimension shared by every runner.
    pub fn dim(&self) -> Option<usize> {
        self.runners.first().map(|r| r.dim())
    }

    pub fn labels(&self) -> &LabelMapping {
        &self.labels
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    fn aggregator(&self, threshold: f32) -> Result<Aggregator, ClassifyError> {
        Ok(Aggregator::new(threshold)?.with_quorum(self.config.quorum(self.runners.len())))
    }

    async fn run_ensemble(
        &self,
        embedding: Arc<[f32]>,
        aggregator: Aggregator,
    ) -> Result<EnsembleResult, ClassifyError> {
        let outcomes = self.fan_out(embedding).await;
        let partial = self.config.partial_quorum(self.runners.len());

        let mut verdicts = Vec::with_capacity(self.runners.len());
        for (runner, outcome) in self.runners.iter().zip(outcomes) {
            let name = runner.name();
            let verdict = outcome.and_then(|output| {
                ModelVerdict::from_output(name, &output, runner.missing_probabilities(), &self.labels)
            });

            match verdict {
                Ok(verdict) => {
                    debug!(
                        model = name,
                        label = verdict.label(),
                        confidence = verdict.confidence(),
                        "model verdict"
                    );
                    verdicts.push((name.to_string(), verdict));
                }
                // A runner that missed the deadline contributes nothing; the
                // aggregator's quorum decides whether that is fatal.
                Err(ClassifyError::Inference {
                    source: InferenceError::TimedOut(limit),
                    ..
                }) => {
                    warn!(model = name, ?limit, "model timed out, no verdict");
                }
                Err(e @ ClassifyError::Inference { .. }) if partial => {
                    warn!(model = name, error = %e, "dropping failed model from ensemble");
                }
                Err(e) => return Err(e),
            }
        }

        let result = aggregator.aggregate(&verdicts)?;
        info!(
            label = %result.label,
            confidence = result.confidence,
            models = verdicts.len(),
            "classified"
        );
        Ok(result)
    }

    /// Run every runner on its own blocking thread and wait for all of them.
    ///
    /// Outcomes are returned in runner order. A blocking task that outlives
    /// the deadline is detached and still runs to completion.
    async fn fan_out(
        &self,
        embedding: Arc<[f32]>,
    ) -> Vec<Result<RawModelOutput, ClassifyError>> {
        let timeout = self.config.timeout();
        let tasks = self.runners.iter().map(|runner| {
            let runner = Arc::clone(runner);
            let embedding = Arc::clone(&embedding);
            async move {
                let name = runner.name().to_string();
                let task = tokio::task::spawn_blocking(move || runner.infer(&embedding));
                let joined = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, task).await {
                        Ok(joined) => joined,
                        Err(_) => return Err(timed_out(name, limit)),
                    },
                    None => task.await,
                };
                match joined {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(e)) => Err(ClassifyError::inference(name, e)),
                    Err(_) => Err(ClassifyError::inference(name, InferenceError::Panicked)),
                }
            }
        });
        join_all(tasks).await
    }
}

fn timed_out(model: String, limit: Duration) -> ClassifyError {
    ClassifyError::inference(model, InferenceError::TimedOut(limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    use async_trait::async_trait;
    use intentvote_core::{ABSTAIN_LABEL, MissingProbabilities, ProviderError};

    const DIM: usize = 4;

    struct FixedProvider(Vec<f32>);

    #[async_trait]
    impl EmbeddingProvider for FixedProvider {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Ok(self.0.clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::Unreachable("connection refused".into()))
        }
    }

    type InferFn = dyn Fn(&[f32]) -> Result<RawModelOutput, InferenceError> + Send + Sync;

    struct FakeRunner {
        name: String,
        dim: usize,
        policy: MissingProbabilities,
        infer: Box<InferFn>,
    }

    impl FakeRunner {
        fn new(
            name: &str,
            infer: impl Fn(&[f32]) -> Result<RawModelOutput, InferenceError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                name: name.to_string(),
                dim: DIM,
                policy: MissingProbabilities::AssumeCertain,
                infer: Box::new(infer),
            }
        }

        /// Runner that always answers `code` with top probability `confidence` (>= 1/3).
        fn answering(name: &str, code: i64, confidence: f32) -> Arc<dyn ModelRunner> {
            Arc::new(Self::new(name, move |_| {
                let rest = (1.0 - confidence) / 2.0;
                Ok(RawModelOutput::new(code).with_probabilities(vec![confidence, rest, rest]))
            }))
        }

        fn failing(name: &str) -> Arc<dyn ModelRunner> {
            Arc::new(Self::new(name, |_| {
                Err(InferenceError::Runtime("session crashed".into()))
            }))
        }
    }

    impl ModelRunner for FakeRunner {
        fn name(&self) -> &str {
            &self.name
        }

        fn dim(&self) -> usize {
            self.dim
        }

        fn missing_probabilities(&self) -> MissingProbabilities {
            self.policy
        }

        fn infer(&self, embedding: &[f32]) -> Result<RawModelOutput, InferenceError> {
            intentvote_core::check_dim(embedding, self.dim)?;
            (self.infer)(embedding)
        }
    }

    fn labels() -> Arc<LabelMapping> {
        Arc::new(
            LabelMapping::from_json_str(r#"{"0": "billing", "1": "shipping", "2": "returns"}"#)
                .unwrap(),
        )
    }

    fn classifier(runners: Vec<Arc<dyn ModelRunner>>, config: EnsembleConfig) -> IntentClassifier {
        IntentClassifier::builder(Arc::new(FixedProvider(vec![0.5; DIM])), labels())
            .runners(runners)
            .config(config)
            .build()
            .unwrap()
    }

    fn standard(codes: [(i64, f32); 3]) -> Vec<Arc<dyn ModelRunner>> {
        vec![
            FakeRunner::answering("logistic_regression", codes[0].0, codes[0].1),
            FakeRunner::answering("svm", codes[1].0, codes[1].1),
            FakeRunner::answering("knn", codes[2].0, codes[2].1),
        ]
    }

    #[tokio::test]
    async fn majority_label_with_mean_confidence() {
        let clf = classifier(
            standard([(1, 0.9), (1, 0.8), (2, 0.7)]),
            EnsembleConfig::default(),
        );
        let r = clf.classify("where is my parcel").await.unwrap();
        assert_eq!(r.label, "shipping");
        assert!((r.confidence - 0.8).abs() < 1e-6);
        assert_eq!(r.votes, vec![("shipping".to_string(), 2), ("returns".to_string(), 1)]);
        assert_eq!(
            r.verdicts.iter().map(|(m, _)| m.as_str()).collect::<Vec<_>>(),
            vec!["logistic_regression", "svm", "knn"]
        );
    }

    #[tokio::test]
    async fn three_way_split_takes_first_queried() {
        let clf = classifier(
            standard([(0, 0.9), (1, 0.9), (2, 0.9)]),
            EnsembleConfig::default(),
        );
        assert_eq!(clf.classify("hmm").await.unwrap().label, "billing");
    }

    #[tokio::test]
    async fn low_confidence_abstains() {
        let clf = classifier(
            standard([(0, 0.4), (0, 0.4), (0, 0.4)]),
            EnsembleConfig::default(),
        );
        let r = clf.classify("?").await.unwrap();
        assert_eq!(r.label, ABSTAIN_LABEL);
        assert!((r.confidence - 0.4).abs() < 1e-6);
    }

    #[tokio::test]
    async fn caller_threshold_overrides_config() {
        let clf = classifier(
            standard([(0, 0.6), (0, 0.6), (0, 0.6)]),
            EnsembleConfig::default(),
        );
        assert_eq!(clf.classify_with_threshold("x", 0.0).await.unwrap().label, "billing");
        assert_eq!(
            clf.classify_with_threshold("x", 1.0).await.unwrap().label,
            ABSTAIN_LABEL
        );
        assert!(matches!(
            clf.classify_with_threshold("x", 2.0).await,
            Err(ClassifyError::InvalidThreshold(_))
        ));
    }

    #[tokio::test]
    async fn provider_failure_surfaces() {
        let clf = IntentClassifier::builder(Arc::new(FailingProvider), labels())
            .runners(standard([(0, 0.9), (0, 0.9), (0, 0.9)]))
            .build()
            .unwrap();
        let err = clf.classify("hello").await.unwrap_err();
        assert!(matches!(err, ClassifyError::Provider(ProviderError::Unreachable(_))));
        assert_eq!(err.stage(), "embedding");
    }

    #[tokio::test]
    async fn unknown_label_code_is_fatal_even_with_partial_quorum() {
        let runners = vec![
            FakeRunner::answering("logistic_regression", 0, 0.9),
            FakeRunner::answering("svm", 42, 0.9),
            FakeRunner::answering("knn", 0, 0.9),
        ];
        let clf = classifier(
            runners,
            EnsembleConfig {
                min_models: Some(1),
                ..Default::default()
            },
        );
        let err = clf.classify("hello").await.unwrap_err();
        assert!(matches!(
            err,
            ClassifyError::Configuration { ref model, ref code } if model == "svm" && code == "42"
        ));
    }

    #[tokio::test]
    async fn runner_failure_is_fatal_by_default() {
        let runners = vec![
            FakeRunner::answering("logistic_regression", 0, 0.9),
            FakeRunner::failing("svm"),
            FakeRunner::answering("knn", 0, 0.9),
        ];
        let clf = classifier(runners, EnsembleConfig::default());
        let err = clf.classify("hello").await.unwrap_err();
        assert_eq!(err.model(), Some("svm"));
        assert!(matches!(
            err,
            ClassifyError::Inference {
                source: InferenceError::Runtime(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn partial_quorum_drops_failed_runner() {
        let runners = vec![
            FakeRunner::answering("logistic_regression", 2, 0.9),
            FakeRunner::failing("svm"),
            FakeRunner::answering("knn", 2, 0.7),
        ];
        let clf = classifier(
            runners,
            EnsembleConfig {
                min_models: Some(2),
                ..Default::default()
            },
        );
        let r = clf.classify("send it back").await.unwrap();
        assert_eq!(r.label, "returns");
        assert_eq!(r.verdicts.len(), 2);
        assert!(r.verdict("svm").is_none());
        assert!((r.confidence - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn partial_quorum_still_enforces_minimum() {
        let runners = vec![
            FakeRunner::answering("logistic_regression", 2, 0.9),
            FakeRunner::failing("svm"),
            FakeRunner::failing("knn"),
        ];
        let clf = classifier(
            runners,
            EnsembleConfig {
                min_models: Some(2),
                ..Default::default()
            },
        );
        let err = clf.classify("x").await.unwrap_err();
        assert!(matches!(err, ClassifyError::Quorum { got: 1, need: 2 }));
    }

    #[tokio::test]
    async fn panicking_runner_reported() {
        let runners: Vec<Arc<dyn ModelRunner>> = vec![
            FakeRunner::answering("logistic_regression", 0, 0.9),
            Arc::new(FakeRunner::new("svm", |_| panic!("boom"))),
        ];
        let clf = classifier(runners, EnsembleConfig::default());
        let err = clf.classify("x").await.unwrap_err();
        assert!(matches!(
            err,
            ClassifyError::Inference {
                ref model,
                source: InferenceError::Panicked,
            } if model == "svm"
        ));
    }

    #[tokio::test]
    async fn timeout_without_partial_quorum_is_quorum_error() {
        let runners: Vec<Arc<dyn ModelRunner>> = vec![
            FakeRunner::answering("logistic_regression", 0, 0.9),
            Arc::new(FakeRunner::new("svm", |_| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(RawModelOutput::new(0))
            })),
        ];
        let clf = classifier(
            runners,
            EnsembleConfig {
                timeout_ms: Some(50),
                ..Default::default()
            },
        );
        let err = clf.classify("x").await.unwrap_err();
        assert!(matches!(err, ClassifyError::Quorum { got: 1, need: 2 }));
    }

    #[tokio::test]
    async fn timed_out_runner_finishes_in_background() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let runners: Vec<Arc<dyn ModelRunner>> = vec![Arc::new(FakeRunner::new("svm", move |_| {
            std::thread::sleep(Duration::from_millis(200));
            flag.store(true, Ordering::SeqCst);
            Ok(RawModelOutput::new(0))
        }))];
        let clf = classifier(
            runners,
            EnsembleConfig {
                timeout_ms: Some(20),
                ..Default::default()
            },
        );

        let err = clf.classify("x").await.unwrap_err();
        assert!(matches!(err, ClassifyError::Quorum { got: 0, need: 1 }));
        assert!(!finished.load(Ordering::SeqCst));

        for _ in 0..100 {
            if finished.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("abandoned inference never completed");
    }

    #[tokio::test]
    async fn timeout_with_partial_quorum_uses_answered_models() {
        let runners: Vec<Arc<dyn ModelRunner>> = vec![
            FakeRunner::answering("logistic_regression", 1, 0.9),
            FakeRunner::answering("svm", 1, 0.7),
            Arc::new(FakeRunner::new("knn", |_| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(RawModelOutput::new(0))
            })),
        ];
        let clf = classifier(
            runners,
            EnsembleConfig {
                min_models: Some(2),
                timeout_ms: Some(100),
                ..Default::default()
            },
        );
        let r = clf.classify("x").await.unwrap();
        assert_eq!(r.label, "shipping");
        assert_eq!(r.verdicts.len(), 2);
    }

    #[tokio::test]
    async fn runners_execute_concurrently() {
        // Each runner blocks until all three are inside infer at once.
        let barrier = Arc::new(Barrier::new(3));
        let runners: Vec<Arc<dyn ModelRunner>> = ["logistic_regression", "svm", "knn"]
            .into_iter()
            .map(|name| {
                let barrier = Arc::clone(&barrier);
                Arc::new(FakeRunner::new(name, move |_| {
                    barrier.wait();
                    Ok(RawModelOutput::new(1))
                })) as Arc<dyn ModelRunner>
            })
            .collect();
        let clf = classifier(
            runners,
            EnsembleConfig {
                timeout_ms: Some(5_000),
                ..Default::default()
            },
        );
        let r = clf.classify("x").await.unwrap();
        assert_eq!(r.label, "shipping");
        assert_eq!(r.confidence, 1.0);
    }

    #[tokio::test]
    async fn reject_policy_fails_runner_without_probabilities() {
        let mut strict = FakeRunner::new("svm", |_| Ok(RawModelOutput::new(0)));
        strict.policy = MissingProbabilities::Reject;
        let runners: Vec<Arc<dyn ModelRunner>> = vec![
            FakeRunner::answering("logistic_regression", 0, 0.9),
            Arc::new(strict),
        ];
        let clf = classifier(runners, EnsembleConfig::default());
        let err = clf.classify("x").await.unwrap_err();
        assert!(matches!(
            err,
            ClassifyError::Inference {
                source: InferenceError::MissingProbabilities,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn dimension_mismatch_names_model() {
        let clf = classifier(
            standard([(0, 0.9), (0, 0.9), (0, 0.9)]),
            EnsembleConfig::default(),
        );
        let err = clf.classify_embedding(vec![0.0; DIM + 1]).await.unwrap_err();
        assert_eq!(err.model(), Some("logistic_regression"));
        assert!(matches!(
            err,
            ClassifyError::Inference {
                source: InferenceError::DimensionMismatch { expected: 4, got: 5 },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn repeated_requests_are_identical() {
        let clf = classifier(
            standard([(0, 0.61), (1, 0.77), (2, 0.93)]),
            EnsembleConfig::default(),
        );
        let a = serde_json::to_string(&clf.classify("x").await.unwrap()).unwrap();
        let b = serde_json::to_string(&clf.classify("x").await.unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn build_rejects_duplicate_names() {
        let err = IntentClassifier::builder(Arc::new(FixedProvider(vec![])), labels())
            .runner(FakeRunner::answering("svm", 0, 0.9))
            .runner(FakeRunner::answering("svm", 1, 0.9))
            .build()
            .err()
            .expect("duplicate runner names should be rejected");
        assert!(matches!(err, ConfigError::DuplicateModel(m) if m == "svm"));
    }

    #[test]
    fn build_rejects_dimension_disagreement() {
        let mut wide = FakeRunner::new("knn", |_| Ok(RawModelOutput::new(0)));
        wide.dim = DIM * 2;
        let err = IntentClassifier::builder(Arc::new(FixedProvider(vec![])), labels())
            .runner(FakeRunner::answering("svm", 0, 0.9))
            .runner(Arc::new(wide))
            .build()
            .err()
            .expect("mismatched dimensions should be rejected");
        assert!(matches!(
            err,
            ConfigError::DimensionDisagreement { ref model, dim: 8, expected: 4, .. } if model == "knn"
        ));
    }

    #[test]
    fn build_rejects_empty_ensemble() {
        let err = IntentClassifier::builder(Arc::new(FixedProvider(vec![])), labels())
            .build()
            .err()
            .expect("an ensemble needs at least one model");
        assert!(matches!(err, ConfigError::NoModels));
    }

    #[test]
    fn accessors() {
        let clf = classifier(
            standard([(0, 0.9), (0, 0.9), (0, 0.9)]),
            EnsembleConfig::default(),
        );
        assert_eq!(clf.model_names(), vec!["logistic_regression", "svm", "knn"]);
        assert_eq!(clf.dim(), Some(DIM));
        assert_eq!(clf.labels().len(), 3);
        assert_eq!(clf.config().threshold, 0.5);
    }
}
