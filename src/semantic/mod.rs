//! Semantic stage — the tier-2 exemplar-similarity classifier.
//!
//! Encodes the guarded text to a unit vector through the injected
//! [`Embedder`], scores it against the snapshot's [`ExemplarIndex`] with
//! per-class max-pooling, and resolves simultaneously-triggering classes by
//! severity, then score, then class id.  Scores inside the escalation band
//! produce an [`Escalation`] so the router may consult the reasoning tier;
//! everything else terminates here.

pub mod embed;
pub mod exemplars;
pub mod index;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PipelineConfig;
use crate::stage::{Deadline, Escalation, StageError, StageRequest, StageVerdict, TierStage};
use crate::verdict::{Method, Tier, Verdict};

pub use embed::{EmbedError, EmbedMemo, Embedder, HashingEmbedder, unit_normalize};
pub use exemplars::builtin_exemplars;
pub use index::{ClassScore, Exemplar, ExemplarIndex, ExemplarSource, IndexBuilder, IndexError};

// ── SemanticStage ──────────────────────────────────────────────────────

/// Tier-2 classifier over the snapshot's exemplar index.
pub struct SemanticStage {
    embedder: Arc<dyn Embedder>,
    memo: EmbedMemo,
    encode_timeout: Duration,
    certain: f32,
    escalate_floor: f32,
}

impl SemanticStage {
    /// Build the stage around an injected encoder.
    #[must_use]
    pub fn new(embedder: Arc<dyn Embedder>, config: &PipelineConfig) -> Self {
        Self {
            embedder,
            memo: EmbedMemo::new(config.embed_memo_capacity),
            encode_timeout: Duration::from_millis(config.encode_timeout_ms),
            certain: config.t2_certain,
            escalate_floor: config.t2_escalate_floor,
        }
    }

    /// Embed through the memo, bounded by the encode timeout and the
    /// remaining request deadline.
    async fn embed(
        &self,
        text: &str,
        deadline: Deadline,
    ) -> Result<Option<Arc<Vec<f32>>>, StageError> {
        if let Some(cached) = self.memo.get(text) {
            return Ok(Some(cached));
        }

        let budget = self.encode_timeout.min(deadline.remaining());
        let encode_deadline = Deadline::after(budget);
        match tokio::time::timeout(budget, self.embedder.encode(text, encode_deadline)).await {
            Ok(Ok(vector)) => {
                let vector = Arc::new(vector);
                self.memo.put(text, Arc::clone(&vector));
                Ok(Some(vector))
            }
            Ok(Err(EmbedError::DeadlineExceeded)) | Err(_) => Ok(None),
            Ok(Err(EmbedError::Unavailable(reason))) => {
                Err(StageError::DependencyUnavailable {
                    stage: "semantic",
                    reason,
                })
            }
            Ok(Err(EmbedError::DimensionMismatch { expected, got })) => {
                Err(StageError::Internal {
                    stage: "semantic",
                    reason: format!("encoder dimension {got}, expected {expected}"),
                })
            }
        }
    }
}

#[async_trait]
impl TierStage for SemanticStage {
    fn tier(&self) -> Tier {
        Tier::Semantic
    }

    fn id(&self) -> &'static str {
        "semantic"
    }

    async fn evaluate(
        &self,
        request: &StageRequest,
        deadline: Deadline,
    ) -> Result<StageVerdict, StageError> {
        let index = &request.snapshot.index;
        let policy = &request.snapshot.policy;

        let Some(query) = self.embed(&request.vector_text, deadline).await? else {
            // Encoder deadline: synthetic allow tagged so logs can tell it
            // apart from a clean pass.
            tracing::warn!(stage = "semantic", "encoder missed its deadline");
            return Ok(StageVerdict::Terminal(Verdict::clean(
                Tier::Semantic,
                Method::SemanticTimeout,
                0.50,
                "embedding encoder missed its deadline",
            )));
        };

        if query.len() != index.dimension() {
            return Err(StageError::Internal {
                stage: "semantic",
                reason: format!(
                    "query dimension {} does not match index dimension {}",
                    query.len(),
                    index.dimension(),
                ),
            });
        }

        let scores = index.max_pool(&query).map_err(|e| StageError::Internal {
            stage: "semantic",
            reason: e.to_string(),
        })?;

        let max_score = scores.iter().map(|s| s.score).fold(0.0_f32, f32::max);
        let mut triggered: Vec<&ClassScore> = scores
            .iter()
            .filter(|s| s.score >= index.threshold(s.failure_class))
            .collect();

        if triggered.is_empty() {
            let confidence = (1.0 - max_score).clamp(0.0, 1.0);
            return Ok(StageVerdict::Terminal(Verdict::clean(
                Tier::Semantic,
                Method::SemanticClear,
                confidence,
                format!("no exemplar class exceeded its threshold (max score {max_score:.2})"),
            )));
        }

        // Resolution: highest severity, then highest score, then class id.
        triggered.sort_by(|a, b| {
            policy
                .severity(b.failure_class)
                .cmp(&policy.severity(a.failure_class))
                .then(
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.failure_class.as_str().cmp(b.failure_class.as_str()))
        });
        let winner = triggered[0];
        let class = winner.failure_class;
        let confidence = winner.score.clamp(0.0, 1.0);
        let (action, severity) = policy.decide(class);
        let explanation = format!(
            "exemplar similarity {confidence:.2} to class {class} (threshold {:.2})",
            index.threshold(class),
        );

        if confidence >= self.certain || confidence < self.escalate_floor {
            return Ok(StageVerdict::Terminal(Verdict::new(
                action,
                Tier::Semantic,
                Method::Semantic,
                class,
                severity,
                confidence,
                explanation,
            )));
        }

        // Escalation band: tentative — the router may consult tier 3.
        Ok(StageVerdict::Escalate(Escalation {
            failure_class: class,
            confidence,
            proposed_action: action,
            method: Method::Semantic,
            tier: Tier::Semantic,
            explanation,
        }))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use crate::stage::CancelFlag;
    use crate::verdict::{Action, FailureClass};

    /// Embedder that maps marker substrings to fixed axes, so tests can
    /// dial in exact similarity scores.
    struct AxisEmbedder {
        markers: Vec<(&'static str, usize, f32)>,
        dimension: usize,
    }

    #[async_trait]
    impl Embedder for AxisEmbedder {
        fn model_version(&self) -> &str {
            "axis-test-v1"
        }
        fn dimension(&self) -> usize {
            self.dimension
        }
        async fn encode(&self, text: &str, _deadline: Deadline) -> Result<Vec<f32>, EmbedError> {
            let mut v = vec![0.0; self.dimension];
            for (marker, axis, weight) in &self.markers {
                if text.contains(marker) {
                    v[*axis] = *weight;
                }
            }
            if !unit_normalize(&mut v) {
                v[self.dimension - 1] = 1.0;
            }
            Ok(v)
        }
    }

    fn snapshot_with(
        exemplars: Vec<(FailureClass, Vec<f32>, f32)>,
        dimension: usize,
    ) -> Arc<Snapshot> {
        let mut snapshot = Snapshot::builtin_for_tests_with_dim(dimension);
        let mut builder = IndexBuilder::new(dimension);
        for (class, embedding, threshold) in exemplars {
            builder
                .push(Exemplar {
                    failure_class: class,
                    text: format!("exemplar for {class}"),
                    embedding,
                    source: ExemplarSource::Builtin,
                })
                .unwrap();
            builder.set_threshold(class, threshold);
        }
        snapshot.index = builder.build();
        Arc::new(snapshot)
    }

    fn request(text: &str, snapshot: Arc<Snapshot>) -> StageRequest {
        StageRequest {
            normalized: text.to_string(),
            pattern_text: text.to_string(),
            vector_text: text.to_string(),
            context: rustc_hash::FxHashMap::default(),
            correlation_id: None,
            carried: None,
            snapshot,
            cancel: CancelFlag::new(),
        }
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    fn axis(dim: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        v
    }

    fn stage_with(markers: Vec<(&'static str, usize, f32)>, dim: usize) -> SemanticStage {
        SemanticStage::new(
            Arc::new(AxisEmbedder {
                markers,
                dimension: dim,
            }),
            &PipelineConfig::default(),
        )
    }

    #[tokio::test]
    async fn certain_score_terminates_with_block() {
        let dim = 8;
        let snapshot = snapshot_with(
            vec![(FailureClass::Toxicity, axis(dim, 0), 0.70)],
            dim,
        );
        let stage = stage_with(vec![("insult", 0, 1.0)], dim);
        let verdict = stage
            .evaluate(&request("a direct insult here", snapshot), deadline())
            .await
            .unwrap();
        match verdict {
            StageVerdict::Terminal(v) => {
                assert_eq!(v.method, Method::Semantic);
                assert_eq!(v.failure_class, FailureClass::Toxicity);
                assert_eq!(v.action, Action::Block);
                assert!(v.confidence >= 0.78);
            }
            StageVerdict::Escalate(_) => panic!("expected terminal"),
        }
    }

    #[tokio::test]
    async fn band_score_escalates() {
        let dim = 8;
        // Query has components on axes 0 and 1; exemplar on axis 0 only,
        // giving a score of 0.70 — inside [0.60, 0.78).
        let snapshot = snapshot_with(
            vec![(FailureClass::PromptInjection, axis(dim, 0), 0.65)],
            dim,
        );
        let stage = stage_with(vec![("hypothetical", 0, 0.70), ("padding", 1, 0.714_143)], dim);
        let verdict = stage
            .evaluate(&request("hypothetical padding", snapshot), deadline())
            .await
            .unwrap();
        match verdict {
            StageVerdict::Escalate(e) => {
                assert_eq!(e.failure_class, FailureClass::PromptInjection);
                assert!(e.confidence >= 0.60 && e.confidence < 0.78, "{}", e.confidence);
            }
            StageVerdict::Terminal(v) => panic!("expected escalation, got {v:?}"),
        }
    }

    #[tokio::test]
    async fn no_trigger_is_semantic_clear() {
        let dim = 8;
        let snapshot = snapshot_with(
            vec![(FailureClass::Bias, axis(dim, 0), 0.70)],
            dim,
        );
        let stage = stage_with(vec![("unrelated", 3, 1.0)], dim);
        let verdict = stage
            .evaluate(&request("unrelated text", snapshot), deadline())
            .await
            .unwrap();
        match verdict {
            StageVerdict::Terminal(v) => {
                assert_eq!(v.method, Method::SemanticClear);
                assert_eq!(v.action, Action::Allow);
                assert_eq!(v.failure_class, FailureClass::None);
                assert!((v.confidence - 1.0).abs() < 1e-5);
            }
            StageVerdict::Escalate(_) => panic!("expected clear"),
        }
    }

    #[tokio::test]
    async fn severity_breaks_ties_between_classes() {
        let dim = 8;
        // Both classes trigger with the same score; toxicity (critical)
        // outranks overconfidence (medium).
        let snapshot = snapshot_with(
            vec![
                (FailureClass::Overconfidence, axis(dim, 0), 0.50),
                (FailureClass::Toxicity, axis(dim, 0), 0.50),
            ],
            dim,
        );
        let stage = stage_with(vec![("marker", 0, 1.0)], dim);
        let verdict = stage
            .evaluate(&request("marker text", snapshot), deadline())
            .await
            .unwrap();
        match verdict {
            StageVerdict::Terminal(v) => {
                assert_eq!(v.failure_class, FailureClass::Toxicity);
            }
            StageVerdict::Escalate(e) => {
                assert_eq!(e.failure_class, FailureClass::Toxicity);
            }
        }
    }

    #[tokio::test]
    async fn slow_encoder_yields_semantic_timeout() {
        struct SlowEmbedder;

        #[async_trait]
        impl Embedder for SlowEmbedder {
            fn model_version(&self) -> &str {
                "slow-v1"
            }
            fn dimension(&self) -> usize {
                8
            }
            async fn encode(
                &self,
                _text: &str,
                _deadline: Deadline,
            ) -> Result<Vec<f32>, EmbedError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(vec![0.0; 8])
            }
        }

        let snapshot = snapshot_with(vec![(FailureClass::Bias, axis(8, 0), 0.70)], 8);
        let mut config = PipelineConfig::default();
        config.encode_timeout_ms = 20;
        let stage = SemanticStage::new(Arc::new(SlowEmbedder), &config);
        let verdict = stage
            .evaluate(&request("whatever", snapshot), deadline())
            .await
            .unwrap();
        match verdict {
            StageVerdict::Terminal(v) => {
                assert_eq!(v.method, Method::SemanticTimeout);
                assert_eq!(v.action, Action::Allow);
            }
            StageVerdict::Escalate(_) => panic!("expected timeout allow"),
        }
    }

    #[tokio::test]
    async fn unavailable_encoder_is_dependency_error() {
        struct DownEmbedder;

        #[async_trait]
        impl Embedder for DownEmbedder {
            fn model_version(&self) -> &str {
                "down-v1"
            }
            fn dimension(&self) -> usize {
                8
            }
            async fn encode(
                &self,
                _text: &str,
                _deadline: Deadline,
            ) -> Result<Vec<f32>, EmbedError> {
                Err(EmbedError::Unavailable("connection refused".into()))
            }
        }

        let snapshot = snapshot_with(vec![(FailureClass::Bias, axis(8, 0), 0.70)], 8);
        let stage = SemanticStage::new(Arc::new(DownEmbedder), &PipelineConfig::default());
        let err = stage
            .evaluate(&request("whatever", snapshot), deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::DependencyUnavailable { .. }));
    }

    #[tokio::test]
    async fn memo_skips_encoder_on_repeat() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingEmbedder {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl Embedder for CountingEmbedder {
            fn model_version(&self) -> &str {
                "counting-v1"
            }
            fn dimension(&self) -> usize {
                8
            }
            async fn encode(
                &self,
                _text: &str,
                _deadline: Deadline,
            ) -> Result<Vec<f32>, EmbedError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let mut v = vec![0.0; 8];
                v[0] = 1.0;
                Ok(v)
            }
        }

        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let snapshot = snapshot_with(vec![(FailureClass::Bias, axis(8, 1), 0.70)], 8);
        let stage = SemanticStage::new(Arc::clone(&embedder) as Arc<dyn Embedder>, &PipelineConfig::default());

        for _ in 0..3 {
            let _ = stage
                .evaluate(&request("same text", Arc::clone(&snapshot)), deadline())
                .await
                .unwrap();
        }
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }
}
