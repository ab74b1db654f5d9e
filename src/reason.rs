//! Reasoning stage — tier 3, deliberation through an injected external
//! reasoner.
//!
//! The reasoner is treated as advice, not authority: the decision cache is
//! consulted first, the call is hard-bounded by a budget, any failure falls
//! back to the tentative verdict carried in from the earlier tiers (a block
//! is never fabricated on reasoner failure), and low-confidence blocks are
//! downgraded to warnings by the conservative floor.  Together these keep
//! the only non-deterministic stage from breaking the pipeline's
//! determinism and latency contracts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::DecisionCache;
use crate::config::PipelineConfig;
use crate::stage::{Deadline, StageError, StageRequest, StageVerdict, TierStage};
use crate::verdict::{Action, FailureClass, Method, Severity, Tier, Verdict};

// ── Reasoner interface ─────────────────────────────────────────────────

/// Structured answer returned by a reasoner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonerJudgment {
    /// Class the reasoner assigned.
    pub failure_class: FailureClass,
    /// Action the reasoner proposes (policy still has the final word).
    pub action: Action,
    /// Reasoner confidence in `[0, 1]`.
    pub confidence: f32,
    /// Free-text rationale for audit logs.
    pub rationale: String,
}

/// Hints forwarded to the reasoner alongside the payload.
#[derive(Debug, Clone, Default)]
pub struct ReasonHints {
    /// Best-match class from the earlier tiers, if any.
    pub candidate_class: Option<FailureClass>,
    /// Confidence of that candidate.
    pub candidate_confidence: f32,
    /// Request context map.
    pub context: FxHashMap<String, String>,
}

/// Errors raised by a reasoner backend.
#[derive(Debug, Error)]
pub enum ReasonerError {
    /// The backend is unreachable.
    #[error("reasoner unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but the answer could not be parsed into a
    /// [`ReasonerJudgment`].
    #[error("reasoner answer unparseable: {0}")]
    Parse(String),

    /// The backend could not finish before the deadline.
    #[error("reasoner deadline exceeded")]
    DeadlineExceeded,
}

/// External deliberation interface.
///
/// # Contract
///
/// Implementations must never block past `deadline` — return
/// [`ReasonerError::DeadlineExceeded`] instead — and must report parse
/// failures as structured errors rather than fabricating a judgment.
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Deliberate over the payload and return a structured judgment.
    ///
    /// # Errors
    ///
    /// Returns [`ReasonerError`] on unavailability, parse failure, or
    /// timeout.
    async fn deliberate(
        &self,
        text: &str,
        hints: &ReasonHints,
        deadline: Deadline,
    ) -> Result<ReasonerJudgment, ReasonerError>;
}

// ── ReasoningStage ─────────────────────────────────────────────────────

/// Tier-3 stage wrapping an injected [`Reasoner`].
pub struct ReasoningStage {
    reasoner: Arc<dyn Reasoner>,
    cache: Arc<DecisionCache>,
    call_budget: Duration,
    floor: f32,
}

impl ReasoningStage {
    /// Build the stage around an injected reasoner and the shared decision
    /// cache.
    #[must_use]
    pub fn new(
        reasoner: Arc<dyn Reasoner>,
        cache: Arc<DecisionCache>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            reasoner,
            cache,
            call_budget: Duration::from_millis(config.reason_timeout_ms),
            floor: config.reason_floor,
        }
    }

    /// Finalize the carried tentative verdict after a reasoner failure.
    fn fallback(&self, request: &StageRequest, why: &str) -> Verdict {
        match &request.carried {
            Some(carried) => {
                let severity = if carried.failure_class == FailureClass::None {
                    Severity::Info
                } else {
                    request.snapshot.policy.severity(carried.failure_class)
                };
                Verdict::new(
                    carried.proposed_action,
                    carried.tier,
                    Method::ReasonFallback,
                    carried.failure_class,
                    severity,
                    carried.confidence,
                    format!("{why}; tentative verdict finalized: {}", carried.explanation),
                )
            }
            None => Verdict::clean(
                Tier::Reasoning,
                Method::ReasonFallback,
                0.50,
                format!("{why}; no tentative verdict carried"),
            ),
        }
    }
}

#[async_trait]
impl TierStage for ReasoningStage {
    fn tier(&self) -> Tier {
        Tier::Reasoning
    }

    fn id(&self) -> &'static str {
        "reason"
    }

    async fn evaluate(
        &self,
        request: &StageRequest,
        deadline: Deadline,
    ) -> Result<StageVerdict, StageError> {
        let snapshot = &request.snapshot;

        // Cache first: a repeat of a previously deliberated payload must
        // not reach the non-deterministic backend again.
        let key = DecisionCache::key(
            &request.normalized,
            &snapshot.version,
            snapshot.index.content_hash(),
        );
        if let Some(hit) = self.cache.get(&key) {
            return Ok(StageVerdict::Terminal(hit));
        }

        let hints = ReasonHints {
            candidate_class: request.carried.as_ref().map(|c| c.failure_class),
            candidate_confidence: request.carried.as_ref().map_or(0.0, |c| c.confidence),
            context: request.context.clone(),
        };

        let budget = self.call_budget.min(deadline.remaining());
        let call_deadline = Deadline::after(budget);
        let outcome = tokio::time::timeout(
            budget,
            self.reasoner.deliberate(&request.normalized, &hints, call_deadline),
        )
        .await;

        let judgment = match outcome {
            Ok(Ok(judgment)) if (0.0..=1.0).contains(&judgment.confidence) => judgment,
            Ok(Ok(judgment)) => {
                tracing::warn!(
                    confidence = f64::from(judgment.confidence),
                    "reasoner returned out-of-range confidence, falling back",
                );
                return Ok(StageVerdict::Terminal(
                    self.fallback(request, "reasoner confidence out of range"),
                ));
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "reasoner failed, falling back");
                return Ok(StageVerdict::Terminal(
                    self.fallback(request, "reasoner failed"),
                ));
            }
            Err(_) => {
                tracing::warn!(budget_ms = budget.as_millis() as u64, "reasoner timed out");
                return Ok(StageVerdict::Terminal(
                    self.fallback(request, "reasoner timed out"),
                ));
            }
        };

        // Policy has the final word on the action for the class.
        let class = judgment.failure_class;
        let (mut action, severity) = snapshot.policy.decide(class);

        // Conservative floor: a low-confidence block from the only
        // non-deterministic stage becomes a warning.
        if action == Action::Block && judgment.confidence < self.floor {
            action = Action::Warn;
        }

        let verdict = Verdict::new(
            action,
            Tier::Reasoning,
            Method::Reason,
            class,
            if class == FailureClass::None {
                Severity::Info
            } else {
                severity
            },
            judgment.confidence,
            judgment.rationale,
        );
        self.cache.put(key, &verdict);
        Ok(StageVerdict::Terminal(verdict))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use crate::stage::{CancelFlag, Escalation};

    struct FixedReasoner {
        judgment: ReasonerJudgment,
    }

    #[async_trait]
    impl Reasoner for FixedReasoner {
        async fn deliberate(
            &self,
            _text: &str,
            _hints: &ReasonHints,
            _deadline: Deadline,
        ) -> Result<ReasonerJudgment, ReasonerError> {
            Ok(self.judgment.clone())
        }
    }

    struct FailingReasoner;

    #[async_trait]
    impl Reasoner for FailingReasoner {
        async fn deliberate(
            &self,
            _text: &str,
            _hints: &ReasonHints,
            _deadline: Deadline,
        ) -> Result<ReasonerJudgment, ReasonerError> {
            Err(ReasonerError::Unavailable("backend down".into()))
        }
    }

    fn request(text: &str, carried: Option<Escalation>) -> StageRequest {
        StageRequest {
            normalized: text.to_string(),
            pattern_text: text.to_string(),
            vector_text: text.to_string(),
            context: FxHashMap::default(),
            correlation_id: None,
            carried,
            snapshot: Arc::new(Snapshot::builtin_for_tests()),
            cancel: CancelFlag::new(),
        }
    }

    fn carried_semantic() -> Escalation {
        Escalation {
            failure_class: FailureClass::PromptInjection,
            confidence: 0.68,
            proposed_action: Action::Block,
            method: Method::Semantic,
            tier: Tier::Semantic,
            explanation: "exemplar similarity 0.68".into(),
        }
    }

    fn stage(reasoner: Arc<dyn Reasoner>) -> (ReasoningStage, Arc<DecisionCache>) {
        let cache = Arc::new(DecisionCache::new(64));
        let stage = ReasoningStage::new(reasoner, Arc::clone(&cache), &PipelineConfig::default());
        (stage, cache)
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    fn terminal(v: StageVerdict) -> Verdict {
        match v {
            StageVerdict::Terminal(v) => v,
            StageVerdict::Escalate(_) => panic!("tier 3 never escalates"),
        }
    }

    #[tokio::test]
    async fn confident_block_passes_through() {
        let (stage, _) = stage(Arc::new(FixedReasoner {
            judgment: ReasonerJudgment {
                failure_class: FailureClass::PromptInjection,
                action: Action::Block,
                confidence: 0.85,
                rationale: "clear jailbreak framing".into(),
            },
        }));
        let v = terminal(
            stage
                .evaluate(&request("some text", Some(carried_semantic())), deadline())
                .await
                .unwrap(),
        );
        assert_eq!(v.action, Action::Block);
        assert_eq!(v.method, Method::Reason);
        assert_eq!(v.tier_used, Tier::Reasoning);
        assert!(v.confidence >= 0.70);
    }

    #[tokio::test]
    async fn low_confidence_block_downgrades_to_warn() {
        let (stage, _) = stage(Arc::new(FixedReasoner {
            judgment: ReasonerJudgment {
                failure_class: FailureClass::PromptInjection,
                action: Action::Block,
                confidence: 0.55,
                rationale: "weak signal".into(),
            },
        }));
        let v = terminal(
            stage
                .evaluate(&request("some text", Some(carried_semantic())), deadline())
                .await
                .unwrap(),
        );
        assert_eq!(v.action, Action::Warn);
        assert_eq!(v.method, Method::Reason);
    }

    #[tokio::test]
    async fn failure_falls_back_to_carried_verdict() {
        let (stage, _) = stage(Arc::new(FailingReasoner));
        let v = terminal(
            stage
                .evaluate(&request("some text", Some(carried_semantic())), deadline())
                .await
                .unwrap(),
        );
        assert_eq!(v.method, Method::ReasonFallback);
        assert_eq!(v.failure_class, FailureClass::PromptInjection);
        assert_eq!(v.tier_used, Tier::Semantic);
        assert!((v.confidence - 0.68).abs() < 1e-6);
    }

    #[tokio::test]
    async fn failure_without_carried_verdict_allows() {
        let (stage, _) = stage(Arc::new(FailingReasoner));
        let v = terminal(
            stage
                .evaluate(&request("some text", None), deadline())
                .await
                .unwrap(),
        );
        assert_eq!(v.action, Action::Allow);
        assert_eq!(v.method, Method::ReasonFallback);
    }

    #[tokio::test]
    async fn timeout_falls_back() {
        struct SlowReasoner;

        #[async_trait]
        impl Reasoner for SlowReasoner {
            async fn deliberate(
                &self,
                _text: &str,
                _hints: &ReasonHints,
                _deadline: Deadline,
            ) -> Result<ReasonerJudgment, ReasonerError> {
                tokio::time::sleep(Duration::from_secs(120)).await;
                unreachable!("the timeout fires first")
            }
        }

        let cache = Arc::new(DecisionCache::new(64));
        let mut config = PipelineConfig::default();
        config.reason_timeout_ms = 20;
        let stage = ReasoningStage::new(Arc::new(SlowReasoner), cache, &config);
        let v = terminal(
            stage
                .evaluate(&request("some text", Some(carried_semantic())), deadline())
                .await
                .unwrap(),
        );
        assert_eq!(v.method, Method::ReasonFallback);
    }

    #[tokio::test]
    async fn successful_verdict_is_cached_and_replayed() {
        let (stage, cache) = stage(Arc::new(FixedReasoner {
            judgment: ReasonerJudgment {
                failure_class: FailureClass::Toxicity,
                action: Action::Block,
                confidence: 0.9,
                rationale: "direct insult".into(),
            },
        }));
        let req = request("you are worthless", Some(carried_semantic()));

        let first = terminal(stage.evaluate(&req, deadline()).await.unwrap());
        assert!(!first.cache_hit);
        assert_eq!(cache.len(), 1);

        let second = terminal(stage.evaluate(&req, deadline()).await.unwrap());
        assert!(second.cache_hit);
        assert_eq!(second.action, first.action);
        assert_eq!(second.failure_class, first.failure_class);
    }

    #[tokio::test]
    async fn policy_overrides_reasoner_action() {
        // Reasoner says allow, but policy blocks toxicity: the class's
        // policy action wins.
        let (stage, _) = stage(Arc::new(FixedReasoner {
            judgment: ReasonerJudgment {
                failure_class: FailureClass::Toxicity,
                action: Action::Allow,
                confidence: 0.95,
                rationale: "looks fine to me".into(),
            },
        }));
        let v = terminal(
            stage
                .evaluate(&request("borderline", Some(carried_semantic())), deadline())
                .await
                .unwrap(),
        );
        assert_eq!(v.action, Action::Block);
    }
}
