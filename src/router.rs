//! Router — confidence-based escalation between the tiers, under budget.
//!
//! The router owns the escalation bands and the inflight bounds: tier-1
//! signals inside the gray band (or no signal at all) go to the semantic
//! tier, semantic scores inside the escalation band go to the reasoning
//! tier, and everything else finalizes where it stands.  Before entering a
//! tier the router checks that the remaining budget covers the tier's
//! minimum expected cost; it never starts work it cannot afford to finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::config::PipelineConfig;
use crate::pipeline::PipelineMetrics;
use crate::stage::{Deadline, Escalation, StageError, StageRequest, StageVerdict, TierStage};
use crate::verdict::{Action, FailureClass, Method, Severity, Tier, Verdict};

// ── Router ─────────────────────────────────────────────────────────────

/// Escalation driver over up to three [`TierStage`]s.
pub struct Router {
    tier1: Arc<dyn TierStage>,
    tier2: Option<Arc<dyn TierStage>>,
    tier3: Option<Arc<dyn TierStage>>,
    tier2_permits: Arc<Semaphore>,
    tier3_permits: Arc<Semaphore>,
    gray_low: f32,
    gray_high: f32,
    t2_min_cost: Duration,
    t3_min_cost: Duration,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl Router {
    /// Assemble the router.  `tier2`/`tier3` are `None` when disabled.
    #[must_use]
    pub fn new(
        tier1: Arc<dyn TierStage>,
        tier2: Option<Arc<dyn TierStage>>,
        tier3: Option<Arc<dyn TierStage>>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            tier1,
            tier2,
            tier3,
            tier2_permits: Arc::new(Semaphore::new(config.tier2_permits.max(1))),
            tier3_permits: Arc::new(Semaphore::new(config.tier3_permits.max(1))),
            gray_low: config.t1_gray_low,
            gray_high: config.t1_gray_high,
            t2_min_cost: Duration::from_millis(config.t2_min_cost_ms),
            t3_min_cost: Duration::from_millis(config.t3_min_cost_ms),
            metrics: None,
        }
    }

    /// Attach per-stage latency metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record_latency(&self, tier: Tier, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            let histogram = match tier {
                Tier::Pattern => &metrics.pattern_latency,
                Tier::Semantic => &metrics.semantic_latency,
                Tier::Reasoning => &metrics.reason_latency,
            };
            histogram.record(elapsed.as_millis() as u64);
        }
    }

    /// Route one guarded request to a final verdict.
    ///
    /// # Errors
    ///
    /// Only [`StageError::Internal`] propagates (the orchestrator converts
    /// it into an internal-error verdict); dependency failures are handled
    /// here by falling back along the escalation chain.
    pub async fn route(
        &self,
        request: &mut StageRequest,
        deadline: Deadline,
    ) -> Result<Verdict, StageError> {
        // Tier 1 is always available and infallible.
        let started = std::time::Instant::now();
        let tier1_verdict = self.tier1.evaluate(request, deadline).await?;
        self.record_latency(Tier::Pattern, started.elapsed());
        let escalation = match tier1_verdict {
            StageVerdict::Terminal(v) => return Ok(v),
            StageVerdict::Escalate(e) => e,
        };

        let no_signal = escalation.confidence == 0.0;
        let in_gray =
            escalation.confidence >= self.gray_low && escalation.confidence <= self.gray_high;
        if !no_signal && !in_gray {
            // Sub-band signal: too weak to block, too specific to escalate.
            return Ok(finalize_weak(&escalation));
        }

        request.carried = Some(escalation.clone());

        // ── Tier 2 ─────────────────────────────────────────────────
        let tier2_outcome = match &self.tier2 {
            Some(stage) if self.affordable(deadline, self.t2_min_cost, request) => Some(
                self.run_bounded(stage, &self.tier2_permits, request, deadline)
                    .await,
            ),
            _ => None,
        };

        match tier2_outcome {
            Some(Ok(StageVerdict::Terminal(v))) => Ok(v),
            Some(Ok(StageVerdict::Escalate(tentative))) => {
                request.carried = Some(tentative.clone());
                self.try_tier3(request, deadline, &tentative).await
            }
            Some(Err(StageError::DependencyUnavailable { stage, reason })) => {
                tracing::warn!(stage, reason = %reason, "semantic stage skipped");
                self.try_tier3_or_skip(request, deadline, &escalation).await
            }
            Some(Err(internal)) => Err(internal),
            None => {
                // Tier 2 disabled or unaffordable.
                self.try_tier3_or_skip(request, deadline, &escalation).await
            }
        }
    }

    /// After a tier-2 escalation: consult tier 3 when possible, otherwise
    /// finalize the tentative semantic verdict.
    async fn try_tier3(
        &self,
        request: &StageRequest,
        deadline: Deadline,
        tentative: &Escalation,
    ) -> Result<Verdict, StageError> {
        if let Some(stage) = &self.tier3
            && self.affordable(deadline, self.t3_min_cost, request)
        {
            match self
                .run_bounded(stage, &self.tier3_permits, request, deadline)
                .await
            {
                Ok(StageVerdict::Terminal(v)) => return Ok(v),
                Ok(StageVerdict::Escalate(_)) | Err(StageError::DependencyUnavailable { .. }) => {}
                Err(internal) => return Err(internal),
            }
        }
        Ok(finalize_tentative(request, tentative))
    }

    /// After tier 2 was skipped entirely: consult tier 3 with the tier-1
    /// provisional, otherwise finalize it with the degraded-path downgrade.
    async fn try_tier3_or_skip(
        &self,
        request: &StageRequest,
        deadline: Deadline,
        provisional: &Escalation,
    ) -> Result<Verdict, StageError> {
        if let Some(stage) = &self.tier3
            && self.affordable(deadline, self.t3_min_cost, request)
        {
            match self
                .run_bounded(stage, &self.tier3_permits, request, deadline)
                .await
            {
                Ok(StageVerdict::Terminal(v)) => return Ok(v),
                Ok(StageVerdict::Escalate(_)) | Err(StageError::DependencyUnavailable { .. }) => {}
                Err(internal) => return Err(internal),
            }
        }
        Ok(finalize_skipped(request, provisional))
    }

    fn affordable(&self, deadline: Deadline, min_cost: Duration, request: &StageRequest) -> bool {
        !request.cancel.is_cancelled() && deadline.remaining() >= min_cost
    }

    /// Run a stage under its inflight semaphore; waiting for a permit is
    /// itself bounded by the deadline.
    async fn run_bounded(
        &self,
        stage: &Arc<dyn TierStage>,
        permits: &Arc<Semaphore>,
        request: &StageRequest,
        deadline: Deadline,
    ) -> Result<StageVerdict, StageError> {
        let permit = tokio::time::timeout(deadline.remaining(), permits.acquire())
            .await
            .map_err(|_| StageError::DependencyUnavailable {
                stage: stage.id(),
                reason: "no inflight capacity within the deadline".to_string(),
            })?
            .map_err(|_| StageError::DependencyUnavailable {
                stage: stage.id(),
                reason: "stage capacity closed".to_string(),
            })?;
        let started = std::time::Instant::now();
        let outcome = stage.evaluate(request, deadline).await;
        self.record_latency(stage.tier(), started.elapsed());
        drop(permit);
        outcome
    }
}

// ── Finalizers ─────────────────────────────────────────────────────────

/// A tier-1 signal below the gray band finalizes as a confident allow.
fn finalize_weak(escalation: &Escalation) -> Verdict {
    Verdict::new(
        Action::Allow,
        escalation.tier,
        Method::PatternWeak,
        escalation.failure_class,
        Severity::Low,
        (1.0 - escalation.confidence).clamp(0.0, 1.0),
        format!("signal below the escalation band: {}", escalation.explanation),
    )
}

/// A tier-2 tentative verdict finalizes as-is when tier 3 cannot run.
fn finalize_tentative(request: &StageRequest, tentative: &Escalation) -> Verdict {
    let severity = if tentative.failure_class == FailureClass::None {
        Severity::Info
    } else {
        request.snapshot.policy.severity(tentative.failure_class)
    };
    Verdict::new(
        tentative.proposed_action,
        tentative.tier,
        tentative.method,
        tentative.failure_class,
        severity,
        tentative.confidence,
        tentative.explanation.clone(),
    )
}

/// The tier-1 provisional finalizes when every advanced stage was skipped;
/// a proposed block survives only at terminal confidence.
fn finalize_skipped(request: &StageRequest, provisional: &Escalation) -> Verdict {
    let action = if provisional.proposed_action == Action::Block && provisional.confidence < 0.85 {
        Action::Allow
    } else {
        provisional.proposed_action
    };
    let class = provisional.failure_class;
    let severity = if class == FailureClass::None || action == Action::Allow {
        Severity::Info
    } else {
        request.snapshot.policy.severity(class)
    };
    Verdict::new(
        action,
        provisional.tier,
        Method::SemanticSkipped,
        class,
        severity,
        provisional.confidence,
        format!(
            "advanced stages unavailable; provisional finalized: {}",
            provisional.explanation,
        ),
    )
}

// ── Tests ──────────────────────────────────────────────────────────────
