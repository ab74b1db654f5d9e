//! The [`TierStage`] trait — the shared evaluation contract for all three
//! classifier tiers — plus the deadline/cancellation primitives every stage
//! observes.
//!
//! A stage receives a [`StageRequest`] (the guarded text views, the captured
//! snapshot, and any tentative verdict carried in from an earlier tier) and
//! returns a [`StageVerdict`]: either a terminal [`Verdict`] or an
//! [`Escalation`] for the router to forward to the next tier.  The router is
//! polymorphic over this trait, which lets tiers be independently tested,
//! swapped, or disabled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::snapshot::Snapshot;
use crate::verdict::{Action, FailureClass, Method, Tier, Verdict};

// ── Deadline ───────────────────────────────────────────────────────────

/// An absolute wall-clock deadline propagated through the pipeline.
///
/// Stages check `remaining()` at every suspension point and wrap external
/// calls in `tokio::time::timeout(deadline.remaining(), ..)`.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `budget` from now.
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    /// A deadline at the given instant.
    #[must_use]
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    /// Time left before the deadline, zero if already past.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// The earlier of this deadline and `budget` from now.  Used to derive
    /// per-stage deadlines that never exceed the remaining total budget.
    #[must_use]
    pub fn capped(&self, budget: Duration) -> Self {
        let candidate = Instant::now() + budget;
        Self {
            at: self.at.min(candidate),
        }
    }
}

// ── CancelFlag ─────────────────────────────────────────────────────────

/// Cooperative cancellation signal for one request.
///
/// An upstream cancel (client disconnect) flips the flag; stages observe it
/// at their next suspension point and the orchestrator returns the
/// budget-exhausted verdict.  Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    /// A fresh, un-cancelled flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

// ── Escalation ─────────────────────────────────────────────────────────

/// A tentative verdict carried between tiers when a stage's answer is too
/// weak to terminate.
///
/// The proposed action is already policy-derived; the router either forwards
/// the escalation to the next tier or finalizes it.
#[derive(Debug, Clone)]
pub struct Escalation {
    /// Best-match class so far (`none` when no signal).
    pub failure_class: FailureClass,
    /// Confidence of the best match (`0.0` when no signal).
    pub confidence: f32,
    /// Policy-derived action the escalating stage would have taken.
    pub proposed_action: Action,
    /// Method of the escalating stage, used when the escalation is
    /// finalized without a later tier overriding it.
    pub method: Method,
    /// Tier that produced the escalation.
    pub tier: Tier,
    /// Explanation accumulated so far.
    pub explanation: String,
}

// ── StageVerdict ───────────────────────────────────────────────────────

/// Result of one tier's evaluation.
#[derive(Debug, Clone)]
pub enum StageVerdict {
    /// The stage reached a decision; routing stops here.
    Terminal(Verdict),
    /// The stage's answer is too weak to terminate; the router decides
    /// whether to consult the next tier.
    Escalate(Escalation),
}

impl StageVerdict {
    /// Returns `true` for [`StageVerdict::Terminal`].
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

// ── StageError ─────────────────────────────────────────────────────────

/// An error encountered during stage evaluation.
///
/// Distinct from a "threat detected" verdict — it means the stage *could
/// not complete its analysis*.  Dependency failures are recoverable (the
/// router proceeds to the next available tier); internal errors fail the
/// single request with a conservative block.
#[derive(Debug, Error)]
pub enum StageError {
    /// The stage's backing dependency (encoder, reasoner) is unavailable.
    #[error("dependency unavailable for stage '{stage}': {reason}")]
    DependencyUnavailable {
        /// Stage identifier.
        stage: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// Invariant violation — index dimension mismatch, corrupt snapshot.
    #[error("internal error in stage '{stage}': {reason}")]
    Internal {
        /// Stage identifier.
        stage: &'static str,
        /// What went wrong.
        reason: String,
    },
}

// ── StageRequest ───────────────────────────────────────────────────────

/// Everything a tier needs to evaluate one payload.
///
/// The snapshot is captured once at request entry and held for the whole
/// request, so every tier observes consistent patterns, exemplars, and
/// policy even across a concurrent hot reload.
#[derive(Debug, Clone)]
pub struct StageRequest {
    /// Canonicalized full text (NFKC, control characters stripped,
    /// whitespace collapsed).
    pub normalized: String,
    /// Normalized text truncated to the pattern-stage cap.
    pub pattern_text: String,
    /// Normalized text truncated to the vector-stage cap.
    pub vector_text: String,
    /// Optional request context forwarded to the reasoning stage as hints.
    pub context: FxHashMap<String, String>,
    /// Correlation id for logs.
    pub correlation_id: Option<String>,
    /// Tentative verdict carried in from an earlier tier, if any.
    pub carried: Option<Escalation>,
    /// The snapshot in force for this request.
    pub snapshot: Arc<Snapshot>,
    /// Cooperative cancellation signal.
    pub cancel: CancelFlag,
}

// ── TierStage trait ────────────────────────────────────────────────────

/// One classifier tier.
///
/// # Contract
///
/// - `evaluate` must be deterministic for a fixed input and snapshot
///   (tier 3 is exempt; its non-determinism is contained by the decision
///   cache and the conservative floor).
/// - The stage must return within `deadline`; exceeding it must yield a
///   structured timeout outcome or a [`StageError`], never an unbounded
///   wait.
/// - Implementations must not mutate shared state other than their own
///   bounded memo caches.
#[async_trait]
pub trait TierStage: Send + Sync {
    /// Which tier this stage implements.
    fn tier(&self) -> Tier;

    /// Stable identifier for logs and metrics labels.
    fn id(&self) -> &'static str;

    /// Evaluate the payload.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::DependencyUnavailable`] when a backing
    /// dependency cannot be reached (the router treats the stage as
    /// skipped) and [`StageError::Internal`] on invariant violations (the
    /// request fails closed with an internal-error verdict).
    async fn evaluate(
        &self,
        request: &StageRequest,
        deadline: Deadline,
    ) -> Result<StageVerdict, StageError>;
}

// ── Tests ──────────────────────────────────────────────────────────────
