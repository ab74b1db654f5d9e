//! Core verdict types shared by every stage of the inspection pipeline.
//!
//! A [`Verdict`] is the structured result of inspecting one payload: the
//! enforcement [`Action`], the [`Tier`] that produced it, a [`Method`] label
//! describing *how* it was produced, the detected [`FailureClass`], a
//! [`Severity`], and a confidence score.  Every public entry point of the
//! crate returns a `Verdict` — errors and timeouts included — so callers
//! never have to branch on an error type to decide what to do with a payload.

use serde::{Deserialize, Serialize};

// ── Action ─────────────────────────────────────────────────────────────

/// Enforcement decision for a payload.
///
/// Ordered so that `Allow < Warn < Block` — policy escalation logic can use
/// plain comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Pass the payload through unchanged.
    Allow,
    /// Pass the payload through but flag it for the caller.
    Warn,
    /// The payload must not reach its downstream consumer.
    Block,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Warn => write!(f, "warn"),
            Self::Block => write!(f, "block"),
        }
    }
}

// ── Severity ───────────────────────────────────────────────────────────

/// Severity level attached to a detected failure.
///
/// Ordered from lowest to highest — `Ord` is derived so that comparisons
/// like `severity >= Severity::High` work naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational — no action required.
    Info,
    /// Low risk — may warrant logging.
    Low,
    /// Medium risk — warrants investigation.
    Medium,
    /// High risk — should block in most policies.
    High,
    /// Critical — immediate block.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

// ── FailureClass ───────────────────────────────────────────────────────

/// Closed enumeration of detectable failure classes.
///
/// The set is fixed at process start; the policy document can re-map the
/// severity, action, and threshold of each class but cannot introduce new
/// ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Attempt to override or exfiltrate the model's instructions.
    PromptInjection,
    /// Reference to an entity or concept that does not exist.
    FabricatedConcept,
    /// Claim presented without any supporting grounding.
    MissingGrounding,
    /// Certainty language disproportionate to the evidence.
    Overconfidence,
    /// Content outside the deployment's intended domain.
    DomainMismatch,
    /// Assertion of a verifiably false fact.
    FabricatedFact,
    /// Systematically slanted framing.
    Bias,
    /// Abusive or harassing content.
    Toxicity,
    /// SQL injection payload.
    SqlInjection,
    /// Cross-site scripting payload.
    Xss,
    /// Filesystem path traversal payload.
    PathTraversal,
    /// Shell command injection payload.
    CommandInjection,
    /// Input crafted to waste matcher or encoder time.
    PathologicalInput,
    /// No failure detected.
    None,
}

impl FailureClass {
    /// All classes, in declaration order.
    pub const ALL: &'static [FailureClass] = &[
        Self::PromptInjection,
        Self::FabricatedConcept,
        Self::MissingGrounding,
        Self::Overconfidence,
        Self::DomainMismatch,
        Self::FabricatedFact,
        Self::Bias,
        Self::Toxicity,
        Self::SqlInjection,
        Self::Xss,
        Self::PathTraversal,
        Self::CommandInjection,
        Self::PathologicalInput,
        Self::None,
    ];

    /// Stable snake_case identifier, also used for lexicographic
    /// tie-breaking between simultaneously-matching classes.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromptInjection => "prompt_injection",
            Self::FabricatedConcept => "fabricated_concept",
            Self::MissingGrounding => "missing_grounding",
            Self::Overconfidence => "overconfidence",
            Self::DomainMismatch => "domain_mismatch",
            Self::FabricatedFact => "fabricated_fact",
            Self::Bias => "bias",
            Self::Toxicity => "toxicity",
            Self::SqlInjection => "sql_injection",
            Self::Xss => "xss",
            Self::PathTraversal => "path_traversal",
            Self::CommandInjection => "command_injection",
            Self::PathologicalInput => "pathological_input",
            Self::None => "none",
        }
    }

    /// Parse a snake_case identifier back into a class.
    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }

    /// Whether this class describes a conventional security payload rather
    /// than a content-quality failure.  Security classes use a lower default
    /// similarity threshold in the exemplar index.
    #[must_use]
    pub fn is_security(self) -> bool {
        matches!(
            self,
            Self::PromptInjection
                | Self::SqlInjection
                | Self::Xss
                | Self::PathTraversal
                | Self::CommandInjection
                | Self::PathologicalInput
        )
    }

    /// Dense index into per-class counter arrays.
    #[must_use]
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|c| *c == self).unwrap_or(0)
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Tier ───────────────────────────────────────────────────────────────

/// Which stage of the pipeline produced a verdict.
///
/// Serialized as the numeric tier (1, 2, or 3) to match the wire schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Deterministic pattern stage.
    Pattern,
    /// Semantic exemplar-similarity stage.
    Semantic,
    /// Reasoning-agent stage.
    Reasoning,
}

impl Tier {
    /// Numeric tier as exposed in the verdict schema.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Pattern => 1,
            Self::Semantic => 2,
            Self::Reasoning => 3,
        }
    }

    /// Inverse of [`as_u8`](Self::as_u8).
    #[must_use]
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Pattern),
            2 => Some(Self::Semantic),
            3 => Some(Self::Reasoning),
            _ => Option::None,
        }
    }
}

impl Serialize for Tier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Tier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = u8::deserialize(deserializer)?;
        Tier::from_u8(n).ok_or_else(|| serde::de::Error::custom(format!("invalid tier {n}")))
    }
}

// ── Method ─────────────────────────────────────────────────────────────

/// How a verdict was produced.
///
/// The label is the primary observability handle: it distinguishes
/// "classified", "skipped", "timed out", and "internal error" outcomes in
/// logs, metrics, and audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Empty or whitespace-only input passed through by the guard.
    GuardEmpty,
    /// The guard rejected a pathological input (oversized, repetitive).
    GuardPathological,
    /// The guard matched a well-known attack signature.
    GuardSignature,
    /// A positive pattern matched at terminal confidence.
    PatternStrong,
    /// An anti-pattern matched at terminal confidence.
    PatternAntimatch,
    /// No pattern matched and no suspicious token was present.
    PatternClear,
    /// Weak pattern signal below the escalation band, finalized as allow.
    PatternWeak,
    /// The exemplar index classified the payload.
    Semantic,
    /// No exemplar class exceeded its threshold.
    SemanticClear,
    /// The embedding encoder missed its deadline.
    SemanticTimeout,
    /// The semantic stage was unavailable; the pattern provisional was
    /// finalized instead.
    SemanticSkipped,
    /// The reasoning stage produced the verdict.
    Reason,
    /// The reasoner failed or timed out; the tentative verdict carried in
    /// from an earlier stage was finalized instead.
    ReasonFallback,
    /// The total pipeline budget ran out before a verdict was reached.
    BudgetExhausted,
    /// An invariant violation was converted into a conservative block.
    InternalError,
}

impl Method {
    /// Stable snake_case label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GuardEmpty => "guard_empty",
            Self::GuardPathological => "guard_pathological",
            Self::GuardSignature => "guard_signature",
            Self::PatternStrong => "pattern_strong",
            Self::PatternAntimatch => "pattern_antimatch",
            Self::PatternClear => "pattern_clear",
            Self::PatternWeak => "pattern_weak",
            Self::Semantic => "semantic",
            Self::SemanticClear => "semantic_clear",
            Self::SemanticTimeout => "semantic_timeout",
            Self::SemanticSkipped => "semantic_skipped",
            Self::Reason => "reason",
            Self::ReasonFallback => "reason_fallback",
            Self::BudgetExhausted => "budget_exhausted",
            Self::InternalError => "internal_error",
        }
    }

    /// Whether verdicts produced by this method may be memoized.
    ///
    /// Timeout, skip, and internal-error outcomes depend on transient
    /// conditions and must never be served from the decision cache.
    /// Guard outcomes are also excluded: the guard's checks are O(1) and
    /// cheaper to recompute than the cache key they would be stored under.
    #[must_use]
    pub fn is_cacheable(self) -> bool {
        matches!(
            self,
            Self::PatternStrong
                | Self::PatternAntimatch
                | Self::PatternClear
                | Self::PatternWeak
                | Self::Semantic
                | Self::SemanticClear
                | Self::Reason
        )
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Verdict ────────────────────────────────────────────────────────────

/// The structured result of inspecting one payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Enforcement decision.
    pub action: Action,
    /// Which tier produced the verdict (1, 2, or 3 on the wire).
    pub tier_used: Tier,
    /// How the verdict was produced.
    pub method: Method,
    /// Detected failure class (`none` when clean).
    pub failure_class: FailureClass,
    /// Severity of the detected failure.
    pub severity: Severity,
    /// Confidence of the stage that produced the verdict, in `[0.0, 1.0]`.
    pub confidence: f32,
    /// Wall-clock time spent producing the verdict.  Preserved from the
    /// original computation when served from the cache.
    pub processing_time_ms: u64,
    /// Human-readable explanation for audit logs.
    pub explanation: String,
    /// Whether this verdict was served from the decision cache.
    pub cache_hit: bool,
}

impl Verdict {
    /// Construct a verdict with the given fields; `processing_time_ms` is
    /// stamped by the orchestrator and defaults to zero here.
    #[must_use]
    pub fn new(
        action: Action,
        tier: Tier,
        method: Method,
        failure_class: FailureClass,
        severity: Severity,
        confidence: f32,
        explanation: impl Into<String>,
    ) -> Self {
        debug_assert!(
            (0.0..=1.0).contains(&confidence),
            "confidence must be in [0.0, 1.0], got {confidence}",
        );
        debug_assert!(
            failure_class != FailureClass::None || action == Action::Allow,
            "failure_class=none requires action=allow",
        );
        Self {
            action,
            tier_used: tier,
            method,
            failure_class,
            severity,
            confidence,
            processing_time_ms: 0,
            explanation: explanation.into(),
            cache_hit: false,
        }
    }

    /// A clean allow verdict for the given tier and method.
    #[must_use]
    pub fn clean(tier: Tier, method: Method, confidence: f32, explanation: impl Into<String>) -> Self {
        Self::new(
            Action::Allow,
            tier,
            method,
            FailureClass::None,
            Severity::Info,
            confidence,
            explanation,
        )
    }

    /// Returns `true` if the action is [`Action::Block`].
    #[must_use]
    pub fn is_block(&self) -> bool {
        self.action == Action::Block
    }

    /// Returns `true` if the action is [`Action::Allow`].
    #[must_use]
    pub fn is_allow(&self) -> bool {
        self.action == Action::Allow
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_ordering() {
        assert!(Action::Allow < Action::Warn);
        assert!(Action::Warn < Action::Block);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn class_round_trips_str() {
        for class in FailureClass::ALL {
            assert_eq!(FailureClass::from_str_opt(class.as_str()), Some(*class));
        }
    }

    #[test]
    fn class_round_trips_json() {
        let json = serde_json::to_string(&FailureClass::PromptInjection).unwrap();
        assert_eq!(json, r#""prompt_injection""#);
        let parsed: FailureClass = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, FailureClass::PromptInjection);
    }

    #[test]
    fn security_classes() {
        assert!(FailureClass::SqlInjection.is_security());
        assert!(FailureClass::PromptInjection.is_security());
        assert!(!FailureClass::Overconfidence.is_security());
        assert!(!FailureClass::FabricatedFact.is_security());
    }

    #[test]
    fn tier_serializes_as_number() {
        let json = serde_json::to_string(&Tier::Semantic).unwrap();
        assert_eq!(json, "2");
        let parsed: Tier = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, Tier::Reasoning);
        assert!(serde_json::from_str::<Tier>("4").is_err());
    }

    #[test]
    fn method_labels() {
        assert_eq!(Method::PatternStrong.as_str(), "pattern_strong");
        assert_eq!(Method::BudgetExhausted.as_str(), "budget_exhausted");
    }

    #[test]
    fn timeout_methods_not_cacheable() {
        assert!(!Method::SemanticTimeout.is_cacheable());
        assert!(!Method::BudgetExhausted.is_cacheable());
        assert!(!Method::InternalError.is_cacheable());
        assert!(!Method::ReasonFallback.is_cacheable());
        assert!(Method::Semantic.is_cacheable());
        assert!(Method::PatternClear.is_cacheable());
    }

    #[test]
    fn guard_methods_not_cacheable() {
        assert!(!Method::GuardEmpty.is_cacheable());
        assert!(!Method::GuardPathological.is_cacheable());
        assert!(!Method::GuardSignature.is_cacheable());
    }

    #[test]
    fn verdict_json_shape() {
        let v = Verdict::new(
            Action::Block,
            Tier::Pattern,
            Method::PatternStrong,
            FailureClass::PromptInjection,
            Severity::Critical,
            0.95,
            "matched PI-001",
        );
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["action"], "block");
        assert_eq!(json["tier_used"], 1);
        assert_eq!(json["method"], "pattern_strong");
        assert_eq!(json["failure_class"], "prompt_injection");
        assert_eq!(json["cache_hit"], false);
    }
}
