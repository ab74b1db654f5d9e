//! Built-in pattern library for the deterministic tier.
//!
//! Positive patterns raise suspicion for a failure class; anti-patterns
//! (well-formed citations and similar grounding markers) lower it.  All
//! sources use bounded gaps (`.{0,N}`) rather than unbounded dot
//! quantifiers, and every entry is revalidated against the structural
//! safety check at load time.

use std::borrow::Cow;

use crate::verdict::FailureClass;

/// An uncompiled pattern definition.
#[derive(Debug, Clone)]
pub struct PatternSpec {
    /// Unique identifier (e.g. `"PI-001"`).
    pub id: Cow<'static, str>,
    /// Failure class reported on match.
    pub failure_class: FailureClass,
    /// Raw regex source.
    pub regex_str: Cow<'static, str>,
    /// Confidence reported when this pattern matches.
    pub confidence: f32,
    /// Whether a match *reduces* suspicion.
    pub is_anti_pattern: bool,
}

macro_rules! pat {
    ($id:expr, $class:expr, $re:expr, $conf:expr) => {
        PatternSpec {
            id: Cow::Borrowed($id),
            failure_class: $class,
            regex_str: Cow::Borrowed($re),
            confidence: $conf,
            is_anti_pattern: false,
        }
    };
    (anti $id:expr, $re:expr, $conf:expr) => {
        PatternSpec {
            id: Cow::Borrowed($id),
            failure_class: FailureClass::None,
            regex_str: Cow::Borrowed($re),
            confidence: $conf,
            is_anti_pattern: true,
        }
    };
}

/// Tokens whose absence marks a payload as safe enough for a terminal
/// tier-1 allow.  Scanned case-insensitively with a single automaton.
pub const SUSPICIOUS_TOKENS: &[&str] = &[
    "ignore",
    "instruction",
    "system prompt",
    "pretend",
    "jailbreak",
    "jailbroken",
    "developer mode",
    "disregard",
    "forget everything",
    "act as",
    "hypothetically",
    "restriction",
    "unfiltered",
    "select",
    "union",
    "script",
    "drop table",
    "passwd",
    "rm -rf",
    "sudo",
    "password",
    "api key",
    "definitely",
    "certainly",
    "guaranteed",
    "100%",
    "always works",
    "never fails",
    "studies show",
    "proven",
    "trust me",
    "everyone knows",
    "worthless",
    "idiot",
    "kill",
    "hate",
    "javascript:",
    "onerror",
];

/// Returns the full built-in pattern set.
#[allow(clippy::too_many_lines)]
#[must_use]
pub fn builtin_patterns() -> Vec<PatternSpec> {
    use FailureClass::{
        Bias, CommandInjection, FabricatedConcept, FabricatedFact, MissingGrounding,
        Overconfidence, PromptInjection, SqlInjection, Toxicity, Xss,
    };

    vec![
        // ── Prompt injection ───────────────────────────────────────
        pat!(
            "PI-001",
            PromptInjection,
            r"(?i)ignore\s+(?:all\s+)?(?:previous|prior)\s+instructions",
            0.95
        ),
        pat!(
            "PI-002",
            PromptInjection,
            r"(?i)(?:reveal|show|print|repeat)\b.{0,40}\bsystem\s+prompt",
            0.92
        ),
        pat!("PI-003", PromptInjection, r"(?i)\byou\s+are\s+now\b", 0.86),
        pat!(
            "PI-004",
            PromptInjection,
            r"(?i)disregard\s+(?:all\s+)?(?:prior|previous|above)",
            0.90
        ),
        pat!(
            "PI-005",
            PromptInjection,
            r"(?i)forget\s+(?:everything|all)\b",
            0.88
        ),
        pat!(
            "PI-006",
            PromptInjection,
            r"(?i)\b(?:jailbreak|jailbroken|dan\s+mode)\b",
            0.90
        ),
        pat!("PI-007", PromptInjection, r"(?i)developer\s+mode", 0.80),
        pat!(
            "PI-008",
            PromptInjection,
            r"(?i)pretend\s+(?:to\s+be|you\s+are)\b",
            0.70
        ),
        pat!("PI-009", PromptInjection, r"(?i)\bact\s+as\s+(?:a|an)\b", 0.55),
        pat!("PI-010", PromptInjection, r"(?i)new\s+instructions\s*:", 0.75),
        pat!(
            "PI-011",
            PromptInjection,
            r"(?i)\bhypothetically\b.{0,80}\bno\s+(?:restrictions|rules|limits)\b",
            0.60
        ),
        pat!(
            "PI-012",
            PromptInjection,
            r"(?i)without\s+(?:any\s+)?(?:restrictions|filters|limitations)",
            0.60
        ),
        pat!(
            "PI-013",
            PromptInjection,
            r"(?i)<\|(?:im_start|im_end|endoftext|system)\|>",
            0.85
        ),
        pat!(
            "PI-014",
            PromptInjection,
            r"(?i)\byour\s+(?:initial|original|hidden)\s+(?:instructions|prompt)\b",
            0.85
        ),
        // ── Overconfidence ─────────────────────────────────────────
        pat!(
            "OC-001",
            Overconfidence,
            r"(?i)\b(?:definitely|certainly|undoubtedly|guaranteed)\b",
            0.45
        ),
        pat!(
            "OC-002",
            Overconfidence,
            r"(?i)\b100%\s+(?:of\s+cases|effective|certain|accurate)\b",
            0.60
        ),
        pat!("OC-003", Overconfidence, r"(?i)\balways\s+works\b", 0.55),
        pat!("OC-004", Overconfidence, r"(?i)\bnever\s+fails\b", 0.55),
        pat!(
            "OC-005",
            Overconfidence,
            r"(?i)\bbeyond\s+(?:any\s+)?doubt\b",
            0.50
        ),
        // ── Fabricated facts / concepts ────────────────────────────
        pat!(
            "FF-001",
            FabricatedFact,
            r"(?i)\bstudies\s+(?:show|prove|confirm)\b",
            0.45
        ),
        pat!(
            "FF-002",
            FabricatedFact,
            r"(?i)\bscientists\s+(?:have\s+)?(?:proven|confirmed)\b",
            0.50
        ),
        pat!(
            "FF-003",
            FabricatedFact,
            r"(?i)\bit\s+is\s+a\s+(?:known|proven)\s+fact\b",
            0.55
        ),
        pat!(
            "FC-001",
            FabricatedConcept,
            r"(?i)\bwell[- ]known\s+(?:theorem|law|principle)\s+of\b",
            0.45
        ),
        // ── Missing grounding ──────────────────────────────────────
        pat!("MG-001", MissingGrounding, r"(?i)\btrust\s+me\b", 0.45),
        pat!(
            "MG-002",
            MissingGrounding,
            r"(?i)\bno\s+(?:citation|source)s?\s+(?:needed|required)\b",
            0.55
        ),
        pat!("MG-003", MissingGrounding, r"(?i)\beveryone\s+knows\b", 0.40),
        // ── Toxicity / bias ────────────────────────────────────────
        pat!(
            "TX-001",
            Toxicity,
            r"(?i)\byou(?:'re|\s+are)\s+(?:worthless|pathetic|an?\s+idiot)\b",
            0.90
        ),
        pat!(
            "TX-002",
            Toxicity,
            r"(?i)\b(?:kill|hurt)\s+(?:yourself|you)\b",
            0.95
        ),
        pat!(
            "TX-003",
            Toxicity,
            r"(?i)\bi\s+(?:hate|despise)\s+(?:you|these\s+people)\b",
            0.70
        ),
        pat!(
            "BI-001",
            Bias,
            r"(?i)\b(?:all|every)\s+(?:women|men|immigrants|foreigners)\s+are\b",
            0.75
        ),
        pat!(
            "BI-002",
            Bias,
            r"(?i)\bthose\s+people\s+(?:always|never)\b",
            0.55
        ),
        // ── Injection payload backstops ────────────────────────────
        pat!("SQ-001", SqlInjection, r"(?i)\bunion\s+select\b", 0.90),
        pat!("SQ-002", SqlInjection, r"(?i)'\s*or\s*'1'\s*=\s*'1", 0.92),
        pat!("CI-001", CommandInjection, r"(?i)\brm\s+-rf\s+/", 0.92),
        pat!("XS-001", Xss, r"(?i)\bjavascript\s*:", 0.80),
        pat!("XS-002", Xss, r"(?i)\bon(?:error|load|click)\s*=", 0.75),
        // ── Anti-patterns: grounding markers ───────────────────────
        pat!(anti "AP-001", r"\[\d{1,3}\]", 0.86),
        pat!(anti "AP-002", r"(?i)\bdoi\s*:\s*10\.\d{4,}", 0.92),
        pat!(anti "AP-003", r"(?i)\barxiv\s*:\s*\d{4}\.\d{4,5}", 0.90),
        pat!(
            anti "AP-004",
            r"(?i)\baccording\s+to\s+(?:the\s+)?(?:study|paper|article|report)\s+(?:published|cited)\b",
            0.85
        ),
        pat!(anti "AP-005", r"\(\s*[A-Z][a-z]+\s+et\s+al\.?,?\s+\d{4}\s*\)", 0.88),
    ]
}

// ── Tests ──────────────────────────────────────────────────────────────
