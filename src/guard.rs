//! Input guard — canonicalization, length caps, pathological-input
//! detection, and well-known attack signatures.
//!
//! The guard runs before any pattern or embedding work and exists to make
//! the rest of the pipeline safe under adversarial input: repetitive or
//! oversized payloads are rejected before a single regex is evaluated, and
//! obvious attack payloads become sub-millisecond verdicts.  Text that
//! survives is canonicalized (NFKC, control characters stripped, whitespace
//! collapsed) and truncated to per-stage caps so worst-case matcher cost is
//! bounded.

use aho_corasick::AhoCorasick;
use regex::Regex;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::config::PipelineConfig;
use crate::policy::PolicyTable;
use crate::verdict::{FailureClass, Method, Severity, Tier, Verdict};

// ── Errors ─────────────────────────────────────────────────────────────

/// Errors raised while building the guard.
#[derive(Debug, Error)]
pub enum GuardError {
    /// A signature regex failed to compile.
    #[error("signature '{name}' failed to compile: {source}")]
    SignatureCompile {
        /// Signature name.
        name: &'static str,
        /// Underlying regex error.
        source: regex::Error,
    },

    /// The keyword prefilter failed to build.
    #[error("signature prefilter failed to build: {0}")]
    Prefilter(#[from] aho_corasick::BuildError),
}

// ── Normalization ──────────────────────────────────────────────────────

/// Characters that render as nothing but survive NFKC.
fn is_zero_width(ch: char) -> bool {
    matches!(
        ch,
        '\u{00AD}' | '\u{200B}'..='\u{200F}' | '\u{2060}' | '\u{FEFF}'
    )
}

/// Canonicalize text: NFKC fold, strip control and zero-width characters,
/// collapse whitespace runs to single spaces, trim.
///
/// All matching, all caching, and the decision-cache key operate on this
/// form, so visually equivalent inputs collapse to one entry.
#[must_use]
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len().min(1 << 16));
    let mut pending_space = false;
    for ch in text.nfkc() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
        } else if ch.is_control() || is_zero_width(ch) {
            // dropped
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(ch);
        }
    }
    out
}

/// Truncate to at most `cap` bytes without splitting a UTF-8 character.
#[must_use]
pub fn truncate_bytes(text: &str, cap: usize) -> &str {
    if text.len() <= cap {
        return text;
    }
    let mut end = cap;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ── Signatures ─────────────────────────────────────────────────────────

struct Signature {
    name: &'static str,
    class: FailureClass,
    confidence: f32,
    regex: Regex,
}

/// `(name, class, confidence, pattern)` for each well-known attack shape.
/// Gaps are bounded (`.{0,160}`) so no signature can scan unboundedly.
const SIGNATURE_SOURCES: &[(&str, FailureClass, f32, &str)] = &[
    (
        "sql_keywords_with_terminator",
        FailureClass::SqlInjection,
        0.88,
        r"(?i)\b(?:select|union|insert|update|delete|drop)\b.{0,160}\b(?:from|into|where|table)\b.{0,160}(?:--|;|\bor\s+1\s*=\s*1\b)",
    ),
    (
        "script_tag",
        FailureClass::Xss,
        0.90,
        r"(?i)<\s*script\b",
    ),
    (
        "traversal_run",
        FailureClass::PathTraversal,
        0.85,
        r"(?:\.\.[/\\]){2,}",
    ),
    (
        "traversal_sensitive_target",
        FailureClass::PathTraversal,
        0.92,
        r"(?i)\.\.[/\\].{0,40}(?:etc[/\\]passwd|windows[/\\]system32)",
    ),
    (
        "shell_meta_with_binary",
        FailureClass::CommandInjection,
        0.88,
        r"(?i)(?:[;&|]|\$\(|\x60)\s*(?:rm|curl|wget|bash|sh|nc|chmod|chown)\b",
    ),
];

/// Cheap literal prefilter; the signature regexes only run after a hit.
const PREFILTER_LITERALS: &[&str] = &[
    "select", "union ", "insert ", "update ", "delete ", "drop ", "<script", "../", "..\\", ";",
    "|", "&", "`", "$(",
];

// ── GuardDisposition ───────────────────────────────────────────────────

/// Text views produced for the downstream stages.
#[derive(Debug, Clone)]
pub struct GuardedText {
    /// Full canonical text (bounded by the raw cap).
    pub normalized: String,
    /// Canonical text truncated to the pattern-stage cap.
    pub pattern_text: String,
    /// Canonical text truncated to the semantic-stage cap.
    pub vector_text: String,
}

/// Result of guarding one payload.
#[derive(Debug, Clone)]
pub enum GuardDisposition {
    /// The guard reached a verdict; no stage runs.
    Terminal(Verdict),
    /// The payload is admitted to the pipeline with bounded text views.
    Clean(GuardedText),
}

// ── InputGuard ─────────────────────────────────────────────────────────

/// Stateless input admission layer; see the module docs for the check
/// order.
pub struct InputGuard {
    max_raw_bytes: usize,
    window_bytes: usize,
    pattern_cap: usize,
    vector_cap: usize,
    signatures: Vec<Signature>,
    prefilter: AhoCorasick,
}

impl InputGuard {
    /// Build the guard from pipeline configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError`] if a signature regex or the prefilter fails
    /// to compile.
    pub fn new(config: &PipelineConfig) -> Result<Self, GuardError> {
        let signatures = SIGNATURE_SOURCES
            .iter()
            .map(|(name, class, confidence, source)| {
                Regex::new(source)
                    .map(|regex| Signature {
                        name,
                        class: *class,
                        confidence: *confidence,
                        regex,
                    })
                    .map_err(|source| GuardError::SignatureCompile { name, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let prefilter = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(PREFILTER_LITERALS)?;

        Ok(Self {
            max_raw_bytes: config.max_raw_bytes,
            window_bytes: config.window_bytes,
            pattern_cap: config.pattern_cap_bytes,
            vector_cap: config.vector_cap_bytes,
            signatures,
            prefilter,
        })
    }

    /// Inspect one raw payload.
    ///
    /// Checks run in order: empty input, raw size cap, repetition signals
    /// over the leading window, attack signatures, then truncation to the
    /// per-stage caps.  `policy` supplies the action and severity for
    /// signature classes so operator overrides apply even to guard
    /// verdicts.
    #[must_use]
    pub fn inspect(&self, raw: &str, policy: &PolicyTable) -> GuardDisposition {
        // 1. Empty or whitespace-only input.
        if raw.trim().is_empty() {
            return GuardDisposition::Terminal(Verdict::clean(
                Tier::Pattern,
                Method::GuardEmpty,
                0.50,
                "empty or whitespace-only input",
            ));
        }

        // 2. Raw size cap, before any per-character work.
        if raw.len() > self.max_raw_bytes {
            return GuardDisposition::Terminal(Verdict::new(
                crate::verdict::Action::Block,
                Tier::Pattern,
                Method::GuardPathological,
                FailureClass::PathologicalInput,
                Severity::High,
                0.70,
                format!(
                    "input of {} bytes exceeds the {}-byte cap",
                    raw.len(),
                    self.max_raw_bytes
                ),
            ));
        }

        let normalized = normalize(raw);
        if normalized.is_empty() {
            return GuardDisposition::Terminal(Verdict::clean(
                Tier::Pattern,
                Method::GuardEmpty,
                0.50,
                "input reduced to nothing by canonicalization",
            ));
        }

        // 3. Repetition / low-diversity signals over the leading window.
        if let Some(verdict) = self.window_signals(&normalized) {
            return GuardDisposition::Terminal(verdict);
        }

        // 4. Well-known attack signatures; first match wins.
        if self.prefilter.is_match(&normalized) {
            for signature in &self.signatures {
                if signature.regex.is_match(&normalized) {
                    let (action, severity) = policy.decide(signature.class);
                    tracing::debug!(
                        signature = signature.name,
                        failure_class = signature.class.as_str(),
                        "guard signature matched",
                    );
                    return GuardDisposition::Terminal(Verdict::new(
                        action,
                        Tier::Pattern,
                        Method::GuardSignature,
                        signature.class,
                        severity,
                        signature.confidence,
                        format!("attack signature '{}' matched", signature.name),
                    ));
                }
            }
        }

        // 5. Bound the text handed to each stage.
        let pattern_text = truncate_bytes(&normalized, self.pattern_cap).to_string();
        let vector_text = truncate_bytes(&normalized, self.vector_cap).to_string();
        GuardDisposition::Clean(GuardedText {
            normalized,
            pattern_text,
            vector_text,
        })
    }

    /// Max single-character frequency ratio and distinct-character count
    /// over the first `window_bytes` of the canonical text.
    fn window_signals(&self, normalized: &str) -> Option<Verdict> {
        let window = truncate_bytes(normalized, self.window_bytes);
        let mut counts: rustc_hash::FxHashMap<char, u32> = rustc_hash::FxHashMap::default();
        let mut total: u32 = 0;
        for ch in window.chars() {
            *counts.entry(ch).or_insert(0) += 1;
            total += 1;
        }
        if total < 50 {
            return None;
        }
        let max_count = counts.values().copied().max().unwrap_or(0);
        let ratio = f64::from(max_count) / f64::from(total);
        let distinct = counts.len();
        if ratio > 0.80 || distinct < 5 {
            return Some(Verdict::new(
                crate::verdict::Action::Block,
                Tier::Pattern,
                Method::GuardPathological,
                FailureClass::PathologicalInput,
                Severity::High,
                0.95,
                format!(
                    "pathological repetition: max-char ratio {ratio:.2}, {distinct} distinct chars",
                ),
            ));
        }
        None
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
