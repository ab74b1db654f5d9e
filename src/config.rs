//! Pipeline configuration: budgets, caps, bands, and tier flags.
//!
//! Every knob has a documented default; a [`PipelineConfig`] built with
//! [`Default`] is production-ready.  Values can be overridden field-by-field
//! with the builder-style setters, loaded from the environment with
//! [`PipelineConfig::with_env`] (`PALISADE_*` variables, `.env` honored),
//! and are validated before use.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

/// Errors raised while assembling or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable was present but unparseable.
    #[error("failed to parse environment variable {key}: {message}")]
    EnvParse {
        /// Environment variable key.
        key: String,
        /// Error message.
        message: String,
    },

    /// A field failed range validation.
    #[error("configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_max_raw_bytes() -> usize {
    10_000
}
fn default_window_bytes() -> usize {
    500
}
fn default_pattern_cap_bytes() -> usize {
    500
}
fn default_vector_cap_bytes() -> usize {
    1_000
}
fn default_per_pattern_timeout_ms() -> u64 {
    500
}
fn default_encode_timeout_ms() -> u64 {
    3_000
}
fn default_reason_timeout_ms() -> u64 {
    15_000
}
fn default_total_budget_ms() -> u64 {
    5_000
}
fn default_hard_budget_ms() -> u64 {
    15_000
}
fn default_cache_capacity() -> usize {
    10_000
}
fn default_embed_memo_capacity() -> usize {
    2_048
}
fn default_tier2_permits() -> usize {
    std::thread::available_parallelism().map_or(8, |n| n.get() * 2)
}
fn default_tier3_permits() -> usize {
    4
}
fn default_health_window() -> usize {
    1_000
}
fn default_max_batch() -> usize {
    100
}
fn default_true() -> bool {
    true
}
fn default_t1_gray_low() -> f32 {
    0.30
}
fn default_t1_gray_high() -> f32 {
    0.85
}
fn default_t2_certain() -> f32 {
    0.78
}
fn default_t2_escalate_floor() -> f32 {
    0.60
}
fn default_reason_floor() -> f32 {
    0.70
}
fn default_security_threshold() -> f32 {
    0.65
}
fn default_content_threshold() -> f32 {
    0.70
}
fn default_t2_min_cost_ms() -> u64 {
    25
}
fn default_t3_min_cost_ms() -> u64 {
    250
}

// ── PipelineConfig ─────────────────────────────────────────────────────

/// All budgets, caps, escalation bands, and tier flags in one place.
///
/// Uses a builder pattern — all setters are `#[must_use]`.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    /// Inputs larger than this many raw bytes are blocked outright.
    #[serde(default = "default_max_raw_bytes")]
    pub max_raw_bytes: usize,
    /// Window over which the guard computes cheap pathological-input
    /// signals.
    #[serde(default = "default_window_bytes")]
    pub window_bytes: usize,
    /// Kept-text cap for the pattern stage.
    #[serde(default = "default_pattern_cap_bytes")]
    pub pattern_cap_bytes: usize,
    /// Kept-text cap for the semantic stage.
    #[serde(default = "default_vector_cap_bytes")]
    pub vector_cap_bytes: usize,
    /// Budget for evaluating a single pattern.
    #[serde(default = "default_per_pattern_timeout_ms")]
    pub per_pattern_timeout_ms: u64,
    /// Budget for one embedding-encoder call.
    #[serde(default = "default_encode_timeout_ms")]
    pub encode_timeout_ms: u64,
    /// Budget for one reasoner call.
    #[serde(default = "default_reason_timeout_ms")]
    pub reason_timeout_ms: u64,
    /// Soft total budget for one request; stages are budgeted against it.
    #[serde(default = "default_total_budget_ms")]
    pub total_budget_ms: u64,
    /// Hard ceiling — nothing waits past this.
    #[serde(default = "default_hard_budget_ms")]
    pub hard_budget_ms: u64,
    /// Decision-cache capacity (entries).
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Embedding memo capacity (entries).
    #[serde(default = "default_embed_memo_capacity")]
    pub embed_memo_capacity: usize,
    /// Concurrent requests admitted into the semantic stage.
    #[serde(default = "default_tier2_permits")]
    pub tier2_permits: usize,
    /// Concurrent requests admitted into the reasoning stage.
    #[serde(default = "default_tier3_permits")]
    pub tier3_permits: usize,
    /// Rolling window size for the tier-health monitor.
    #[serde(default = "default_health_window")]
    pub health_window: usize,
    /// Maximum requests per batch call.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Whether the semantic stage is enabled.
    #[serde(default = "default_true")]
    pub tier2_enabled: bool,
    /// Whether the reasoning stage is enabled.
    #[serde(default = "default_true")]
    pub tier3_enabled: bool,
    /// Lower bound of the tier-1 gray band; weaker signals finalize as
    /// allow.
    #[serde(default = "default_t1_gray_low")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub t1_gray_low: f32,
    /// Upper bound of the tier-1 gray band; stronger signals block at
    /// tier 1.
    #[serde(default = "default_t1_gray_high")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub t1_gray_high: f32,
    /// Semantic score at or above which tier 2 terminates.
    #[serde(default = "default_t2_certain")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub t2_certain: f32,
    /// Lower edge of the tier-2 escalation band.
    #[serde(default = "default_t2_escalate_floor")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub t2_escalate_floor: f32,
    /// Reasoner blocks below this confidence are downgraded to warnings.
    #[serde(default = "default_reason_floor")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub reason_floor: f32,
    /// Default exemplar threshold for security classes.
    #[serde(default = "default_security_threshold")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub security_threshold: f32,
    /// Default exemplar threshold for content classes.
    #[serde(default = "default_content_threshold")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub content_threshold: f32,
    /// Minimum expected cost of the semantic stage; the router will not
    /// enter it with less remaining budget.
    #[serde(default = "default_t2_min_cost_ms")]
    pub t2_min_cost_ms: u64,
    /// Minimum expected cost of the reasoning stage.
    #[serde(default = "default_t3_min_cost_ms")]
    pub t3_min_cost_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_raw_bytes: default_max_raw_bytes(),
            window_bytes: default_window_bytes(),
            pattern_cap_bytes: default_pattern_cap_bytes(),
            vector_cap_bytes: default_vector_cap_bytes(),
            per_pattern_timeout_ms: default_per_pattern_timeout_ms(),
            encode_timeout_ms: default_encode_timeout_ms(),
            reason_timeout_ms: default_reason_timeout_ms(),
            total_budget_ms: default_total_budget_ms(),
            hard_budget_ms: default_hard_budget_ms(),
            cache_capacity: default_cache_capacity(),
            embed_memo_capacity: default_embed_memo_capacity(),
            tier2_permits: default_tier2_permits(),
            tier3_permits: default_tier3_permits(),
            health_window: default_health_window(),
            max_batch: default_max_batch(),
            tier2_enabled: true,
            tier3_enabled: true,
            t1_gray_low: default_t1_gray_low(),
            t1_gray_high: default_t1_gray_high(),
            t2_certain: default_t2_certain(),
            t2_escalate_floor: default_t2_escalate_floor(),
            reason_floor: default_reason_floor(),
            security_threshold: default_security_threshold(),
            content_threshold: default_content_threshold(),
            t2_min_cost_ms: default_t2_min_cost_ms(),
            t3_min_cost_ms: default_t3_min_cost_ms(),
        }
    }
}

impl PipelineConfig {
    /// Create a configuration with documented defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the raw-input size cap in bytes.
    #[must_use]
    pub fn max_raw_bytes(mut self, bytes: usize) -> Self {
        self.max_raw_bytes = bytes;
        self
    }

    /// Set the soft total budget in milliseconds.
    #[must_use]
    pub fn total_budget_ms(mut self, ms: u64) -> Self {
        self.total_budget_ms = ms;
        self
    }

    /// Set the hard total budget in milliseconds.
    #[must_use]
    pub fn hard_budget_ms(mut self, ms: u64) -> Self {
        self.hard_budget_ms = ms;
        self
    }

    /// Set the decision-cache capacity.
    #[must_use]
    pub fn cache_capacity(mut self, entries: usize) -> Self {
        self.cache_capacity = entries;
        self
    }

    /// Enable or disable the semantic stage.
    #[must_use]
    pub fn tier2_enabled(mut self, enabled: bool) -> Self {
        self.tier2_enabled = enabled;
        self
    }

    /// Enable or disable the reasoning stage.
    #[must_use]
    pub fn tier3_enabled(mut self, enabled: bool) -> Self {
        self.tier3_enabled = enabled;
        self
    }

    /// Set the encode timeout in milliseconds.
    #[must_use]
    pub fn encode_timeout_ms(mut self, ms: u64) -> Self {
        self.encode_timeout_ms = ms;
        self
    }

    /// Set the reasoner timeout in milliseconds.
    #[must_use]
    pub fn reason_timeout_ms(mut self, ms: u64) -> Self {
        self.reason_timeout_ms = ms;
        self
    }

    /// Apply `PALISADE_*` environment overrides (loading `.env` if present).
    ///
    /// Recognized variables: `PALISADE_MAX_RAW_BYTES`,
    /// `PALISADE_TOTAL_BUDGET_MS`, `PALISADE_HARD_BUDGET_MS`,
    /// `PALISADE_CACHE_CAPACITY`, `PALISADE_TIER2_ENABLED`,
    /// `PALISADE_TIER3_ENABLED`.  Missing variables leave the current
    /// value untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvParse`] when a present variable cannot be
    /// parsed.
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        fn parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
            match std::env::var(key) {
                Ok(raw) => raw.parse().map(Some).map_err(|_| ConfigError::EnvParse {
                    key: key.to_string(),
                    message: format!("could not parse '{raw}'"),
                }),
                Err(_) => Ok(None),
            }
        }

        if let Some(v) = parse("PALISADE_MAX_RAW_BYTES")? {
            self.max_raw_bytes = v;
        }
        if let Some(v) = parse("PALISADE_TOTAL_BUDGET_MS")? {
            self.total_budget_ms = v;
        }
        if let Some(v) = parse("PALISADE_HARD_BUDGET_MS")? {
            self.hard_budget_ms = v;
        }
        if let Some(v) = parse("PALISADE_CACHE_CAPACITY")? {
            self.cache_capacity = v;
        }
        if let Some(v) = parse("PALISADE_TIER2_ENABLED")? {
            self.tier2_enabled = v;
        }
        if let Some(v) = parse("PALISADE_TIER3_ENABLED")? {
            self.tier3_enabled = v;
        }

        Ok(self)
    }

    /// Validate ranges and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] when a threshold is outside
    /// `[0, 1]` or the band edges are inverted.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        let mut errors = validator::ValidationErrors::new();
        if self.t1_gray_low > self.t1_gray_high {
            errors.add("t1_gray_low", validator::ValidationError::new("band_inverted"));
        }
        if self.t2_escalate_floor > self.t2_certain {
            errors.add(
                "t2_escalate_floor",
                validator::ValidationError::new("band_inverted"),
            );
        }
        if self.total_budget_ms > self.hard_budget_ms {
            errors.add(
                "total_budget_ms",
                validator::ValidationError::new("soft_exceeds_hard"),
            );
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.check().expect("defaults must validate");
        assert_eq!(config.max_raw_bytes, 10_000);
        assert_eq!(config.pattern_cap_bytes, 500);
        assert_eq!(config.vector_cap_bytes, 1_000);
        assert_eq!(config.total_budget_ms, 5_000);
        assert_eq!(config.cache_capacity, 10_000);
        assert!(config.tier2_enabled);
        assert!(config.tier3_enabled);
    }

    #[test]
    fn inverted_band_rejected() {
        let config = PipelineConfig::default()
            .max_raw_bytes(10_000)
            .total_budget_ms(5_000);
        let mut bad = config;
        bad.t1_gray_low = 0.9;
        bad.t1_gray_high = 0.3;
        assert!(bad.check().is_err());
    }

    #[test]
    fn soft_budget_must_not_exceed_hard() {
        let bad = PipelineConfig::default()
            .total_budget_ms(20_000)
            .hard_budget_ms(15_000);
        assert!(bad.check().is_err());
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let mut bad = PipelineConfig::default();
        bad.t2_certain = 1.5;
        assert!(bad.check().is_err());
    }

    #[test]
    fn builder_setters() {
        let config = PipelineConfig::new()
            .cache_capacity(42)
            .tier3_enabled(false);
        assert_eq!(config.cache_capacity, 42);
        assert!(!config.tier3_enabled);
    }
}
