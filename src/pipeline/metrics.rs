//! Pipeline counters and latency histograms, rendered as plain-text
//! scrape output.
//!
//! Everything is lock-free atomics; recording happens on the verdict path
//! and must stay cheap.  Quantiles are estimated from fixed buckets —
//! good enough for dashboards, free of allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::verdict::{FailureClass, Method, Verdict};

/// Histogram bucket upper bounds in milliseconds.
const BOUNDS: [u64; 12] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1_000, 5_000, 15_000];

// ── LatencyHistogram ───────────────────────────────────────────────────

/// Fixed-bucket latency histogram.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    counts: [AtomicU64; BOUNDS.len() + 1],
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Record one sample.
    pub fn record(&self, ms: u64) {
        let bucket = BOUNDS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(BOUNDS.len());
        self.counts[bucket].fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of recorded samples.
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Bucket-resolution quantile estimate (upper bound of the bucket the
    /// quantile falls in).
    #[must_use]
    pub fn quantile(&self, q: f64) -> u64 {
        let total = self.samples();
        if total == 0 {
            return 0;
        }
        let rank = ((q * total as f64).ceil() as u64).max(1);
        let mut seen = 0u64;
        for (i, count) in self.counts.iter().enumerate() {
            seen += count.load(Ordering::Relaxed);
            if seen >= rank {
                return BOUNDS.get(i).copied().unwrap_or(u64::MAX);
            }
        }
        u64::MAX
    }
}

// ── PipelineMetrics ────────────────────────────────────────────────────

/// All counters exposed by the metrics endpoint.
#[derive(Debug)]
pub struct PipelineMetrics {
    verdicts_total: AtomicU64,
    per_tier: [AtomicU64; 3],
    per_class: [AtomicU64; FailureClass::ALL.len()],
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    semantic_timeouts: AtomicU64,
    reason_fallbacks: AtomicU64,
    budget_exhausted: AtomicU64,
    internal_errors: AtomicU64,
    /// End-to-end latency.
    pub total_latency: LatencyHistogram,
    /// Tier-1 stage latency.
    pub pattern_latency: LatencyHistogram,
    /// Tier-2 stage latency.
    pub semantic_latency: LatencyHistogram,
    /// Tier-3 stage latency.
    pub reason_latency: LatencyHistogram,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    /// Fresh, zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self {
            verdicts_total: AtomicU64::new(0),
            per_tier: std::array::from_fn(|_| AtomicU64::new(0)),
            per_class: std::array::from_fn(|_| AtomicU64::new(0)),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            semantic_timeouts: AtomicU64::new(0),
            reason_fallbacks: AtomicU64::new(0),
            budget_exhausted: AtomicU64::new(0),
            internal_errors: AtomicU64::new(0),
            total_latency: LatencyHistogram::default(),
            pattern_latency: LatencyHistogram::default(),
            semantic_latency: LatencyHistogram::default(),
            reason_latency: LatencyHistogram::default(),
        }
    }

    /// Update counters for one emitted verdict.
    pub fn record_verdict(&self, verdict: &Verdict) {
        self.verdicts_total.fetch_add(1, Ordering::Relaxed);
        let tier = usize::from(verdict.tier_used.as_u8()) - 1;
        self.per_tier[tier].fetch_add(1, Ordering::Relaxed);
        self.per_class[verdict.failure_class.index()].fetch_add(1, Ordering::Relaxed);
        if verdict.cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
        match verdict.method {
            Method::SemanticTimeout => {
                self.semantic_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Method::ReasonFallback => {
                self.reason_fallbacks.fetch_add(1, Ordering::Relaxed);
            }
            Method::BudgetExhausted => {
                self.budget_exhausted.fetch_add(1, Ordering::Relaxed);
            }
            Method::InternalError => {
                self.internal_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Per-tier verdict counts `[tier1, tier2, tier3]`.
    #[must_use]
    pub fn tier_counts(&self) -> [u64; 3] {
        std::array::from_fn(|i| self.per_tier[i].load(Ordering::Relaxed))
    }

    /// Total verdicts emitted.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.verdicts_total.load(Ordering::Relaxed)
    }

    /// Cache hit ratio in `[0, 1]` (zero before any traffic).
    #[must_use]
    pub fn cache_hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Render all counters as plain-text scrape output.
    #[must_use]
    pub fn render(&self) -> String {
        use std::fmt::Write;

        let mut out = String::with_capacity(1_024);
        let _ = writeln!(out, "palisade_verdicts_total {}", self.total());
        for (i, count) in self.tier_counts().iter().enumerate() {
            let _ = writeln!(out, "palisade_verdicts_tier{{tier=\"{}\"}} {count}", i + 1);
        }
        for class in FailureClass::ALL {
            let count = self.per_class[class.index()].load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "palisade_verdicts_class{{class=\"{}\"}} {count}",
                class.as_str(),
            );
        }
        let _ = writeln!(
            out,
            "palisade_cache_hits {}",
            self.cache_hits.load(Ordering::Relaxed),
        );
        let _ = writeln!(
            out,
            "palisade_cache_misses {}",
            self.cache_misses.load(Ordering::Relaxed),
        );
        let _ = writeln!(out, "palisade_cache_hit_ratio {:.4}", self.cache_hit_ratio());
        let _ = writeln!(
            out,
            "palisade_timeouts{{stage=\"semantic\"}} {}",
            self.semantic_timeouts.load(Ordering::Relaxed),
        );
        let _ = writeln!(
            out,
            "palisade_fallbacks{{stage=\"reason\"}} {}",
            self.reason_fallbacks.load(Ordering::Relaxed),
        );
        let _ = writeln!(
            out,
            "palisade_budget_exhausted_total {}",
            self.budget_exhausted.load(Ordering::Relaxed),
        );
        let _ = writeln!(
            out,
            "palisade_internal_errors_total {}",
            self.internal_errors.load(Ordering::Relaxed),
        );
        for (name, histogram) in [
            ("total", &self.total_latency),
            ("pattern", &self.pattern_latency),
            ("semantic", &self.semantic_latency),
            ("reason", &self.reason_latency),
        ] {
            for q in [0.5, 0.95] {
                let _ = writeln!(
                    out,
                    "palisade_latency_ms{{stage=\"{name}\",quantile=\"{q}\"}} {}",
                    histogram.quantile(q),
                );
            }
        }
        out
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::{Action, Severity, Tier};

    fn verdict(tier: Tier, method: Method, cache_hit: bool) -> Verdict {
        let mut v = Verdict::new(
            Action::Allow,
            tier,
            method,
            FailureClass::None,
            Severity::Info,
            0.9,
            "test",
        );
        v.cache_hit = cache_hit;
        v
    }

    #[test]
    fn histogram_quantiles_are_monotone() {
        let h = LatencyHistogram::default();
        for ms in [1, 3, 7, 20, 80, 400] {
            h.record(ms);
        }
        assert_eq!(h.samples(), 6);
        assert!(h.quantile(0.5) <= h.quantile(0.95));
    }

    #[test]
    fn histogram_empty_is_zero() {
        let h = LatencyHistogram::default();
        assert_eq!(h.quantile(0.5), 0);
    }

    #[test]
    fn verdict_counters_accumulate() {
        let m = PipelineMetrics::new();
        m.record_verdict(&verdict(Tier::Pattern, Method::PatternClear, false));
        m.record_verdict(&verdict(Tier::Pattern, Method::PatternClear, true));
        m.record_verdict(&verdict(Tier::Semantic, Method::SemanticTimeout, false));

        assert_eq!(m.total(), 3);
        assert_eq!(m.tier_counts(), [2, 1, 0]);
        assert!((m.cache_hit_ratio() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn render_contains_all_sections() {
        let m = PipelineMetrics::new();
        m.record_verdict(&verdict(Tier::Pattern, Method::PatternClear, false));
        let text = m.render();
        assert!(text.contains("palisade_verdicts_total 1"));
        assert!(text.contains("palisade_verdicts_tier{tier=\"1\"} 1"));
        assert!(text.contains("palisade_verdicts_class{class=\"none\"} 1"));
        assert!(text.contains("palisade_cache_hit_ratio"));
        assert!(text.contains("palisade_latency_ms{stage=\"total\",quantile=\"0.5\"}"));
    }
}
