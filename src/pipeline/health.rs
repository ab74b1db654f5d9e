//! Tier-health monitor — rolling tier-usage distribution with drift
//! warnings.
//!
//! A healthy deployment resolves the overwhelming majority of traffic at
//! tier 1; sustained escalation to the advanced tiers means the pattern
//! library has drifted behind the traffic (or an attack is probing the
//! semantic surface), and shows up here before it shows up in the latency
//! budget.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Minimum observations before the monitor starts judging the
/// distribution.
const WARMUP_SAMPLES: usize = 20;

/// Flag thresholds, in percent of the rolling window.
const TIER1_MIN_PCT: f64 = 80.0;
const TIER2_MAX_PCT: f64 = 15.0;
const TIER3_MAX_PCT: f64 = 5.0;

// ── HealthReport ───────────────────────────────────────────────────────

/// Snapshot of the tier distribution over the rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Percent of recent verdicts resolved at tier 1.
    pub tier1_pct: f64,
    /// Percent of recent verdicts resolved at tier 2.
    pub tier2_pct: f64,
    /// Percent of recent verdicts resolved at tier 3.
    pub tier3_pct: f64,
    /// Whether the distribution is within the expected envelope.
    pub ok: bool,
    /// Human-readable findings when it is not.
    pub messages: Vec<String>,
}

// ── TierHealth ─────────────────────────────────────────────────────────

/// Rolling window of tier numbers for emitted verdicts.
#[derive(Debug)]
pub struct TierHealth {
    window: Mutex<VecDeque<u8>>,
    capacity: usize,
}

impl TierHealth {
    /// Monitor over the last `capacity` verdicts.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Record the tier of one emitted verdict.
    pub fn observe(&self, tier: u8) {
        let mut window = self.window.lock();
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(tier);
    }

    /// Compute the current distribution and flags.
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let window = self.window.lock();
        let total = window.len();
        let count = |tier: u8| window.iter().filter(|t| **t == tier).count();

        if total < WARMUP_SAMPLES {
            // Not enough signal to judge; report the raw numbers as ok.
            let pct = |n: usize| {
                if total == 0 {
                    0.0
                } else {
                    n as f64 * 100.0 / total as f64
                }
            };
            return HealthReport {
                tier1_pct: pct(count(1)),
                tier2_pct: pct(count(2)),
                tier3_pct: pct(count(3)),
                ok: true,
                messages: Vec::new(),
            };
        }

        let tier1_pct = count(1) as f64 * 100.0 / total as f64;
        let tier2_pct = count(2) as f64 * 100.0 / total as f64;
        let tier3_pct = count(3) as f64 * 100.0 / total as f64;

        let mut messages = Vec::new();
        if tier1_pct < TIER1_MIN_PCT {
            messages.push(format!(
                "tier-1 resolution at {tier1_pct:.1}% (expected ≥ {TIER1_MIN_PCT:.0}%)",
            ));
        }
        if tier2_pct > TIER2_MAX_PCT {
            messages.push(format!(
                "tier-2 escalation at {tier2_pct:.1}% (expected ≤ {TIER2_MAX_PCT:.0}%)",
            ));
        }
        if tier3_pct > TIER3_MAX_PCT {
            messages.push(format!(
                "tier-3 escalation at {tier3_pct:.1}% (expected ≤ {TIER3_MAX_PCT:.0}%)",
            ));
        }

        HealthReport {
            tier1_pct,
            tier2_pct,
            tier3_pct,
            ok: messages.is_empty(),
            messages,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_is_always_ok() {
        let h = TierHealth::new(100);
        for _ in 0..5 {
            h.observe(3);
        }
        let report = h.report();
        assert!(report.ok);
        assert!(report.messages.is_empty());
    }

    #[test]
    fn healthy_distribution_passes() {
        let h = TierHealth::new(100);
        for _ in 0..90 {
            h.observe(1);
        }
        for _ in 0..8 {
            h.observe(2);
        }
        for _ in 0..2 {
            h.observe(3);
        }
        let report = h.report();
        assert!(report.ok, "{:?}", report.messages);
        assert!(report.tier1_pct > 80.0);
    }

    #[test]
    fn excessive_tier2_is_flagged() {
        let h = TierHealth::new(100);
        for _ in 0..70 {
            h.observe(1);
        }
        for _ in 0..30 {
            h.observe(2);
        }
        let report = h.report();
        assert!(!report.ok);
        assert_eq!(report.messages.len(), 2, "tier1 low and tier2 high");
    }

    #[test]
    fn window_is_bounded() {
        let h = TierHealth::new(50);
        for _ in 0..50 {
            h.observe(3);
        }
        // Healthy traffic pushes the bad prefix out of the window.
        for _ in 0..50 {
            h.observe(1);
        }
        let report = h.report();
        assert!(report.ok, "{:?}", report.messages);
        assert!((report.tier1_pct - 100.0).abs() < 1e-9);
    }
}
