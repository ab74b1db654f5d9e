//! The exemplar index — precomputed unit vectors per failure class with
//! max-pool nearest-neighbor scoring.
//!
//! The index is immutable once built and is published atomically inside a
//! snapshot; a hot reload builds a fresh index off-line so readers never
//! observe torn state.  The content hash participates in the decision-cache
//! key, which is how a reload logically invalidates stale cached verdicts.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::verdict::FailureClass;

// ── Errors ─────────────────────────────────────────────────────────────

/// Errors raised while building or querying the index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// An exemplar's vector does not match the index dimension — a
    /// load-time error that aborts the snapshot build.
    #[error("exemplar '{text}' has dimension {got}, index dimension is {expected}")]
    DimensionMismatch {
        /// First characters of the offending exemplar text.
        text: String,
        /// Index dimension.
        expected: usize,
        /// Offending vector dimension.
        got: usize,
    },

    /// A query vector does not match the index dimension — a programming
    /// error surfaced at query time.
    #[error("query vector has dimension {got}, index dimension is {expected}")]
    QueryDimensionMismatch {
        /// Index dimension.
        expected: usize,
        /// Query vector dimension.
        got: usize,
    },
}

// ── Exemplar ───────────────────────────────────────────────────────────

/// Where an exemplar came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExemplarSource {
    /// Declared in the operator policy document.
    Policy,
    /// Shipped with the crate.
    Builtin,
}

/// One embedded exemplar: a short text whose vector represents one way a
/// failure class appears.
#[derive(Debug, Clone)]
pub struct Exemplar {
    /// Class this exemplar represents.
    pub failure_class: FailureClass,
    /// Source text.
    pub text: String,
    /// Unit-normalized embedding.
    pub embedding: Vec<f32>,
    /// Provenance.
    pub source: ExemplarSource,
}

/// Per-class score produced by a query.
#[derive(Debug, Clone, Copy)]
pub struct ClassScore {
    /// Scored class.
    pub failure_class: FailureClass,
    /// Max-pooled inner product over the class's exemplars.
    pub score: f32,
}

// ── IndexBuilder ───────────────────────────────────────────────────────

/// Accumulates exemplars and thresholds, then freezes them into an
/// [`ExemplarIndex`].
#[derive(Debug)]
pub struct IndexBuilder {
    dimension: usize,
    exemplars: Vec<Exemplar>,
    thresholds: FxHashMap<FailureClass, f32>,
}

impl IndexBuilder {
    /// Start an index of the given dimension.  The dimension is fixed here;
    /// exemplars of any other dimension are load-time errors.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            exemplars: Vec::new(),
            thresholds: FxHashMap::default(),
        }
    }

    /// Add one exemplar.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] when the embedding has the
    /// wrong dimension.
    pub fn push(&mut self, exemplar: Exemplar) -> Result<(), IndexError> {
        if exemplar.embedding.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                text: exemplar.text.chars().take(40).collect(),
                expected: self.dimension,
                got: exemplar.embedding.len(),
            });
        }
        self.exemplars.push(exemplar);
        Ok(())
    }

    /// Set the trigger threshold for a class.
    pub fn set_threshold(&mut self, class: FailureClass, threshold: f32) {
        self.thresholds.insert(class, threshold);
    }

    /// Freeze into an immutable index, computing the content hash.
    #[must_use]
    pub fn build(self) -> ExemplarIndex {
        let mut hasher = Sha256::new();
        hasher.update((self.dimension as u64).to_le_bytes());
        for exemplar in &self.exemplars {
            hasher.update(exemplar.failure_class.as_str().as_bytes());
            hasher.update([0x1f]);
            hasher.update(exemplar.text.as_bytes());
            hasher.update([0x1e]);
        }
        let mut threshold_entries: Vec<_> = self
            .thresholds
            .iter()
            .map(|(class, t)| (class.as_str(), t.to_bits()))
            .collect();
        threshold_entries.sort_unstable();
        for (name, bits) in threshold_entries {
            hasher.update(name.as_bytes());
            hasher.update(bits.to_le_bytes());
        }
        let content_hash = format!("{:x}", hasher.finalize());

        let mut vectors = Vec::with_capacity(self.exemplars.len() * self.dimension);
        let mut labels = Vec::with_capacity(self.exemplars.len());
        for exemplar in &self.exemplars {
            vectors.extend_from_slice(&exemplar.embedding);
            labels.push(exemplar.failure_class);
        }

        ExemplarIndex {
            dimension: self.dimension,
            vectors,
            labels,
            thresholds: self.thresholds,
            content_hash,
        }
    }
}

// ── ExemplarIndex ──────────────────────────────────────────────────────

/// Immutable M×d exemplar matrix with class labels and per-class
/// thresholds.
#[derive(Debug)]
pub struct ExemplarIndex {
    dimension: usize,
    vectors: Vec<f32>,
    labels: Vec<FailureClass>,
    thresholds: FxHashMap<FailureClass, f32>,
    content_hash: String,
}

impl ExemplarIndex {
    /// Vector dimensionality.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of exemplars.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the index holds no exemplars.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Hash over the index contents, rotated into the decision-cache key.
    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Trigger threshold for a class (as resolved at build time).
    #[must_use]
    pub fn threshold(&self, class: FailureClass) -> f32 {
        self.thresholds.get(&class).copied().unwrap_or(1.0)
    }

    /// Inner products against every exemplar, max-pooled per class.
    ///
    /// Classes are returned in a deterministic order (lexicographic on
    /// class id).
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::QueryDimensionMismatch`] when the query has
    /// the wrong dimension — a programming error the caller converts into
    /// an internal-error verdict.
    pub fn max_pool(&self, query: &[f32]) -> Result<Vec<ClassScore>, IndexError> {
        if query.len() != self.dimension {
            return Err(IndexError::QueryDimensionMismatch {
                expected: self.dimension,
                got: query.len(),
            });
        }

        let mut best: FxHashMap<FailureClass, f32> = FxHashMap::default();
        for (row, class) in self.labels.iter().enumerate() {
            let offset = row * self.dimension;
            let vector = &self.vectors[offset..offset + self.dimension];
            let score: f32 = vector.iter().zip(query).map(|(a, b)| a * b).sum();
            let slot = best.entry(*class).or_insert(f32::MIN);
            if score > *slot {
                *slot = score;
            }
        }

        let mut scores: Vec<ClassScore> = best
            .into_iter()
            .map(|(failure_class, score)| ClassScore {
                failure_class,
                score,
            })
            .collect();
        scores.sort_by(|a, b| a.failure_class.as_str().cmp(b.failure_class.as_str()));
        Ok(scores)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
