//! The injected embedding interface and the built-in deterministic
//! encoder.
//!
//! Production deployments inject a real model behind [`Embedder`]; the
//! crate ships [`HashingEmbedder`] — character-trigram feature hashing,
//! L2-normalized — so the pipeline works stand-alone and tests are fully
//! deterministic.  A bounded [`EmbedMemo`] lets repeated strings skip the
//! encoder entirely.

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use thiserror::Error;

use crate::stage::Deadline;

// ── Errors ─────────────────────────────────────────────────────────────

/// Errors raised by an embedding encoder.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// The encoder could not finish before the supplied deadline.
    #[error("encoder deadline exceeded")]
    DeadlineExceeded,

    /// The encoder backend is unreachable.
    #[error("encoder unavailable: {0}")]
    Unavailable(String),

    /// The encoder returned a vector of the wrong dimension.
    #[error("encoder returned {got}-dimensional vector, expected {expected}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Returned dimension.
        got: usize,
    },
}

// ── Embedder trait ─────────────────────────────────────────────────────

/// Text-to-unit-vector encoder.
///
/// # Contract
///
/// - `encode` must be deterministic for a given [`model_version`](Self::model_version).
/// - The returned vector must have exactly [`dimension`](Self::dimension)
///   components and unit L2 norm.
/// - Implementations must respect `deadline` and return
///   [`EmbedError::DeadlineExceeded`] rather than blocking past it.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Version identifier of the underlying model.
    fn model_version(&self) -> &str;

    /// Output dimensionality.
    fn dimension(&self) -> usize;

    /// Encode `text` into a unit vector.
    ///
    /// # Errors
    ///
    /// Returns [`EmbedError`] on timeout, backend failure, or dimension
    /// mismatch.
    async fn encode(&self, text: &str, deadline: Deadline) -> Result<Vec<f32>, EmbedError>;
}

/// Scale a vector to unit L2 norm in place.  Returns `false` when the
/// vector is all-zero (and leaves it untouched).
pub fn unit_normalize(v: &mut [f32]) -> bool {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

// ── HashingEmbedder ────────────────────────────────────────────────────

/// Deterministic character-trigram feature-hashing encoder.
///
/// Not a semantic model — near-identical strings score high, paraphrases
/// may not.  Exists so the crate has a dependency-free default and so the
/// exemplar machinery can be exercised deterministically in tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    version: String,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl HashingEmbedder {
    /// Create an encoder with the given output dimension.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
            version: format!("hashing-{}-v1", dimension.max(8)),
        }
    }

    fn feature_index(&self, gram: &[char]) -> usize {
        let mut hasher = FxHasher::default();
        for ch in gram {
            ch.hash(&mut hasher);
        }
        (hasher.finish() as usize) % self.dimension
    }

    fn encode_sync(&self, text: &str) -> Vec<f32> {
        let chars: Vec<char> = text.chars().flat_map(char::to_lowercase).collect();
        let mut v = vec![0.0_f32; self.dimension];
        if chars.len() < 3 {
            if !chars.is_empty() {
                v[self.feature_index(&chars)] = 1.0;
            }
            return v;
        }
        for gram in chars.windows(3) {
            v[self.feature_index(gram)] += 1.0;
        }
        unit_normalize(&mut v);
        v
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, text: &str, _deadline: Deadline) -> Result<Vec<f32>, EmbedError> {
        // Pure CPU, linear in the (already capped) input; no suspension
        // needed.
        Ok(self.encode_sync(text))
    }
}

// ── EmbedMemo ──────────────────────────────────────────────────────────

/// Bounded memo mapping hashed text to its embedding, so repeated strings
/// skip the encoder.
#[derive(Debug)]
pub struct EmbedMemo {
    inner: Mutex<LruCache<u64, Arc<Vec<f32>>>>,
}

impl EmbedMemo {
    /// Create a memo holding at most `capacity` embeddings.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is nonzero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn key(text: &str) -> u64 {
        let mut hasher = FxHasher::default();
        text.hash(&mut hasher);
        hasher.finish()
    }

    /// Cached embedding for `text`, if present.
    #[must_use]
    pub fn get(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        self.inner.lock().get(&Self::key(text)).cloned()
    }

    /// Store an embedding for `text`.
    pub fn put(&self, text: &str, embedding: Arc<Vec<f32>>) {
        self.inner.lock().put(Self::key(text), embedding);
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
