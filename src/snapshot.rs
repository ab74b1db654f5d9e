//! The atomically published snapshot: patterns, exemplar index, and policy
//! in force for a request.
//!
//! A hot reload builds a complete new [`Snapshot`] off-line — compiling
//! patterns, re-embedding exemplars, resolving the policy table — and only
//! then publishes it through [`SnapshotStore`].  Requests capture the
//! current `Arc` once at entry and hold it throughout, so in-flight
//! requests finish against the snapshot they started with and readers never
//! observe torn state.  Any build error aborts the reload and leaves the
//! previous snapshot untouched.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::pattern::{PatternError, PatternSet};
use crate::policy::{PolicyDocument, PolicyError, PolicyTable};
use crate::semantic::{
    Embedder, Exemplar, ExemplarSource, IndexBuilder, IndexError, builtin_exemplars,
};
use crate::stage::Deadline;
use crate::verdict::FailureClass;

// ── Errors ─────────────────────────────────────────────────────────────

/// Errors that abort a snapshot build (and therefore a reload).
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The policy document failed validation or table resolution.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// A pattern failed compilation or the safety check.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// Exemplar vectors were inconsistent with the index dimension.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// An exemplar could not be embedded.
    #[error("failed to embed exemplar '{text}': {source}")]
    Embed {
        /// First characters of the exemplar text.
        text: String,
        /// Underlying encoder error.
        source: crate::semantic::EmbedError,
    },
}

// ── Snapshot ───────────────────────────────────────────────────────────

/// Immutable bundle of everything a request evaluates against.
#[derive(Debug)]
pub struct Snapshot {
    /// Compiled tier-1 pattern library.
    pub patterns: PatternSet,
    /// Tier-2 exemplar index.
    pub index: crate::semantic::ExemplarIndex,
    /// Resolved policy table.
    pub policy: PolicyTable,
    /// Version string, rotated into the decision-cache key.
    pub version: String,
}

impl Snapshot {
    /// Build a snapshot from a policy document, embedding all exemplars
    /// through the injected encoder.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] on any load failure; the caller keeps the
    /// previous snapshot.
    pub async fn build(
        doc: &PolicyDocument,
        config: &PipelineConfig,
        embedder: &dyn Embedder,
    ) -> Result<Self, SnapshotError> {
        doc.validate()?;

        let patterns = PatternSet::compile(&doc.patterns)?;
        let policy = doc.build_table()?;

        let mut builder = IndexBuilder::new(embedder.dimension());
        for class in FailureClass::ALL {
            if *class != FailureClass::None {
                builder.set_threshold(*class, policy.threshold(*class, config));
            }
        }

        let encode_budget = Duration::from_millis(config.encode_timeout_ms);
        let mut pending: Vec<(FailureClass, String, ExemplarSource)> = builtin_exemplars()
            .into_iter()
            .map(|(class, text)| (class, text.to_string(), ExemplarSource::Builtin))
            .collect();
        pending.extend(
            doc.exemplars()
                .into_iter()
                .map(|(class, text)| (class, text, ExemplarSource::Policy)),
        );

        for (class, text, source) in pending {
            let embedding = embedder
                .encode(&text, Deadline::after(encode_budget))
                .await
                .map_err(|source| SnapshotError::Embed {
                    text: text.chars().take(40).collect(),
                    source,
                })?;
            builder.push(Exemplar {
                failure_class: class,
                text,
                embedding,
                source,
            })?;
        }

        let version = doc.version.clone().unwrap_or_else(|| derived_version(doc));

        Ok(Self {
            patterns,
            index: builder.build(),
            policy,
            version,
        })
    }

    #[cfg(test)]
    pub(crate) fn builtin_for_tests() -> Self {
        Self::builtin_for_tests_with_dim(8)
    }

    #[cfg(test)]
    pub(crate) fn builtin_for_tests_with_dim(dimension: usize) -> Self {
        Self {
            patterns: PatternSet::compile(&[]).expect("builtin patterns compile"),
            index: IndexBuilder::new(dimension).build(),
            policy: PolicyTable::defaults(),
            version: "test-snapshot".to_string(),
        }
    }
}

/// Content-derived version for documents that do not declare one, so any
/// document change rotates the decision-cache key.
fn derived_version(doc: &PolicyDocument) -> String {
    let serialized = serde_json::to_vec(doc).unwrap_or_default();
    let digest = Sha256::digest(&serialized);
    format!("doc-{:x}", digest)[..16].to_string()
}

// ── SnapshotStore ──────────────────────────────────────────────────────

/// Atomic publication point for the current snapshot.
///
/// Readers clone the `Arc` in a short read-locked section; a reload swaps
/// the pointer under the write lock.  No reader ever blocks on a build.
#[derive(Debug)]
pub struct SnapshotStore {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotStore {
    /// Create a store publishing the given initial snapshot.
    #[must_use]
    pub fn new(initial: Arc<Snapshot>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Capture the snapshot currently in force.
    #[must_use]
    pub fn load(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    /// Publish a new snapshot.  In-flight requests keep the `Arc` they
    /// captured at entry.
    pub fn publish(&self, snapshot: Arc<Snapshot>) {
        let version = snapshot.version.clone();
        *self.current.write() = snapshot;
        tracing::info!(version = %version, "snapshot published");
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::HashingEmbedder;

    #[tokio::test]
    async fn build_from_empty_document_uses_builtins() {
        let doc = PolicyDocument::default();
        let embedder = HashingEmbedder::default();
        let snapshot = Snapshot::build(&doc, &PipelineConfig::default(), &embedder)
            .await
            .unwrap();
        assert!(!snapshot.patterns.is_empty());
        assert_eq!(snapshot.index.len(), builtin_exemplars().len());
        assert!(snapshot.version.starts_with("doc-"));
    }

    #[tokio::test]
    async fn declared_version_wins() {
        let doc = PolicyDocument {
            version: Some("release-9".into()),
            ..PolicyDocument::default()
        };
        let embedder = HashingEmbedder::default();
        let snapshot = Snapshot::build(&doc, &PipelineConfig::default(), &embedder)
            .await
            .unwrap();
        assert_eq!(snapshot.version, "release-9");
    }

    #[tokio::test]
    async fn policy_exemplars_join_the_index() {
        let yaml = r"
failure_policies:
  domain_mismatch:
    examples:
      - 'tell me about celebrity gossip instead'
";
        let doc: PolicyDocument = serde_yaml::from_str(yaml).unwrap();
        let embedder = HashingEmbedder::default();
        let snapshot = Snapshot::build(&doc, &PipelineConfig::default(), &embedder)
            .await
            .unwrap();
        assert_eq!(snapshot.index.len(), builtin_exemplars().len() + 1);
    }

    #[tokio::test]
    async fn invalid_document_aborts_build() {
        let yaml = r"
failure_policies:
  not_a_class:
    action: block
";
        let doc: PolicyDocument = serde_yaml::from_str(yaml).unwrap();
        let embedder = HashingEmbedder::default();
        let err = Snapshot::build(&doc, &PipelineConfig::default(), &embedder)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Policy(_)));
    }

    #[tokio::test]
    async fn store_swaps_atomically() {
        let embedder = HashingEmbedder::default();
        let config = PipelineConfig::default();
        let first = Arc::new(
            Snapshot::build(&PolicyDocument::default(), &config, &embedder)
                .await
                .unwrap(),
        );
        let store = SnapshotStore::new(Arc::clone(&first));

        let captured = store.load();

        let second_doc = PolicyDocument {
            version: Some("v2".into()),
            ..PolicyDocument::default()
        };
        let second = Arc::new(Snapshot::build(&second_doc, &config, &embedder).await.unwrap());
        store.publish(second);

        // The captured snapshot is unchanged; new loads see v2.
        assert_eq!(captured.version, first.version);
        assert_eq!(store.load().version, "v2");
    }
}
