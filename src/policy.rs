//! Policy engine — the declarative table mapping each failure class to a
//! severity, an enforcement action, an optional threshold override, and a
//! reason.
//!
//! Stages propose actions; the policy table has the final word.  The table
//! is hot-reloadable from a [`PolicyDocument`] (YAML, TOML, or JSON by file
//! extension, like the rest of the configuration surface); parse or
//! validation errors abort the reload and leave the running snapshot
//! untouched.
//!
//! Policy maps `class → action` with no class-to-class dependencies;
//! severity-based tie-breaking between simultaneously-matching classes is
//! the only inter-class relation and is a pure lookup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::verdict::{Action, FailureClass, Severity};

// ── Errors ─────────────────────────────────────────────────────────────

/// Errors raised while loading or validating a policy document.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Failed to read the policy file.
    #[error("failed to read policy file at {path}: {source}")]
    FileRead {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the policy document.
    #[error("failed to parse {format} policy: {source}")]
    Parse {
        /// Format that failed to parse.
        format: &'static str,
        /// Underlying parse error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Unsupported or unrecognised file extension.
    #[error("unsupported policy file format: extension must be .yaml, .yml, .toml, or .json")]
    UnsupportedFormat,

    /// The document names a class outside the closed enumeration.
    #[error("unknown failure class '{0}' in policy document")]
    UnknownClass(String),

    /// A threshold was outside `[0, 1]`.
    #[error("threshold {value} for class '{class}' is outside [0, 1]")]
    InvalidThreshold {
        /// Class the threshold was attached to.
        class: String,
        /// Offending value.
        value: f32,
    },

    /// A custom pattern failed the structural safety check or regex
    /// compilation.
    #[error("custom pattern '{id}' rejected: {reason}")]
    InvalidPattern {
        /// Pattern id.
        id: String,
        /// Why it was rejected.
        reason: String,
    },
}

// ── ClassPolicy ────────────────────────────────────────────────────────

/// Per-class enforcement entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassPolicy {
    /// Severity assigned to detections of this class.
    pub severity: Severity,
    /// Final action for this class.
    pub action: Action,
    /// Optional exemplar-threshold override; `None` falls back to the
    /// security/content default.
    pub threshold: Option<f32>,
    /// Operator-facing rationale.
    pub reason: String,
}

// ── PolicyTable ────────────────────────────────────────────────────────

/// The resolved class → policy mapping in force for one snapshot.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    entries: FxHashMap<FailureClass, ClassPolicy>,
}

impl PolicyTable {
    /// The built-in default table.
    #[must_use]
    pub fn defaults() -> Self {
        use Action::{Allow, Block, Warn};
        use FailureClass as F;
        use Severity::{Critical, High, Info, Low, Medium};

        let mut entries = FxHashMap::default();
        let mut set = |class: F, severity, action, reason: &str| {
            entries.insert(
                class,
                ClassPolicy {
                    severity,
                    action,
                    threshold: None,
                    reason: reason.to_string(),
                },
            );
        };

        set(F::PromptInjection, Critical, Block, "instruction override attempts");
        set(F::Toxicity, Critical, Block, "abusive content");
        set(F::PathTraversal, Critical, Block, "filesystem escape payloads");
        set(F::CommandInjection, Critical, Block, "shell execution payloads");
        set(F::FabricatedFact, High, Block, "verifiably false assertions");
        set(F::FabricatedConcept, High, Block, "references to nonexistent entities");
        set(F::SqlInjection, High, Block, "database attack payloads");
        set(F::Xss, High, Block, "script injection payloads");
        set(F::Bias, High, Block, "systematically slanted framing");
        set(F::MissingGrounding, Medium, Warn, "claims without support");
        set(F::Overconfidence, Medium, Warn, "certainty beyond evidence");
        set(F::DomainMismatch, Low, Warn, "out-of-domain content");
        set(F::PathologicalInput, High, Block, "resource-exhaustion inputs");
        set(F::None, Info, Allow, "no failure detected");

        Self { entries }
    }

    /// Final `(action, severity)` for a class.  `none` is always
    /// `(allow, info)` regardless of overrides.
    #[must_use]
    pub fn decide(&self, class: FailureClass) -> (Action, Severity) {
        if class == FailureClass::None {
            return (Action::Allow, Severity::Info);
        }
        self.entries
            .get(&class)
            .map_or((Action::Block, Severity::High), |p| (p.action, p.severity))
    }

    /// Severity lookup used for tie-breaking between simultaneously
    /// matching classes.
    #[must_use]
    pub fn severity(&self, class: FailureClass) -> Severity {
        self.decide(class).1
    }

    /// Exemplar threshold for a class: the per-class override when present,
    /// otherwise the security/content default from the configuration.
    #[must_use]
    pub fn threshold(&self, class: FailureClass, config: &PipelineConfig) -> f32 {
        if let Some(p) = self.entries.get(&class)
            && let Some(t) = p.threshold
        {
            return t;
        }
        if class.is_security() {
            config.security_threshold
        } else {
            config.content_threshold
        }
    }

    /// Replace the action for a class (operator override path).
    pub fn set_action(&mut self, class: FailureClass, action: Action) {
        if let Some(p) = self.entries.get_mut(&class) {
            p.action = action;
        }
    }

    /// Merge one document entry over the defaults.
    fn apply(&mut self, class: FailureClass, entry: &FailurePolicyEntry) {
        let slot = self.entries.entry(class).or_insert_with(|| ClassPolicy {
            severity: Severity::Medium,
            action: Action::Warn,
            threshold: None,
            reason: String::new(),
        });
        if let Some(severity) = entry.severity {
            slot.severity = severity;
        }
        if let Some(action) = entry.action {
            slot.action = action;
        }
        if entry.threshold.is_some() {
            slot.threshold = entry.threshold;
        }
        if let Some(reason) = &entry.reason {
            slot.reason = reason.clone();
        }
    }
}

// ── PolicyDocument ─────────────────────────────────────────────────────

/// A custom tier-1 pattern supplied by the policy source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPatternSpec {
    /// Unique identifier.
    pub id: String,
    /// Failure class assigned on match.
    pub failure_class: FailureClass,
    /// Raw regex source; validated against the structural safety check at
    /// load time.
    pub regex: String,
    /// Confidence reported when the pattern matches.
    pub confidence: f32,
    /// Whether a match *reduces* suspicion.
    #[serde(default)]
    pub is_anti_pattern: bool,
}

/// One class entry in the policy document.  All fields optional — missing
/// fields keep the built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailurePolicyEntry {
    /// Severity override.
    pub severity: Option<Severity>,
    /// Action override.
    pub action: Option<Action>,
    /// Exemplar-threshold override.
    pub threshold: Option<f32>,
    /// Operator-facing rationale.
    pub reason: Option<String>,
    /// Exemplar texts for this class, embedded into the index at reload.
    #[serde(default)]
    pub examples: Vec<String>,
}

/// Global threshold defaults carried by the document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GlobalThresholds {
    /// Default for security classes.
    pub security: Option<f32>,
    /// Default for content classes.
    pub content: Option<f32>,
}

/// Tier enable flags carried by the document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierFlags {
    /// Whether the semantic stage is enabled.
    pub semantic: Option<bool>,
    /// Whether the reasoning stage is enabled.
    pub reasoning: Option<bool>,
}

/// The operator-facing policy document: per-class policies and exemplars,
/// global thresholds, tier flags, and custom patterns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Version string published with the snapshot; changing it invalidates
    /// the decision cache by key rotation.
    pub version: Option<String>,
    /// Class-keyed policy entries (snake_case class names).
    #[serde(default)]
    pub failure_policies: BTreeMap<String, FailurePolicyEntry>,
    /// Global threshold defaults.
    pub thresholds: Option<GlobalThresholds>,
    /// Tier enable flags.
    pub tiers: Option<TierFlags>,
    /// Additional tier-1 patterns.
    #[serde(default)]
    pub patterns: Vec<CustomPatternSpec>,
}

impl PolicyDocument {
    /// Load a document from a YAML, TOML, or JSON file by extension.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if the file cannot be read, parsed, or
    /// validated.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| PolicyError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        let doc: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => {
                serde_yaml::from_str(&content).map_err(|e| PolicyError::Parse {
                    format: "YAML",
                    source: Box::new(e),
                })?
            }
            Some("toml") => toml::from_str(&content).map_err(|e| PolicyError::Parse {
                format: "TOML",
                source: Box::new(e),
            })?,
            Some("json") => serde_json::from_str(&content).map_err(|e| PolicyError::Parse {
                format: "JSON",
                source: Box::new(e),
            })?,
            _ => return Err(PolicyError::UnsupportedFormat),
        };

        doc.validate()?;
        Ok(doc)
    }

    /// Validate class names and value ranges without building anything.
    ///
    /// # Errors
    ///
    /// Returns the first [`PolicyError`] found.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (name, entry) in &self.failure_policies {
            let class = FailureClass::from_str_opt(name)
                .ok_or_else(|| PolicyError::UnknownClass(name.clone()))?;
            if let Some(t) = entry.threshold
                && !(0.0..=1.0).contains(&t)
            {
                return Err(PolicyError::InvalidThreshold {
                    class: class.as_str().to_string(),
                    value: t,
                });
            }
        }
        for pattern in &self.patterns {
            if !(0.0..=1.0).contains(&pattern.confidence) {
                return Err(PolicyError::InvalidPattern {
                    id: pattern.id.clone(),
                    reason: format!("confidence {} outside [0, 1]", pattern.confidence),
                });
            }
        }
        Ok(())
    }

    /// Resolve the document over the built-in defaults into a
    /// [`PolicyTable`].
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::UnknownClass`] for names outside the closed
    /// enumeration.
    pub fn build_table(&self) -> Result<PolicyTable, PolicyError> {
        let mut table = PolicyTable::defaults();
        for (name, entry) in &self.failure_policies {
            let class = FailureClass::from_str_opt(name)
                .ok_or_else(|| PolicyError::UnknownClass(name.clone()))?;
            table.apply(class, entry);
        }
        Ok(table)
    }

    /// Apply the document's global thresholds and tier flags over a
    /// configuration.
    #[must_use]
    pub fn apply_to_config(&self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(thresholds) = self.thresholds {
            if let Some(s) = thresholds.security {
                config.security_threshold = s;
            }
            if let Some(c) = thresholds.content {
                config.content_threshold = c;
            }
        }
        if let Some(tiers) = self.tiers {
            if let Some(semantic) = tiers.semantic {
                config.tier2_enabled = semantic;
            }
            if let Some(reasoning) = tiers.reasoning {
                config.tier3_enabled = reasoning;
            }
        }
        config
    }

    /// All `(class, text)` exemplars declared under the class entries.
    #[must_use]
    pub fn exemplars(&self) -> Vec<(FailureClass, String)> {
        let mut out = Vec::new();
        for (name, entry) in &self.failure_policies {
            if let Some(class) = FailureClass::from_str_opt(name) {
                for text in &entry.examples {
                    out.push((class, text.clone()));
                }
            }
        }
        out
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
