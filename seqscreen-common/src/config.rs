//! Rules and policy configuration loading
//!
//! Both files are YAML and are consulted at startup and again at each run's
//! ruleset-metadata resolution. A missing or malformed file is a
//! configuration error surfaced to the caller before any stage runs; the
//! validators themselves never see a broken config.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Severity;
use crate::{Error, Result};

// ============================================================================
// Rules configuration
// ============================================================================

/// Top-level rules configuration (`validation_rules.yml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Declared semver of the ruleset.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub changelog: Vec<ChangelogEntry>,
    #[serde(default)]
    pub rules: RuleSections,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub version: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub changes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSections {
    #[serde(default)]
    pub consistency: ConsistencyRules,
    #[serde(default)]
    pub duplicates: DuplicateRules,
    #[serde(default)]
    pub bias: BiasRules,
    #[serde(default)]
    pub custom: Vec<CustomRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsistencyRules {
    #[serde(default)]
    pub required_columns: Vec<String>,
    /// Expected cell type per column.
    #[serde(default)]
    pub column_types: BTreeMap<String, ColumnType>,
    /// Closed `[min, max]` interval per numeric column.
    #[serde(default)]
    pub value_ranges: BTreeMap<String, ValueRange>,
    #[serde(default)]
    pub cross_column: Vec<CrossColumnRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Float,
    String,
    Bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ValueRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

/// Declarative relation between two columns, e.g. `start < end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossColumnRule {
    pub column1: String,
    pub operator: CrossColumnOp,
    pub column2: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossColumnOp {
    #[serde(rename = "<")]
    Less,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "==")]
    Equal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateRules {
    #[serde(default = "default_true")]
    pub check_duplicate_rows: bool,
    /// Columns whose values must be unique across the dataset.
    #[serde(default)]
    pub unique_columns: Vec<String>,
    /// Columns scanned for near-duplicate sequences.
    #[serde(default)]
    pub sequence_columns: Vec<String>,
    /// Similarity at or above which two sequences count as near-duplicates.
    #[serde(default = "default_similarity_threshold")]
    pub sequence_similarity_threshold: f64,
}

impl Default for DuplicateRules {
    fn default() -> Self {
        Self {
            check_duplicate_rows: true,
            unique_columns: Vec::new(),
            sequence_columns: Vec::new(),
            sequence_similarity_threshold: default_similarity_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiasRules {
    /// Categorical columns checked for class imbalance and used for
    /// missingness correlation.
    #[serde(default)]
    pub categorical_columns: Vec<String>,
    #[serde(default = "default_imbalance_threshold")]
    pub imbalance_threshold: f64,
    #[serde(default = "default_missing_threshold")]
    pub missing_value_threshold: f64,
}

impl Default for BiasRules {
    fn default() -> Self {
        Self {
            categorical_columns: Vec::new(),
            imbalance_threshold: default_imbalance_threshold(),
            missing_value_threshold: default_missing_threshold(),
        }
    }
}

/// User-defined rule evaluated by the rule engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRule {
    pub id: String,
    #[serde(default)]
    pub field: Option<String>,
    pub severity: Severity,
    pub message: String,
    pub predicate: CustomPredicate,
}

/// The closed set of predicates custom rules may use. Rows violating the
/// predicate are reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomPredicate {
    /// Cell must be non-null.
    NonNull { column: String },
    /// Cell text must be one of the listed values.
    InSet { column: String, values: Vec<String> },
    /// Cell text length must be at least `min`.
    MinLength { column: String, min: usize },
    /// Cell text length must be at most `max`.
    MaxLength { column: String, max: usize },
}

fn default_true() -> bool {
    true
}

fn default_similarity_threshold() -> f64 {
    0.95
}

fn default_imbalance_threshold() -> f64 {
    0.30
}

fn default_missing_threshold() -> f64 {
    0.10
}

impl RulesConfig {
    /// Load and parse the rules file. Unreadable or malformed YAML is a
    /// configuration error; no validation report is produced for those.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read rules config {}: {e}", path.display()))
        })?;
        let config = Self::from_yaml(&contents).map_err(|e| {
            Error::Config(format!("Malformed rules config {}: {e}", path.display()))
        })?;
        info!(
            path = %path.display(),
            version = config.version.as_deref().unwrap_or("unknown"),
            custom_rules = config.rules.custom.len(),
            "Loaded validation rules"
        );
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

// ============================================================================
// Policy configuration
// ============================================================================

/// Top-level policy configuration (`policy_config.yml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub decision_matrix: DecisionMatrix,
    #[serde(default)]
    pub human_review_triggers: HumanReviewTriggers,
}

/// First-match-wins decision thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecisionMatrix {
    /// Criticals at or above this count reject the dataset.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: usize,
    /// Errors at or above this count reject the dataset.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: usize,
    /// Warnings at or above this count downgrade to conditional accept.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: usize,
}

impl Default for DecisionMatrix {
    fn default() -> Self {
        Self {
            critical_threshold: default_critical_threshold(),
            error_threshold: default_error_threshold(),
            warning_threshold: default_warning_threshold(),
        }
    }
}

/// Disjunction of conditions that flag a run for human review.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HumanReviewTriggers {
    #[serde(default = "default_true")]
    pub on_critical: bool,
    #[serde(default = "default_review_error_threshold")]
    pub error_count_threshold: usize,
    #[serde(default = "default_review_warning_threshold")]
    pub warning_count_threshold: usize,
}

impl Default for HumanReviewTriggers {
    fn default() -> Self {
        Self {
            on_critical: true,
            error_count_threshold: default_review_error_threshold(),
            warning_count_threshold: default_review_warning_threshold(),
        }
    }
}

fn default_critical_threshold() -> usize {
    1
}

fn default_error_threshold() -> usize {
    5
}

fn default_warning_threshold() -> usize {
    10
}

fn default_review_error_threshold() -> usize {
    3
}

fn default_review_warning_threshold() -> usize {
    15
}

impl PolicyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read policy config {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&contents).map_err(|e| {
            Error::Config(format!("Malformed policy config {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "Loaded policy configuration");
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
