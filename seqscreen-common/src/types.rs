//! Core data model for the validation pipeline
//!
//! Defines the contracts passed between the orchestrator, the per-stage
//! validators, the policy engine, and downstream consumers of the final
//! report. Every type here serializes to the JSON shape the HTTP layer
//! exposes; enum values serialize as lowercase strings.

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Severity and Issues
// ============================================================================

/// Issue severity, ordered from least to most severe.
///
/// `Error` and `Critical` fail a stage; `Info` and `Warning` do not.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single validation finding.
///
/// Issues are created by validators, collected into a [`StageResult`], and
/// finally aggregated by the policy engine. Row indices are ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    /// Stable rule identifier, e.g. `BIO_002`, `DUP_003`.
    pub rule_id: String,
    /// Column the issue refers to; `None` for table-level findings.
    #[serde(default)]
    pub field: Option<String>,
    pub message: String,
    /// Affected row indices, ascending. Empty for table-level findings.
    #[serde(default)]
    pub affected_rows: Vec<usize>,
    /// Rule-specific context (counts, thresholds, sampled values).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Issue {
    pub fn new(severity: Severity, rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            rule_id: rule_id.into(),
            field: None,
            message: message.into(),
            affected_rows: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Attach affected rows. Indices are sorted and deduplicated so the
    /// ascending-order contract holds regardless of production order.
    pub fn with_rows(mut self, mut rows: Vec<usize>) -> Self {
        rows.sort_unstable();
        rows.dedup();
        self.affected_rows = rows;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ============================================================================
// Dataset Description
// ============================================================================

/// The closed set of recognized dataset formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    GuideRna,
    VariantAnnotation,
    SampleMetadata,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::GuideRna => "guide_rna",
            DataFormat::VariantAnnotation => "variant_annotation",
            DataFormat::SampleMetadata => "sample_metadata",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guide_rna" => Ok(DataFormat::GuideRna),
            "variant_annotation" => Ok(DataFormat::VariantAnnotation),
            "sample_metadata" => Ok(DataFormat::SampleMetadata),
            other => Err(crate::Error::InvalidInput(format!(
                "Unrecognized dataset format: {other}"
            ))),
        }
    }
}

/// Caller-supplied description of the dataset under validation.
///
/// Immutable within a run. The `format` tag is carried raw so an unknown
/// tag reaches the schema stage and is reported as a critical issue rather
/// than rejected at the type level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub dataset_id: String,
    pub format: String,
    pub record_count: usize,
    #[serde(default)]
    pub organism: Option<String>,
    #[serde(default)]
    pub experiment_type: Option<String>,
    #[serde(default)]
    pub reference_genome: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl DatasetMetadata {
    pub fn new(dataset_id: impl Into<String>, format: impl Into<String>, record_count: usize) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            format: format.into(),
            record_count,
            organism: None,
            experiment_type: None,
            reference_genome: None,
            tags: Vec::new(),
        }
    }

    /// Parse the raw format tag against the closed set.
    pub fn parsed_format(&self) -> Result<DataFormat, crate::Error> {
        self.format.parse()
    }
}

// ============================================================================
// Stage Results
// ============================================================================

/// Pipeline stages in their canonical report order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Schema,
    Rules,
    BioRules,
    BioLookups,
    Policy,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Schema => "schema",
            StageName::Rules => "rules",
            StageName::BioRules => "bio_rules",
            StageName::BioLookups => "bio_lookups",
            StageName::Policy => "policy",
        }
    }

    /// All stages in report order.
    pub const ALL: [StageName; 5] = [
        StageName::Schema,
        StageName::Rules,
        StageName::BioRules,
        StageName::BioLookups,
        StageName::Policy,
    ];
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub passed: bool,
    pub issues: Vec<Issue>,
    pub execution_time_ms: f64,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub stage_metadata: serde_json::Map<String, serde_json::Value>,
}

impl StageResult {
    /// Build a stage result. `passed` is derived, never caller-supplied:
    /// a stage passes exactly when no issue reaches `error` severity.
    pub fn new(
        stage: StageName,
        issues: Vec<Issue>,
        execution_time_ms: f64,
        stage_metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let passed = !issues.iter().any(|i| i.severity >= Severity::Error);
        Self {
            stage,
            passed,
            issues,
            execution_time_ms,
            stage_metadata,
        }
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.issues.iter().map(|i| i.severity).max()
    }

    pub fn has_severity_at_least(&self, severity: Severity) -> bool {
        self.issues.iter().any(|i| i.severity >= severity)
    }
}

/// Ordered stage-name → stage-result mapping.
///
/// Serializes as a JSON object keyed by stage name; iteration and
/// serialization order always follow the canonical stage order, no matter
/// which stage finished first.
#[derive(Debug, Clone, Default)]
pub struct StageMap {
    entries: Vec<StageResult>,
}

impl StageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a stage result, replacing any prior result for the same stage
    /// and keeping canonical order.
    pub fn insert(&mut self, result: StageResult) {
        self.entries.retain(|r| r.stage != result.stage);
        self.entries.push(result);
        self.entries.sort_by_key(|r| r.stage);
    }

    pub fn get(&self, stage: StageName) -> Option<&StageResult> {
        self.entries.iter().find(|r| r.stage == stage)
    }

    pub fn contains(&self, stage: StageName) -> bool {
        self.get(stage).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageResult> {
        self.entries.iter()
    }

    /// All issues across all stages, in stage order then production order.
    pub fn issues(&self) -> impl Iterator<Item = &Issue> {
        self.entries.iter().flat_map(|r| r.issues.iter())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for StageMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for result in &self.entries {
            map.serialize_entry(result.stage.as_str(), result)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StageMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StageMapVisitor;

        impl<'de> Visitor<'de> for StageMapVisitor {
            type Value = StageMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of stage name to stage result")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut stages = StageMap::new();
                while let Some((_key, value)) = access.next_entry::<String, StageResult>()? {
                    stages.insert(value);
                }
                Ok(stages)
            }
        }

        deserializer.deserialize_map(StageMapVisitor)
    }
}

// ============================================================================
// Decisions and Reports
// ============================================================================

/// Final validation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    ConditionalAccept,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accepted => "accepted",
            Decision::ConditionalAccept => "conditional_accept",
            Decision::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the rule configuration in effect for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesetMetadata {
    /// Declared semver, or `"unknown"` when the file lacks one.
    pub version: String,
    #[serde(default)]
    pub last_updated: Option<String>,
    /// Path the configuration was read from.
    pub source: String,
    /// First 16 hex chars of SHA-256 over the raw file bytes.
    #[serde(default)]
    pub hash: Option<String>,
    /// Changes listed in the most recent changelog entry.
    #[serde(default)]
    pub latest_changes: Vec<String>,
}

impl RulesetMetadata {
    /// Placeholder used when no rules file is configured.
    pub fn unknown(source: impl Into<String>) -> Self {
        Self {
            version: "unknown".to_string(),
            last_updated: None,
            source: source.into(),
            hash: None,
            latest_changes: Vec::new(),
        }
    }
}

/// Snapshot of the external-lookup configuration, embedded in every report
/// so results can be reproduced against the same provider setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfiguration {
    pub primary_provider: String,
    /// Requests per second granted by the primary provider.
    pub primary_rate_limit: u32,
    pub api_key_present: bool,
    pub batch_size: usize,
    pub secondary_provider: String,
    pub secondary_enabled: bool,
}

/// The complete, immutable outcome of one validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub validation_id: Uuid,
    pub dataset_id: String,
    pub timestamp: DateTime<Utc>,
    pub final_decision: Decision,
    pub rationale: String,
    pub requires_human_review: bool,
    pub execution_time_seconds: f64,
    pub short_circuited: bool,
    pub stages: StageMap,
    pub ruleset_metadata: RulesetMetadata,
    pub api_configuration: ApiConfiguration,
}

impl ValidationReport {
    /// Count issues by severity across all stages.
    pub fn severity_counts(&self) -> SeverityCounts {
        SeverityCounts::from_issues(self.stages.issues())
    }
}

/// Aggregated issue counts, the sole input to policy decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub error: usize,
    pub warning: usize,
    pub info: usize,
}

impl SeverityCounts {
    pub fn from_issues<'a>(issues: impl Iterator<Item = &'a Issue>) -> Self {
        let mut counts = Self::default();
        for issue in issues {
            match issue.severity {
                Severity::Critical => counts.critical += 1,
                Severity::Error => counts.error += 1,
                Severity::Warning => counts.warning += 1,
                Severity::Info => counts.info += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.critical + self.error + self.warning + self.info
    }
}

// ============================================================================
// Tests
// ============================================================================
