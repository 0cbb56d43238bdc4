//! Schema validation stage
//!
//! Record-level structural and type checks driven by the dataset's format
//! tag. An unrecognized tag is a critical finding (nothing downstream can
//! interpret the table); structural problems in individual records are
//! errors, but the records stay in the table so later stages keep
//! accumulating findings for them.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use seqscreen_common::table::{ColumnView, DataTable};
use seqscreen_common::types::{
    DataFormat, DatasetMetadata, Issue, Severity, StageName, StageResult,
};
use tracing::debug;

use crate::orchestrator::RunContext;

use super::Validator;

/// Fraction of ambiguous (`N`) bases above which a sequence is flagged.
const MAX_AMBIGUOUS_FRACTION: f64 = 0.10;

const GUIDE_RNA_REQUIRED: [&str; 6] = [
    "guide_id",
    "sequence",
    "pam_sequence",
    "target_gene",
    "organism",
    "nuclease_type",
];

const VARIANT_REQUIRED: [&str; 4] = ["chromosome", "position", "ref_allele", "alt_allele"];

const SAMPLE_REQUIRED: [&str; 2] = ["sample_id", "organism"];

/// Structural validator for the closed set of recognized formats.
#[derive(Debug, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }

    fn validate_table(&self, table: &DataTable, metadata: &DatasetMetadata) -> Vec<Issue> {
        let format = match metadata.parsed_format() {
            Ok(format) => format,
            Err(_) => {
                return vec![Issue::new(
                    Severity::Critical,
                    "SCHEMA_001",
                    format!("Unrecognized dataset format: {}", metadata.format),
                )
                .with_field("format")];
            }
        };

        if table.is_empty() {
            return vec![Issue::new(
                Severity::Warning,
                "empty_dataset",
                "Empty dataset provided",
            )];
        }

        let mut issues = Vec::new();
        match format {
            DataFormat::GuideRna => self.validate_guide_rna(table, &mut issues),
            DataFormat::VariantAnnotation => self.validate_variant_annotation(table, &mut issues),
            DataFormat::SampleMetadata => self.validate_sample_metadata(table, &mut issues),
        }
        issues
    }

    fn check_required(&self, table: &DataTable, required: &[&str], issues: &mut Vec<Issue>) {
        for &column in required {
            match table.column(column) {
                None => issues.push(
                    Issue::new(
                        Severity::Error,
                        "SCHEMA_002",
                        format!("Missing required field: {column}"),
                    )
                    .with_field(column),
                ),
                Some(view) => {
                    let null_rows = view.null_rows();
                    if !null_rows.is_empty() {
                        issues.push(
                            Issue::new(
                                Severity::Error,
                                "SCHEMA_003",
                                format!(
                                    "{} record(s) missing required field '{column}'",
                                    null_rows.len()
                                ),
                            )
                            .with_field(column)
                            .with_rows(null_rows),
                        );
                    }
                }
            }
        }
    }

    fn validate_guide_rna(&self, table: &DataTable, issues: &mut Vec<Issue>) {
        self.check_required(table, &GUIDE_RNA_REQUIRED, issues);

        if let Some(sequence) = table.column("sequence") {
            let invalid: Vec<usize> = sequence
                .strings()
                .filter(|(_, s)| s.is_empty() || !is_dna(s))
                .map(|(idx, _)| idx)
                .collect();
            if !invalid.is_empty() {
                issues.push(
                    Issue::new(
                        Severity::Error,
                        "SCHEMA_004",
                        format!(
                            "{} sequence(s) empty or containing characters outside A/C/G/T/N",
                            invalid.len()
                        ),
                    )
                    .with_field("sequence")
                    .with_rows(invalid),
                );
            }

            let ambiguous: Vec<usize> = sequence
                .strings()
                .filter(|(_, s)| ambiguous_fraction(s) > MAX_AMBIGUOUS_FRACTION)
                .map(|(idx, _)| idx)
                .collect();
            if !ambiguous.is_empty() {
                issues.push(
                    Issue::new(
                        Severity::Warning,
                        "SCHEMA_009",
                        format!(
                            "{} sequence(s) with high ambiguous base content (>{}% N)",
                            ambiguous.len(),
                            (MAX_AMBIGUOUS_FRACTION * 100.0) as u32
                        ),
                    )
                    .with_field("sequence")
                    .with_rows(ambiguous),
                );
            }
        }

        // The nuclease-specific PAM pattern is a biological rule (BIO_002);
        // here only the DNA alphabet of the PAM cell is structural.
        if let Some(pam) = table.column("pam_sequence") {
            let invalid: Vec<usize> = pam
                .strings()
                .filter(|(_, s)| s.is_empty() || !is_dna(s))
                .map(|(idx, _)| idx)
                .collect();
            if !invalid.is_empty() {
                issues.push(
                    Issue::new(
                        Severity::Error,
                        "SCHEMA_005",
                        format!(
                            "{} PAM sequence(s) empty or containing non-DNA characters",
                            invalid.len()
                        ),
                    )
                    .with_field("pam_sequence")
                    .with_rows(invalid),
                );
            }
        }
    }

    fn validate_variant_annotation(&self, table: &DataTable, issues: &mut Vec<Issue>) {
        self.check_required(table, &VARIANT_REQUIRED, issues);

        if let Some(position) = table.column("position") {
            let invalid = position.rows_where(|v| {
                !v.is_null() && !matches!(v.as_int(), Some(p) if p > 0)
            });
            if !invalid.is_empty() {
                issues.push(
                    Issue::new(
                        Severity::Error,
                        "SCHEMA_006",
                        format!("{} position(s) not a positive integer", invalid.len()),
                    )
                    .with_field("position")
                    .with_rows(invalid),
                );
            }
        }

        for column in ["ref_allele", "alt_allele"] {
            if let Some(view) = table.column(column) {
                let invalid: Vec<usize> = view
                    .strings()
                    .filter(|(_, s)| s.is_empty() || !is_allele(s))
                    .map(|(idx, _)| idx)
                    .collect();
                if !invalid.is_empty() {
                    issues.push(
                        Issue::new(
                            Severity::Error,
                            "SCHEMA_007",
                            format!(
                                "{} {column} value(s) empty or outside A/C/G/T/N/-",
                                invalid.len()
                            ),
                        )
                        .with_field(column)
                        .with_rows(invalid),
                    );
                }
            }
        }
    }

    fn validate_sample_metadata(&self, table: &DataTable, issues: &mut Vec<Issue>) {
        self.check_required(table, &SAMPLE_REQUIRED, issues);

        if let Some(sample_id) = table.column("sample_id") {
            let duplicates = duplicate_rows(&sample_id);
            if !duplicates.is_empty() {
                issues.push(
                    Issue::new(
                        Severity::Error,
                        "SCHEMA_008",
                        format!(
                            "sample_id must be unique within the dataset; {} duplicate record(s)",
                            duplicates.len()
                        ),
                    )
                    .with_field("sample_id")
                    .with_rows(duplicates),
                );
            }
        }
    }
}

#[async_trait]
impl Validator for SchemaValidator {
    fn stage(&self) -> StageName {
        StageName::Schema
    }

    async fn run(
        &self,
        table: &DataTable,
        metadata: &DatasetMetadata,
        _ctx: &RunContext,
    ) -> StageResult {
        let start = Instant::now();
        let issues = self.validate_table(table, metadata);

        debug!(
            format = %metadata.format,
            records = table.len(),
            issues = issues.len(),
            "Schema validation complete"
        );

        let mut stage_metadata = serde_json::Map::new();
        stage_metadata.insert("format".to_string(), metadata.format.clone().into());
        stage_metadata.insert("records_processed".to_string(), table.len().into());

        StageResult::new(
            StageName::Schema,
            issues,
            start.elapsed().as_secs_f64() * 1000.0,
            stage_metadata,
        )
    }
}

/// Every character in {A, C, G, T, N} after upper-casing.
fn is_dna(s: &str) -> bool {
    s.bytes()
        .all(|b| matches!(b.to_ascii_uppercase(), b'A' | b'C' | b'G' | b'T' | b'N'))
}

/// Allele alphabet: DNA plus the deletion marker.
fn is_allele(s: &str) -> bool {
    s.bytes()
        .all(|b| matches!(b.to_ascii_uppercase(), b'A' | b'C' | b'G' | b'T' | b'N' | b'-'))
}

fn ambiguous_fraction(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let n = s.bytes().filter(|b| b.to_ascii_uppercase() == b'N').count();
    n as f64 / s.len() as f64
}

/// Rows participating in any duplicated value of the column, ascending.
fn duplicate_rows(view: &ColumnView<'_>) -> Vec<usize> {
    let mut by_value: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, value) in view.indexed() {
        if value.is_null() {
            continue;
        }
        by_value.entry(value.to_string()).or_default().push(idx);
    }
    let mut rows: Vec<usize> = by_value
        .into_values()
        .filter(|rows| rows.len() > 1)
        .flatten()
        .collect();
    rows.sort_unstable();
    rows
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{guide_row, guide_table, run_ctx};
    use seqscreen_common::table::Value;

    fn meta(format: &str, rows: usize) -> DatasetMetadata {
        DatasetMetadata::new("ds-test", format, rows)
    }

    #[tokio::test]
    async fn clean_guide_rna_passes() {
        let table = guide_table(vec![guide_row("g1", "ATCGATCGATCGATCGATCG", "AGG", "BRCA1")]);
        let result = SchemaValidator::new()
            .run(&table, &meta("guide_rna", 1), &run_ctx())
            .await;
        assert!(result.passed);
        assert!(result.issues.is_empty());
    }

    #[tokio::test]
    async fn unknown_format_is_critical() {
        let table = guide_table(vec![guide_row("g1", "ATCG", "AGG", "BRCA1")]);
        let result = SchemaValidator::new()
            .run(&table, &meta("fasta", 1), &run_ctx())
            .await;
        assert!(!result.passed);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].severity, Severity::Critical);
        assert_eq!(result.issues[0].rule_id, "SCHEMA_001");
    }

    #[tokio::test]
    async fn empty_table_is_single_warning() {
        let table = guide_table(vec![]);
        let result = SchemaValidator::new()
            .run(&table, &meta("guide_rna", 0), &run_ctx())
            .await;
        assert!(result.passed);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].rule_id, "empty_dataset");
        assert_eq!(result.issues[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn missing_column_and_missing_values_are_errors() {
        let table = DataTable::from_rows(
            ["guide_id", "sequence", "pam_sequence", "target_gene", "organism"],
            vec![
                vec![
                    Value::from("g1"),
                    Value::from("ATCGATCGATCGATCGATCG"),
                    Value::from("AGG"),
                    Value::from("BRCA1"),
                    Value::Null,
                ],
            ],
        )
        .unwrap();

        let result = SchemaValidator::new()
            .run(&table, &meta("guide_rna", 1), &run_ctx())
            .await;
        assert!(!result.passed);

        let rule_ids: Vec<&str> = result.issues.iter().map(|i| i.rule_id.as_str()).collect();
        // nuclease_type column absent, organism value null
        assert!(rule_ids.contains(&"SCHEMA_002"));
        assert!(rule_ids.contains(&"SCHEMA_003"));
        let null_issue = result
            .issues
            .iter()
            .find(|i| i.rule_id == "SCHEMA_003")
            .unwrap();
        assert_eq!(null_issue.affected_rows, vec![0]);
    }

    #[tokio::test]
    async fn invalid_sequence_characters_are_errors() {
        let table = guide_table(vec![guide_row("g1", "ATCGXTCG", "AGG", "BRCA1")]);
        let result = SchemaValidator::new()
            .run(&table, &meta("guide_rna", 1), &run_ctx())
            .await;
        let issue = result
            .issues
            .iter()
            .find(|i| i.rule_id == "SCHEMA_004")
            .expect("invalid sequence issue");
        assert_eq!(issue.severity, Severity::Error);
        assert_eq!(issue.affected_rows, vec![0]);
    }

    #[tokio::test]
    async fn pam_nuclease_mismatch_is_not_a_schema_finding() {
        // An alphabet-valid PAM that does not match the nuclease pattern
        // passes schema; the bio stage owns that rule.
        let table = guide_table(vec![guide_row("g1", "ATCGATCGATCGATCGATCG", "AAA", "BRCA1")]);
        let result = SchemaValidator::new()
            .run(&table, &meta("guide_rna", 1), &run_ctx())
            .await;
        assert!(result.passed);
        assert!(result.issues.is_empty());
    }

    #[tokio::test]
    async fn high_ambiguity_sequence_warns() {
        let table = guide_table(vec![guide_row("g1", "ANNNATCGATCGATCGATCG", "AGG", "BRCA1")]);
        let result = SchemaValidator::new()
            .run(&table, &meta("guide_rna", 1), &run_ctx())
            .await;
        assert!(result.passed);
        assert!(result.issues.iter().any(|i| i.rule_id == "SCHEMA_009"));
    }

    #[tokio::test]
    async fn variant_positions_must_be_positive_integers() {
        let table = DataTable::from_rows(
            ["chromosome", "position", "ref_allele", "alt_allele"],
            vec![
                vec![
                    Value::from("chr1"),
                    Value::from(12345),
                    Value::from("A"),
                    Value::from("G"),
                ],
                vec![
                    Value::from("chr2"),
                    Value::from(0),
                    Value::from("C"),
                    Value::from("T"),
                ],
                vec![
                    Value::from("chr3"),
                    Value::from("abc"),
                    Value::from("G"),
                    Value::from("-"),
                ],
            ],
        )
        .unwrap();

        let result = SchemaValidator::new()
            .run(&table, &meta("variant_annotation", 3), &run_ctx())
            .await;
        let issue = result
            .issues
            .iter()
            .find(|i| i.rule_id == "SCHEMA_006")
            .expect("position issue");
        assert_eq!(issue.affected_rows, vec![1, 2]);
    }

    #[tokio::test]
    async fn variant_alleles_use_extended_alphabet() {
        let table = DataTable::from_rows(
            ["chromosome", "position", "ref_allele", "alt_allele"],
            vec![vec![
                Value::from("chr1"),
                Value::from(100),
                Value::from("A"),
                Value::from("Z"),
            ]],
        )
        .unwrap();

        let result = SchemaValidator::new()
            .run(&table, &meta("variant_annotation", 1), &run_ctx())
            .await;
        let issue = result
            .issues
            .iter()
            .find(|i| i.rule_id == "SCHEMA_007")
            .expect("allele issue");
        assert_eq!(issue.field.as_deref(), Some("alt_allele"));
    }

    #[tokio::test]
    async fn duplicate_sample_ids_are_errors() {
        let table = DataTable::from_rows(
            ["sample_id", "organism"],
            vec![
                vec![Value::from("s1"), Value::from("human")],
                vec![Value::from("s2"), Value::from("human")],
                vec![Value::from("s1"), Value::from("mouse")],
            ],
        )
        .unwrap();

        let result = SchemaValidator::new()
            .run(&table, &meta("sample_metadata", 3), &run_ctx())
            .await;
        let issue = result
            .issues
            .iter()
            .find(|i| i.rule_id == "SCHEMA_008")
            .expect("duplicate sample_id issue");
        assert_eq!(issue.affected_rows, vec![0, 2]);
    }
}
