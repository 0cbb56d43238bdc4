//! Biological plausibility rules
//!
//! Domain checks that need no external data. All checks are bulk scans over
//! table columns producing one issue per rule with the affected rows
//! collected, never one issue per row.
//!
//! PAM patterns are IUPAC-coded (N = any base, R = A/G, V = A/C/G); the
//! matcher works on base bitmasks rather than regular expressions.

use std::time::Instant;

use async_trait::async_trait;
use seqscreen_common::table::{ColumnView, DataTable};
use seqscreen_common::types::{
    DataFormat, DatasetMetadata, Issue, Severity, StageName, StageResult,
};
use tracing::debug;

use crate::orchestrator::RunContext;

use super::Validator;

/// Guides shorter than this are unusable.
const MIN_GUIDE_LENGTH: usize = 15;
/// Guides longer than this are unusable.
const MAX_GUIDE_LENGTH: usize = 30;
/// Optimal guide length window.
const OPTIMAL_GUIDE_LENGTH: std::ops::RangeInclusive<usize> = 19..=20;
/// Acceptable GC-content window.
const GC_RANGE: std::ops::RangeInclusive<f64> = 0.40..=0.70;
/// Homopolymer run length at which a sequence is flagged.
const HOMOPOLYMER_RUN: usize = 5;

/// PAM pattern for each recognized nuclease, IUPAC-coded.
const PAM_PATTERNS: [(&str, &str); 5] = [
    ("SpCas9", "NGG"),
    ("SaCas9", "NNGRRT"),
    ("Cas12a", "TTTV"),
    ("AsCas12a", "TTTV"),
    ("LbCas12a", "TTTV"),
];

/// Local biological checks for the recognized dataset formats.
#[derive(Debug, Default)]
pub struct BioRulesValidator;

impl BioRulesValidator {
    pub fn new() -> Self {
        Self
    }

    fn validate_guide_rna(&self, table: &DataTable, issues: &mut Vec<Issue>) {
        let Some(sequence) = table.column("sequence") else {
            return;
        };

        // BIO_001A: critically short guides
        let short: Vec<usize> = sequence
            .strings()
            .filter(|(_, s)| !s.is_empty() && s.len() < MIN_GUIDE_LENGTH)
            .map(|(idx, _)| idx)
            .collect();
        if !short.is_empty() {
            issues.push(
                Issue::new(
                    Severity::Error,
                    "BIO_001A",
                    format!(
                        "{} guide(s) critically short (<{MIN_GUIDE_LENGTH}bp), likely unusable",
                        short.len()
                    ),
                )
                .with_field("sequence")
                .with_rows(short),
            );
        }

        // BIO_001B: usable but suboptimal length
        let suboptimal: Vec<usize> = sequence
            .strings()
            .filter(|(_, s)| {
                let len = s.len();
                (MIN_GUIDE_LENGTH..=MAX_GUIDE_LENGTH).contains(&len)
                    && !OPTIMAL_GUIDE_LENGTH.contains(&len)
            })
            .map(|(idx, _)| idx)
            .collect();
        if !suboptimal.is_empty() {
            issues.push(
                Issue::new(
                    Severity::Warning,
                    "BIO_001B",
                    format!(
                        "{} guide(s) with suboptimal length (optimal: 19-20bp)",
                        suboptimal.len()
                    ),
                )
                .with_field("sequence")
                .with_rows(suboptimal),
            );
        }

        // BIO_001C: critically long guides
        let long: Vec<usize> = sequence
            .strings()
            .filter(|(_, s)| s.len() > MAX_GUIDE_LENGTH)
            .map(|(idx, _)| idx)
            .collect();
        if !long.is_empty() {
            issues.push(
                Issue::new(
                    Severity::Error,
                    "BIO_001C",
                    format!(
                        "{} guide(s) too long (>{MAX_GUIDE_LENGTH}bp), likely unusable",
                        long.len()
                    ),
                )
                .with_field("sequence")
                .with_rows(long),
            );
        }

        // BIO_002: PAM must match the declared nuclease's pattern
        if let (Some(pam), Some(nuclease)) =
            (table.column("pam_sequence"), table.column("nuclease_type"))
        {
            self.check_pam_patterns(&pam, &nuclease, issues);
        }

        // BIO_003: GC content window
        let gc_out: Vec<usize> = sequence
            .strings()
            .filter(|(_, s)| !s.is_empty() && !GC_RANGE.contains(&gc_fraction(s)))
            .map(|(idx, _)| idx)
            .collect();
        if !gc_out.is_empty() {
            issues.push(
                Issue::new(
                    Severity::Warning,
                    "BIO_003",
                    format!(
                        "{} guide(s) with GC content outside 40-70%",
                        gc_out.len()
                    ),
                )
                .with_field("sequence")
                .with_rows(gc_out),
            );
        }

        // BIO_004: poly-T transcription-termination signal
        let poly_t: Vec<usize> = sequence
            .strings()
            .filter(|(_, s)| s.to_ascii_uppercase().contains("TTTT"))
            .map(|(idx, _)| idx)
            .collect();
        if !poly_t.is_empty() {
            issues.push(
                Issue::new(
                    Severity::Warning,
                    "BIO_004",
                    format!(
                        "{} guide(s) contain a poly-T stretch (TTTT), transcription-termination risk",
                        poly_t.len()
                    ),
                )
                .with_field("sequence")
                .with_rows(poly_t),
            );
        }

        // BIO_005: homopolymer runs
        let homopolymer: Vec<usize> = sequence
            .strings()
            .filter(|(_, s)| has_homopolymer(s, HOMOPOLYMER_RUN))
            .map(|(idx, _)| idx)
            .collect();
        if !homopolymer.is_empty() {
            issues.push(
                Issue::new(
                    Severity::Warning,
                    "BIO_005",
                    format!(
                        "{} guide(s) contain homopolymer runs ({HOMOPOLYMER_RUN}+ identical bases)",
                        homopolymer.len()
                    ),
                )
                .with_field("sequence")
                .with_rows(homopolymer),
            );
        }

        // BIO_006: characters outside the DNA alphabet. Uracil is excluded
        // here so RNA/DNA confusion stays a dedicated, softer finding.
        let non_dna: Vec<usize> = sequence
            .strings()
            .filter(|(_, s)| {
                s.bytes().any(|b| {
                    !matches!(
                        b.to_ascii_uppercase(),
                        b'A' | b'C' | b'G' | b'T' | b'N' | b'U'
                    )
                })
            })
            .map(|(idx, _)| idx)
            .collect();
        if !non_dna.is_empty() {
            issues.push(
                Issue::new(
                    Severity::Error,
                    "BIO_006",
                    format!(
                        "{} sequence(s) contain non-DNA characters",
                        non_dna.len()
                    ),
                )
                .with_field("sequence")
                .with_rows(non_dna),
            );
        }

        // BIO_007: uracil, an RNA base, in a DNA sequence column
        let uracil: Vec<usize> = sequence
            .strings()
            .filter(|(_, s)| s.bytes().any(|b| b.to_ascii_uppercase() == b'U'))
            .map(|(idx, _)| idx)
            .collect();
        if !uracil.is_empty() {
            issues.push(
                Issue::new(
                    Severity::Warning,
                    "BIO_007",
                    format!(
                        "{} sequence(s) contain uracil (U): RNA base in a DNA sequence",
                        uracil.len()
                    ),
                )
                .with_field("sequence")
                .with_rows(uracil),
            );
        }
    }

    fn check_pam_patterns(
        &self,
        pam: &ColumnView<'_>,
        nuclease: &ColumnView<'_>,
        issues: &mut Vec<Issue>,
    ) {
        let nuclease_by_row: Vec<Option<&str>> = nuclease.iter().map(|v| v.as_str()).collect();

        for (name, pattern) in PAM_PATTERNS {
            let invalid: Vec<usize> = pam
                .strings()
                .filter(|(idx, pam_seq)| {
                    nuclease_by_row[*idx] == Some(name) && !matches_iupac(pam_seq, pattern)
                })
                .map(|(idx, _)| idx)
                .collect();
            if !invalid.is_empty() {
                issues.push(
                    Issue::new(
                        Severity::Error,
                        "BIO_002",
                        format!(
                            "{} invalid PAM sequence(s) for {name} (expected {pattern})",
                            invalid.len()
                        ),
                    )
                    .with_field("pam_sequence")
                    .with_rows(invalid)
                    .with_meta("nuclease", name.into()),
                );
            }
        }
    }

    fn validate_variant_annotation(&self, table: &DataTable, issues: &mut Vec<Issue>) {
        // VAR_001: mixed chromosome naming styles
        if let Some(chromosome) = table.column("chromosome") {
            let mut prefixed = Vec::new();
            let mut bare = Vec::new();
            for (idx, name) in chromosome.strings() {
                if name.to_ascii_lowercase().starts_with("chr") {
                    prefixed.push(idx);
                } else {
                    bare.push(idx);
                }
            }
            if !prefixed.is_empty() && !bare.is_empty() {
                let minority = if prefixed.len() < bare.len() { prefixed } else { bare };
                issues.push(
                    Issue::new(
                        Severity::Warning,
                        "VAR_001",
                        "Mixed chromosome naming: both 'chr'-prefixed and bare names present",
                    )
                    .with_field("chromosome")
                    .with_rows(minority),
                );
            }
        }

        // VAR_002: allele frequencies are probabilities
        if let Some(frequency) = table.column("allele_frequency") {
            let out_of_range = frequency.rows_where(|v| {
                !v.is_null() && !matches!(v.as_f64(), Some(f) if (0.0..=1.0).contains(&f))
            });
            if !out_of_range.is_empty() {
                issues.push(
                    Issue::new(
                        Severity::Error,
                        "VAR_002",
                        format!(
                            "{} allele frequency value(s) outside [0, 1]",
                            out_of_range.len()
                        ),
                    )
                    .with_field("allele_frequency")
                    .with_rows(out_of_range),
                );
            }
        }
    }

    fn validate_sample_metadata(&self, table: &DataTable, issues: &mut Vec<Issue>) {
        // SMP_001: collection dates in ISO format
        if let Some(dates) = table.column("collection_date") {
            let malformed: Vec<usize> = dates
                .strings()
                .filter(|(_, s)| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_err())
                .map(|(idx, _)| idx)
                .collect();
            if !malformed.is_empty() {
                issues.push(
                    Issue::new(
                        Severity::Warning,
                        "SMP_001",
                        format!(
                            "{} collection_date value(s) not in YYYY-MM-DD format",
                            malformed.len()
                        ),
                    )
                    .with_field("collection_date")
                    .with_rows(malformed),
                );
            }
        }
    }
}

#[async_trait]
impl Validator for BioRulesValidator {
    fn stage(&self) -> StageName {
        StageName::BioRules
    }

    async fn run(
        &self,
        table: &DataTable,
        metadata: &DatasetMetadata,
        _ctx: &RunContext,
    ) -> StageResult {
        let start = Instant::now();
        let mut issues = Vec::new();

        match metadata.parsed_format() {
            Ok(DataFormat::GuideRna) => self.validate_guide_rna(table, &mut issues),
            Ok(DataFormat::VariantAnnotation) => {
                self.validate_variant_annotation(table, &mut issues)
            }
            Ok(DataFormat::SampleMetadata) => self.validate_sample_metadata(table, &mut issues),
            Err(_) => {
                // Unknown formats are the schema stage's finding; nothing to
                // check here when the pipeline runs without short-circuit.
            }
        }

        debug!(
            format = %metadata.format,
            issues = issues.len(),
            "Biological rule validation complete"
        );

        let mut stage_metadata = serde_json::Map::new();
        stage_metadata.insert("data_type".to_string(), metadata.format.clone().into());

        StageResult::new(
            StageName::BioRules,
            issues,
            start.elapsed().as_secs_f64() * 1000.0,
            stage_metadata,
        )
    }
}

// ============================================================================
// Sequence helpers
// ============================================================================

const MASK_A: u8 = 1;
const MASK_C: u8 = 2;
const MASK_G: u8 = 4;
const MASK_T: u8 = 8;

/// Bitmask of bases an IUPAC code can stand for.
fn iupac_mask(letter: u8) -> u8 {
    match letter.to_ascii_uppercase() {
        b'A' => MASK_A,
        b'C' => MASK_C,
        b'G' => MASK_G,
        b'T' => MASK_T,
        b'R' => MASK_A | MASK_G,
        b'Y' => MASK_C | MASK_T,
        b'S' => MASK_C | MASK_G,
        b'W' => MASK_A | MASK_T,
        b'K' => MASK_G | MASK_T,
        b'M' => MASK_A | MASK_C,
        b'B' => MASK_C | MASK_G | MASK_T,
        b'D' => MASK_A | MASK_G | MASK_T,
        b'H' => MASK_A | MASK_C | MASK_T,
        b'V' => MASK_A | MASK_C | MASK_G,
        b'N' => MASK_A | MASK_C | MASK_G | MASK_T,
        _ => 0,
    }
}

/// Whether `sequence` matches the IUPAC-coded `pattern` position by position.
fn matches_iupac(sequence: &str, pattern: &str) -> bool {
    if sequence.len() != pattern.len() {
        return false;
    }
    sequence.bytes().zip(pattern.bytes()).all(|(base, code)| {
        let base_mask = iupac_mask(base);
        base_mask != 0 && base_mask & !iupac_mask(code) == 0
    })
}

fn gc_fraction(sequence: &str) -> f64 {
    if sequence.is_empty() {
        return 0.0;
    }
    let gc = sequence
        .bytes()
        .filter(|b| matches!(b.to_ascii_uppercase(), b'G' | b'C'))
        .count();
    gc as f64 / sequence.len() as f64
}

fn has_homopolymer(sequence: &str, run: usize) -> bool {
    let mut current = 0u8;
    let mut count = 0usize;
    for b in sequence.bytes().map(|b| b.to_ascii_uppercase()) {
        if !matches!(b, b'A' | b'C' | b'G' | b'T') {
            count = 0;
            current = 0;
            continue;
        }
        if b == current {
            count += 1;
        } else {
            current = b;
            count = 1;
        }
        if count >= run {
            return true;
        }
    }
    false
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{guide_row, guide_table, run_ctx};
    use seqscreen_common::table::Value;

    fn meta(format: &str) -> DatasetMetadata {
        DatasetMetadata::new("ds-test", format, 0)
    }

    async fn run(table: &DataTable, format: &str) -> StageResult {
        BioRulesValidator::new()
            .run(table, &meta(format), &run_ctx())
            .await
    }

    fn rule_ids(result: &StageResult) -> Vec<&str> {
        result.issues.iter().map(|i| i.rule_id.as_str()).collect()
    }

    #[test]
    fn iupac_matcher_handles_wildcards() {
        assert!(matches_iupac("AGG", "NGG"));
        assert!(matches_iupac("TGG", "NGG"));
        assert!(!matches_iupac("AAA", "NGG"));
        assert!(!matches_iupac("AG", "NGG"));

        // NNGRRT: R is A or G
        assert!(matches_iupac("CTGAGT", "NNGRRT"));
        assert!(!matches_iupac("CTGACT", "NNGRRT"));

        // TTTV: V is A, C or G (not T)
        assert!(matches_iupac("TTTA", "TTTV"));
        assert!(!matches_iupac("TTTT", "TTTV"));
    }

    #[test]
    fn gc_and_homopolymer_helpers() {
        assert!((gc_fraction("GGCC") - 1.0).abs() < 1e-9);
        assert!((gc_fraction("ATCGATCGATCGATCGATCG") - 0.5).abs() < 1e-9);
        assert!(has_homopolymer("ATCGGGGGA", 5));
        assert!(!has_homopolymer("ATCGGGGA", 5));
    }

    #[tokio::test]
    async fn clean_guide_has_no_issues() {
        let table = guide_table(vec![guide_row("g1", "ATCGATCGATCGATCGATCG", "AGG", "BRCA1")]);
        let result = run(&table, "guide_rna").await;
        assert!(result.passed);
        assert!(result.issues.is_empty());
    }

    #[tokio::test]
    async fn invalid_pam_is_bio_002_error() {
        let table = guide_table(vec![guide_row("g1", "ATCGATCGATCGATCGATCG", "AAA", "BRCA1")]);
        let result = run(&table, "guide_rna").await;
        assert!(!result.passed);
        assert_eq!(result.issues.len(), 1);
        let issue = &result.issues[0];
        assert_eq!(issue.rule_id, "BIO_002");
        assert_eq!(issue.severity, Severity::Error);
        assert_eq!(issue.affected_rows, vec![0]);
    }

    #[tokio::test]
    async fn sa_cas9_uses_its_own_pattern() {
        let mut row_ok = guide_row("g1", "ATCGATCGATCGATCGATCG", "CTGAGT", "BRCA1");
        row_ok[5] = Value::from("SaCas9");
        let mut row_bad = guide_row("g2", "ATCGATCGATCGATCGATCG", "AGG", "TP53");
        row_bad[5] = Value::from("SaCas9");
        let table = guide_table(vec![row_ok, row_bad]);

        let result = run(&table, "guide_rna").await;
        let issue = result
            .issues
            .iter()
            .find(|i| i.rule_id == "BIO_002")
            .expect("PAM issue");
        assert_eq!(issue.affected_rows, vec![1]);
    }

    #[tokio::test]
    async fn length_rules_split_by_severity() {
        let table = guide_table(vec![
            guide_row("g1", "ATCGATCG", "AGG", "BRCA1"), // 8bp, critically short
            guide_row("g2", "ATCGATCGATCGATCGA", "AGG", "TP53"), // 17bp, suboptimal
            guide_row("g3", "ATCGATCGATCGATCGATCG", "AGG", "EGFR"), // 20bp, fine
            guide_row(
                "g4",
                "ATCGATCGATCGATCGATCGATCGATCGATCGATCG", // 36bp, critically long
                "AGG",
                "KRAS",
            ),
        ]);

        let result = run(&table, "guide_rna").await;
        let short = result.issues.iter().find(|i| i.rule_id == "BIO_001A").unwrap();
        assert_eq!(short.severity, Severity::Error);
        assert_eq!(short.affected_rows, vec![0]);

        let suboptimal = result.issues.iter().find(|i| i.rule_id == "BIO_001B").unwrap();
        assert_eq!(suboptimal.severity, Severity::Warning);
        assert_eq!(suboptimal.affected_rows, vec![1]);

        let long = result.issues.iter().find(|i| i.rule_id == "BIO_001C").unwrap();
        assert_eq!(long.severity, Severity::Error);
        assert_eq!(long.affected_rows, vec![3]);
    }

    #[tokio::test]
    async fn gc_poly_t_and_homopolymer_warnings() {
        let table = guide_table(vec![
            guide_row("g1", "AAAAATCGATCGATCGATAT", "AGG", "BRCA1"), // homopolymer + low GC
            guide_row("g2", "ATCGTTTTGCGCATCGATCG", "AGG", "TP53"),  // poly-T
        ]);

        let result = run(&table, "guide_rna").await;
        let ids = rule_ids(&result);
        assert!(ids.contains(&"BIO_003"));
        assert!(ids.contains(&"BIO_004"));
        assert!(ids.contains(&"BIO_005"));
        assert!(result.passed); // warnings only

        let poly_t = result.issues.iter().find(|i| i.rule_id == "BIO_004").unwrap();
        assert_eq!(poly_t.affected_rows, vec![1]);
    }

    #[tokio::test]
    async fn uracil_warns_without_a_non_dna_error() {
        let table = guide_table(vec![guide_row("g1", "AUCGAUCGAUCGAUCGAUCG", "AGG", "BRCA1")]);
        let result = run(&table, "guide_rna").await;
        let ids = rule_ids(&result);
        assert!(ids.contains(&"BIO_007"));
        assert!(!ids.contains(&"BIO_006"));
    }

    #[tokio::test]
    async fn truly_foreign_characters_are_bio_006_errors() {
        let table = guide_table(vec![guide_row("g1", "ATCGXTCGATCGATCGATCG", "AGG", "BRCA1")]);
        let result = run(&table, "guide_rna").await;
        let issue = result.issues.iter().find(|i| i.rule_id == "BIO_006").unwrap();
        assert_eq!(issue.severity, Severity::Error);
    }

    #[tokio::test]
    async fn variant_mixed_chromosome_naming_warns() {
        let table = DataTable::from_rows(
            ["chromosome", "position", "ref_allele", "alt_allele", "allele_frequency"],
            vec![
                vec![
                    Value::from("chr1"),
                    Value::from(100),
                    Value::from("A"),
                    Value::from("G"),
                    Value::from(0.2),
                ],
                vec![
                    Value::from("chr2"),
                    Value::from(200),
                    Value::from("C"),
                    Value::from("T"),
                    Value::from(0.9),
                ],
                vec![
                    Value::from("3"),
                    Value::from(300),
                    Value::from("G"),
                    Value::from("A"),
                    Value::from(1.5),
                ],
            ],
        )
        .unwrap();

        let result = run(&table, "variant_annotation").await;
        let mixed = result.issues.iter().find(|i| i.rule_id == "VAR_001").unwrap();
        assert_eq!(mixed.affected_rows, vec![2]);

        let frequency = result.issues.iter().find(|i| i.rule_id == "VAR_002").unwrap();
        assert_eq!(frequency.severity, Severity::Error);
        assert_eq!(frequency.affected_rows, vec![2]);
    }

    #[tokio::test]
    async fn sample_dates_must_be_iso() {
        let table = DataTable::from_rows(
            ["sample_id", "organism", "collection_date"],
            vec![
                vec![Value::from("s1"), Value::from("human"), Value::from("2025-01-31")],
                vec![Value::from("s2"), Value::from("human"), Value::from("31/01/2025")],
            ],
        )
        .unwrap();

        let result = run(&table, "sample_metadata").await;
        let issue = result.issues.iter().find(|i| i.rule_id == "SMP_001").unwrap();
        assert_eq!(issue.severity, Severity::Warning);
        assert_eq!(issue.affected_rows, vec![1]);
    }
}
