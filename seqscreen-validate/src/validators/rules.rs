//! Vectorized rule engine
//!
//! Consistency, duplicate, and bias checks expressed as bulk tabular
//! operations over whole columns. Each check emits one issue carrying the
//! affected row indices rather than one issue per row.
//!
//! The near-duplicate scan buckets sequences by length and compares only
//! within a bucket (near-duplicates share a length class), with the
//! per-bucket pairwise work spread across rayon workers. This keeps the
//! scan usable at 10k rows where a naive all-pairs comparison is not.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use async_trait::async_trait;
use rayon::prelude::*;
use seqscreen_common::config::{
    CrossColumnOp, CustomPredicate, CustomRule, RuleSections, RulesConfig,
};
use seqscreen_common::config::ColumnType;
use seqscreen_common::table::{DataTable, Value};
use seqscreen_common::types::{DatasetMetadata, Issue, Severity, StageName, StageResult};
use tracing::debug;

use crate::orchestrator::RunContext;

use super::Validator;

/// Configurable consistency/duplicate/bias validator.
pub struct RuleValidator {
    sections: RuleSections,
}

impl RuleValidator {
    pub fn new(config: &RulesConfig) -> Self {
        Self {
            sections: config.rules.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Consistency
    // ------------------------------------------------------------------

    fn check_consistency(&self, table: &DataTable, issues: &mut Vec<Issue>) {
        let rules = &self.sections.consistency;

        for column in &rules.required_columns {
            if !table.has_column(column) {
                issues.push(
                    Issue::new(
                        Severity::Error,
                        "CONS_001",
                        format!("Missing required column: {column}"),
                    )
                    .with_field(column.clone()),
                );
            }
        }

        for (column, expected) in &rules.column_types {
            let Some(view) = table.column(column) else {
                continue;
            };
            let mismatched =
                view.rows_where(|v| !v.is_null() && !cell_matches_type(v, *expected));
            if !mismatched.is_empty() {
                issues.push(
                    Issue::new(
                        Severity::Error,
                        "CONS_002",
                        format!(
                            "{} value(s) in '{column}' not of expected type {expected:?}",
                            mismatched.len()
                        ),
                    )
                    .with_field(column.clone())
                    .with_rows(mismatched),
                );
            }
        }

        for (column, range) in &rules.value_ranges {
            let Some(view) = table.column(column) else {
                continue;
            };
            if let Some(min) = range.min {
                let below = view.rows_where(|v| matches!(v.as_f64(), Some(f) if f < min));
                if !below.is_empty() {
                    issues.push(
                        Issue::new(
                            Severity::Error,
                            "CONS_003",
                            format!("{} value(s) in '{column}' below minimum {min}", below.len()),
                        )
                        .with_field(column.clone())
                        .with_rows(below),
                    );
                }
            }
            if let Some(max) = range.max {
                let above = view.rows_where(|v| matches!(v.as_f64(), Some(f) if f > max));
                if !above.is_empty() {
                    issues.push(
                        Issue::new(
                            Severity::Error,
                            "CONS_004",
                            format!("{} value(s) in '{column}' above maximum {max}", above.len()),
                        )
                        .with_field(column.clone())
                        .with_rows(above),
                    );
                }
            }
        }

        for rule in &rules.cross_column {
            let (Some(left), Some(right)) =
                (table.column(&rule.column1), table.column(&rule.column2))
            else {
                continue;
            };
            let violations: Vec<usize> = left
                .indexed()
                .zip(right.iter())
                .filter(|((_, a), b)| !a.is_null() && !b.is_null() && !holds(a, rule.operator, b))
                .map(|((idx, _), _)| idx)
                .collect();
            if !violations.is_empty() {
                let op = match rule.operator {
                    CrossColumnOp::Less => "<",
                    CrossColumnOp::Greater => ">",
                    CrossColumnOp::Equal => "==",
                };
                issues.push(
                    Issue::new(
                        Severity::Error,
                        "CONS_005",
                        format!(
                            "Cross-column rule violated: {} {op} {} ({} row(s))",
                            rule.column1,
                            rule.column2,
                            violations.len()
                        ),
                    )
                    .with_field(format!("{},{}", rule.column1, rule.column2))
                    .with_rows(violations),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Duplicates
    // ------------------------------------------------------------------

    fn check_duplicates(&self, table: &DataTable, issues: &mut Vec<Issue>) {
        let rules = &self.sections.duplicates;

        if rules.check_duplicate_rows {
            for group in exact_duplicate_groups(table, &rules.unique_columns) {
                issues.push(
                    Issue::new(
                        Severity::Warning,
                        "DUP_001",
                        format!(
                            "{} rows identical across non-identifier columns",
                            group.len()
                        ),
                    )
                    .with_rows(group),
                );
            }
        }

        for column in &rules.unique_columns {
            let Some(view) = table.column(column) else {
                continue;
            };
            let mut by_value: HashMap<String, Vec<usize>> = HashMap::new();
            for (idx, value) in view.indexed() {
                if value.is_null() {
                    continue;
                }
                by_value.entry(value.to_string()).or_default().push(idx);
            }
            let mut groups: Vec<(String, Vec<usize>)> = by_value
                .into_iter()
                .filter(|(_, rows)| rows.len() > 1)
                .collect();
            groups.sort_by_key(|(_, rows)| rows[0]);
            for (value, rows) in groups {
                issues.push(
                    Issue::new(
                        Severity::Error,
                        "DUP_002",
                        format!(
                            "Duplicate value '{value}' in unique column '{column}' ({} rows)",
                            rows.len()
                        ),
                    )
                    .with_field(column.clone())
                    .with_rows(rows),
                );
            }
        }

        for column in &rules.sequence_columns {
            let Some(view) = table.column(column) else {
                continue;
            };
            let entries: Vec<(usize, String)> = view
                .strings()
                .map(|(idx, s)| (idx, s.to_ascii_uppercase()))
                .collect();
            for group in near_duplicate_groups(&entries, rules.sequence_similarity_threshold) {
                issues.push(
                    Issue::new(
                        Severity::Warning,
                        "DUP_003",
                        format!(
                            "{} near-duplicate sequences in '{column}' (similarity >= {:.0}%)",
                            group.len(),
                            rules.sequence_similarity_threshold * 100.0
                        ),
                    )
                    .with_field(column.clone())
                    .with_rows(group)
                    .with_meta(
                        "similarity_threshold",
                        rules.sequence_similarity_threshold.into(),
                    ),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Bias
    // ------------------------------------------------------------------

    fn check_bias(&self, table: &DataTable, issues: &mut Vec<Issue>) {
        let rules = &self.sections.bias;

        for column in &rules.categorical_columns {
            let Some(view) = table.column(column) else {
                continue;
            };
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            let mut total = 0usize;
            for value in view.iter() {
                if value.is_null() {
                    continue;
                }
                *counts.entry(value.to_string()).or_default() += 1;
                total += 1;
            }
            if counts.len() < 2 || total == 0 {
                continue;
            }
            let min_count = counts.values().copied().min().unwrap_or(0);
            let min_share = min_count as f64 / total as f64;
            if min_share < rules.imbalance_threshold {
                let distribution: serde_json::Map<String, serde_json::Value> = counts
                    .iter()
                    .map(|(class, count)| {
                        (class.clone(), (*count as f64 / total as f64).into())
                    })
                    .collect();
                issues.push(
                    Issue::new(
                        Severity::Warning,
                        "BIAS_001",
                        format!(
                            "Class imbalance in '{column}': minority class share {:.1}%",
                            min_share * 100.0
                        ),
                    )
                    .with_field(column.clone())
                    .with_meta("class_distribution", distribution.into())
                    .with_meta("min_proportion", min_share.into()),
                );
            }
        }

        for column in table.columns() {
            let view = table.column(column).expect("column listed by the table");
            let overall = view.null_fraction();
            if overall <= rules.missing_value_threshold {
                continue;
            }

            // Missingness concentrated in one category of a declared
            // categorical is a bias signal, not just sparsity.
            let correlated_with = rules.categorical_columns.iter().find(|categorical| {
                *categorical != column
                    && missingness_correlates(
                        table,
                        column,
                        categorical.as_str(),
                        overall,
                        rules.missing_value_threshold,
                    )
            });

            let severity = if correlated_with.is_some() {
                Severity::Error
            } else {
                Severity::Warning
            };
            let mut issue = Issue::new(
                severity,
                "BIAS_002",
                format!(
                    "High missing value rate in '{column}': {:.1}%",
                    overall * 100.0
                ),
            )
            .with_field(column.clone())
            .with_rows(view.null_rows())
            .with_meta("missing_proportion", overall.into());
            if let Some(categorical) = correlated_with {
                issue = issue.with_meta("correlated_with", categorical.clone().into());
            }
            issues.push(issue);
        }
    }

    // ------------------------------------------------------------------
    // Custom rules
    // ------------------------------------------------------------------

    fn apply_custom_rules(&self, table: &DataTable, issues: &mut Vec<Issue>) {
        for rule in &self.sections.custom {
            let Some(violations) = custom_rule_violations(table, rule) else {
                debug!(rule_id = %rule.id, "Custom rule references a missing column; skipped");
                continue;
            };
            if violations.is_empty() {
                continue;
            }
            let field = rule
                .field
                .clone()
                .unwrap_or_else(|| predicate_column(&rule.predicate).to_string());
            issues.push(
                Issue::new(
                    rule.severity,
                    rule.id.clone(),
                    format!("{} ({} violation(s))", rule.message, violations.len()),
                )
                .with_field(field)
                .with_rows(violations),
            );
        }
    }
}

#[async_trait]
impl Validator for RuleValidator {
    fn stage(&self) -> StageName {
        StageName::Rules
    }

    async fn run(
        &self,
        table: &DataTable,
        _metadata: &DatasetMetadata,
        _ctx: &RunContext,
    ) -> StageResult {
        let start = Instant::now();
        let mut issues = Vec::new();

        self.check_consistency(table, &mut issues);
        self.check_duplicates(table, &mut issues);
        self.check_bias(table, &mut issues);
        self.apply_custom_rules(table, &mut issues);

        debug!(
            records = table.len(),
            issues = issues.len(),
            "Rule validation complete"
        );

        let mut stage_metadata = serde_json::Map::new();
        stage_metadata.insert(
            "custom_rules_applied".to_string(),
            self.sections.custom.len().into(),
        );
        stage_metadata.insert("records_processed".to_string(), table.len().into());

        StageResult::new(
            StageName::Rules,
            issues,
            start.elapsed().as_secs_f64() * 1000.0,
            stage_metadata,
        )
    }
}

// ============================================================================
// Check helpers
// ============================================================================

fn cell_matches_type(value: &Value, expected: ColumnType) -> bool {
    match expected {
        ColumnType::Int => matches!(value, Value::Int(_)),
        ColumnType::Float => matches!(value, Value::Int(_) | Value::Float(_)),
        ColumnType::String => matches!(value, Value::Text(_)),
        ColumnType::Bool => matches!(value, Value::Bool(_)),
    }
}

fn holds(a: &Value, op: CrossColumnOp, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return match op {
            CrossColumnOp::Less => x < y,
            CrossColumnOp::Greater => x > y,
            CrossColumnOp::Equal => x == y,
        };
    }
    let (x, y) = (a.to_string(), b.to_string());
    match op {
        CrossColumnOp::Less => x < y,
        CrossColumnOp::Greater => x > y,
        CrossColumnOp::Equal => x == y,
    }
}

/// Groups of rows identical across all non-identifier columns, each group
/// ordered ascending, groups ordered by first row.
fn exact_duplicate_groups(table: &DataTable, identifier_columns: &[String]) -> Vec<Vec<usize>> {
    let compared: Vec<&String> = table
        .columns()
        .iter()
        .filter(|c| !identifier_columns.contains(*c))
        .collect();
    if compared.is_empty() {
        return Vec::new();
    }

    let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
    for row_idx in 0..table.len() {
        let key = compared
            .iter()
            .map(|column| {
                let value = table.value(row_idx, column.as_str()).expect("row in range");
                serde_json::to_string(value).unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join("\u{1f}");
        by_key.entry(key).or_default().push(row_idx);
    }

    let mut groups: Vec<Vec<usize>> = by_key
        .into_values()
        .filter(|rows| rows.len() > 1)
        .collect();
    groups.sort_by_key(|rows| rows[0]);
    groups
}

/// Positional similarity for equal-length sequences, with early exit once
/// the mismatch budget for `threshold` is spent.
fn similarity_at_least(a: &str, b: &str, threshold: f64) -> bool {
    debug_assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return false;
    }
    let budget = ((1.0 - threshold) * a.len() as f64).floor() as usize;
    let mut mismatches = 0usize;
    for (x, y) in a.bytes().zip(b.bytes()) {
        if x != y {
            mismatches += 1;
            if mismatches > budget {
                return false;
            }
        }
    }
    true
}

/// Connected components of near-duplicate pairs. Bucketing by exact length
/// keeps the pairwise comparison within length classes; buckets are scanned
/// in parallel.
fn near_duplicate_groups(entries: &[(usize, String)], threshold: f64) -> Vec<Vec<usize>> {
    let mut buckets: BTreeMap<usize, Vec<(usize, &str)>> = BTreeMap::new();
    for (row, sequence) in entries {
        if !sequence.is_empty() {
            buckets
                .entry(sequence.len())
                .or_default()
                .push((*row, sequence.as_str()));
        }
    }

    let bucket_list: Vec<Vec<(usize, &str)>> = buckets.into_values().collect();
    let pairs: Vec<(usize, usize)> = bucket_list
        .par_iter()
        .flat_map_iter(|bucket| {
            let mut found = Vec::new();
            for i in 0..bucket.len() {
                for j in (i + 1)..bucket.len() {
                    if similarity_at_least(bucket[i].1, bucket[j].1, threshold) {
                        found.push((bucket[i].0, bucket[j].0));
                    }
                }
            }
            found
        })
        .collect();

    let mut union_find = UnionFind::default();
    for (a, b) in pairs {
        union_find.union(a, b);
    }
    union_find.groups()
}

/// Disjoint-set over row indices, used to merge near-duplicate pairs into
/// groups.
#[derive(Default)]
struct UnionFind {
    parent: HashMap<usize, usize>,
}

impl UnionFind {
    fn find(&mut self, x: usize) -> usize {
        let parent = *self.parent.entry(x).or_insert(x);
        if parent == x {
            return x;
        }
        let root = self.find(parent);
        self.parent.insert(x, root);
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller root wins so group identity is deterministic.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(hi, lo);
        }
    }

    /// Components with two or more members, each ascending, ordered by
    /// their smallest row.
    fn groups(&mut self) -> Vec<Vec<usize>> {
        let members: Vec<usize> = self.parent.keys().copied().collect();
        let mut by_root: HashMap<usize, Vec<usize>> = HashMap::new();
        for member in members {
            let root = self.find(member);
            by_root.entry(root).or_default().push(member);
        }
        let mut groups: Vec<Vec<usize>> = by_root
            .into_values()
            .filter(|g| g.len() > 1)
            .map(|mut g| {
                g.sort_unstable();
                g
            })
            .collect();
        groups.sort_by_key(|g| g[0]);
        groups
    }
}

/// Whether the missingness of `column` is unevenly distributed across the
/// categories of `categorical`: some category's missing fraction deviates
/// from the overall fraction by more than the configured threshold.
fn missingness_correlates(
    table: &DataTable,
    column: &str,
    categorical: &str,
    overall: f64,
    threshold: f64,
) -> bool {
    let (Some(target), Some(classes)) = (table.column(column), table.column(categorical)) else {
        return false;
    };

    let mut per_class: HashMap<String, (usize, usize)> = HashMap::new();
    for ((_, value), class) in target.indexed().zip(classes.iter()) {
        if class.is_null() {
            continue;
        }
        let entry = per_class.entry(class.to_string()).or_default();
        entry.1 += 1;
        if value.is_null() {
            entry.0 += 1;
        }
    }

    per_class.values().any(|(missing, total)| {
        *total > 0 && ((*missing as f64 / *total as f64) - overall).abs() > threshold
    })
}

fn custom_rule_violations(table: &DataTable, rule: &CustomRule) -> Option<Vec<usize>> {
    let column = predicate_column(&rule.predicate);
    let view = table.column(column)?;
    let violations = match &rule.predicate {
        CustomPredicate::NonNull { .. } => view.rows_where(|v| v.is_null()),
        CustomPredicate::InSet { values, .. } => {
            view.rows_where(|v| !v.is_null() && !values.iter().any(|w| w == &v.to_string()))
        }
        CustomPredicate::MinLength { min, .. } => {
            view.rows_where(|v| matches!(v.as_str(), Some(s) if s.len() < *min))
        }
        CustomPredicate::MaxLength { max, .. } => {
            view.rows_where(|v| matches!(v.as_str(), Some(s) if s.len() > *max))
        }
    };
    Some(violations)
}

fn predicate_column(predicate: &CustomPredicate) -> &str {
    match predicate {
        CustomPredicate::NonNull { column }
        | CustomPredicate::InSet { column, .. }
        | CustomPredicate::MinLength { column, .. }
        | CustomPredicate::MaxLength { column, .. } => column,
    }
}

// ============================================================================
// Tests
// ============================================================================
