//! Policy decision engine
//!
//! Turns the aggregated severity counts of a run into the final decision,
//! the human-review flag, and a one-sentence rationale. Everything here is
//! a pure function of the counts and the policy configuration: individual
//! validators never decide, and re-running policy over the same stages
//! gives the same answer.

use seqscreen_common::config::PolicyConfig;
use seqscreen_common::types::{Decision, SeverityCounts, StageMap};
use tracing::debug;

/// Outcome of policy evaluation over a run's stage results.
#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    pub decision: Decision,
    pub rationale: String,
    pub requires_review: bool,
    pub counts: SeverityCounts,
    /// Follow-ups attached to conditional accepts.
    pub conditions: Vec<String>,
}

/// Table-driven decision engine.
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Evaluate the decision matrix and review triggers over all stages.
    pub fn evaluate(&self, stages: &StageMap) -> PolicyOutcome {
        let counts = SeverityCounts::from_issues(stages.issues());
        let decision = self.apply_decision_matrix(&counts);
        let requires_review = self.should_trigger_review(&counts);
        let rationale = self.rationale(decision, &counts);
        let conditions = if decision == Decision::ConditionalAccept {
            self.conditions(&counts, stages)
        } else {
            Vec::new()
        };

        debug!(
            decision = %decision,
            critical = counts.critical,
            errors = counts.error,
            warnings = counts.warning,
            requires_review,
            "Policy decision made"
        );

        PolicyOutcome {
            decision,
            rationale,
            requires_review,
            counts,
            conditions,
        }
    }

    /// First matching row of the decision matrix wins.
    fn apply_decision_matrix(&self, counts: &SeverityCounts) -> Decision {
        let matrix = &self.config.decision_matrix;
        if counts.critical >= matrix.critical_threshold {
            return Decision::Rejected;
        }
        if counts.error >= matrix.error_threshold {
            return Decision::Rejected;
        }
        if counts.warning >= matrix.warning_threshold {
            return Decision::ConditionalAccept;
        }
        Decision::Accepted
    }

    /// Disjunction of configured review triggers.
    fn should_trigger_review(&self, counts: &SeverityCounts) -> bool {
        let triggers = &self.config.human_review_triggers;
        if triggers.on_critical && counts.critical > 0 {
            return true;
        }
        if counts.error >= triggers.error_count_threshold {
            return true;
        }
        counts.warning >= triggers.warning_count_threshold
    }

    fn rationale(&self, decision: Decision, counts: &SeverityCounts) -> String {
        let matrix = &self.config.decision_matrix;
        match decision {
            Decision::Rejected => {
                let mut parts = Vec::new();
                if counts.error >= matrix.error_threshold {
                    parts.push(format!(
                        "{} error(s) exceed threshold of {}",
                        counts.error, matrix.error_threshold
                    ));
                }
                if counts.warning > 0 {
                    parts.push(format!("{} warning(s)", counts.warning));
                }
                if counts.critical > 0 {
                    parts.push(format!(
                        "{} critical issue(s) require attention",
                        counts.critical
                    ));
                }
                if parts.is_empty() {
                    parts.push("validation failed".to_string());
                }
                format!("Rejected: {}", parts.join("; "))
            }
            Decision::ConditionalAccept => {
                let mut parts = Vec::new();
                if counts.error > 0 {
                    parts.push(format!("{} error(s)", counts.error));
                }
                if counts.warning > 0 {
                    parts.push(format!("{} warning(s)", counts.warning));
                }
                format!("Conditional accept: {} require attention", parts.join(", "))
            }
            Decision::Accepted => {
                if counts.warning > 0 {
                    format!("Accepted with {} warning(s)", counts.warning)
                } else {
                    "All validation checks passed".to_string()
                }
            }
        }
    }

    fn conditions(&self, counts: &SeverityCounts, stages: &StageMap) -> Vec<String> {
        let mut conditions = Vec::new();
        if counts.error > 0 {
            conditions.push(format!(
                "Review and address {} error(s) before production use",
                counts.error
            ));
        }
        if counts.warning > 0 {
            conditions.push(format!(
                "Consider reviewing {} warning(s) for optimization",
                counts.warning
            ));
        }
        for stage in stages.iter() {
            if !stage.issues.is_empty() {
                conditions.push(format!("Review {} validation issues", stage.stage));
            }
        }
        if conditions.is_empty() {
            conditions.push("Manual review recommended before proceeding".to_string());
        }
        conditions
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use seqscreen_common::config::{DecisionMatrix, HumanReviewTriggers};
    use seqscreen_common::types::{Issue, Severity, StageName, StageResult};

    fn stages_with(critical: usize, error: usize, warning: usize, info: usize) -> StageMap {
        let mut issues = Vec::new();
        for i in 0..critical {
            issues.push(Issue::new(Severity::Critical, format!("C{i}"), "critical"));
        }
        for i in 0..error {
            issues.push(Issue::new(Severity::Error, format!("E{i}"), "error"));
        }
        for i in 0..warning {
            issues.push(Issue::new(Severity::Warning, format!("W{i}"), "warning"));
        }
        for i in 0..info {
            issues.push(Issue::new(Severity::Info, format!("I{i}"), "info"));
        }
        let mut stages = StageMap::new();
        stages.insert(StageResult::new(
            StageName::Rules,
            issues,
            1.0,
            serde_json::Map::new(),
        ));
        stages
    }

    fn engine() -> PolicyEngine {
        PolicyEngine::new(PolicyConfig::default())
    }

    #[test]
    fn clean_run_is_accepted() {
        let outcome = engine().evaluate(&stages_with(0, 0, 0, 0));
        assert_eq!(outcome.decision, Decision::Accepted);
        assert!(!outcome.requires_review);
        assert_eq!(outcome.rationale, "All validation checks passed");
        assert!(outcome.conditions.is_empty());
    }

    #[test]
    fn one_critical_rejects_at_exact_threshold() {
        let outcome = engine().evaluate(&stages_with(1, 0, 0, 0));
        assert_eq!(outcome.decision, Decision::Rejected);
        assert!(outcome.requires_review);
        assert!(outcome.rationale.contains("1 critical issue(s)"));
    }

    #[test]
    fn five_errors_reject_and_four_do_not() {
        let rejected = engine().evaluate(&stages_with(0, 5, 0, 0));
        assert_eq!(rejected.decision, Decision::Rejected);
        assert!(rejected.rationale.contains("5 error(s) exceed threshold of 5"));

        // error_threshold - 1 errors with no criticals: accepted or
        // conditional depending on warnings
        let accepted = engine().evaluate(&stages_with(0, 4, 0, 0));
        assert_eq!(accepted.decision, Decision::Accepted);

        let conditional = engine().evaluate(&stages_with(0, 4, 10, 0));
        assert_eq!(conditional.decision, Decision::ConditionalAccept);
    }

    #[test]
    fn ten_warnings_downgrade_to_conditional() {
        let outcome = engine().evaluate(&stages_with(0, 0, 10, 0));
        assert_eq!(outcome.decision, Decision::ConditionalAccept);
        assert!(outcome.rationale.contains("10 warning(s)"));
        assert!(!outcome.conditions.is_empty());

        let under = engine().evaluate(&stages_with(0, 0, 9, 0));
        assert_eq!(under.decision, Decision::Accepted);
        assert_eq!(under.rationale, "Accepted with 9 warning(s)");
    }

    #[test]
    fn info_issues_never_affect_the_decision() {
        let outcome = engine().evaluate(&stages_with(0, 0, 0, 50));
        assert_eq!(outcome.decision, Decision::Accepted);
        assert!(!outcome.requires_review);
    }

    #[test]
    fn review_triggers_are_a_disjunction() {
        // 3 errors trigger review while the decision stays non-rejected
        let by_errors = engine().evaluate(&stages_with(0, 3, 0, 0));
        assert_eq!(by_errors.decision, Decision::Accepted);
        assert!(by_errors.requires_review);

        let by_warnings = engine().evaluate(&stages_with(0, 0, 15, 0));
        assert!(by_warnings.requires_review);

        let below_all = engine().evaluate(&stages_with(0, 2, 14, 0));
        assert!(!below_all.requires_review);
    }

    #[test]
    fn on_critical_toggle_is_respected() {
        let config = PolicyConfig {
            decision_matrix: DecisionMatrix {
                critical_threshold: 2,
                ..DecisionMatrix::default()
            },
            human_review_triggers: HumanReviewTriggers {
                on_critical: false,
                ..HumanReviewTriggers::default()
            },
        };
        let outcome = PolicyEngine::new(config).evaluate(&stages_with(1, 0, 0, 0));
        // One critical under a threshold of two, with on_critical off
        assert_eq!(outcome.decision, Decision::Accepted);
        assert!(!outcome.requires_review);
    }

    #[test]
    fn evaluation_is_a_pure_function_of_counts() {
        let stages = stages_with(0, 2, 7, 1);
        let first = engine().evaluate(&stages);
        let second = engine().evaluate(&stages);
        assert_eq!(first.decision, second.decision);
        assert_eq!(first.requires_review, second.requires_review);
        assert_eq!(first.rationale, second.rationale);
        assert_eq!(first.counts, second.counts);
    }

    #[test]
    fn conditional_conditions_name_the_stages() {
        let outcome = engine().evaluate(&stages_with(0, 1, 10, 0));
        assert_eq!(outcome.decision, Decision::ConditionalAccept);
        assert!(outcome
            .conditions
            .iter()
            .any(|c| c.contains("rules validation issues")));
    }
}
