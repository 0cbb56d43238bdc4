//! Validation orchestrator
//!
//! Sequences the pipeline: schema, then rules, then the two biological
//! stages (concurrently when enabled), then policy, and assembles the
//! final report. Data-driven failures become issues; only configuration
//! problems surface as errors before any stage runs.
//!
//! Containment rules:
//! - a stage that panics yields a synthetic critical `internal_error`
//!   issue and the pipeline continues, subject to short-circuiting;
//! - the overall deadline cancels in-flight stages at their next
//!   suspension point and the partial report carries a timeout issue;
//! - schema failures (error or critical) short-circuit; beyond schema,
//!   only critical issues do.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use seqscreen_common::config::{PolicyConfig, RulesConfig};
use seqscreen_common::events::{EventBus, ValidationEvent};
use seqscreen_common::table::DataTable;
use seqscreen_common::types::{
    ApiConfiguration, DatasetMetadata, Issue, Severity, StageMap, StageName, StageResult,
    ValidationReport,
};
use seqscreen_common::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{CacheSettings, LookupSettings, OrchestratorOptions};
use crate::engine::PolicyEngine;
use crate::lookup::provider::GeneLookupProvider;
use crate::lookup::{EnsemblClient, GeneCache, NcbiClient};
use crate::ruleset::RulesetResolver;
use crate::validators::{
    BioLookupsValidator, BioRulesValidator, RuleValidator, SchemaValidator, Validator,
};

/// Per-run context handed to every validator.
pub struct RunContext {
    pub validation_id: Uuid,
    /// Cancelled when the overall deadline trips; validators stop at their
    /// next suspension point.
    pub cancel: CancellationToken,
}

/// The validation pipeline. One instance serves many runs; each run is a
/// single-shot computation producing one immutable report.
pub struct ValidationOrchestrator {
    options: OrchestratorOptions,
    schema: SchemaValidator,
    rules: RuleValidator,
    bio_rules: BioRulesValidator,
    bio_lookups: BioLookupsValidator,
    policy: PolicyEngine,
    ruleset: RulesetResolver,
    cache: Arc<GeneCache>,
    api_configuration: ApiConfiguration,
    event_bus: EventBus,
}

impl ValidationOrchestrator {
    /// Build the production pipeline: settings from the environment, real
    /// providers, persistent cache.
    pub async fn new(options: OrchestratorOptions) -> Result<Self> {
        let lookup = LookupSettings::from_env();
        let cache = Arc::new(GeneCache::open(&CacheSettings::from_env()).await?);
        let primary: Arc<dyn GeneLookupProvider> = Arc::new(NcbiClient::new(&lookup));
        let secondary: Option<Arc<dyn GeneLookupProvider>> = if lookup.ensembl_enabled {
            Some(Arc::new(EnsemblClient::new(&lookup)))
        } else {
            None
        };
        Self::with_parts(options, lookup, cache, primary, secondary, EventBus::default())
    }

    /// Build a pipeline from explicit parts. Hosts use this to share an
    /// event bus or cache; tests use it to inject mock providers.
    pub fn with_parts(
        options: OrchestratorOptions,
        lookup: LookupSettings,
        cache: Arc<GeneCache>,
        primary: Arc<dyn GeneLookupProvider>,
        secondary: Option<Arc<dyn GeneLookupProvider>>,
        event_bus: EventBus,
    ) -> Result<Self> {
        // Config errors abort construction; no report is ever produced for
        // an unreadable or malformed configuration.
        let rules_config = RulesConfig::load(&options.rules_config_path)?;
        let policy_config = PolicyConfig::load(&options.policy_config_path)?;

        let api_configuration = lookup.api_configuration();
        let ruleset = RulesetResolver::new(&options.rules_config_path);

        info!(
            rules = %options.rules_config_path.display(),
            policy = %options.policy_config_path.display(),
            parallel_bio = options.parallel_bio_enabled,
            short_circuit = options.short_circuit_enabled,
            "Validation orchestrator initialized"
        );

        Ok(Self {
            schema: SchemaValidator::new(),
            rules: RuleValidator::new(&rules_config),
            bio_rules: BioRulesValidator::new(),
            bio_lookups: BioLookupsValidator::new(
                Arc::clone(&cache),
                primary,
                secondary,
                lookup,
            ),
            policy: PolicyEngine::new(policy_config),
            ruleset,
            cache,
            api_configuration,
            event_bus,
            options,
        })
    }

    /// The lookup cache, for the cache-management API surface.
    pub fn cache(&self) -> &Arc<GeneCache> {
        &self.cache
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Run the full pipeline over one dataset and produce its report.
    pub async fn validate(
        &self,
        table: &DataTable,
        metadata: &DatasetMetadata,
    ) -> Result<ValidationReport> {
        let validation_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + self.options.overall_timeout;
        let ctx = RunContext {
            validation_id,
            cancel: CancellationToken::new(),
        };

        info!(
            validation_id = %validation_id,
            dataset_id = %metadata.dataset_id,
            format = %metadata.format,
            records = table.len(),
            "Starting validation run"
        );
        self.event_bus.emit_lossy(ValidationEvent::ValidationStarted {
            validation_id,
            dataset_id: metadata.dataset_id.clone(),
            timestamp: Utc::now(),
        });

        // Resolved once per run so every report names the exact ruleset.
        let ruleset = self.ruleset.resolve();

        let mut stages = StageMap::new();
        let mut short_circuited = false;

        let (schema_result, mut timed_out) =
            self.run_stage(&self.schema, table, metadata, &ctx, deadline).await;
        let schema_failed = schema_result.has_severity_at_least(Severity::Error);
        stages.insert(schema_result);

        if !timed_out {
            if self.options.short_circuit_enabled && schema_failed {
                info!(validation_id = %validation_id, "Short-circuiting: schema validation failed");
                short_circuited = true;
            } else {
                let (rules_result, rules_timed_out) =
                    self.run_stage(&self.rules, table, metadata, &ctx, deadline).await;
                timed_out |= rules_timed_out;
                let rules_critical = rules_result.has_severity_at_least(Severity::Critical);
                stages.insert(rules_result);

                if !timed_out {
                    if self.options.short_circuit_enabled && rules_critical {
                        info!(
                            validation_id = %validation_id,
                            "Short-circuiting: critical rule violations detected"
                        );
                        short_circuited = true;
                    } else if self.options.parallel_bio_enabled {
                        // Both workers rejoin here; a timeout in one never
                        // cancels the other mid-stage.
                        let (bio_rules_outcome, bio_lookups_outcome) = tokio::join!(
                            self.run_stage(&self.bio_rules, table, metadata, &ctx, deadline),
                            self.run_stage(&self.bio_lookups, table, metadata, &ctx, deadline),
                        );
                        timed_out |= bio_rules_outcome.1 || bio_lookups_outcome.1;
                        stages.insert(bio_rules_outcome.0);
                        stages.insert(bio_lookups_outcome.0);
                    } else {
                        let (bio_rules_result, a_timed_out) =
                            self.run_stage(&self.bio_rules, table, metadata, &ctx, deadline).await;
                        stages.insert(bio_rules_result);
                        let (bio_lookups_result, b_timed_out) =
                            self.run_stage(&self.bio_lookups, table, metadata, &ctx, deadline).await;
                        stages.insert(bio_lookups_result);
                        timed_out |= a_timed_out || b_timed_out;
                    }
                }
            }
        }

        // Policy always runs, even over a partial run.
        let policy_started = Instant::now();
        let outcome = self.policy.evaluate(&stages);
        let mut policy_metadata = serde_json::Map::new();
        policy_metadata.insert(
            "severity_counts".to_string(),
            serde_json::to_value(outcome.counts).expect("counts serialize"),
        );
        if !outcome.conditions.is_empty() {
            policy_metadata.insert(
                "conditions".to_string(),
                serde_json::to_value(&outcome.conditions).expect("conditions serialize"),
            );
        }
        stages.insert(StageResult::new(
            StageName::Policy,
            Vec::new(),
            policy_started.elapsed().as_secs_f64() * 1000.0,
            policy_metadata,
        ));

        let execution_time_seconds = started.elapsed().as_secs_f64();
        let report = ValidationReport {
            validation_id,
            dataset_id: metadata.dataset_id.clone(),
            timestamp: Utc::now(),
            final_decision: outcome.decision,
            rationale: outcome.rationale,
            requires_human_review: outcome.requires_review,
            execution_time_seconds,
            short_circuited,
            stages,
            ruleset_metadata: ruleset.metadata,
            api_configuration: self.api_configuration.clone(),
        };

        info!(
            validation_id = %validation_id,
            dataset_id = %report.dataset_id,
            decision = %report.final_decision,
            duration_seconds = format!("{execution_time_seconds:.3}"),
            short_circuited,
            timed_out,
            "Validation run complete"
        );
        self.event_bus.emit_lossy(ValidationEvent::ValidationCompleted {
            validation_id,
            decision: report.final_decision,
            execution_time_seconds,
            short_circuited,
            timestamp: Utc::now(),
        });

        Ok(report)
    }

    /// Run one stage with panic containment and the remaining deadline
    /// budget. Returns the result plus whether the deadline tripped.
    async fn run_stage(
        &self,
        validator: &dyn Validator,
        table: &DataTable,
        metadata: &DatasetMetadata,
        ctx: &RunContext,
        deadline: Instant,
    ) -> (StageResult, bool) {
        let stage = validator.stage();
        self.event_bus.emit_lossy(ValidationEvent::StageStarted {
            validation_id: ctx.validation_id,
            stage,
            timestamp: Utc::now(),
        });

        let started = Instant::now();
        let remaining = deadline.saturating_duration_since(started);

        let (result, timed_out) = if remaining.is_zero() {
            ctx.cancel.cancel();
            (self.timeout_result(stage, 0.0), true)
        } else {
            let guarded = std::panic::AssertUnwindSafe(validator.run(table, metadata, ctx))
                .catch_unwind();
            match tokio::time::timeout(remaining, guarded).await {
                Ok(Ok(result)) => (result, false),
                Ok(Err(panic)) => {
                    let message = panic_message(&panic);
                    error!(stage = %stage, message, "Validator crashed; containing");
                    (
                        self.internal_error_result(
                            stage,
                            started.elapsed().as_secs_f64() * 1000.0,
                            &message,
                        ),
                        false,
                    )
                }
                Err(_) => {
                    // Overall deadline: ask every in-flight validator to stop.
                    ctx.cancel.cancel();
                    warn!(stage = %stage, "Overall timeout tripped during stage");
                    (
                        self.timeout_result(stage, started.elapsed().as_secs_f64() * 1000.0),
                        true,
                    )
                }
            }
        };

        self.event_bus.emit_lossy(ValidationEvent::StageCompleted {
            validation_id: ctx.validation_id,
            stage,
            passed: result.passed,
            issue_count: result.issues.len(),
            timestamp: Utc::now(),
        });
        (result, timed_out)
    }

    fn internal_error_result(
        &self,
        stage: StageName,
        elapsed_ms: f64,
        message: &str,
    ) -> StageResult {
        let issue = Issue::new(
            Severity::Critical,
            "ORCH_001",
            format!("Internal error in {stage} stage: {message}"),
        )
        .with_meta("internal_error", true.into());
        StageResult::new(stage, vec![issue], elapsed_ms, serde_json::Map::new())
    }

    fn timeout_result(&self, stage: StageName, elapsed_ms: f64) -> StageResult {
        let issue = Issue::new(
            Severity::Critical,
            "ORCH_002",
            format!(
                "Validation timeout after {}s while running {stage} stage",
                self.options.overall_timeout.as_secs_f64()
            ),
        )
        .with_meta("timeout", true.into());
        StageResult::new(stage, vec![issue], elapsed_ms, serde_json::Map::new())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{guide_row, guide_table, run_ctx, MockProvider};
    use async_trait::async_trait;
    use seqscreen_common::types::Decision;
    use seqscreen_common::Error;
    use std::io::Write;
    use std::time::Duration;

    const RULES_YAML: &str = r#"
version: "1.2.0"
last_updated: "2025-05-20"
changelog:
  - version: "1.2.0"
    date: "2025-05-20"
    changes: ["Near-duplicate scan for guide sequences"]
rules:
  duplicates:
    unique_columns: [guide_id]
    sequence_columns: [sequence]
  bias:
    categorical_columns: [nuclease_type]
"#;

    const POLICY_YAML: &str = "{}\n";

    struct Harness {
        orchestrator: ValidationOrchestrator,
        primary: Arc<MockProvider>,
        cache: Arc<GeneCache>,
        _dir: tempfile::TempDir,
    }

    async fn harness_with(
        primary: MockProvider,
        secondary: Option<MockProvider>,
        configure: impl FnOnce(&mut OrchestratorOptions),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();

        let rules_path = dir.path().join("validation_rules.yml");
        std::fs::File::create(&rules_path)
            .unwrap()
            .write_all(RULES_YAML.as_bytes())
            .unwrap();
        let policy_path = dir.path().join("policy_config.yml");
        std::fs::File::create(&policy_path)
            .unwrap()
            .write_all(POLICY_YAML.as_bytes())
            .unwrap();

        let mut options = OrchestratorOptions {
            rules_config_path: rules_path,
            policy_config_path: policy_path,
            ..OrchestratorOptions::default()
        };
        configure(&mut options);

        let cache = Arc::new(
            GeneCache::open(&CacheSettings {
                enabled: true,
                path: dir.path().join("cache.db"),
                ttl_hours: 168,
            })
            .await
            .unwrap(),
        );

        let primary = Arc::new(primary);
        let orchestrator = ValidationOrchestrator::with_parts(
            options,
            LookupSettings::default(),
            Arc::clone(&cache),
            Arc::clone(&primary) as Arc<dyn GeneLookupProvider>,
            secondary.map(|s| Arc::new(s) as Arc<dyn GeneLookupProvider>),
            EventBus::new(64),
        )
        .unwrap();

        Harness {
            orchestrator,
            primary,
            cache,
            _dir: dir,
        }
    }

    async fn harness() -> Harness {
        harness_with(
            MockProvider::new("ncbi").with_gene("BRCA1").with_gene("TP53"),
            None,
            |_| {},
        )
        .await
    }

    fn meta(format: &str, rows: usize) -> DatasetMetadata {
        DatasetMetadata::new("ds-e2e", format, rows)
    }

    #[tokio::test]
    async fn clean_guide_rna_single_record_is_accepted() {
        let h = harness().await;
        let table = guide_table(vec![guide_row("g1", "ATCGATCGATCGATCGATCG", "AGG", "BRCA1")]);

        let report = h
            .orchestrator
            .validate(&table, &meta("guide_rna", 1))
            .await
            .unwrap();

        assert_eq!(report.final_decision, Decision::Accepted);
        assert!(!report.requires_human_review);
        assert!(!report.short_circuited);
        assert_eq!(report.stages.len(), 5);
        for stage in report.stages.iter() {
            assert!(stage.passed, "stage {} failed", stage.stage);
        }
        assert_eq!(report.stages.issues().count(), 0);
        assert_eq!(report.rationale, "All validation checks passed");
        assert_eq!(report.ruleset_metadata.version, "1.2.0");
        assert!(report.ruleset_metadata.hash.is_some());
    }

    #[tokio::test]
    async fn invalid_pam_is_reported_but_accepted() {
        let h = harness().await;
        let table = guide_table(vec![guide_row("g1", "ATCGATCGATCGATCGATCG", "AAA", "BRCA1")]);

        let report = h
            .orchestrator
            .validate(&table, &meta("guide_rna", 1))
            .await
            .unwrap();

        // One error is far below the rejection threshold of five.
        assert_eq!(report.final_decision, Decision::Accepted);
        let bio_rules = report.stages.get(StageName::BioRules).unwrap();
        assert!(!bio_rules.passed);
        let issue = bio_rules
            .issues
            .iter()
            .find(|i| i.rule_id == "BIO_002")
            .expect("BIO_002 present");
        assert_eq!(issue.affected_rows, vec![0]);
    }

    #[tokio::test]
    async fn errors_below_threshold_with_few_warnings_stay_accepted() {
        let h = harness().await;
        // Ten rows: four identical sequences (distinct guide ids), one
        // critically short guide, one invalid PAM.
        let mut rows = Vec::new();
        for i in 0..4 {
            rows.push(guide_row(
                &format!("dup{i}"),
                "ATCGATCGATCGATCGATCG",
                "AGG",
                "BRCA1",
            ));
        }
        rows.push(guide_row("short", "ATCGATCG", "AGG", "TP53"));
        rows.push(guide_row("badpam", "GGCCGGCCATATGGCCGGCC", "AAA", "TP53"));
        for i in 0..4 {
            let sequence = match i {
                0 => "GGCCATCGATAAGGCCATCG",
                1 => "CCGGATATCGCGCCGGATAT",
                2 => "TGCATGCATGCATGCAATCG",
                _ => "CATGCCGGAACCGGTTCATG",
            };
            rows.push(guide_row(&format!("ok{i}"), sequence, "AGG", "BRCA1"));
        }
        let table = guide_table(rows);

        let report = h
            .orchestrator
            .validate(&table, &meta("guide_rna", 10))
            .await
            .unwrap();

        let counts = report.severity_counts();
        assert_eq!(counts.critical, 0);
        assert_eq!(counts.error, 2); // BIO_001A + BIO_002
        assert!(counts.warning >= 2); // DUP_001 + DUP_003 at least

        let rules = report.stages.get(StageName::Rules).unwrap();
        let near_dup = rules
            .issues
            .iter()
            .find(|i| i.rule_id == "DUP_003")
            .expect("DUP_003 present");
        assert_eq!(near_dup.affected_rows, vec![0, 1, 2, 3]);

        // Two errors sit under both the rejection threshold (5) and the
        // review trigger (3); warnings stay under ten.
        assert_eq!(report.final_decision, Decision::Accepted);
        assert!(!report.requires_human_review);
    }

    #[tokio::test]
    async fn unknown_gene_with_primary_down_falls_back_to_ensembl() {
        let h = harness_with(
            MockProvider::new("ncbi").failing(),
            Some(
                MockProvider::new("ensembl")
                    .without_batch()
                    .with_gene("BRCA1"),
            ),
            |_| {},
        )
        .await;

        let table = guide_table(vec![guide_row("g1", "ATCGATCGATCGATCGATCG", "AGG", "BRCA1")]);
        let report = h
            .orchestrator
            .validate(&table, &meta("guide_rna", 1))
            .await
            .unwrap();

        let lookups = report.stages.get(StageName::BioLookups).unwrap();
        let fallbacks = lookups.stage_metadata["ensembl_fallbacks"]
            .as_u64()
            .unwrap();
        assert!(fallbacks >= 1);
        assert_eq!(report.final_decision, Decision::Accepted);

        // The fallback resolution was written back to the cache.
        let cached = h.cache.lookup("human", "BRCA1").await.unwrap().unwrap();
        assert_eq!(cached.provider, "ensembl");
    }

    #[tokio::test]
    async fn second_run_with_warm_cache_makes_no_api_calls() {
        let h = harness().await;
        let table = guide_table(vec![guide_row("g1", "ATCGATCGATCGATCGATCG", "AGG", "BRCA1")]);
        let metadata = meta("guide_rna", 1);

        let first = h.orchestrator.validate(&table, &metadata).await.unwrap();
        let second = h.orchestrator.validate(&table, &metadata).await.unwrap();

        let lookups = second.stages.get(StageName::BioLookups).unwrap();
        assert_eq!(lookups.stage_metadata["cache_hit_rate"], "100.0%");
        assert_eq!(lookups.stage_metadata["api_calls_made"], 0);
        assert_eq!(h.primary.calls(), 1);

        // Idempotence: decision and issue lists match across runs.
        assert_eq!(first.final_decision, second.final_decision);
        let first_issues: Vec<_> = first.stages.issues().collect();
        let second_issues: Vec<_> = second.stages.issues().collect();
        assert_eq!(first_issues, second_issues);
    }

    #[tokio::test]
    async fn unknown_format_short_circuits_to_rejection() {
        let h = harness().await;
        let table = guide_table(vec![guide_row("g1", "ATCGATCGATCGATCGATCG", "AGG", "BRCA1")]);

        let report = h
            .orchestrator
            .validate(&table, &meta("fastq_reads", 1))
            .await
            .unwrap();

        assert!(report.short_circuited);
        assert!(report.stages.contains(StageName::Schema));
        assert!(report.stages.contains(StageName::Policy));
        assert!(!report.stages.contains(StageName::Rules));
        assert!(!report.stages.contains(StageName::BioRules));
        assert!(!report.stages.contains(StageName::BioLookups));
        assert_eq!(report.final_decision, Decision::Rejected);
        assert!(report.requires_human_review);
        assert!(report.rationale.contains("critical"));
        assert_eq!(h.primary.calls(), 0);
    }

    #[tokio::test]
    async fn short_circuit_disabled_runs_all_stages() {
        let h = harness_with(
            MockProvider::new("ncbi").with_gene("BRCA1"),
            None,
            |options| options.short_circuit_enabled = false,
        )
        .await;
        // Schema error: sequence has a foreign character.
        let table = guide_table(vec![guide_row("g1", "ATCGXTCGATCGATCGATCG", "AGG", "BRCA1")]);

        let report = h
            .orchestrator
            .validate(&table, &meta("guide_rna", 1))
            .await
            .unwrap();

        assert!(!report.short_circuited);
        assert_eq!(report.stages.len(), 5);
        assert!(!report.stages.get(StageName::Schema).unwrap().passed);
    }

    #[tokio::test]
    async fn empty_table_is_accepted_with_one_warning() {
        let h = harness().await;
        let table = guide_table(vec![]);

        let report = h
            .orchestrator
            .validate(&table, &meta("guide_rna", 0))
            .await
            .unwrap();

        assert_eq!(report.final_decision, Decision::Accepted);
        let issues: Vec<_> = report.stages.issues().collect();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].rule_id, "empty_dataset");
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn parallel_and_sequential_bio_produce_identical_findings() {
        let table = guide_table(vec![
            guide_row("g1", "ATCGATCGATCGATCGATCG", "AAA", "BRCA1"),
            guide_row("g2", "ATCGATCG", "AGG", "NOTAGENE1"),
        ]);
        let metadata = meta("guide_rna", 2);

        let parallel = harness().await;
        let sequential = harness_with(
            MockProvider::new("ncbi").with_gene("BRCA1").with_gene("TP53"),
            None,
            |options| options.parallel_bio_enabled = false,
        )
        .await;

        let a = parallel.orchestrator.validate(&table, &metadata).await.unwrap();
        let b = sequential
            .orchestrator
            .validate(&table, &metadata)
            .await
            .unwrap();

        let issues_a: Vec<_> = a
            .stages
            .issues()
            .map(|i| (i.rule_id.clone(), i.affected_rows.clone()))
            .collect();
        let issues_b: Vec<_> = b
            .stages
            .issues()
            .map(|i| (i.rule_id.clone(), i.affected_rows.clone()))
            .collect();
        assert_eq!(issues_a, issues_b);
        assert_eq!(a.final_decision, b.final_decision);
    }

    #[tokio::test]
    async fn missing_rules_config_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let policy_path = dir.path().join("policy.yml");
        std::fs::write(&policy_path, POLICY_YAML).unwrap();

        let options = OrchestratorOptions {
            rules_config_path: dir.path().join("nope.yml"),
            policy_config_path: policy_path,
            ..OrchestratorOptions::default()
        };
        let cache = Arc::new(
            GeneCache::open(&CacheSettings {
                enabled: false,
                path: dir.path().join("cache.db"),
                ttl_hours: 1,
            })
            .await
            .unwrap(),
        );

        let result = ValidationOrchestrator::with_parts(
            options,
            LookupSettings::default(),
            cache,
            Arc::new(MockProvider::new("ncbi")) as Arc<dyn GeneLookupProvider>,
            None,
            EventBus::new(8),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    struct PanickingValidator;

    #[async_trait]
    impl Validator for PanickingValidator {
        fn stage(&self) -> StageName {
            StageName::Rules
        }

        async fn run(
            &self,
            _table: &DataTable,
            _metadata: &DatasetMetadata,
            _ctx: &RunContext,
        ) -> StageResult {
            panic!("validator bug under test");
        }
    }

    #[tokio::test]
    async fn panicking_validator_is_contained_as_internal_error() {
        let h = harness().await;
        let table = guide_table(vec![guide_row("g1", "ATCGATCGATCGATCGATCG", "AGG", "BRCA1")]);
        let ctx = run_ctx();

        let (result, timed_out) = h
            .orchestrator
            .run_stage(
                &PanickingValidator,
                &table,
                &meta("guide_rna", 1),
                &ctx,
                Instant::now() + Duration::from_secs(30),
            )
            .await;

        assert!(!timed_out);
        assert!(!result.passed);
        assert_eq!(result.issues.len(), 1);
        let issue = &result.issues[0];
        assert_eq!(issue.rule_id, "ORCH_001");
        assert_eq!(issue.severity, Severity::Critical);
        assert!(issue.message.contains("validator bug under test"));
        assert_eq!(issue.metadata["internal_error"], true);
    }

    #[tokio::test]
    async fn overall_timeout_yields_partial_report_with_timeout_issue() {
        let h = harness_with(
            MockProvider::new("ncbi")
                .with_gene("BRCA1")
                .with_delay(Duration::from_secs(5)),
            None,
            |options| options.overall_timeout = Duration::from_millis(200),
        )
        .await;

        let table = guide_table(vec![guide_row("g1", "ATCGATCGATCGATCGATCG", "AGG", "BRCA1")]);
        let report = h
            .orchestrator
            .validate(&table, &meta("guide_rna", 1))
            .await
            .unwrap();

        // Policy still ran over the partial stages.
        assert!(report.stages.contains(StageName::Policy));
        let timeout_issue = report
            .stages
            .issues()
            .find(|i| i.rule_id == "ORCH_002")
            .expect("timeout issue present");
        assert_eq!(timeout_issue.severity, Severity::Critical);
        assert_eq!(report.final_decision, Decision::Rejected);
    }

    #[tokio::test]
    async fn report_round_trips_through_json() {
        let h = harness().await;
        let table = guide_table(vec![
            guide_row("g1", "ATCGATCGATCGATCGATCG", "AAA", "BRCA1"),
            guide_row("g2", "ATCGATCG", "AGG", "TP53"),
        ]);

        let report = h
            .orchestrator
            .validate(&table, &meta("guide_rna", 2))
            .await
            .unwrap();

        let json = serde_json::to_string_pretty(&report).unwrap();
        let back: ValidationReport = serde_json::from_str(&json).unwrap();

        assert_eq!(back.validation_id, report.validation_id);
        assert_eq!(back.dataset_id, report.dataset_id);
        assert_eq!(back.final_decision, report.final_decision);
        assert_eq!(back.rationale, report.rationale);
        assert_eq!(back.requires_human_review, report.requires_human_review);
        assert_eq!(back.short_circuited, report.short_circuited);
        assert_eq!(back.ruleset_metadata, report.ruleset_metadata);
        assert_eq!(back.api_configuration, report.api_configuration);
        let original: Vec<_> = report.stages.issues().collect();
        let decoded: Vec<_> = back.stages.issues().collect();
        assert_eq!(original, decoded);

        // Enum values serialize as lowercase strings.
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["final_decision"], "accepted");
        assert!(value["stages"]["bio_rules"]["issues"][0]["severity"]
            .as_str()
            .unwrap()
            .chars()
            .all(|c| c.is_ascii_lowercase() || c == '_'));
    }

    #[tokio::test]
    async fn execution_time_covers_every_stage() {
        let h = harness().await;
        let table = guide_table(vec![guide_row("g1", "ATCGATCGATCGATCGATCG", "AGG", "BRCA1")]);

        let report = h
            .orchestrator
            .validate(&table, &meta("guide_rna", 1))
            .await
            .unwrap();

        for stage in report.stages.iter() {
            assert!(
                report.execution_time_seconds * 1000.0 >= stage.execution_time_ms,
                "run shorter than stage {}",
                stage.stage
            );
        }
    }

    #[tokio::test]
    async fn events_bracket_the_run() {
        let h = harness().await;
        let mut rx = h.orchestrator.event_bus().subscribe();
        let table = guide_table(vec![guide_row("g1", "ATCGATCGATCGATCGATCG", "AGG", "BRCA1")]);

        h.orchestrator
            .validate(&table, &meta("guide_rna", 1))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(
            events.first(),
            Some(ValidationEvent::ValidationStarted { .. })
        ));
        assert!(matches!(
            events.last(),
            Some(ValidationEvent::ValidationCompleted { .. })
        ));
        let stage_completions = events
            .iter()
            .filter(|e| matches!(e, ValidationEvent::StageCompleted { .. }))
            .count();
        assert_eq!(stage_completions, 4); // schema, rules, bio_rules, bio_lookups
    }
}
