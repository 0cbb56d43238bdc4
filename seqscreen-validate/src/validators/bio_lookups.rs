//! External identifier validation stage
//!
//! Confirms identifier-column values (gene symbols) against the primary
//! provider with failover to the secondary, through the persistent TTL
//! cache. Pipeline per run: cache phase, miss coalescing into batched
//! chunks grouped by organism, primary submission, per-chunk failover,
//! write-back of every authoritative answer.
//!
//! Outcome severities: "not found" is an error (the identifier is truly
//! unknown), an ambiguous match is a warning, and an identifier neither
//! provider could answer for is a degraded-mode warning that is never
//! cached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use seqscreen_common::table::DataTable;
use seqscreen_common::types::{DatasetMetadata, Issue, Severity, StageName, StageResult};
use tracing::{debug, info, warn};

use crate::config::LookupSettings;
use crate::lookup::cache::{await_claim, CacheEntry, FetchClaim, GeneCache, KeyClaim};
use crate::lookup::provider::{GeneLookupProvider, LookupOutcome};
use crate::orchestrator::RunContext;

use super::Validator;

/// Fallback organism when neither the table nor the dataset metadata
/// declares one.
const DEFAULT_ORGANISM: &str = "human";

/// One distinct `(organism, identifier)` pair extracted from the table.
struct PendingKey {
    /// Identifier column the value came from.
    column: String,
    /// Organism, case-folded for querying and caching.
    organism: String,
    /// Identifier with its original casing for messages.
    identifier: String,
    /// Rows carrying this identifier, ascending.
    rows: Vec<usize>,
}

enum Resolution {
    Resolved {
        valid: bool,
        match_count: usize,
        provider: String,
    },
    Degraded,
}

/// Lookup-stage validator.
pub struct BioLookupsValidator {
    cache: Arc<GeneCache>,
    primary: Arc<dyn GeneLookupProvider>,
    secondary: Option<Arc<dyn GeneLookupProvider>>,
    settings: LookupSettings,
}

impl BioLookupsValidator {
    pub fn new(
        cache: Arc<GeneCache>,
        primary: Arc<dyn GeneLookupProvider>,
        secondary: Option<Arc<dyn GeneLookupProvider>>,
        settings: LookupSettings,
    ) -> Self {
        Self {
            cache,
            primary,
            secondary,
            settings,
        }
    }

    /// Distinct `(organism, identifier)` pairs, case-insensitively deduped
    /// with the first-seen casing preserved, in first-seen order.
    fn extract_keys(&self, table: &DataTable, metadata: &DatasetMetadata) -> Vec<PendingKey> {
        let mut keys: Vec<PendingKey> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();

        for column in &self.settings.identifier_columns {
            let Some(view) = table.column(column) else {
                continue;
            };
            for (row, identifier) in view.strings() {
                let identifier = identifier.trim();
                if identifier.is_empty() {
                    continue;
                }
                let organism = table
                    .value(row, "organism")
                    .and_then(|v| v.as_str())
                    .or(metadata.organism.as_deref())
                    .unwrap_or(DEFAULT_ORGANISM)
                    .trim()
                    .to_lowercase();

                let folded = (organism.clone(), identifier.to_uppercase());
                match index.get(&folded) {
                    Some(&pos) => keys[pos].rows.push(row),
                    None => {
                        index.insert(folded, keys.len());
                        keys.push(PendingKey {
                            column: column.clone(),
                            organism,
                            identifier: identifier.to_string(),
                            rows: vec![row],
                        });
                    }
                }
            }
        }
        keys
    }

    /// Resolve one chunk through the secondary provider, one identifier at
    /// a time when it lacks batch support.
    async fn failover_chunk(
        &self,
        secondary: &Arc<dyn GeneLookupProvider>,
        organism: &str,
        chunk: Vec<(usize, FetchClaim, String)>,
        counters: &mut Counters,
        resolutions: &mut HashMap<usize, Resolution>,
    ) {
        if secondary.supports_batch() {
            let identifiers: Vec<String> = chunk.iter().map(|(_, _, id)| id.clone()).collect();
            counters.api_calls += 1;
            match secondary.lookup_batch(organism, &identifiers).await {
                Ok(outcomes) => {
                    for ((key_idx, claim, _), outcome) in chunk.into_iter().zip(outcomes) {
                        counters.secondary_successes += 1;
                        self.complete(key_idx, claim, organism, outcome, secondary.name(), resolutions)
                            .await;
                    }
                }
                Err(error) => {
                    warn!(provider = secondary.name(), %error, "Secondary provider failed; chunk degraded");
                    for (key_idx, claim, _) in chunk {
                        claim.publish(None);
                        resolutions.insert(key_idx, Resolution::Degraded);
                    }
                }
            }
            return;
        }

        for (key_idx, claim, identifier) in chunk {
            counters.api_calls += 1;
            match secondary
                .lookup_batch(organism, std::slice::from_ref(&identifier))
                .await
            {
                Ok(mut outcomes) if !outcomes.is_empty() => {
                    counters.secondary_successes += 1;
                    let outcome = outcomes.remove(0);
                    self.complete(key_idx, claim, organism, outcome, secondary.name(), resolutions)
                        .await;
                }
                Ok(_) => {
                    claim.publish(None);
                    resolutions.insert(key_idx, Resolution::Degraded);
                }
                Err(error) => {
                    warn!(provider = secondary.name(), identifier, %error, "Secondary lookup failed");
                    claim.publish(None);
                    resolutions.insert(key_idx, Resolution::Degraded);
                }
            }
        }
    }

    /// Record an authoritative answer: write it back to the cache, publish
    /// to any coalesced waiters, and remember the resolution.
    async fn complete(
        &self,
        key_idx: usize,
        claim: FetchClaim,
        organism: &str,
        outcome: LookupOutcome,
        provider: &str,
        resolutions: &mut HashMap<usize, Resolution>,
    ) {
        match self
            .cache
            .put(organism, &outcome.identifier, &outcome, provider)
            .await
        {
            Ok(entry) => claim.publish(Some(entry)),
            Err(error) => {
                warn!(%error, identifier = %outcome.identifier, "Cache write-back failed");
                claim.publish(None);
            }
        }
        resolutions.insert(
            key_idx,
            Resolution::Resolved {
                valid: outcome.valid,
                match_count: outcome.match_count,
                provider: provider.to_string(),
            },
        );
    }
}

#[derive(Default)]
struct Counters {
    cache_hits: usize,
    cache_misses: usize,
    api_calls: usize,
    primary_successes: usize,
    secondary_successes: usize,
}

#[async_trait]
impl Validator for BioLookupsValidator {
    fn stage(&self) -> StageName {
        StageName::BioLookups
    }

    async fn run(
        &self,
        table: &DataTable,
        metadata: &DatasetMetadata,
        ctx: &RunContext,
    ) -> StageResult {
        let start = Instant::now();
        let keys = self.extract_keys(table, metadata);
        let mut counters = Counters::default();
        let mut resolutions: HashMap<usize, Resolution> = HashMap::new();

        // Phase 1: cache, claiming misses for single-flight fetching.
        let mut owners: Vec<(usize, FetchClaim)> = Vec::new();
        let mut waiters = Vec::new();
        for (key_idx, key) in keys.iter().enumerate() {
            match self.cache.lookup(&key.organism, &key.identifier).await {
                Ok(Some(entry)) => {
                    counters.cache_hits += 1;
                    resolutions.insert(key_idx, resolution_from_entry(&entry));
                }
                Ok(None) => {
                    counters.cache_misses += 1;
                    match self.cache.claim(&key.organism, &key.identifier) {
                        KeyClaim::Owner(claim) => owners.push((key_idx, claim)),
                        KeyClaim::Waiter(rx) => waiters.push((key_idx, rx)),
                    }
                }
                Err(error) => {
                    warn!(%error, identifier = %key.identifier, "Cache read failed; treating as miss");
                    counters.cache_misses += 1;
                    match self.cache.claim(&key.organism, &key.identifier) {
                        KeyClaim::Owner(claim) => owners.push((key_idx, claim)),
                        KeyClaim::Waiter(rx) => waiters.push((key_idx, rx)),
                    }
                }
            }
        }

        // Phase 2: coalesce misses into chunks, preserving organism grouping.
        let mut groups: Vec<(String, Vec<(usize, FetchClaim)>)> = Vec::new();
        for (key_idx, claim) in owners {
            let organism = keys[key_idx].organism.clone();
            match groups.iter_mut().find(|(o, _)| *o == organism) {
                Some((_, members)) => members.push((key_idx, claim)),
                None => groups.push((organism, vec![(key_idx, claim)])),
            }
        }

        // Phases 3-4: primary submission with per-chunk failover.
        let mut cancelled = false;
        for (organism, members) in groups {
            let mut members = members.into_iter().peekable();
            while members.peek().is_some() {
                if ctx.cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let chunk: Vec<(usize, FetchClaim)> =
                    members.by_ref().take(self.settings.batch_size).collect();
                let identifiers: Vec<String> = chunk
                    .iter()
                    .map(|(key_idx, _)| keys[*key_idx].identifier.clone())
                    .collect();

                counters.api_calls += 1;
                match self.primary.lookup_batch(&organism, &identifiers).await {
                    Ok(outcomes) => {
                        for ((key_idx, claim), outcome) in chunk.into_iter().zip(outcomes) {
                            counters.primary_successes += 1;
                            self.complete(
                                key_idx,
                                claim,
                                &organism,
                                outcome,
                                self.primary.name(),
                                &mut resolutions,
                            )
                            .await;
                        }
                    }
                    Err(error) => {
                        warn!(
                            provider = self.primary.name(),
                            organism = %organism,
                            chunk_size = identifiers.len(),
                            %error,
                            "Primary provider failed; failing chunk over"
                        );
                        let with_ids: Vec<(usize, FetchClaim, String)> = chunk
                            .into_iter()
                            .zip(identifiers)
                            .map(|((key_idx, claim), id)| (key_idx, claim, id))
                            .collect();
                        match &self.secondary {
                            Some(secondary) => {
                                self.failover_chunk(
                                    secondary,
                                    &organism,
                                    with_ids,
                                    &mut counters,
                                    &mut resolutions,
                                )
                                .await;
                            }
                            None => {
                                for (key_idx, claim, _) in with_ids {
                                    claim.publish(None);
                                    resolutions.insert(key_idx, Resolution::Degraded);
                                }
                            }
                        }
                    }
                }
            }
            if cancelled {
                break;
            }
        }

        // Phase 5: coalesced waiters resolve off someone else's fetch.
        for (key_idx, rx) in waiters {
            match await_claim(rx).await {
                Some(entry) => {
                    resolutions.insert(key_idx, resolution_from_entry(&entry));
                }
                None => {
                    resolutions.insert(key_idx, Resolution::Degraded);
                }
            }
        }

        // Phase 6: issues, in key extraction order.
        let mut issues = Vec::new();
        let mut degraded_mode = false;
        for (key_idx, key) in keys.iter().enumerate() {
            match resolutions.get(&key_idx) {
                Some(Resolution::Resolved {
                    valid: true,
                    match_count,
                    provider,
                }) if *match_count > 1 => {
                    issues.push(
                        Issue::new(
                            Severity::Warning,
                            "LOOKUP_002",
                            format!(
                                "Ambiguous gene symbol '{}' ({match_count} matches in {provider})",
                                key.identifier
                            ),
                        )
                        .with_field(key.column.clone())
                        .with_rows(key.rows.clone())
                        .with_meta("match_count", (*match_count).into())
                        .with_meta("provider", provider.clone().into()),
                    );
                }
                Some(Resolution::Resolved { valid: false, provider, .. }) => {
                    issues.push(
                        Issue::new(
                            Severity::Error,
                            "LOOKUP_001",
                            format!(
                                "Gene symbol '{}' not found for organism '{}' ({provider})",
                                key.identifier, key.organism
                            ),
                        )
                        .with_field(key.column.clone())
                        .with_rows(key.rows.clone())
                        .with_meta("provider", provider.clone().into()),
                    );
                }
                Some(Resolution::Degraded) => {
                    degraded_mode = true;
                    issues.push(
                        Issue::new(
                            Severity::Warning,
                            "LOOKUP_004",
                            format!(
                                "Could not validate '{}': all providers unavailable",
                                key.identifier
                            ),
                        )
                        .with_field(key.column.clone())
                        .with_rows(key.rows.clone())
                        .with_meta("provider", "degraded".into()),
                    );
                }
                _ => {}
            }
        }

        let attempted = counters.primary_successes
            + counters.secondary_successes
            + resolutions
                .values()
                .filter(|r| matches!(r, Resolution::Degraded))
                .count();
        let provider_reliability = if attempted == 0 {
            1.0
        } else {
            (counters.primary_successes + counters.secondary_successes) as f64 / attempted as f64
        };
        let total_requests = counters.cache_hits + counters.cache_misses;
        let hit_rate = if total_requests == 0 {
            "0.0%".to_string()
        } else {
            format!(
                "{:.1}%",
                counters.cache_hits as f64 / total_requests as f64 * 100.0
            )
        };

        info!(
            genes = keys.len(),
            cache_hits = counters.cache_hits,
            api_calls = counters.api_calls,
            fallbacks = counters.secondary_successes,
            degraded = degraded_mode,
            "External lookup validation complete"
        );
        debug!(cancelled, "Lookup stage finishing");

        let mut stage_metadata = serde_json::Map::new();
        stage_metadata.insert("genes_validated".to_string(), keys.len().into());
        stage_metadata.insert("cache_hits".to_string(), counters.cache_hits.into());
        stage_metadata.insert("cache_misses".to_string(), counters.cache_misses.into());
        stage_metadata.insert("cache_hit_rate".to_string(), hit_rate.into());
        stage_metadata.insert("api_calls_made".to_string(), counters.api_calls.into());
        stage_metadata.insert("ncbi_successes".to_string(), counters.primary_successes.into());
        stage_metadata.insert(
            "ensembl_fallbacks".to_string(),
            counters.secondary_successes.into(),
        );
        stage_metadata.insert("degraded_mode".to_string(), degraded_mode.into());
        stage_metadata.insert(
            "provider_reliability".to_string(),
            provider_reliability.into(),
        );
        stage_metadata.insert("batch_size".to_string(), self.settings.batch_size.into());

        StageResult::new(
            StageName::BioLookups,
            issues,
            start.elapsed().as_secs_f64() * 1000.0,
            stage_metadata,
        )
    }
}

fn resolution_from_entry(entry: &CacheEntry) -> Resolution {
    Resolution::Resolved {
        valid: entry.valid,
        match_count: entry.match_count,
        provider: entry.provider.clone(),
    }
}

// ============================================================================
// Tests
// ============================================================================
