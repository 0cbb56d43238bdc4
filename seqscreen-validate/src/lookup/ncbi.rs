//! NCBI Gene client (primary provider)
//!
//! Resolves gene symbols through E-utilities in two steps: a single batched
//! `esearch` turns a whole chunk of symbols into gene ids, then one
//! `esummary` maps those ids back to official symbols. One chunk costs two
//! HTTP requests regardless of chunk size.
//!
//! Rate limits follow NCBI policy: 10 requests/second with an API key,
//! 3 without. Transient failures (network, HTTP 429/5xx, timeouts) retry
//! with exponential backoff before the chunk is handed to failover.
//!
//! # API Reference
//! - Endpoint: https://eutils.ncbi.nlm.nih.gov/entrez/eutils
//! - Documentation: https://www.ncbi.nlm.nih.gov/books/NBK25501/

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::LookupSettings;

use super::provider::{GeneLookupProvider, LookupOutcome};

/// NCBI E-utilities base URL
const NCBI_EUTILS_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

/// User-Agent sent with every request
const USER_AGENT: &str = "seqscreen/0.1 (dataset validation pipeline)";

/// Exponential backoff base delay
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Exponential backoff ceiling
const BACKOFF_CAP: Duration = Duration::from_secs(8);

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Batched NCBI Gene client.
pub struct NcbiClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    limiter: DirectLimiter,
    permits: Semaphore,
    max_retries: u32,
}

impl NcbiClient {
    pub fn new(settings: &LookupSettings) -> Self {
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .expect("HTTP client construction with static config");

        let rate = NonZeroU32::new(settings.primary_rate_limit().max(1))
            .expect("rate limit is at least 1");

        Self {
            http,
            base_url: NCBI_EUTILS_URL.to_string(),
            api_key: settings.ncbi_api_key.clone(),
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            permits: Semaphore::new(settings.concurrency_limit.max(1)),
            max_retries: settings.max_retries,
        }
    }

    /// Override the endpoint, for hosts pointing at a mirror.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get_json_with_retry(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> anyhow::Result<serde_json::Value> {
        let mut attempt = 0u32;
        loop {
            // The bucket blocks until a token is available; it never drops.
            self.limiter.until_ready().await;

            match self.try_get_json(url, params).await {
                Ok(value) => return Ok(value),
                Err(error) if error.retryable && attempt < self.max_retries => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        url,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error.message,
                        "NCBI request failed; backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(anyhow!(error.message)),
            }
        }
    }

    async fn try_get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, RequestFailure> {
        let response = self
            .http
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| RequestFailure {
                retryable: true,
                message: format!("NCBI request failed: {e}"),
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(RequestFailure {
                retryable: true,
                message: format!("NCBI returned {status}"),
            });
        }
        if !status.is_success() {
            return Err(RequestFailure {
                retryable: false,
                message: format!("NCBI returned {status}"),
            });
        }

        response.json().await.map_err(|e| RequestFailure {
            retryable: false,
            message: format!("NCBI response parse failed: {e}"),
        })
    }

    async fn fetch_gene_ids(
        &self,
        organism: &str,
        identifiers: &[String],
    ) -> anyhow::Result<Vec<String>> {
        let term = build_search_term(organism, identifiers);
        let mut params: Vec<(&str, String)> = vec![
            ("db", "gene".to_string()),
            ("term", term),
            ("retmode", "json".to_string()),
            ("retmax", (identifiers.len() * 3).to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }

        let data = self
            .get_json_with_retry(&format!("{}/esearch.fcgi", self.base_url), &params)
            .await
            .context("esearch")?;
        Ok(parse_esearch_ids(&data))
    }

    async fn fetch_summaries(
        &self,
        gene_ids: &[String],
    ) -> anyhow::Result<HashMap<String, GeneSummary>> {
        if gene_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut params: Vec<(&str, String)> = vec![
            ("db", "gene".to_string()),
            ("id", gene_ids.join(",")),
            ("retmode", "json".to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }

        let data = self
            .get_json_with_retry(&format!("{}/esummary.fcgi", self.base_url), &params)
            .await
            .context("esummary")?;
        Ok(parse_summaries(&data, gene_ids))
    }
}

#[async_trait]
impl GeneLookupProvider for NcbiClient {
    fn name(&self) -> &'static str {
        "ncbi"
    }

    async fn lookup_batch(
        &self,
        organism: &str,
        identifiers: &[String],
    ) -> anyhow::Result<Vec<LookupOutcome>> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("semaphore never closed");

        debug!(
            organism,
            batch_size = identifiers.len(),
            "Resolving gene symbols against NCBI"
        );

        let gene_ids = self.fetch_gene_ids(organism, identifiers).await?;
        let summaries = self.fetch_summaries(&gene_ids).await?;

        Ok(map_outcomes(identifiers, &gene_ids, &summaries))
    }
}

/// Summary fields extracted from an `esummary` record.
#[derive(Debug, Clone)]
struct GeneSummary {
    symbol: String,
}

struct RequestFailure {
    retryable: bool,
    message: String,
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt));
    exp.min(BACKOFF_CAP)
}

/// Batched search term: `(G1[Gene Name] OR G2[Gene Name]) AND human[Organism]`.
fn build_search_term(organism: &str, identifiers: &[String]) -> String {
    let genes = identifiers
        .iter()
        .map(|g| format!("{g}[Gene Name]"))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!("({genes}) AND {organism}[Organism]")
}

fn parse_esearch_ids(data: &serde_json::Value) -> Vec<String> {
    data["esearchresult"]["idlist"]
        .as_array()
        .map(|ids| {
            ids.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_summaries(
    data: &serde_json::Value,
    gene_ids: &[String],
) -> HashMap<String, GeneSummary> {
    let mut summaries = HashMap::new();
    let Some(result) = data["result"].as_object() else {
        return summaries;
    };
    for gene_id in gene_ids {
        let Some(record) = result.get(gene_id) else {
            continue;
        };
        let Some(symbol) = record["name"].as_str() else {
            continue;
        };
        summaries.insert(
            gene_id.clone(),
            GeneSummary {
                symbol: symbol.to_string(),
            },
        );
    }
    summaries
}

/// Map resolved ids back to the requested symbols, case-insensitively.
fn map_outcomes(
    identifiers: &[String],
    gene_ids: &[String],
    summaries: &HashMap<String, GeneSummary>,
) -> Vec<LookupOutcome> {
    let mut by_symbol: HashMap<String, Vec<&GeneSummary>> = HashMap::new();
    for gene_id in gene_ids {
        if let Some(summary) = summaries.get(gene_id) {
            by_symbol
                .entry(summary.symbol.to_ascii_uppercase())
                .or_default()
                .push(summary);
        }
    }

    identifiers
        .iter()
        .map(|identifier| {
            match by_symbol.get(&identifier.to_ascii_uppercase()) {
                Some(matches) if !matches.is_empty() => LookupOutcome {
                    identifier: identifier.clone(),
                    valid: true,
                    canonical_name: Some(matches[0].symbol.clone()),
                    match_count: matches.len(),
                },
                _ => LookupOutcome::not_found(identifier.clone()),
            }
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn search_term_batches_and_scopes_by_organism() {
        let term = build_search_term(
            "human",
            &["BRCA1".to_string(), "TP53".to_string()],
        );
        assert_eq!(
            term,
            "(BRCA1[Gene Name] OR TP53[Gene Name]) AND human[Organism]"
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(10), Duration::from_secs(8));
    }

    #[test]
    fn parses_esearch_id_list() {
        let data = json!({"esearchresult": {"idlist": ["672", "7157"]}});
        assert_eq!(parse_esearch_ids(&data), vec!["672", "7157"]);
        assert!(parse_esearch_ids(&json!({})).is_empty());
    }

    #[test]
    fn maps_ids_back_to_requested_symbols() {
        let data = json!({
            "result": {
                "uids": ["672", "7157"],
                "672": {"name": "BRCA1", "description": "BRCA1 DNA repair associated"},
                "7157": {"name": "TP53", "description": "tumor protein p53"}
            }
        });
        let ids = vec!["672".to_string(), "7157".to_string()];
        let summaries = parse_summaries(&data, &ids);
        assert_eq!(summaries.len(), 2);

        let outcomes = map_outcomes(
            &["brca1".to_string(), "TP53".to_string(), "NOPE1".to_string()],
            &ids,
            &summaries,
        );
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].valid);
        assert_eq!(outcomes[0].identifier, "brca1");
        assert_eq!(outcomes[0].canonical_name.as_deref(), Some("BRCA1"));
        assert!(outcomes[1].valid);
        assert!(!outcomes[2].valid);
        assert_eq!(outcomes[2].match_count, 0);
    }

    #[test]
    fn multiple_matches_mark_ambiguity() {
        let data = json!({
            "result": {
                "uids": ["1", "2"],
                "1": {"name": "HLA"},
                "2": {"name": "hla"}
            }
        });
        let ids = vec!["1".to_string(), "2".to_string()];
        let summaries = parse_summaries(&data, &ids);
        let outcomes = map_outcomes(&["HLA".to_string()], &ids, &summaries);
        assert_eq!(outcomes[0].match_count, 2);
        assert!(outcomes[0].is_ambiguous());
    }

    #[tokio::test]
    async fn empty_batch_short_circuits_without_io() {
        let client = NcbiClient::new(&LookupSettings::default());
        let outcomes = client.lookup_batch("human", &[]).await.unwrap();
        assert!(outcomes.is_empty());
    }
}
