//! Ensembl REST client (secondary provider)
//!
//! Failover target when NCBI is unreachable. The xrefs endpoint takes one
//! symbol per request, so chunks re-routed here are resolved one identifier
//! at a time under Ensembl's own rate limiter.
//!
//! # API Reference
//! - Endpoint: https://rest.ensembl.org/xrefs/symbol/{species}/{symbol}
//! - Documentation: https://rest.ensembl.org/documentation/info/xref_external

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::LookupSettings;

use super::provider::{GeneLookupProvider, LookupOutcome};

/// Ensembl REST base URL
const ENSEMBL_REST_URL: &str = "https://rest.ensembl.org";

const USER_AGENT: &str = "seqscreen/0.1 (dataset validation pipeline)";

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Per-identifier Ensembl xrefs client.
pub struct EnsemblClient {
    http: Client,
    base_url: String,
    limiter: DirectLimiter,
    permits: Semaphore,
}

impl EnsemblClient {
    pub fn new(settings: &LookupSettings) -> Self {
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .expect("HTTP client construction with static config");

        let period = Duration::from_secs_f64(settings.ensembl_rate_limit_delay.max(0.001));
        let quota = Quota::with_period(period).expect("non-zero rate-limit period");

        Self {
            http,
            base_url: ENSEMBL_REST_URL.to_string(),
            limiter: RateLimiter::direct(quota),
            permits: Semaphore::new(settings.concurrency_limit.max(1)),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn lookup_one(&self, organism: &str, identifier: &str) -> anyhow::Result<LookupOutcome> {
        self.limiter.until_ready().await;

        let species = species_path(organism);
        let url = format!("{}/xrefs/symbol/{species}/{identifier}", self.base_url);

        debug!(organism, identifier, "Resolving gene symbol against Ensembl");

        let response = self
            .http
            .get(&url)
            .query(&[("content-type", "application/json")])
            .send()
            .await
            .context("Ensembl request failed")?;

        let status = response.status();
        // A 404 from xrefs means the species is unknown, not the symbol;
        // both count as "not found" answers rather than provider failures.
        if status.as_u16() == 404 {
            return Ok(LookupOutcome::not_found(identifier));
        }
        if !status.is_success() {
            return Err(anyhow!("Ensembl returned {status}"));
        }

        let matches: Vec<serde_json::Value> =
            response.json().await.context("Ensembl response parse failed")?;
        Ok(outcome_from_matches(identifier, &matches))
    }
}

#[async_trait]
impl GeneLookupProvider for EnsemblClient {
    fn name(&self) -> &'static str {
        "ensembl"
    }

    fn supports_batch(&self) -> bool {
        false
    }

    async fn lookup_batch(
        &self,
        organism: &str,
        identifiers: &[String],
    ) -> anyhow::Result<Vec<LookupOutcome>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("semaphore never closed");

        let mut outcomes = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            outcomes.push(self.lookup_one(organism, identifier).await?);
        }
        Ok(outcomes)
    }
}

/// Ensembl species path component: lowercase with underscores, and the
/// common shorthand organisms mapped to their binomial names.
fn species_path(organism: &str) -> String {
    match organism.to_ascii_lowercase().as_str() {
        "human" => "homo_sapiens".to_string(),
        "mouse" => "mus_musculus".to_string(),
        "rat" => "rattus_norvegicus".to_string(),
        "zebrafish" => "danio_rerio".to_string(),
        other => other.replace(' ', "_"),
    }
}

fn outcome_from_matches(identifier: &str, matches: &[serde_json::Value]) -> LookupOutcome {
    if matches.is_empty() {
        return LookupOutcome::not_found(identifier);
    }
    let canonical = matches[0]["id"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| identifier.to_ascii_uppercase());
    LookupOutcome {
        identifier: identifier.to_string(),
        valid: true,
        canonical_name: Some(canonical),
        match_count: matches.len(),
    }
}

// ============================================================================
// Tests
// ============================================================================
