//! Runtime configuration resolution for seqscreen-validate
//!
//! Settings resolve from environment variables over built-in defaults.
//! Invalid values never abort startup: they log a warning and fall back,
//! so a typo in a deployment manifest degrades to defaults instead of
//! taking the service down.

use std::path::PathBuf;
use std::time::Duration;

use seqscreen_common::types::ApiConfiguration;
use tracing::{info, warn};

/// Primary-provider rate limit with an API key (requests per second).
pub const NCBI_RATE_WITH_KEY: u32 = 10;
/// Primary-provider rate limit without an API key.
pub const NCBI_RATE_WITHOUT_KEY: u32 = 3;

/// External-lookup subsystem settings.
#[derive(Debug, Clone)]
pub struct LookupSettings {
    /// NCBI API key; unlocks the higher primary rate limit.
    pub ncbi_api_key: Option<String>,
    /// Identifiers per batched primary request.
    pub batch_size: usize,
    /// Retries per chunk before the chunk is marked provider-failed.
    pub max_retries: u32,
    /// Per-request timeout, independent of the overall deadline.
    pub request_timeout: Duration,
    /// In-flight request cap per provider.
    pub concurrency_limit: usize,
    /// Whether the secondary provider is available for failover.
    pub ensembl_enabled: bool,
    /// Minimum interval between secondary-provider requests, seconds.
    pub ensembl_rate_limit_delay: f64,
    /// Columns holding identifiers to validate externally.
    pub identifier_columns: Vec<String>,
}

impl Default for LookupSettings {
    fn default() -> Self {
        Self {
            ncbi_api_key: None,
            batch_size: 50,
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
            concurrency_limit: 8,
            ensembl_enabled: true,
            ensembl_rate_limit_delay: 1.0 / 15.0,
            identifier_columns: vec!["target_gene".to_string()],
        }
    }
}

impl LookupSettings {
    /// Resolve from the environment: `NCBI_API_KEY`, `ENSEMBL_ENABLED`,
    /// `ENSEMBL_RATE_LIMIT_DELAY`.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        match std::env::var("NCBI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => {
                info!(rate_limit = NCBI_RATE_WITH_KEY, "NCBI API key detected");
                settings.ncbi_api_key = Some(key);
            }
            _ => {
                info!(
                    rate_limit = NCBI_RATE_WITHOUT_KEY,
                    "No NCBI API key; using the unauthenticated rate limit"
                );
            }
        }

        if let Some(enabled) = bool_env("ENSEMBL_ENABLED") {
            settings.ensembl_enabled = enabled;
        }

        if let Ok(raw) = std::env::var("ENSEMBL_RATE_LIMIT_DELAY") {
            match raw.parse::<f64>() {
                Ok(delay) if delay > 0.0 => settings.ensembl_rate_limit_delay = delay,
                _ => warn!(
                    value = %raw,
                    "Invalid ENSEMBL_RATE_LIMIT_DELAY; keeping {}s",
                    settings.ensembl_rate_limit_delay
                ),
            }
        }

        settings
    }

    /// Effective primary rate limit in requests per second.
    pub fn primary_rate_limit(&self) -> u32 {
        if self.ncbi_api_key.is_some() {
            NCBI_RATE_WITH_KEY
        } else {
            NCBI_RATE_WITHOUT_KEY
        }
    }

    /// Snapshot embedded into every report.
    pub fn api_configuration(&self) -> ApiConfiguration {
        ApiConfiguration {
            primary_provider: "ncbi".to_string(),
            primary_rate_limit: self.primary_rate_limit(),
            api_key_present: self.ncbi_api_key.is_some(),
            batch_size: self.batch_size,
            secondary_provider: "ensembl".to_string(),
            secondary_enabled: self.ensembl_enabled,
        }
    }
}

/// Persistent lookup-cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub path: PathBuf,
    pub ttl_hours: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("validation_cache.db"),
            ttl_hours: 168,
        }
    }
}

impl CacheSettings {
    /// Resolve from the environment: `CACHE_ENABLED`, `CACHE_PATH`,
    /// `CACHE_TTL_HOURS`.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(enabled) = bool_env("CACHE_ENABLED") {
            settings.enabled = enabled;
        }
        if let Ok(path) = std::env::var("CACHE_PATH") {
            if !path.trim().is_empty() {
                settings.path = PathBuf::from(path);
            }
        }
        if let Ok(raw) = std::env::var("CACHE_TTL_HOURS") {
            match raw.parse::<u64>() {
                Ok(hours) if hours > 0 => settings.ttl_hours = hours,
                _ => warn!(value = %raw, "Invalid CACHE_TTL_HOURS; keeping {}h", settings.ttl_hours),
            }
        }

        settings
    }
}

/// Orchestration options for a validation run.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub overall_timeout: Duration,
    pub short_circuit_enabled: bool,
    pub parallel_bio_enabled: bool,
    pub rules_config_path: PathBuf,
    pub policy_config_path: PathBuf,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            overall_timeout: Duration::from_secs(300),
            short_circuit_enabled: true,
            parallel_bio_enabled: true,
            rules_config_path: PathBuf::from("config/validation_rules.yml"),
            policy_config_path: PathBuf::from("config/policy_config.yml"),
        }
    }
}

impl OrchestratorOptions {
    /// Resolve from the environment: `ORCHESTRATOR_TIMEOUT_SECONDS`,
    /// `ENABLE_SHORT_CIRCUIT`, `ENABLE_PARALLEL_BIO`.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(raw) = std::env::var("ORCHESTRATOR_TIMEOUT_SECONDS") {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => options.overall_timeout = Duration::from_secs(secs),
                _ => warn!(
                    value = %raw,
                    "Invalid ORCHESTRATOR_TIMEOUT_SECONDS; keeping {}s",
                    options.overall_timeout.as_secs()
                ),
            }
        }
        if let Some(enabled) = bool_env("ENABLE_SHORT_CIRCUIT") {
            options.short_circuit_enabled = enabled;
        }
        if let Some(enabled) = bool_env("ENABLE_PARALLEL_BIO") {
            options.parallel_bio_enabled = enabled;
        }

        options
    }
}

/// Parse a boolean environment variable. Accepts `1/0`, `true/false`,
/// `yes/no`, `on/off` (case-insensitive); anything else warns and is ignored.
fn bool_env(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            warn!(name, value = other, "Unrecognized boolean value; ignoring");
            None
        }
    }
}
