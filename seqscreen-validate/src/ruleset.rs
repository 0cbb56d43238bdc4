//! Ruleset identity resolution
//!
//! Computes the identity of the rule configuration in effect (declared
//! version plus a content hash of the raw file bytes) so every report can
//! state exactly which ruleset produced it. Resolution is informational:
//! a missing or unversioned file yields `"unknown"`, never an error.

use std::path::{Path, PathBuf};

use seqscreen_common::config::RulesConfig;
use seqscreen_common::types::RulesetMetadata;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Ruleset identity with the full content hash retained for internal use.
#[derive(Debug, Clone)]
pub struct ResolvedRuleset {
    pub metadata: RulesetMetadata,
    /// Full SHA-256 hex digest; the report carries only the short form.
    pub full_hash: Option<String>,
}

/// Resolves ruleset metadata for the configured rules file.
#[derive(Debug, Clone)]
pub struct RulesetResolver {
    path: PathBuf,
}

impl RulesetResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the rules file and compute its identity. Called once per run.
    pub fn resolve(&self) -> ResolvedRuleset {
        let source = self.path.display().to_string();

        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(path = %source, error = %e, "Rules file unreadable; ruleset identity unknown");
                return ResolvedRuleset {
                    metadata: RulesetMetadata::unknown(source),
                    full_hash: None,
                };
            }
        };

        let full_hash = format!("{:x}", Sha256::digest(&bytes));
        let short_hash = full_hash[..16].to_string();

        let config: RulesConfig = match serde_yaml::from_slice(&bytes) {
            Ok(config) => config,
            Err(e) => {
                debug!(path = %source, error = %e, "Rules file not parseable; ruleset identity unknown");
                return ResolvedRuleset {
                    metadata: RulesetMetadata::unknown(source),
                    full_hash: Some(full_hash),
                };
            }
        };

        // A file without declared version metadata still hashes, but the
        // report shows the ruleset as unversioned.
        let Some(version) = config.version else {
            return ResolvedRuleset {
                metadata: RulesetMetadata::unknown(source),
                full_hash: Some(full_hash),
            };
        };

        let latest_changes = config
            .changelog
            .first()
            .map(|entry| entry.changes.clone())
            .unwrap_or_default();

        ResolvedRuleset {
            metadata: RulesetMetadata {
                version,
                last_updated: config.last_updated,
                source,
                hash: Some(short_hash),
                latest_changes,
            },
            full_hash: Some(full_hash),
        }
    }
}
