//! Provider trait for external identifier validation
//!
//! Both providers answer the same question: does this identifier exist for
//! this organism, and under what canonical name? The trait is the seam the
//! failover logic works across and the place tests plug mock providers in.

use async_trait::async_trait;

/// Resolution of a single identifier by a provider.
///
/// A returned outcome is authoritative: `valid = false` means the provider
/// answered "not found", not that the call failed. Call failures surface as
/// `Err` from the provider method and drive retry/failover instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupOutcome {
    /// Identifier as queried (original casing).
    pub identifier: String,
    pub valid: bool,
    /// Official symbol reported by the provider, when found.
    pub canonical_name: Option<String>,
    /// Number of matches the provider returned; more than one means the
    /// query was ambiguous.
    pub match_count: usize,
}

impl LookupOutcome {
    pub fn not_found(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            valid: false,
            canonical_name: None,
            match_count: 0,
        }
    }

    pub fn found(identifier: impl Into<String>, canonical: impl Into<String>, matches: usize) -> Self {
        Self {
            identifier: identifier.into(),
            valid: true,
            canonical_name: Some(canonical.into()),
            match_count: matches,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        self.match_count > 1
    }
}

/// An authoritative gene database reachable over the network.
#[async_trait]
pub trait GeneLookupProvider: Send + Sync {
    /// Provider name for cache entries and report metadata.
    fn name(&self) -> &'static str;

    /// Whether one request can carry many identifiers. Providers without
    /// batch support are queried one identifier at a time during failover.
    fn supports_batch(&self) -> bool {
        true
    }

    /// Resolve a set of identifiers for one organism. Returns one outcome
    /// per requested identifier, in request order. An `Err` covers the
    /// whole call and marks the chunk provider-failed.
    async fn lookup_batch(
        &self,
        organism: &str,
        identifiers: &[String],
    ) -> anyhow::Result<Vec<LookupOutcome>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_constructors() {
        let missing = LookupOutcome::not_found("NOPE1");
        assert!(!missing.valid);
        assert_eq!(missing.match_count, 0);
        assert!(!missing.is_ambiguous());

        let found = LookupOutcome::found("brca1", "BRCA1", 1);
        assert!(found.valid);
        assert_eq!(found.canonical_name.as_deref(), Some("BRCA1"));
        assert!(!found.is_ambiguous());

        let ambiguous = LookupOutcome::found("HLA", "HLA-A", 4);
        assert!(ambiguous.is_ambiguous());
    }
}
