//! Shared test fixtures: mock lookup providers, table builders, and run
//! contexts. Compiled only for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use seqscreen_common::table::{DataTable, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::lookup::provider::{GeneLookupProvider, LookupOutcome};
use crate::orchestrator::RunContext;

/// Scriptable in-memory lookup provider.
///
/// Knows a fixed set of gene symbols (case-insensitive). Unknown symbols
/// resolve as "not found"; a failing provider errors on every call, which
/// drives the retry/failover paths in tests.
pub struct MockProvider {
    name: &'static str,
    batch: bool,
    genes: HashMap<String, usize>,
    failing: AtomicBool,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockProvider {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            batch: true,
            genes: HashMap::new(),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Sleep before answering, to exercise timeout paths.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Register a known gene with a single match.
    pub fn with_gene(mut self, symbol: &str) -> Self {
        self.genes.insert(symbol.to_ascii_uppercase(), 1);
        self
    }

    /// Register a gene that resolves with multiple matches.
    pub fn with_ambiguous_gene(mut self, symbol: &str, matches: usize) -> Self {
        self.genes.insert(symbol.to_ascii_uppercase(), matches);
        self
    }

    /// Provider without batch support (queried one identifier at a time).
    pub fn without_batch(mut self) -> Self {
        self.batch = false;
        self
    }

    /// Provider that errors on every call until revived.
    pub fn failing(self) -> Self {
        self.failing.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of lookup calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeneLookupProvider for MockProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    async fn lookup_batch(
        &self,
        _organism: &str,
        identifiers: &[String],
    ) -> anyhow::Result<Vec<LookupOutcome>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("{} unreachable", self.name);
        }
        Ok(identifiers
            .iter()
            .map(|identifier| {
                let folded = identifier.to_ascii_uppercase();
                match self.genes.get(&folded) {
                    Some(&matches) => LookupOutcome {
                        identifier: identifier.clone(),
                        valid: true,
                        canonical_name: Some(folded),
                        match_count: matches,
                    },
                    None => LookupOutcome::not_found(identifier.clone()),
                }
            })
            .collect())
    }
}

/// Fresh run context with an un-cancelled token.
pub fn run_ctx() -> RunContext {
    RunContext {
        validation_id: Uuid::new_v4(),
        cancel: CancellationToken::new(),
    }
}

/// Standard guide-RNA column set.
pub const GUIDE_COLUMNS: [&str; 6] = [
    "guide_id",
    "sequence",
    "pam_sequence",
    "target_gene",
    "organism",
    "nuclease_type",
];

/// One SpCas9 guide row for the standard column set.
pub fn guide_row(id: &str, sequence: &str, pam: &str, gene: &str) -> Vec<Value> {
    vec![
        Value::from(id),
        Value::from(sequence),
        Value::from(pam),
        Value::from(gene),
        Value::from("human"),
        Value::from("SpCas9"),
    ]
}

/// Guide-RNA table from rows built with [`guide_row`].
pub fn guide_table(rows: Vec<Vec<Value>>) -> DataTable {
    DataTable::from_rows(GUIDE_COLUMNS, rows).expect("valid guide table")
}
