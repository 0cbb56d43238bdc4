//! Stage validators
//!
//! Each pipeline stage is a [`Validator`] with exactly one operation:
//! `run(table, metadata, ctx) -> StageResult`. There is no inheritance;
//! the orchestrator holds a fixed ordered list of validators by stage name.
//! Validators never fail for data problems — findings become issues — and
//! internal crashes are contained by the orchestrator.

pub mod bio_lookups;
pub mod bio_rules;
pub mod rules;
pub mod schema;

use async_trait::async_trait;
use seqscreen_common::table::DataTable;
use seqscreen_common::types::{DatasetMetadata, StageName, StageResult};

use crate::orchestrator::RunContext;

pub use bio_lookups::BioLookupsValidator;
pub use bio_rules::BioRulesValidator;
pub use rules::RuleValidator;
pub use schema::SchemaValidator;

/// A single pipeline stage.
#[async_trait]
pub trait Validator: Send + Sync {
    /// The stage this validator produces.
    fn stage(&self) -> StageName;

    /// Validate the table and return the stage result. Data problems are
    /// reported as issues, never as errors.
    async fn run(
        &self,
        table: &DataTable,
        metadata: &DatasetMetadata,
        ctx: &RunContext,
    ) -> StageResult;
}
