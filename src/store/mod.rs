//! Repository abstraction
//!
//! Every component receives a `&dyn Repository` scoped to one job
//! invocation. `SqliteRepository` is the production implementation.

pub mod sqlite;

pub use sqlite::SqliteRepository;

use chrono::{DateTime, Utc};

use crate::error::PipelineResult;
use crate::models::{
    FinalOutcome, JobRun, JobStatus, PerformanceStat, RecommendationCard, SettlementRecord,
    SettlementResult, SettlementRow,
};

/// Result of replacing a card under its identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Inserted,
    Updated,
    /// Same content hash as the stored card; nothing written
    Unchanged,
    /// The stored card is already settled and must not be replaced
    SettledLocked,
}

impl ReplaceOutcome {
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

/// Result of replacing the whole card set one subject has under a producer
/// version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectReplace {
    /// One per submitted card, in order
    pub outcomes: Vec<ReplaceOutcome>,
    /// Keys of PENDING cards the new set no longer contains; deleted along
    /// with their settlement records
    pub retired: Vec<String>,
}

/// Error recorded on a RUNNING record recovered as abandoned.
pub const ABANDONED_MESSAGE: &str = "abandoned";

/// Verdict on the latest run for a key, evaluated before a new run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Proceed,
    /// Latest run is a stale RUNNING record: mark it FAILED, then proceed
    Abandoned,
    Blocked(JobStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    Started {
        run: JobRun,
        /// Id of the abandoned run marked FAILED on the way in
        recovered: Option<i64>,
    },
    Blocked(JobStatus),
}

pub trait Repository: Send + Sync {
    // ---- run ledger -------------------------------------------------------

    /// Most recent run for a non-null idempotency key.
    fn latest_job_run(&self, key: &str) -> PipelineResult<Option<JobRun>>;

    /// Judge the latest run for `key` with `gate` and, unless blocked, insert
    /// a RUNNING record, as one transaction. A null key skips the gate.
    /// Fails with `IdempotencyConflict` if another RUNNING record already
    /// holds the key.
    fn begin_job_run(
        &self,
        key: Option<&str>,
        job_name: &str,
        started_at: DateTime<Utc>,
        gate: &dyn Fn(&JobRun) -> GateVerdict,
    ) -> PipelineResult<BeginOutcome>;

    fn finish_job_run(
        &self,
        id: i64,
        status: JobStatus,
        ended_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> PipelineResult<()>;

    fn list_job_runs(&self, key: Option<&str>, limit: usize) -> PipelineResult<Vec<JobRun>>;

    // ---- recommendation cards ---------------------------------------------

    /// Upsert the card under its identity and create its PENDING settlement
    /// record if absent, as one transaction.
    fn replace_card(&self, card: &RecommendationCard) -> PipelineResult<ReplaceOutcome>;

    /// Replace every card of `subject_id` under `producer_version` with
    /// `cards` in one transaction. PENDING cards whose key is absent from
    /// `cards` are deleted; SETTLED ones are kept.
    fn replace_subject_cards(
        &self,
        subject_id: &str,
        producer_version: &str,
        cards: &[RecommendationCard],
    ) -> PipelineResult<SubjectReplace>;

    fn cards_for_subject(&self, subject_id: &str) -> PipelineResult<Vec<RecommendationCard>>;

    // ---- settlement -------------------------------------------------------

    fn get_settlement(&self, card_id: &str) -> PipelineResult<Option<SettlementRecord>>;

    /// PENDING records whose subject has a FINAL outcome.
    fn pending_with_final_outcome(&self) -> PipelineResult<Vec<(SettlementRow, FinalOutcome)>>;

    fn settled_rows(&self) -> PipelineResult<Vec<SettlementRow>>;

    fn all_settlement_rows(&self) -> PipelineResult<Vec<SettlementRow>>;

    /// PENDING -> SETTLED. Returns false if the record was not pending.
    fn settle_pending(
        &self,
        settlement_id: i64,
        result: SettlementResult,
        pnl_units: Option<f64>,
        settled_at: DateTime<Utc>,
    ) -> PipelineResult<bool>;

    /// Overwrite the grade of an already SETTLED record. `settled_at` is
    /// kept so the record stays in its original stats period.
    fn correct_settlement(
        &self,
        settlement_id: i64,
        result: SettlementResult,
        pnl_units: Option<f64>,
    ) -> PipelineResult<bool>;

    // ---- final outcomes ---------------------------------------------------

    fn upsert_outcome(&self, outcome: &FinalOutcome) -> PipelineResult<()>;

    fn get_outcome(&self, subject_id: &str) -> PipelineResult<Option<FinalOutcome>>;

    // ---- performance stats ------------------------------------------------

    /// Overwrite each stat under its (sport, market key, period) key.
    fn replace_performance_stats(&self, stats: &[PerformanceStat]) -> PipelineResult<()>;

    fn list_performance_stats(&self) -> PipelineResult<Vec<PerformanceStat>>;
}
