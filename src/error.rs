//! Error taxonomy
//!
//! Four classes, each with a fixed recovery policy:
//! - `ContractViolation`: malformed card payload. Aborts the whole run.
//! - `SubjectProcessing`: one subject could not be handled. Counted, batch continues.
//! - `IdempotencyConflict`: the ledger refused the key. Reported as skipped.
//! - `Persistence`: a repository operation failed. Marks the run FAILED.

use thiserror::Error;

use crate::models::{JobStatus, MarketKind, Selection};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("contract violation on card '{card_key}': {reason}")]
    ContractViolation { card_key: String, reason: String },

    #[error("subject '{subject_id}' skipped: {reason}")]
    SubjectProcessing {
        subject_id: String,
        kind: &'static str,
        reason: String,
    },

    #[error("idempotency key '{key}' is already {status}")]
    IdempotencyConflict { key: String, status: JobStatus },

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl PipelineError {
    pub fn contract(card_key: &str, reason: impl Into<String>) -> Self {
        Self::ContractViolation {
            card_key: card_key.to_string(),
            reason: reason.into(),
        }
    }

    /// Short label recorded alongside failure messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContractViolation { .. } => "contract_violation",
            Self::SubjectProcessing { .. } => "subject_processing",
            Self::IdempotencyConflict { .. } => "idempotency_conflict",
            Self::Persistence(_) => "persistence",
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(format!("serialization: {}", e))
    }
}

/// Per-subject failures. Recorded in the run summary by kind; never abort a run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubjectError {
    #[error("subject id is empty")]
    EmptySubjectId,

    #[error("no driver weights configured for sport '{sport}'")]
    UnknownSport { sport: String },

    #[error("stored payload unparsable: {0}")]
    UnparsablePayload(String),

    #[error("no line resolvable for {market} market")]
    UnresolvableLine { market: MarketKind },

    #[error("no final outcome for subject")]
    MissingOutcome,

    #[error("final outcome scores must be finite and non-negative")]
    InvalidOutcome,

    #[error("selection '{selection}' cannot be graded in {market} market")]
    SelectionMismatch {
        market: MarketKind,
        selection: Selection,
    },
}

impl SubjectError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptySubjectId => "empty_subject_id",
            Self::UnknownSport { .. } => "unknown_sport",
            Self::UnparsablePayload(_) => "unparsable_payload",
            Self::UnresolvableLine { .. } => "unresolvable_line",
            Self::MissingOutcome => "missing_outcome",
            Self::InvalidOutcome => "invalid_outcome",
            Self::SelectionMismatch { .. } => "selection_mismatch",
        }
    }

    pub fn into_pipeline(self, subject_id: &str) -> PipelineError {
        PipelineError::SubjectProcessing {
            subject_id: subject_id.to_string(),
            kind: self.kind(),
            reason: self.to_string(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
