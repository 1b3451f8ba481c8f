//! Run Ledger
//!
//! Gates job execution on an opaque idempotency key. The most recent record
//! for a key decides:
//! - none or FAILED: run
//! - SUCCESS: skip
//! - RUNNING: skip, unless older than `stale_after_secs`, in which case it
//!   is marked FAILED ("abandoned") and the key becomes retry-eligible
//!
//! A null key always runs and is still recorded for auditing. `begin`
//! reads the latest record and inserts the new RUNNING one in a single
//! repository transaction, so two callers cannot both pass the gate.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{JobRun, JobStatus};
use crate::store::{BeginOutcome, GateVerdict, Repository};

pub use crate::store::ABANDONED_MESSAGE;

/// Ten years; keeps `Duration::seconds` in range
const MAX_STALE_SECS: u64 = 10 * 365 * 24 * 3600;

/// Gate decision for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunGate {
    Proceed,
    Blocked(JobStatus),
}

/// Handle for a RUNNING record; consumed by `complete`.
#[derive(Debug, Clone, Serialize)]
pub struct RunTicket {
    pub run_id: i64,
    pub key: Option<String>,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
}

pub struct RunLedger<'a> {
    repo: &'a dyn Repository,
    stale_after: Duration,
}

impl<'a> RunLedger<'a> {
    pub fn new(repo: &'a dyn Repository, config: &LedgerConfig) -> Self {
        Self {
            repo,
            stale_after: Duration::seconds(config.stale_after_secs.min(MAX_STALE_SECS) as i64),
        }
    }

    pub fn should_run(&self, key: Option<&str>) -> PipelineResult<bool> {
        Ok(self.gate_at(key, Utc::now())? == RunGate::Proceed)
    }

    /// Evaluate the gate at `now`, recovering an abandoned RUNNING record.
    pub fn gate_at(&self, key: Option<&str>, now: DateTime<Utc>) -> PipelineResult<RunGate> {
        let Some(key) = key else {
            return Ok(RunGate::Proceed);
        };

        let Some(latest) = self.repo.latest_job_run(key)? else {
            return Ok(RunGate::Proceed);
        };

        match self.verdict(&latest, now) {
            GateVerdict::Proceed => Ok(RunGate::Proceed),
            GateVerdict::Blocked(status) => Ok(RunGate::Blocked(status)),
            GateVerdict::Abandoned => {
                warn!(
                    key,
                    run_id = latest.id,
                    started_at = %latest.started_at,
                    "recovering abandoned run"
                );
                self.repo
                    .finish_job_run(latest.id, JobStatus::Failed, now, Some(ABANDONED_MESSAGE))?;
                Ok(RunGate::Proceed)
            }
        }
    }

    fn verdict(&self, latest: &JobRun, now: DateTime<Utc>) -> GateVerdict {
        match latest.status {
            JobStatus::Failed => GateVerdict::Proceed,
            JobStatus::Success => GateVerdict::Blocked(JobStatus::Success),
            JobStatus::Running if now - latest.started_at >= self.stale_after => {
                GateVerdict::Abandoned
            }
            JobStatus::Running => GateVerdict::Blocked(JobStatus::Running),
        }
    }

    pub fn begin(&self, key: Option<&str>, job_name: &str) -> PipelineResult<RunTicket> {
        self.begin_at(key, job_name, Utc::now())
    }

    /// Insert a RUNNING record if the gate allows it.
    pub fn begin_at(
        &self,
        key: Option<&str>,
        job_name: &str,
        now: DateTime<Utc>,
    ) -> PipelineResult<RunTicket> {
        let gate = |latest: &JobRun| self.verdict(latest, now);
        let run = match self.repo.begin_job_run(key, job_name, now, &gate)? {
            BeginOutcome::Started { run, recovered } => {
                if let Some(old) = recovered {
                    warn!(key = ?key, run_id = old, "recovered abandoned run");
                }
                run
            }
            BeginOutcome::Blocked(status) => {
                info!(key = ?key, job = job_name, %status, "⏭️ run skipped");
                return Err(PipelineError::IdempotencyConflict {
                    key: key.unwrap_or_default().to_string(),
                    status,
                });
            }
        };
        debug!(key = ?key, job = job_name, run_id = run.id, "run started");

        Ok(RunTicket {
            run_id: run.id,
            key: run.idempotency_key,
            job_name: run.job_name,
            started_at: run.started_at,
        })
    }

    /// SUCCESS when `error` is `None`, FAILED with the message otherwise.
    pub fn complete(&self, ticket: &RunTicket, error: Option<&str>) -> PipelineResult<()> {
        let status = if error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Success
        };
        self.repo
            .finish_job_run(ticket.run_id, status, Utc::now(), error)?;

        match error {
            None => info!(
                key = ?ticket.key,
                job = %ticket.job_name,
                run_id = ticket.run_id,
                "✅ run complete"
            ),
            Some(e) => warn!(
                key = ?ticket.key,
                job = %ticket.job_name,
                run_id = ticket.run_id,
                error = e,
                "❌ run failed"
            ),
        }
        Ok(())
    }
}
