//! Job runners
//!
//! Each job is gated by the run ledger: an idempotency conflict returns
//! `JobOutcome::Skipped`, any other error marks the run FAILED with its
//! message and propagates. The repository is borrowed for the lifetime of
//! one `Pipeline` and never held globally.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::arbiter::Arbiter;
use crate::config::PipelineConfig;
use crate::drivers::DriverAggregator;
use crate::error::{PipelineError, PipelineResult, SubjectError};
use crate::ledger::{RunLedger, RunTicket};
use crate::models::{FinalOutcome, JobStatus, PerformanceStat, PublishBatch, RunSummary};
use crate::resettle::{ResettleMode, ResettleReport, ResettlementCorrector};
use crate::settlement::SettlementResolver;
use crate::stats::StatsAggregator;
use crate::store::Repository;
use crate::writer::{draft_cards, CardScope, RecommendationWriter};

pub const JOB_PUBLISH: &str = "publish";
pub const JOB_INGEST_OUTCOMES: &str = "ingest_outcomes";
pub const JOB_SETTLE: &str = "settle";
pub const JOB_STATS: &str = "stats";
pub const JOB_RESETTLE: &str = "resettle";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome<T> {
    Completed { run_id: i64, report: T },
    Skipped { key: String, status: JobStatus },
}

impl<T> JobOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    pub fn report(&self) -> Option<&T> {
        match self {
            Self::Completed { report, .. } => Some(report),
            Self::Skipped { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub as_of: DateTime<Utc>,
    pub stats: Vec<PerformanceStat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResettleJobReport {
    #[serde(flatten)]
    pub resettle: ResettleReport,
    /// Stat rows rewritten after corrections were applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats_recomputed: Option<usize>,
}

pub struct Pipeline<'a> {
    repo: &'a dyn Repository,
    config: &'a PipelineConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(repo: &'a dyn Repository, config: &'a PipelineConfig) -> Self {
        Self { repo, config }
    }

    fn ledger(&self) -> RunLedger<'a> {
        RunLedger::new(self.repo, &self.config.ledger)
    }

    /// Run `job` under the ledger for `key`.
    pub fn run_job<T, F>(
        &self,
        job_name: &str,
        key: Option<&str>,
        job: F,
    ) -> PipelineResult<JobOutcome<T>>
    where
        F: FnOnce() -> PipelineResult<T>,
    {
        let ledger = self.ledger();
        let ticket: RunTicket = match ledger.begin(key, job_name) {
            Ok(ticket) => ticket,
            Err(PipelineError::IdempotencyConflict { key, status }) => {
                return Ok(JobOutcome::Skipped { key, status });
            }
            Err(e) => return Err(e),
        };

        match job() {
            Ok(report) => {
                ledger.complete(&ticket, None)?;
                Ok(JobOutcome::Completed {
                    run_id: ticket.run_id,
                    report,
                })
            }
            Err(e) => {
                let message = format!("{}: {}", e.kind(), e);
                if let Err(mark_err) = ledger.complete(&ticket, Some(&message)) {
                    error!(
                        run_id = ticket.run_id,
                        error = %mark_err,
                        "could not mark run failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Aggregate, arbitrate and write cards for every subject, plus any
    /// pre-built external cards.
    ///
    /// Every scored subject's card set under the configured producer version
    /// is replaced as a whole: a market that abstains on this run loses its
    /// PENDING card, and so does the call card when nothing qualifies.
    ///
    /// `processed` counts subjects and external cards, `changed` cards
    /// written or retired, `skipped` cards left as they were and subjects
    /// that produced no card, `failed` subjects that could not be scored.
    pub fn publish(
        &self,
        batch: &PublishBatch,
        key: Option<&str>,
    ) -> PipelineResult<JobOutcome<RunSummary>> {
        self.run_job(JOB_PUBLISH, key, || {
            let now = Utc::now();
            let aggregator = DriverAggregator::new(self.config);
            let arbiter = Arbiter::new(self.config);

            let mut summary = RunSummary::default();
            let mut drafts = Vec::new();
            let mut scopes = Vec::new();

            for subject in &batch.subjects {
                summary.processed += 1;
                if subject.subject_id.trim().is_empty() {
                    summary.record_failure(&SubjectError::EmptySubjectId.into_pipeline(""));
                    continue;
                }

                let impacts = aggregator.aggregate(subject);
                if impacts.is_empty() {
                    warn!(
                        subject = %subject.subject_id,
                        sport = %subject.sport,
                        "no weights configured for sport"
                    );
                    let err = SubjectError::UnknownSport {
                        sport: subject.sport.clone(),
                    };
                    summary.record_failure(&err.into_pipeline(&subject.subject_id));
                    continue;
                }

                scopes.push(CardScope::new(
                    &subject.subject_id,
                    &self.config.producer_version,
                ));
                let decided = arbiter.arbitrate(&impacts, &subject.market_context);
                if decided.decisions.is_empty() {
                    debug!(subject = %subject.subject_id, "all markets abstained");
                    summary.skipped += 1;
                    continue;
                }

                drafts.extend(draft_cards(
                    &arbiter,
                    subject,
                    &decided,
                    &self.config.producer_version,
                    now,
                )?);
            }

            summary.processed += batch.cards.len() as u64;
            drafts.extend(batch.cards.iter().cloned());

            let written =
                RecommendationWriter::new(self.repo).write_all(&drafts, &scopes, now)?;
            summary.changed += written.changed;
            summary.skipped += written.skipped;
            Ok(summary)
        })
    }

    /// Upsert final outcomes. Outcomes with non-finite or negative scores
    /// are counted as failures.
    pub fn ingest_outcomes(
        &self,
        outcomes: &[FinalOutcome],
        key: Option<&str>,
    ) -> PipelineResult<JobOutcome<RunSummary>> {
        self.run_job(JOB_INGEST_OUTCOMES, key, || {
            let mut summary = RunSummary::default();
            for outcome in outcomes {
                summary.processed += 1;
                if outcome.subject_id.trim().is_empty() {
                    summary.record_failure(&SubjectError::EmptySubjectId.into_pipeline(""));
                    continue;
                }
                let valid = |s: f64| s.is_finite() && s >= 0.0;
                if !valid(outcome.home_score) || !valid(outcome.away_score) {
                    warn!(subject = %outcome.subject_id, "outcome rejected: invalid scores");
                    summary.record_failure(
                        &SubjectError::InvalidOutcome.into_pipeline(&outcome.subject_id),
                    );
                    continue;
                }
                self.repo.upsert_outcome(outcome)?;
                summary.changed += 1;
            }
            Ok(summary)
        })
    }

    pub fn settle(&self, key: Option<&str>) -> PipelineResult<JobOutcome<RunSummary>> {
        self.run_job(JOB_SETTLE, key, || {
            SettlementResolver::new(self.repo).run(Utc::now())
        })
    }

    pub fn recompute_stats(
        &self,
        key: Option<&str>,
        as_of: Option<DateTime<Utc>>,
    ) -> PipelineResult<JobOutcome<StatsReport>> {
        self.run_job(JOB_STATS, key, || {
            let as_of = as_of.unwrap_or_else(Utc::now);
            let stats = StatsAggregator::new(self.repo).recompute(as_of)?;
            Ok(StatsReport { as_of, stats })
        })
    }

    /// Audit settled records; in apply mode write corrections and refresh
    /// stats when anything changed.
    pub fn resettle(
        &self,
        mode: ResettleMode,
        key: Option<&str>,
    ) -> PipelineResult<JobOutcome<ResettleJobReport>> {
        self.run_job(JOB_RESETTLE, key, || {
            let now = Utc::now();
            let corrector =
                ResettlementCorrector::new(self.repo, self.config.resettle.pnl_tolerance);
            let resettle = corrector.run(mode)?;

            let stats_recomputed = if mode == ResettleMode::Apply && resettle.summary.changed > 0 {
                Some(StatsAggregator::new(self.repo).recompute(now)?.len())
            } else {
                None
            };

            Ok(ResettleJobReport {
                resettle,
                stats_recomputed,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteRepository;

    #[test]
    fn test_second_run_with_same_key_is_skipped() {
        let repo = SqliteRepository::in_memory().unwrap();
        let config = PipelineConfig::default();
        let pipeline = Pipeline::new(&repo, &config);

        let mut calls = 0;
        let first = pipeline
            .run_job("noop", Some("k"), || {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert!(!first.is_skipped());

        let second = pipeline
            .run_job("noop", Some("k"), || {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            second,
            JobOutcome::Skipped {
                status: JobStatus::Success,
                ..
            }
        ));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_failed_job_is_recorded_and_retryable() {
        let repo = SqliteRepository::in_memory().unwrap();
        let config = PipelineConfig::default();
        let pipeline = Pipeline::new(&repo, &config);

        let err = pipeline
            .run_job::<(), _>("noop", Some("k"), || {
                Err(PipelineError::Persistence("disk I/O error".into()))
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));

        let run = repo.latest_job_run("k").unwrap().unwrap();
        assert_eq!(run.status, JobStatus::Failed);
        assert_eq!(
            run.error.as_deref(),
            Some("persistence: persistence error: disk I/O error")
        );

        let retry = pipeline.run_job("noop", Some("k"), || Ok(())).unwrap();
        assert!(!retry.is_skipped());
    }

    #[test]
    fn test_outcome_validation_counts_failures() {
        let repo = SqliteRepository::in_memory().unwrap();
        let config = PipelineConfig::default();
        let pipeline = Pipeline::new(&repo, &config);
        let now = Utc::now();

        let outcomes = vec![
            FinalOutcome {
                subject_id: "g1".into(),
                home_score: 3.0,
                away_score: 2.0,
                status: crate::models::OutcomeStatus::Final,
                recorded_at: now,
            },
            FinalOutcome {
                subject_id: "g2".into(),
                home_score: f64::NAN,
                away_score: 2.0,
                status: crate::models::OutcomeStatus::Final,
                recorded_at: now,
            },
        ];
        let outcome = pipeline.ingest_outcomes(&outcomes, None).unwrap();
        let summary = outcome.report().unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.changed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].kind, "invalid_outcome");
        assert!(repo.get_outcome("g2").unwrap().is_none());
    }
}
