//! Resettlement Corrector
//!
//! Re-grades every SETTLED record from the authoritative `decision` field
//! and reports (preview) or writes (apply) the records whose result changed
//! or whose PnL moved by more than the configured tolerance. Applying twice
//! in a row reports nothing the second time.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{PipelineResult, SubjectError};
use crate::models::{OutcomeStatus, RunSummary, SettlementResult};
use crate::settlement::{grade_card, Grading};
use crate::store::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResettleMode {
    Preview,
    Apply,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Correction {
    pub settlement_id: i64,
    pub card_id: String,
    pub subject_id: String,
    pub card_key: String,
    pub old_result: Option<SettlementResult>,
    pub new_result: SettlementResult,
    pub old_pnl: Option<f64>,
    pub new_pnl: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResettleReport {
    pub mode: ResettleMode,
    #[serde(flatten)]
    pub summary: RunSummary,
    pub corrections: Vec<Correction>,
}

/// Whether a stored grade differs from a fresh one beyond float noise.
pub fn differs(
    old_result: Option<SettlementResult>,
    old_pnl: Option<f64>,
    new_result: SettlementResult,
    new_pnl: Option<f64>,
    tolerance: f64,
) -> bool {
    if old_result != Some(new_result) {
        return true;
    }
    match (old_pnl, new_pnl) {
        (None, None) => false,
        (Some(a), Some(b)) => !((a - b).abs() <= tolerance),
        _ => true,
    }
}

pub struct ResettlementCorrector<'a> {
    repo: &'a dyn Repository,
    tolerance: f64,
}

impl<'a> ResettlementCorrector<'a> {
    pub fn new(repo: &'a dyn Repository, tolerance: f64) -> Self {
        Self { repo, tolerance }
    }

    /// Corrections keep the record's original `settled_at`.
    pub fn run(&self, mode: ResettleMode) -> PipelineResult<ResettleReport> {
        let rows = self.repo.settled_rows()?;
        let mut summary = RunSummary::default();
        let mut corrections = Vec::new();

        for row in &rows {
            summary.processed += 1;
            let card = &row.card;

            let outcome = match self.repo.get_outcome(&card.subject_id)? {
                Some(o) if o.status == OutcomeStatus::Final => o,
                _ => {
                    let e = SubjectError::MissingOutcome;
                    warn!(
                        subject = %card.subject_id,
                        card_key = %card.card_key,
                        error = %e,
                        "resettle skipped"
                    );
                    summary.record_failure(&e.into_pipeline(&card.subject_id));
                    continue;
                }
            };

            let grade = match grade_card(card, &outcome) {
                Ok(Grading::Graded(g)) => g,
                Ok(Grading::Abstained) => {
                    warn!(
                        subject = %card.subject_id,
                        card_key = %card.card_key,
                        "settled record now reads as an abstention, left as is"
                    );
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(
                        subject = %card.subject_id,
                        card_key = %card.card_key,
                        error = %e,
                        "resettle skipped"
                    );
                    summary.record_failure(&e.into_pipeline(&card.subject_id));
                    continue;
                }
            };

            if !differs(
                row.record.result,
                row.record.pnl_units,
                grade.result,
                grade.pnl_units,
                self.tolerance,
            ) {
                continue;
            }

            info!(
                subject = %card.subject_id,
                card_key = %card.card_key,
                old = ?row.record.result,
                new = %grade.result,
                old_pnl = ?row.record.pnl_units,
                new_pnl = ?grade.pnl_units,
                mode = ?mode,
                "🔁 Settlement correction"
            );

            if mode == ResettleMode::Apply {
                self.repo
                    .correct_settlement(row.record.id, grade.result, grade.pnl_units)?;
            }
            summary.changed += 1;
            corrections.push(Correction {
                settlement_id: row.record.id,
                card_id: card.card_id.clone(),
                subject_id: card.subject_id.clone(),
                card_key: card.card_key.clone(),
                old_result: row.record.result,
                new_result: grade.result,
                old_pnl: row.record.pnl_units,
                new_pnl: grade.pnl_units,
            });
        }

        info!(
            mode = ?mode,
            processed = summary.processed,
            changes = summary.changed,
            failed = summary.failed,
            "Resettlement pass complete"
        );
        Ok(ResettleReport {
            mode,
            summary,
            corrections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CardDraft, FinalOutcome, RecommendationCard, StatPeriod};
    use crate::stats::compute;
    use crate::store::SqliteRepository;
    use crate::writer::validate;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 20, 0, 0).unwrap()
    }

    fn moneyline_card(
        subject: &str,
        selection: &str,
        created_at: DateTime<Utc>,
    ) -> RecommendationCard {
        let draft = CardDraft {
            subject_id: subject.into(),
            sport: "nhl".into(),
            card_key: "moneyline".into(),
            producer_version: "manual-v1".into(),
            payload: json!({
                "card_type": "base",
                "base": {
                    "market": "moneyline",
                    "decision": { "selection": selection, "price": 150 },
                    "confidence": 0.55,
                    "tier": "WATCH",
                    "generated_at": "2026-08-18T18:00:00Z",
                    "market_context": {}
                }
            }),
            expires_at: None,
        };
        validate(&draft, created_at).unwrap()
    }

    /// Store `card` as SETTLED with the given grade.
    fn settle(
        repo: &SqliteRepository,
        card: &RecommendationCard,
        result: SettlementResult,
        pnl: Option<f64>,
        at: DateTime<Utc>,
    ) -> i64 {
        repo.replace_card(card).unwrap();
        let record = repo.get_settlement(&card.card_id).unwrap().unwrap();
        assert!(repo.settle_pending(record.id, result, pnl, at).unwrap());
        record.id
    }

    fn outcome(subject: &str, home: f64, away: f64, status: OutcomeStatus) -> FinalOutcome {
        FinalOutcome {
            subject_id: subject.into(),
            home_score: home,
            away_score: away,
            status,
            recorded_at: now(),
        }
    }

    #[test]
    fn test_outcome_no_longer_final_is_a_classified_failure() {
        let repo = SqliteRepository::in_memory().unwrap();
        let card = moneyline_card("g1", "away", now());
        settle(&repo, &card, SettlementResult::Loss, Some(-1.0), now());
        repo.upsert_outcome(&outcome("g1", 2.0, 5.0, OutcomeStatus::Cancelled))
            .unwrap();

        let report = ResettlementCorrector::new(&repo, 1e-6)
            .run(ResettleMode::Apply)
            .unwrap();
        assert_eq!(report.summary.processed, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.failures[0].kind, "missing_outcome");
        assert!(report.corrections.is_empty());

        let stored = repo.get_settlement(&card.card_id).unwrap().unwrap();
        assert_eq!(stored.result, Some(SettlementResult::Loss));
    }

    #[test]
    fn test_settled_abstention_is_left_alone() {
        let repo = SqliteRepository::in_memory().unwrap();
        let card = moneyline_card("g1", "pass", now());
        settle(&repo, &card, SettlementResult::Win, Some(1.5), now());
        repo.upsert_outcome(&outcome("g1", 2.0, 5.0, OutcomeStatus::Final))
            .unwrap();

        let report = ResettlementCorrector::new(&repo, 1e-6)
            .run(ResettleMode::Apply)
            .unwrap();
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.summary.changed, 0);
        assert_eq!(report.summary.failed, 0);

        let stored = repo.get_settlement(&card.card_id).unwrap().unwrap();
        assert_eq!(stored.result, Some(SettlementResult::Win));
    }

    #[test]
    fn test_preview_writes_nothing_and_apply_keeps_period() {
        let repo = SqliteRepository::in_memory().unwrap();
        let sixty_days_ago = now() - Duration::days(60);
        let card = moneyline_card("g1", "away", sixty_days_ago);
        // stored grade disagrees with the decision: away won 5-2
        settle(&repo, &card, SettlementResult::Loss, Some(-1.0), sixty_days_ago);
        repo.upsert_outcome(&outcome("g1", 2.0, 5.0, OutcomeStatus::Final))
            .unwrap();
        let corrector = ResettlementCorrector::new(&repo, 1e-6);

        let preview = corrector.run(ResettleMode::Preview).unwrap();
        assert_eq!(preview.corrections.len(), 1);
        assert_eq!(preview.corrections[0].new_result, SettlementResult::Win);
        let untouched = repo.get_settlement(&card.card_id).unwrap().unwrap();
        assert_eq!(untouched.result, Some(SettlementResult::Loss));

        let applied = corrector.run(ResettleMode::Apply).unwrap();
        assert_eq!(applied.summary.changed, 1);
        let stored = repo.get_settlement(&card.card_id).unwrap().unwrap();
        assert_eq!(stored.result, Some(SettlementResult::Win));
        assert_eq!(stored.pnl_units, Some(1.5));
        assert_eq!(stored.settled_at, Some(sixty_days_ago));

        let stats = compute(&repo.all_settlement_rows().unwrap(), now());
        let stat = |period: StatPeriod| {
            stats
                .iter()
                .find(|s| s.market_key == "moneyline" && s.period == period)
                .unwrap()
        };
        assert_eq!(stat(StatPeriod::All).wins, 1);
        assert_eq!(stat(StatPeriod::Last30d).settled, 0);
        assert_eq!(stat(StatPeriod::Last7d).settled, 0);

        assert!(corrector.run(ResettleMode::Apply).unwrap().corrections.is_empty());
    }

    #[test]
    fn test_differs_respects_tolerance() {
        use SettlementResult::*;
        assert!(!differs(Some(Win), Some(0.9090909), Win, Some(0.90909091), 1e-6));
        assert!(differs(Some(Win), Some(0.9), Win, Some(0.91), 1e-6));
        assert!(differs(Some(Loss), Some(-1.0), Win, Some(-1.0), 1e-6));
        assert!(differs(Some(Win), None, Win, Some(1.2), 1e-6));
        assert!(differs(Some(Win), Some(1.2), Win, None, 1e-6));
        assert!(!differs(Some(Win), None, Win, None, 1e-6));
        assert!(differs(None, Some(0.0), Push, Some(0.0), 1e-6));
    }
}
