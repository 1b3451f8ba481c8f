//! Settlement Resolver
//!
//! Grades each PENDING record whose subject has a FINAL outcome. The pick is
//! always read from the payload's `decision`; the legacy `prediction`
//! string is never consulted. Comparisons are exact: PUSH only on equality.
//!
//! Per-record problems (unparsable payload, no resolvable line) are counted
//! as failures and the batch moves on. Abstentions stay PENDING forever.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::pnl::pnl_units;
use crate::error::{PipelineResult, SubjectError};
use crate::models::{
    CardPayload, FinalOutcome, MarketKind, RecommendationCard, RunSummary, Selection,
    SettlementResult,
};
use crate::store::Repository;

/// Result of grading one card.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Grade {
    pub market: MarketKind,
    pub selection: Selection,
    pub line: Option<f64>,
    pub price: Option<f64>,
    pub result: SettlementResult,
    pub pnl_units: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Grading {
    Graded(Grade),
    /// The decision is the abstention value; never settled
    Abstained,
}

fn compare(ours: f64, theirs: f64) -> SettlementResult {
    match ours.partial_cmp(&theirs) {
        Some(Ordering::Greater) => SettlementResult::Win,
        Some(Ordering::Less) => SettlementResult::Loss,
        _ => SettlementResult::Push,
    }
}

/// Win/loss/push for a selection given final home/away metrics.
///
/// `line` is from the selected side's perspective for spreads and the
/// combined threshold for totals; moneyline ignores it.
pub fn classify(
    market: MarketKind,
    selection: Selection,
    line: Option<f64>,
    home: f64,
    away: f64,
) -> Result<SettlementResult, SubjectError> {
    if !home.is_finite() || !away.is_finite() {
        return Err(SubjectError::InvalidOutcome);
    }
    let mismatch = SubjectError::SelectionMismatch { market, selection };
    let resolved = || line.ok_or(SubjectError::UnresolvableLine { market });

    match market {
        MarketKind::Moneyline => match selection {
            Selection::Home => Ok(compare(home, away)),
            Selection::Away => Ok(compare(away, home)),
            _ => Err(mismatch),
        },
        MarketKind::Spread => match selection {
            Selection::Home => Ok(compare(home + resolved()?, away)),
            Selection::Away => Ok(compare(away + resolved()?, home)),
            _ => Err(mismatch),
        },
        MarketKind::Total => {
            let combined = home + away;
            match selection {
                Selection::Over => Ok(compare(combined, resolved()?)),
                Selection::Under => Ok(compare(resolved()?, combined)),
                _ => Err(mismatch),
            }
        }
    }
}

/// Grade a stored card against a final outcome.
pub fn grade_card(
    card: &RecommendationCard,
    outcome: &FinalOutcome,
) -> Result<Grading, SubjectError> {
    let payload: CardPayload = serde_json::from_str(&card.payload_json)
        .map_err(|e| SubjectError::UnparsablePayload(e.to_string()))?;
    let base = payload.base();
    let market = base.market;
    let selection = base.decision.selection;

    if selection.is_abstention() {
        return Ok(Grading::Abstained);
    }

    let line = base
        .decision
        .line
        .filter(|l| l.is_finite())
        .or_else(|| base.market_context.line_for(market, selection));
    let price = base
        .decision
        .price
        .filter(|p| p.is_finite())
        .or_else(|| base.market_context.price_for(market, selection));

    let result = classify(market, selection, line, outcome.home_score, outcome.away_score)?;

    Ok(Grading::Graded(Grade {
        market,
        selection,
        line,
        price,
        result,
        pnl_units: pnl_units(result, price),
    }))
}

pub struct SettlementResolver<'a> {
    repo: &'a dyn Repository,
}

impl<'a> SettlementResolver<'a> {
    pub fn new(repo: &'a dyn Repository) -> Self {
        Self { repo }
    }

    /// Settle every eligible PENDING record.
    pub fn run(&self, now: DateTime<Utc>) -> PipelineResult<RunSummary> {
        let rows = self.repo.pending_with_final_outcome()?;
        let mut summary = RunSummary::default();

        for (row, outcome) in &rows {
            summary.processed += 1;
            let card = &row.card;

            let grade = match grade_card(card, outcome) {
                Ok(Grading::Graded(grade)) => grade,
                Ok(Grading::Abstained) => {
                    debug!(
                        subject = %card.subject_id,
                        card_key = %card.card_key,
                        "abstention left pending"
                    );
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(
                        subject = %card.subject_id,
                        card_key = %card.card_key,
                        error = %e,
                        "⚠️ settlement skipped"
                    );
                    summary.record_failure(&e.into_pipeline(&card.subject_id));
                    continue;
                }
            };

            if self
                .repo
                .settle_pending(row.record.id, grade.result, grade.pnl_units, now)?
            {
                debug!(
                    subject = %card.subject_id,
                    card_key = %card.card_key,
                    result = %grade.result,
                    pnl = ?grade.pnl_units,
                    "settled"
                );
                summary.changed += 1;
            } else {
                summary.skipped += 1;
            }
        }

        info!(
            processed = summary.processed,
            settled = summary.changed,
            skipped = summary.skipped,
            failed = summary.failed,
            "🏁 Settlement pass complete"
        );
        Ok(summary)
    }
}
