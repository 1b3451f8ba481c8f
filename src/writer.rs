//! Recommendation Writer
//!
//! Builds card drafts from arbiter output and persists drafts idempotently.
//! Every draft in a batch is validated against its card-type schema before
//! the first write, so a ContractViolation leaves the store untouched.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::arbiter::{Arbiter, SubjectDecisions};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    CardBase, CardDraft, CardPayload, Decision, DriverBreakdown, MarketDecision, MarketKind,
    RecommendationCard, RunSummary, Selection, SubjectContext,
};
use crate::store::{ReplaceOutcome, Repository};

/// Card key of the cross-market headline card.
pub const CALL_CARD_KEY: &str = "call";

const REASONING_LIMIT: usize = 3;

// =============================================================================
// DRAFTING
// =============================================================================

/// Legacy display string, e.g. "home -3.5", "over 221.5", "away ML".
fn prediction_label(market: MarketKind, selection: Selection, line: Option<f64>) -> String {
    match (market, line) {
        (_, _) if selection.is_abstention() => "pass".to_string(),
        (MarketKind::Moneyline, _) => format!("{} ML", selection),
        (_, Some(line)) if market == MarketKind::Spread => format!("{} {:+}", selection, line),
        (_, Some(line)) => format!("{} {}", selection, line),
        (_, None) => selection.to_string(),
    }
}

/// Strongest contributors first.
fn reasoning(decision: &MarketDecision) -> Vec<String> {
    let mut eligible: Vec<_> = decision.drivers.iter().filter(|d| d.eligible).collect();
    eligible.sort_by(|a, b| b.impact.abs().total_cmp(&a.impact.abs()));
    eligible
        .into_iter()
        .take(REASONING_LIMIT)
        .map(|d| format!("{} {:+.3}", d.key, d.impact))
        .collect()
}

fn card_base(
    arbiter: &Arbiter<'_>,
    subject: &SubjectContext,
    decision: &MarketDecision,
    generated_at: DateTime<Utc>,
) -> CardBase {
    CardBase {
        market: decision.market,
        decision: Decision {
            selection: decision.selection,
            line: decision.line,
            price: decision.price,
        },
        prediction: Some(prediction_label(
            decision.market,
            decision.selection,
            decision.line,
        )),
        confidence: arbiter.confidence(decision),
        tier: decision.tier,
        generated_at,
        market_context: subject.market_context.clone(),
        reasoning: reasoning(decision),
    }
}

/// Driver cards for every decided market plus a call card for the headline.
///
/// `generated_at` is the snapshot capture time when present so that an
/// identical input republishes byte-identical payloads.
pub fn draft_cards(
    arbiter: &Arbiter<'_>,
    subject: &SubjectContext,
    decided: &SubjectDecisions,
    producer_version: &str,
    now: DateTime<Utc>,
) -> PipelineResult<Vec<CardDraft>> {
    let generated_at = subject.market_context.captured_at.unwrap_or(now);
    let mut drafts = Vec::with_capacity(decided.decisions.len() + 1);

    let draft = |card_key: &str, payload: &CardPayload| -> PipelineResult<CardDraft> {
        Ok(CardDraft {
            subject_id: subject.subject_id.clone(),
            sport: subject.sport.clone(),
            card_key: card_key.to_string(),
            producer_version: producer_version.to_string(),
            payload: serde_json::to_value(payload)?,
            expires_at: subject.starts_at,
        })
    };

    for decision in &decided.decisions {
        let payload = CardPayload::Driver {
            base: card_base(arbiter, subject, decision, generated_at),
            breakdown: DriverBreakdown {
                net_score: decision.net_score,
                conflict: decision.conflict,
                coverage: decision.coverage,
                drivers: decision.drivers.clone(),
            },
        };
        drafts.push(draft(decision.market.as_str(), &payload)?);
    }

    if let Some(expression) = &decided.expression {
        if let Some(headline) = decided
            .decisions
            .iter()
            .find(|d| d.market == expression.chosen)
        {
            let payload = CardPayload::Call {
                base: card_base(arbiter, subject, headline, generated_at),
                expression: expression.clone(),
            };
            drafts.push(draft(CALL_CARD_KEY, &payload)?);
        }
    }

    Ok(drafts)
}

// =============================================================================
// VALIDATION
// =============================================================================

fn check_unit(card_key: &str, field: &str, v: f64) -> PipelineResult<()> {
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(PipelineError::contract(
            card_key,
            format!("{} must be within [0, 1], got {}", field, v),
        ))
    }
}

fn check_finite(card_key: &str, field: &str, v: Option<f64>) -> PipelineResult<()> {
    match v {
        Some(x) if !x.is_finite() => Err(PipelineError::contract(
            card_key,
            format!("{} must be finite", field),
        )),
        _ => Ok(()),
    }
}

/// Validate a draft and turn it into a storable card.
pub fn validate(draft: &CardDraft, now: DateTime<Utc>) -> PipelineResult<RecommendationCard> {
    let key = draft.card_key.as_str();
    for (field, value) in [
        ("subject_id", &draft.subject_id),
        ("sport", &draft.sport),
        ("card_key", &draft.card_key),
        ("producer_version", &draft.producer_version),
    ] {
        if value.trim().is_empty() {
            return Err(PipelineError::contract(key, format!("{} is empty", field)));
        }
    }

    let payload: CardPayload = serde_json::from_value(draft.payload.clone())
        .map_err(|e| {
            PipelineError::contract(key, format!("payload does not match schema: {}", e))
        })?;
    let base = payload.base();

    check_unit(key, "confidence", base.confidence)?;
    check_finite(key, "decision.line", base.decision.line)?;
    check_finite(key, "decision.price", base.decision.price)?;
    if !base.decision.selection.valid_for(base.market) {
        return Err(PipelineError::contract(
            key,
            format!(
                "selection '{}' is not valid for {} market",
                base.decision.selection, base.market
            ),
        ));
    }

    match &payload {
        CardPayload::Base { .. } => {}
        CardPayload::Driver { breakdown, .. } => {
            if breakdown.drivers.is_empty() {
                return Err(PipelineError::contract(key, "driver breakdown is empty"));
            }
            check_unit(key, "breakdown.coverage", breakdown.coverage)?;
            check_unit(key, "breakdown.conflict", breakdown.conflict)?;
            check_finite(key, "breakdown.net_score", Some(breakdown.net_score))?;
        }
        CardPayload::Call { expression, .. } => {
            if !expression.candidates.iter().any(|c| c.market == expression.chosen) {
                return Err(PipelineError::contract(
                    key,
                    "chosen market is not among the candidates",
                ));
            }
            if expression.chosen != base.market {
                return Err(PipelineError::contract(
                    key,
                    "call card market differs from the chosen market",
                ));
            }
        }
    }

    let payload_json = serde_json::to_string(&payload)?;
    let payload_hash = hex::encode(Sha256::digest(payload_json.as_bytes()));

    Ok(RecommendationCard {
        card_id: RecommendationCard::identity_id(
            &draft.subject_id,
            &draft.card_key,
            &draft.producer_version,
        ),
        subject_id: draft.subject_id.clone(),
        sport: draft.sport.to_ascii_lowercase(),
        card_key: draft.card_key.clone(),
        producer_version: draft.producer_version.clone(),
        card_type: payload.card_type(),
        market: base.market,
        selection: base.decision.selection,
        confidence: base.confidence,
        tier: base.tier,
        payload_json,
        payload_hash,
        created_at: now,
        expires_at: draft.expires_at,
    })
}

// =============================================================================
// WRITING
// =============================================================================

/// A subject whose complete card set under `producer_version` is decided
/// by the current run. Stored PENDING cards outside that set are retired.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CardScope {
    pub subject_id: String,
    pub producer_version: String,
}

impl CardScope {
    pub fn new(subject_id: &str, producer_version: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            producer_version: producer_version.to_string(),
        }
    }

    fn of(card: &RecommendationCard) -> Self {
        Self::new(&card.subject_id, &card.producer_version)
    }
}

pub struct RecommendationWriter<'a> {
    repo: &'a dyn Repository,
}

impl<'a> RecommendationWriter<'a> {
    pub fn new(repo: &'a dyn Repository) -> Self {
        Self { repo }
    }

    /// Validate every draft, then replace each card under its identity.
    ///
    /// Cards belonging to one of `scopes` are written as that subject's full
    /// set, retiring PENDING cards it no longer contains; a scope with no
    /// drafts retires everything still pending. Other cards are replaced one
    /// by one.
    ///
    /// `changed` counts inserts, updates and retired cards; `skipped` counts
    /// unchanged republishes and cards locked by a settled record.
    pub fn write_all(
        &self,
        drafts: &[CardDraft],
        scopes: &[CardScope],
        now: DateTime<Utc>,
    ) -> PipelineResult<RunSummary> {
        let cards = drafts
            .iter()
            .map(|d| validate(d, now))
            .collect::<PipelineResult<Vec<_>>>()?;

        let mut scoped: BTreeMap<CardScope, Vec<RecommendationCard>> =
            scopes.iter().map(|s| (s.clone(), Vec::new())).collect();
        let mut loose = Vec::new();
        for card in cards {
            match scoped.get_mut(&CardScope::of(&card)) {
                Some(set) => set.push(card),
                None => loose.push(card),
            }
        }

        let mut summary = RunSummary::default();
        for (scope, set) in &scoped {
            let replaced = self.repo.replace_subject_cards(
                &scope.subject_id,
                &scope.producer_version,
                set,
            )?;
            for (card, outcome) in set.iter().zip(&replaced.outcomes) {
                tally(&mut summary, card, *outcome);
            }
            if !replaced.retired.is_empty() {
                info!(
                    subject = %scope.subject_id,
                    retired = ?replaced.retired,
                    "Superseded cards retired"
                );
                summary.changed += replaced.retired.len() as u64;
            }
        }
        for card in &loose {
            let outcome = self.repo.replace_card(card)?;
            tally(&mut summary, card, outcome);
        }

        info!(
            cards = summary.processed,
            written = summary.changed,
            skipped = summary.skipped,
            "📝 Cards written"
        );
        Ok(summary)
    }
}

fn tally(summary: &mut RunSummary, card: &RecommendationCard, outcome: ReplaceOutcome) {
    summary.processed += 1;
    if outcome.is_write() {
        summary.changed += 1;
    } else {
        summary.skipped += 1;
    }
    debug!(
        subject = %card.subject_id,
        card_key = %card.card_key,
        tier = %card.tier,
        outcome = ?outcome,
        "card replace"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::drivers::DriverAggregator;
    use crate::models::{
        CardType, DriverSignal, DriverStatus, MarketSnapshot, SettlementResult, SettlementStatus,
        Tier,
    };
    use crate::store::SqliteRepository;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 18, 0, 0).unwrap()
    }

    fn signal(key: &str, score: f64) -> DriverSignal {
        DriverSignal {
            key: key.to_string(),
            score,
            status: DriverStatus::Actionable,
            inputs: serde_json::Value::Null,
        }
    }

    fn subject() -> SubjectContext {
        let mut drivers = BTreeMap::new();
        drivers.insert(
            MarketKind::Spread,
            vec![
                signal("power_rating", 0.72),
                signal("rest_advantage", 0.6),
                signal("injury_impact", 0.55),
            ],
        );
        drivers.insert(MarketKind::Total, vec![signal("pace_projection", 0.58)]);
        SubjectContext {
            subject_id: "nba-2026-10-17-bos-nyk".into(),
            sport: "nba".into(),
            starts_at: Some(now() + chrono::Duration::hours(2)),
            market_context: MarketSnapshot {
                captured_at: Some(now()),
                spread_home_line: Some(-3.5),
                spread_home_price: Some(-110.0),
                spread_away_price: Some(-110.0),
                total_line: Some(221.5),
                over_price: Some(-105.0),
                under_price: Some(-115.0),
                ..Default::default()
            },
            drivers,
        }
    }

    fn drafts(config: &PipelineConfig) -> Vec<CardDraft> {
        let s = subject();
        let arbiter = Arbiter::new(config);
        let impacts = DriverAggregator::new(config).aggregate(&s);
        let decided = arbiter.arbitrate(&impacts, &s.market_context);
        draft_cards(&arbiter, &s, &decided, &config.producer_version, now()).unwrap()
    }

    fn base_payload(selection: &str, confidence: f64) -> serde_json::Value {
        json!({
            "card_type": "base",
            "base": {
                "market": "total",
                "decision": { "selection": selection, "line": 221.5, "price": -110 },
                "confidence": confidence,
                "tier": "WATCH",
                "generated_at": "2026-10-17T18:00:00Z",
                "market_context": { "total_line": 221.5 }
            }
        })
    }

    fn external(card_key: &str, payload: serde_json::Value) -> CardDraft {
        CardDraft {
            subject_id: "nba-2026-10-17-lal-gsw".into(),
            sport: "NBA".into(),
            card_key: card_key.into(),
            producer_version: "totals-v3".into(),
            payload,
            expires_at: None,
        }
    }

    #[test]
    fn test_drafts_cover_markets_and_headline() {
        let config = PipelineConfig::default();
        let drafts = drafts(&config);

        // moneyline has no signals and abstains
        let keys: Vec<&str> = drafts.iter().map(|d| d.card_key.as_str()).collect();
        assert_eq!(keys, vec!["spread", "total", CALL_CARD_KEY]);

        let call = validate(&drafts[2], now()).unwrap();
        assert_eq!(call.card_type, CardType::Call);
        assert_eq!(call.market, MarketKind::Spread);
        assert_eq!(call.selection, Selection::Home);
        assert_eq!(call.expires_at, subject().starts_at);

        let spread = validate(&drafts[0], now()).unwrap();
        assert_eq!(spread.tier, Tier::Fire);
        let payload: CardPayload = serde_json::from_str(&spread.payload_json).unwrap();
        assert_eq!(payload.base().prediction.as_deref(), Some("home -3.5"));
        assert_eq!(payload.base().decision.line, Some(-3.5));
    }

    fn scope(config: &PipelineConfig) -> Vec<CardScope> {
        vec![CardScope::new("nba-2026-10-17-bos-nyk", &config.producer_version)]
    }

    #[test]
    fn test_republish_is_unchanged() {
        let config = PipelineConfig::default();
        let repo = SqliteRepository::in_memory().unwrap();
        let writer = RecommendationWriter::new(&repo);

        let first = writer.write_all(&drafts(&config), &scope(&config), now()).unwrap();
        assert_eq!(first.changed, 3);

        let later = now() + chrono::Duration::minutes(5);
        let second = writer.write_all(&drafts(&config), &scope(&config), later).unwrap();
        assert_eq!(second.changed, 0);
        assert_eq!(second.skipped, 3);

        let cards = repo.cards_for_subject("nba-2026-10-17-bos-nyk").unwrap();
        assert_eq!(cards.len(), 3);
        for card in &cards {
            let record = repo.get_settlement(&card.card_id).unwrap().unwrap();
            assert_eq!(record.status, SettlementStatus::Pending);
        }
    }

    #[test]
    fn test_validation_rejects_bad_payloads() {
        let cases = vec![
            ("confidence", base_payload("over", 1.2)),
            ("selection", base_payload("home", 0.5)),
            ("schema", json!({ "card_type": "base", "base": { "market": "total" } })),
            ("card type", json!({ "card_type": "teaser" })),
            (
                "empty breakdown",
                json!({
                    "card_type": "driver",
                    "base": base_payload("over", 0.5)["base"].clone(),
                    "breakdown": {
                        "net_score": 0.1,
                        "conflict": 0.0,
                        "coverage": 1.0,
                        "drivers": []
                    }
                }),
            ),
            (
                "call candidates",
                json!({
                    "card_type": "call",
                    "base": base_payload("over", 0.5)["base"].clone(),
                    "expression": { "chosen": "total", "candidates": [] }
                }),
            ),
        ];

        for (label, payload) in cases {
            let err = validate(&external("total", payload), now()).unwrap_err();
            assert!(
                matches!(err, PipelineError::ContractViolation { .. }),
                "{}: {:?}",
                label,
                err
            );
        }

        assert!(validate(&external("total", base_payload("under", 0.5)), now()).is_ok());
    }

    #[test]
    fn test_contract_violation_writes_nothing() {
        let config = PipelineConfig::default();
        let repo = SqliteRepository::in_memory().unwrap();
        let writer = RecommendationWriter::new(&repo);

        let mut batch = drafts(&config);
        batch.push(external("total", base_payload("home", 0.5)));

        let err = writer.write_all(&batch, &scope(&config), now()).unwrap_err();
        assert!(matches!(err, PipelineError::ContractViolation { .. }));
        assert!(repo.all_settlement_rows().unwrap().is_empty());
    }

    #[test]
    fn test_abstaining_rerun_retires_pending_cards() {
        let config = PipelineConfig::default();
        let repo = SqliteRepository::in_memory().unwrap();
        let writer = RecommendationWriter::new(&repo);
        writer.write_all(&drafts(&config), &scope(&config), now()).unwrap();

        let spread = repo
            .cards_for_subject("nba-2026-10-17-bos-nyk")
            .unwrap()
            .into_iter()
            .find(|c| c.card_key == "spread")
            .unwrap();
        let record = repo.get_settlement(&spread.card_id).unwrap().unwrap();
        repo.settle_pending(record.id, SettlementResult::Win, Some(0.91), now())
            .unwrap();

        // every market abstains now; an unrelated external card rides along
        let extra = external("total", base_payload("over", 0.5));
        let summary = writer.write_all(&[extra], &scope(&config), now()).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.changed, 3);

        let remaining: Vec<String> = repo
            .cards_for_subject("nba-2026-10-17-bos-nyk")
            .unwrap()
            .into_iter()
            .map(|c| c.card_key)
            .collect();
        assert_eq!(remaining, vec!["spread".to_string()]);
        assert_eq!(repo.cards_for_subject("nba-2026-10-17-lal-gsw").unwrap().len(), 1);
        assert_eq!(repo.all_settlement_rows().unwrap().len(), 2);
    }

    #[test]
    fn test_external_card_sport_is_normalized() {
        let card = validate(&external("total", base_payload("over", 0.5)), now()).unwrap();
        assert_eq!(card.sport, "nba");
        assert_eq!(card.card_type, CardType::Base);
        assert_eq!(card.payload_hash.len(), 64);
    }
}
