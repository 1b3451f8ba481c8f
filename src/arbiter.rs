//! Cross-Market Arbiter
//!
//! Per market: net score (sum of eligible impacts), coverage (eligible over
//! configured drivers) and conflict (how evenly the impact mass splits
//! between the two directions, 0 unanimous to 1 maximally split). These map
//! to a tier through fixed thresholds:
//!
//! - PASS if coverage < `watch_min_coverage`, |net| < `watch_min_net` or
//!   conflict > `pass_conflict`
//! - FIRE if |net| >= `fire_min_net`, coverage >= `fire_min_coverage` and
//!   conflict <= `fire_max_conflict`
//! - WATCH otherwise
//!
//! Conflict only ever appears as a disqualifier, so for fixed net and
//! coverage a higher conflict can never raise the tier.
//!
//! When several markets for one subject qualify, expression choice flags one
//! as the headline. Ordering: tier, |net|, lower conflict, higher coverage,
//! then the configured market priority.

use std::cmp::Ordering;

use tracing::debug;

use crate::config::{PipelineConfig, TierThresholds};
use crate::drivers::MarketImpacts;
use crate::models::{
    ExpressionCandidate, ExpressionChoice, MarketDecision, MarketKind, MarketSnapshot, Selection,
    Tier,
};

/// Normalized directional disagreement among contributing drivers.
pub fn conflict(impacts: &MarketImpacts) -> f64 {
    let (pos, neg) = impacts
        .contributions
        .iter()
        .filter(|c| c.eligible)
        .fold((0.0_f64, 0.0_f64), |(p, n), c| {
            if c.impact > 0.0 {
                (p + c.impact, n)
            } else {
                (p, n - c.impact)
            }
        });
    let mass = pos + neg;
    if mass > 0.0 {
        2.0 * pos.min(neg) / mass
    } else {
        0.0
    }
}

/// Decisions for one subject, plus the headline choice if any market qualified.
#[derive(Debug, Clone)]
pub struct SubjectDecisions {
    pub decisions: Vec<MarketDecision>,
    pub expression: Option<ExpressionChoice>,
}

pub struct Arbiter<'a> {
    tiers: &'a TierThresholds,
    priority: &'a [MarketKind],
}

impl<'a> Arbiter<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self {
            tiers: &config.tiers,
            priority: &config.market_priority,
        }
    }

    pub fn classify(&self, net_score: f64, coverage: f64, conflict: f64) -> Tier {
        let t = self.tiers;
        let magnitude = net_score.abs();

        if !magnitude.is_finite()
            || coverage < t.watch_min_coverage
            || magnitude < t.watch_min_net
            || conflict > t.pass_conflict
        {
            return Tier::Pass;
        }

        if magnitude >= t.fire_min_net
            && coverage >= t.fire_min_coverage
            && conflict <= t.fire_max_conflict
        {
            Tier::Fire
        } else {
            Tier::Watch
        }
    }

    /// Confidence in [0, 1]: strength relative to the FIRE bar, discounted
    /// by missing coverage and by conflict.
    pub fn confidence(&self, decision: &MarketDecision) -> f64 {
        if decision.tier == Tier::Pass {
            return 0.0;
        }
        let strength = if self.tiers.fire_min_net > 0.0 {
            (decision.net_score.abs() / self.tiers.fire_min_net).clamp(0.0, 1.0)
        } else {
            1.0
        };
        (strength * decision.coverage * (1.0 - decision.conflict)).clamp(0.0, 1.0)
    }

    pub fn decide(&self, impacts: &MarketImpacts, snapshot: &MarketSnapshot) -> MarketDecision {
        let market = impacts.market;
        let net_score = impacts.net_score();
        let coverage = impacts.coverage();
        let conflict = conflict(impacts);

        let mut tier = self.classify(net_score, coverage, conflict);
        let mut selection = Selection::Pass;
        if tier.qualifies() {
            selection = Selection::from_lean(market, net_score);
            if selection.is_abstention() {
                tier = Tier::Pass;
            }
        }

        debug!(
            market = %market,
            net = net_score,
            coverage,
            conflict,
            tier = %tier,
            selection = %selection,
            "market decided"
        );

        MarketDecision {
            market,
            net_score,
            conflict,
            coverage,
            tier,
            selection,
            line: snapshot.line_for(market, selection),
            price: snapshot.price_for(market, selection),
            drivers: impacts.contributions.clone(),
            headline: false,
        }
    }

    fn priority_rank(&self, market: MarketKind) -> usize {
        self.priority
            .iter()
            .position(|m| *m == market)
            .unwrap_or(self.priority.len() + market as usize)
    }

    /// Total order used by expression choice; `Less` means `a` wins.
    pub fn compare(&self, a: &MarketDecision, b: &MarketDecision) -> Ordering {
        b.tier
            .cmp(&a.tier)
            .then_with(|| b.net_score.abs().total_cmp(&a.net_score.abs()))
            .then_with(|| a.conflict.total_cmp(&b.conflict))
            .then_with(|| b.coverage.total_cmp(&a.coverage))
            .then_with(|| self.priority_rank(a.market).cmp(&self.priority_rank(b.market)))
    }

    /// Pick the headline among qualifying (FIRE/WATCH) decisions.
    pub fn choose_expression(&self, decisions: &[MarketDecision]) -> Option<ExpressionChoice> {
        let mut qualifying: Vec<&MarketDecision> =
            decisions.iter().filter(|d| d.tier.qualifies()).collect();
        qualifying.sort_by(|a, b| self.compare(a, b));

        let chosen = qualifying.first()?.market;
        Some(ExpressionChoice {
            chosen,
            candidates: qualifying
                .iter()
                .map(|d| ExpressionCandidate {
                    market: d.market,
                    tier: d.tier,
                    net_score: d.net_score,
                    conflict: d.conflict,
                    coverage: d.coverage,
                })
                .collect(),
        })
    }

    /// Decide every non-abstaining market and flag the headline.
    pub fn arbitrate(
        &self,
        impacts: &[MarketImpacts],
        snapshot: &MarketSnapshot,
    ) -> SubjectDecisions {
        let mut decisions: Vec<MarketDecision> = impacts
            .iter()
            .filter(|i| !i.abstains())
            .map(|i| self.decide(i, snapshot))
            .collect();

        let expression = self.choose_expression(&decisions);
        if let Some(choice) = &expression {
            for d in decisions.iter_mut() {
                d.headline = d.market == choice.chosen;
            }
        }

        SubjectDecisions {
            decisions,
            expression,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DriverContribution, DriverStatus};

    fn contribution(key: &str, impact: f64) -> DriverContribution {
        DriverContribution {
            key: key.to_string(),
            status: DriverStatus::Actionable,
            score: Some(0.5 + impact),
            weight: 1.0,
            impact,
            eligible: true,
        }
    }

    fn impacts(market: MarketKind, values: &[f64]) -> MarketImpacts {
        MarketImpacts {
            market,
            contributions: values
                .iter()
                .enumerate()
                .map(|(i, v)| contribution(&format!("d{}", i), *v))
                .collect(),
        }
    }

    fn decision(
        market: MarketKind,
        tier: Tier,
        net: f64,
        conflict: f64,
        coverage: f64,
    ) -> MarketDecision {
        MarketDecision {
            market,
            net_score: net,
            conflict,
            coverage,
            tier,
            selection: Selection::from_lean(market, net),
            line: None,
            price: None,
            drivers: Vec::new(),
            headline: false,
        }
    }

    #[test]
    fn test_conflict_measure() {
        assert_eq!(conflict(&impacts(MarketKind::Spread, &[0.2, 0.1])), 0.0);
        assert!((conflict(&impacts(MarketKind::Spread, &[0.2, -0.2])) - 1.0).abs() < 1e-12);
        assert!((conflict(&impacts(MarketKind::Spread, &[0.3, -0.1])) - 0.5).abs() < 1e-12);
        assert_eq!(conflict(&impacts(MarketKind::Spread, &[])), 0.0);
    }

    #[test]
    fn test_tier_thresholds() {
        let config = PipelineConfig::default();
        let arbiter = Arbiter::new(&config);
        assert_eq!(arbiter.classify(0.30, 1.0, 0.0), Tier::Fire);
        assert_eq!(arbiter.classify(-0.30, 1.0, 0.0), Tier::Fire);
        assert_eq!(arbiter.classify(0.10, 1.0, 0.0), Tier::Watch);
        assert_eq!(arbiter.classify(0.30, 0.5, 0.0), Tier::Watch);
        assert_eq!(arbiter.classify(0.30, 1.0, 0.4), Tier::Watch);
        assert_eq!(arbiter.classify(0.30, 1.0, 0.7), Tier::Pass);
        assert_eq!(arbiter.classify(0.01, 1.0, 0.0), Tier::Pass);
        assert_eq!(arbiter.classify(0.30, 0.2, 0.0), Tier::Pass);
        assert_eq!(arbiter.classify(f64::NAN, 1.0, 0.0), Tier::Pass);
    }

    #[test]
    fn test_higher_conflict_never_raises_tier() {
        let config = PipelineConfig::default();
        let arbiter = Arbiter::new(&config);
        let nets = [0.0, 0.04, 0.05, 0.1, 0.2, 0.5, -0.3];
        let coverages = [0.0, 0.34, 0.5, 0.6, 1.0];

        for net in nets {
            for coverage in coverages {
                let mut previous = Tier::Fire;
                for step in 0..=100 {
                    let c = step as f64 / 100.0;
                    let tier = arbiter.classify(net, coverage, c);
                    assert!(
                        tier <= previous,
                        "net={} coverage={} conflict={} rose to {}",
                        net,
                        coverage,
                        c,
                        tier
                    );
                    previous = tier;
                }
            }
        }
    }

    #[test]
    fn test_decide_reads_line_and_price_for_selected_side() {
        let config = PipelineConfig::default();
        let arbiter = Arbiter::new(&config);
        let snapshot = MarketSnapshot {
            spread_home_line: Some(-4.5),
            spread_home_price: Some(-110.0),
            spread_away_price: Some(-105.0),
            ..Default::default()
        };
        let d = arbiter.decide(&impacts(MarketKind::Spread, &[-0.2, -0.1]), &snapshot);
        assert_eq!(d.tier, Tier::Fire);
        assert_eq!(d.selection, Selection::Away);
        assert_eq!(d.line, Some(4.5));
        assert_eq!(d.price, Some(-105.0));
        assert!((arbiter.confidence(&d) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pass_decision_has_pass_selection() {
        let config = PipelineConfig::default();
        let arbiter = Arbiter::new(&config);
        let d = arbiter.decide(&impacts(MarketKind::Total, &[0.02]), &MarketSnapshot::default());
        assert_eq!(d.tier, Tier::Pass);
        assert_eq!(d.selection, Selection::Pass);
        assert_eq!(arbiter.confidence(&d), 0.0);
    }

    #[test]
    fn test_expression_choice_ordering() {
        let config = PipelineConfig::default();
        let arbiter = Arbiter::new(&config);

        // tier beats magnitude
        let decisions = vec![
            decision(MarketKind::Total, Tier::Watch, 0.9, 0.0, 1.0),
            decision(MarketKind::Spread, Tier::Fire, 0.25, 0.0, 1.0),
        ];
        assert_eq!(arbiter.choose_expression(&decisions).unwrap().chosen, MarketKind::Spread);

        // magnitude beats conflict
        let decisions = vec![
            decision(MarketKind::Spread, Tier::Fire, 0.25, 0.0, 1.0),
            decision(MarketKind::Total, Tier::Fire, -0.40, 0.2, 1.0),
        ];
        assert_eq!(arbiter.choose_expression(&decisions).unwrap().chosen, MarketKind::Total);

        // equal magnitude: lower conflict, then higher coverage
        let decisions = vec![
            decision(MarketKind::Spread, Tier::Fire, 0.3, 0.2, 1.0),
            decision(MarketKind::Total, Tier::Fire, 0.3, 0.1, 0.7),
        ];
        assert_eq!(arbiter.choose_expression(&decisions).unwrap().chosen, MarketKind::Total);
        let decisions = vec![
            decision(MarketKind::Spread, Tier::Fire, 0.3, 0.1, 0.7),
            decision(MarketKind::Total, Tier::Fire, 0.3, 0.1, 1.0),
        ];
        assert_eq!(arbiter.choose_expression(&decisions).unwrap().chosen, MarketKind::Total);

        // full tie falls back to market priority
        let decisions = vec![
            decision(MarketKind::Moneyline, Tier::Watch, 0.1, 0.0, 1.0),
            decision(MarketKind::Total, Tier::Watch, 0.1, 0.0, 1.0),
            decision(MarketKind::Spread, Tier::Watch, 0.1, 0.0, 1.0),
        ];
        let choice = arbiter.choose_expression(&decisions).unwrap();
        assert_eq!(choice.chosen, MarketKind::Spread);
        assert_eq!(choice.candidates.len(), 3);
        assert_eq!(choice.candidates[1].market, MarketKind::Total);
    }

    #[test]
    fn test_arbitrate_flags_single_headline_and_drops_abstentions() {
        let config = PipelineConfig::default();
        let arbiter = Arbiter::new(&config);
        let mut missing = impacts(MarketKind::Moneyline, &[0.0]);
        missing.contributions[0].eligible = false;

        let result = arbiter.arbitrate(
            &[
                missing,
                impacts(MarketKind::Spread, &[0.15, 0.1]),
                impacts(MarketKind::Total, &[0.1]),
            ],
            &MarketSnapshot::default(),
        );

        assert_eq!(result.decisions.len(), 2);
        let headlines: Vec<_> = result.decisions.iter().filter(|d| d.headline).collect();
        assert_eq!(headlines.len(), 1);
        assert_eq!(headlines[0].market, MarketKind::Spread);
        assert_eq!(result.expression.unwrap().chosen, MarketKind::Spread);
    }

    #[test]
    fn test_no_qualifying_market_means_no_headline() {
        let config = PipelineConfig::default();
        let arbiter = Arbiter::new(&config);
        let result = arbiter.arbitrate(
            &[impacts(MarketKind::Total, &[0.01])],
            &MarketSnapshot::default(),
        );
        assert!(result.expression.is_none());
        assert!(!result.decisions[0].headline);
    }
}
