//! Driver Aggregator
//!
//! Turns the raw driver signals for one subject into weighted impacts per
//! market. Only drivers listed in the configured weight table count:
//! `impact = (score - neutral) * weight` for ACTIONABLE signals, zero for
//! NEUTRAL or MISSING ones. A configured driver absent from the input is
//! recorded as MISSING so coverage reflects it.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::{DriverWeight, PipelineConfig};
use crate::models::{DriverContribution, DriverSignal, DriverStatus, MarketKind, SubjectContext};

/// Per-driver impacts for one subject/market, ready for the arbiter.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketImpacts {
    pub market: MarketKind,
    pub contributions: Vec<DriverContribution>,
}

impl MarketImpacts {
    pub fn configured(&self) -> usize {
        self.contributions.len()
    }

    pub fn eligible(&self) -> usize {
        self.contributions.iter().filter(|c| c.eligible).count()
    }

    pub fn net_score(&self) -> f64 {
        self.contributions
            .iter()
            .filter(|c| c.eligible)
            .map(|c| c.impact)
            .sum()
    }

    /// Fraction of configured drivers that contributed.
    pub fn coverage(&self) -> f64 {
        match self.configured() {
            0 => 0.0,
            n => self.eligible() as f64 / n as f64,
        }
    }

    /// No eligible driver: the market produces no card at all.
    pub fn abstains(&self) -> bool {
        self.eligible() == 0
    }
}

/// Score one market's signals against its configured weights.
pub fn aggregate_market(
    market: MarketKind,
    signals: &[DriverSignal],
    weights: &[DriverWeight],
) -> MarketImpacts {
    let mut by_key: HashMap<&str, &DriverSignal> = HashMap::with_capacity(signals.len());
    for signal in signals {
        if by_key.insert(signal.key.as_str(), signal).is_some() {
            debug!(market = %market, driver = %signal.key, "duplicate driver signal, keeping last");
        }
    }

    let contributions = weights
        .iter()
        .map(|w| {
            let Some(signal) = by_key.remove(w.driver.as_str()) else {
                return DriverContribution {
                    key: w.driver.clone(),
                    status: DriverStatus::Missing,
                    score: None,
                    weight: w.weight,
                    impact: 0.0,
                    eligible: false,
                };
            };

            let eligible = signal.status == DriverStatus::Actionable && signal.score.is_finite();
            if signal.status == DriverStatus::Actionable && !eligible {
                warn!(market = %market, driver = %signal.key, "non-finite driver score ignored");
            }

            DriverContribution {
                key: w.driver.clone(),
                status: signal.status,
                score: signal.score.is_finite().then_some(signal.score),
                weight: w.weight,
                impact: if eligible {
                    (signal.score - w.neutral) * w.weight
                } else {
                    0.0
                },
                eligible,
            }
        })
        .collect();

    for key in by_key.keys() {
        debug!(market = %market, driver = *key, "driver not in weight table, ignored");
    }

    MarketImpacts {
        market,
        contributions,
    }
}

/// Applies the weight table to whole subjects.
pub struct DriverAggregator<'a> {
    config: &'a PipelineConfig,
}

impl<'a> DriverAggregator<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Impacts for every market with configured drivers for the subject's
    /// sport, in `MarketKind` order. Abstaining markets are included; the
    /// caller decides what to do with them.
    pub fn aggregate(&self, subject: &SubjectContext) -> Vec<MarketImpacts> {
        MarketKind::ALL
            .iter()
            .filter_map(|&market| {
                let weights = self.config.drivers_for(&subject.sport, market);
                if weights.is_empty() {
                    return None;
                }
                let signals = subject
                    .drivers
                    .get(&market)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                Some(aggregate_market(market, signals, weights))
            })
            .collect()
    }
}
