//! Stats Aggregator
//!
//! Full recomputation of performance stats from every settlement record.
//! Groups are (sport, card key) plus an `all` rollup per sport, each over
//! the `all`, `last_30d` and `last_7d` periods ending at an explicit `as_of`.
//!
//! A record's reference time is its settlement time once settled, its
//! creation time otherwise. Call cards repeat the headline market's pick,
//! so they are kept out of the `all` rollup.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::PipelineResult;
use crate::models::{
    CardType, PerformanceStat, SettlementResult, SettlementRow, SettlementStatus, StatPeriod,
};
use crate::store::Repository;

pub const ALL_MARKETS: &str = "all";

#[derive(Debug, Default, Clone)]
struct Tally {
    total: u64,
    settled: u64,
    wins: u64,
    losses: u64,
    pushes: u64,
    total_pnl: f64,
}

impl Tally {
    fn add(&mut self, row: &SettlementRow) {
        self.total += 1;
        if row.record.status != SettlementStatus::Settled {
            return;
        }
        self.settled += 1;
        match row.record.result {
            Some(SettlementResult::Win) => self.wins += 1,
            Some(SettlementResult::Loss) => self.losses += 1,
            Some(SettlementResult::Push) => self.pushes += 1,
            None => {}
        }
        if let Some(pnl) = row.record.pnl_units {
            self.total_pnl += pnl;
        }
    }

    fn into_stat(
        self,
        sport: String,
        market_key: String,
        period: StatPeriod,
        computed_at: DateTime<Utc>,
    ) -> PerformanceStat {
        let decided = self.wins + self.losses;
        let win_rate = if decided > 0 {
            self.wins as f64 / decided as f64
        } else {
            0.0
        };
        let avg_pnl = if self.settled > 0 {
            self.total_pnl / self.settled as f64
        } else {
            0.0
        };
        PerformanceStat {
            sport,
            market_key,
            period,
            total: self.total,
            settled: self.settled,
            wins: self.wins,
            losses: self.losses,
            pushes: self.pushes,
            total_pnl: self.total_pnl,
            win_rate,
            avg_pnl,
            computed_at,
        }
    }
}

fn reference_time(row: &SettlementRow) -> DateTime<Utc> {
    match row.record.status {
        SettlementStatus::Settled => row.record.settled_at.unwrap_or(row.record.created_at),
        SettlementStatus::Pending => row.record.created_at,
    }
}

fn in_period(row: &SettlementRow, period: StatPeriod, as_of: DateTime<Utc>) -> bool {
    match period.window() {
        None => true,
        Some(window) => {
            let t = reference_time(row);
            t > as_of - window && t <= as_of
        }
    }
}

/// Deterministic stats for `rows`, sorted by (sport, market key, period).
///
/// Every group seen in the history gets all three periods, with zero counts
/// when nothing falls inside a window.
pub fn compute(rows: &[SettlementRow], as_of: DateTime<Utc>) -> Vec<PerformanceStat> {
    let mut tallies: BTreeMap<(String, String, StatPeriod), Tally> = BTreeMap::new();

    for row in rows {
        let sport = row.card.sport.clone();
        let mut keys = vec![row.card.card_key.clone()];
        if row.card.card_type != CardType::Call {
            keys.push(ALL_MARKETS.to_string());
        }

        for key in keys {
            for period in StatPeriod::ALL {
                let tally = tallies
                    .entry((sport.clone(), key.clone(), period))
                    .or_default();
                if in_period(row, period, as_of) {
                    tally.add(row);
                }
            }
        }
    }

    tallies
        .into_iter()
        .map(|((sport, key, period), tally)| tally.into_stat(sport, key, period, as_of))
        .collect()
}

pub struct StatsAggregator<'a> {
    repo: &'a dyn Repository,
}

impl<'a> StatsAggregator<'a> {
    pub fn new(repo: &'a dyn Repository) -> Self {
        Self { repo }
    }

    /// Recompute from the full history and overwrite every key.
    pub fn recompute(&self, as_of: DateTime<Utc>) -> PipelineResult<Vec<PerformanceStat>> {
        let rows = self.repo.all_settlement_rows()?;
        let stats = compute(&rows, as_of);
        self.repo.replace_performance_stats(&stats)?;

        info!(
            records = rows.len(),
            groups = stats.len(),
            as_of = %as_of,
            "📈 Performance stats recomputed"
        );
        Ok(stats)
    }
}
