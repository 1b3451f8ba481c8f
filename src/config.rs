//! Pipeline configuration
//!
//! Tier thresholds, expression priority, ledger recovery policy and the
//! static driver weight table. Loaded from TOML; every section has defaults
//! so a missing file still yields a working pipeline.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::models::MarketKind;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Version stamped on every card this pipeline produces
    #[serde(default = "default_producer_version")]
    pub producer_version: String,

    #[serde(default)]
    pub tiers: TierThresholds,

    /// Fixed market order used as the last expression-choice tie-break
    #[serde(default = "default_market_priority")]
    pub market_priority: Vec<MarketKind>,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub resettle: ResettleConfig,

    /// sport -> market name -> configured drivers
    #[serde(default = "default_weights")]
    pub weights: BTreeMap<String, BTreeMap<String, Vec<DriverWeight>>>,
}

fn default_database_path() -> String {
    "./betterpicks.db".to_string()
}

fn default_producer_version() -> String {
    "drivers-v1".to_string()
}

fn default_market_priority() -> Vec<MarketKind> {
    vec![MarketKind::Spread, MarketKind::Total, MarketKind::Moneyline]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            producer_version: default_producer_version(),
            tiers: TierThresholds::default(),
            market_priority: default_market_priority(),
            ledger: LedgerConfig::default(),
            resettle: ResettleConfig::default(),
            weights: default_weights(),
        }
    }
}

impl PipelineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `BETTERPICKS_CONFIG` (default `betterpicks.toml`), falling
    /// back to defaults when the file is absent. `DATABASE_PATH` overrides
    /// the configured database.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let path = std::env::var("BETTERPICKS_CONFIG")
            .unwrap_or_else(|_| "betterpicks.toml".to_string());

        let mut config = if Path::new(&path).exists() {
            Self::load(&path)?
        } else {
            tracing::debug!("Using default pipeline config ({} not found)", path);
            Self::default()
        };

        if let Ok(db) = std::env::var("DATABASE_PATH") {
            config.database_path = db;
        }
        Ok(config)
    }

    /// Reject settings that would break tier monotonicity or leave the
    /// weight table unusable.
    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.tiers;
        for (name, v) in [
            ("fire_max_conflict", t.fire_max_conflict),
            ("pass_conflict", t.pass_conflict),
            ("fire_min_coverage", t.fire_min_coverage),
            ("watch_min_coverage", t.watch_min_coverage),
        ] {
            if !(0.0..=1.0).contains(&v) {
                bail!("tiers.{} must be within [0, 1], got {}", name, v);
            }
        }
        if t.fire_max_conflict > t.pass_conflict {
            bail!(
                "tiers.fire_max_conflict ({}) exceeds tiers.pass_conflict ({})",
                t.fire_max_conflict,
                t.pass_conflict
            );
        }
        if t.fire_min_net < t.watch_min_net {
            bail!("tiers.fire_min_net must be >= tiers.watch_min_net");
        }
        if t.fire_min_coverage < t.watch_min_coverage {
            bail!("tiers.fire_min_coverage must be >= tiers.watch_min_coverage");
        }
        if self.market_priority.is_empty() {
            bail!("market_priority must list at least one market");
        }
        if self.ledger.stale_after_secs < MIN_STALE_AFTER_SECS {
            bail!(
                "ledger.stale_after_secs must be at least {}, got {}",
                MIN_STALE_AFTER_SECS,
                self.ledger.stale_after_secs
            );
        }
        if !(self.resettle.pnl_tolerance >= 0.0) {
            bail!("resettle.pnl_tolerance must be non-negative");
        }
        for (sport, markets) in &self.weights {
            for (market, drivers) in markets {
                if MarketKind::parse(market).is_none() {
                    bail!("weights.{}: unknown market '{}'", sport, market);
                }
                for d in drivers {
                    if !d.weight.is_finite() || d.weight <= 0.0 {
                        bail!("weights.{}.{}.{}: weight must be positive", sport, market, d.driver);
                    }
                }
            }
        }
        Ok(())
    }

    /// Configured drivers for a sport/market, empty when unconfigured.
    pub fn drivers_for(&self, sport: &str, market: MarketKind) -> &[DriverWeight] {
        self.weights
            .get(&sport.to_ascii_lowercase())
            .and_then(|m| m.get(market.as_str()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Thresholds mapping (|net|, coverage, conflict) to a tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierThresholds {
    #[serde(default = "default_fire_min_net")]
    pub fire_min_net: f64,
    #[serde(default = "default_fire_min_coverage")]
    pub fire_min_coverage: f64,
    #[serde(default = "default_fire_max_conflict")]
    pub fire_max_conflict: f64,
    #[serde(default = "default_watch_min_net")]
    pub watch_min_net: f64,
    #[serde(default = "default_watch_min_coverage")]
    pub watch_min_coverage: f64,
    /// Conflict above this disqualifies the market outright
    #[serde(default = "default_pass_conflict")]
    pub pass_conflict: f64,
}

fn default_fire_min_net() -> f64 {
    0.20
}
fn default_fire_min_coverage() -> f64 {
    0.60
}
fn default_fire_max_conflict() -> f64 {
    0.25
}
fn default_watch_min_net() -> f64 {
    0.05
}
fn default_watch_min_coverage() -> f64 {
    0.34
}
fn default_pass_conflict() -> f64 {
    0.60
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            fire_min_net: default_fire_min_net(),
            fire_min_coverage: default_fire_min_coverage(),
            fire_max_conflict: default_fire_max_conflict(),
            watch_min_net: default_watch_min_net(),
            watch_min_coverage: default_watch_min_coverage(),
            pass_conflict: default_pass_conflict(),
        }
    }
}

/// Shorter windows would let a live run be recovered as abandoned
pub const MIN_STALE_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// A RUNNING record older than this is treated as abandoned
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_stale_after_secs() -> u64 {
    6 * 60 * 60
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResettleConfig {
    /// PnL differences at or below this are float noise, not corrections
    #[serde(default = "default_pnl_tolerance")]
    pub pnl_tolerance: f64,
}

fn default_pnl_tolerance() -> f64 {
    1e-6
}

impl Default for ResettleConfig {
    fn default() -> Self {
        Self {
            pnl_tolerance: default_pnl_tolerance(),
        }
    }
}

/// One configured driver for a sport/market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverWeight {
    pub driver: String,
    pub weight: f64,
    /// "No opinion" value of the driver's score scale
    #[serde(default = "default_neutral")]
    pub neutral: f64,
}

fn default_neutral() -> f64 {
    0.5
}

impl DriverWeight {
    pub fn new(driver: &str, weight: f64) -> Self {
        Self {
            driver: driver.to_string(),
            weight,
            neutral: default_neutral(),
        }
    }

    pub fn signed(driver: &str, weight: f64) -> Self {
        Self {
            driver: driver.to_string(),
            weight,
            neutral: 0.0,
        }
    }
}

/// Built-in weight table for the sports the producers currently cover.
pub fn default_weights() -> BTreeMap<String, BTreeMap<String, Vec<DriverWeight>>> {
    let mut nba = BTreeMap::new();
    nba.insert(
        MarketKind::Moneyline.as_str().to_string(),
        vec![
            DriverWeight::new("power_rating", 1.0),
            DriverWeight::new("rest_advantage", 0.5),
            DriverWeight::new("injury_impact", 0.8),
        ],
    );
    nba.insert(
        MarketKind::Spread.as_str().to_string(),
        vec![
            DriverWeight::new("power_rating", 1.0),
            DriverWeight::new("rest_advantage", 0.6),
            DriverWeight::new("injury_impact", 0.8),
            DriverWeight::signed("line_movement", 0.4),
        ],
    );
    nba.insert(
        MarketKind::Total.as_str().to_string(),
        vec![
            DriverWeight::new("pace_projection", 1.0),
            DriverWeight::new("defensive_rating", 0.7),
            DriverWeight::new("referee_tendency", 0.3),
        ],
    );

    let mut nhl = BTreeMap::new();
    nhl.insert(
        MarketKind::Moneyline.as_str().to_string(),
        vec![
            DriverWeight::new("goalie_matchup", 1.0),
            DriverWeight::new("power_rating", 0.8),
            DriverWeight::new("rest_advantage", 0.4),
        ],
    );
    nhl.insert(
        MarketKind::Spread.as_str().to_string(),
        vec![
            DriverWeight::new("goalie_matchup", 0.9),
            DriverWeight::new("power_rating", 0.8),
        ],
    );
    nhl.insert(
        MarketKind::Total.as_str().to_string(),
        vec![
            DriverWeight::new("shot_volume", 1.0),
            DriverWeight::new("goalie_matchup", 0.6),
        ],
    );

    let mut weights = BTreeMap::new();
    weights.insert("nba".to_string(), nba);
    weights.insert("nhl".to_string(), nhl);
    weights
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.market_priority[0], MarketKind::Spread);
        assert_eq!(config.drivers_for("NBA", MarketKind::Total).len(), 3);
        assert!(config.drivers_for("mlb", MarketKind::Total).is_empty());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = PipelineConfig::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: PipelineConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.producer_version, config.producer_version);
        assert_eq!(parsed.weights, config.weights);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: PipelineConfig = toml::from_str(
            r#"
            producer_version = "drivers-v2"

            [tiers]
            fire_min_net = 0.3
            "#,
        )
        .unwrap();
        assert_eq!(parsed.producer_version, "drivers-v2");
        assert_eq!(parsed.tiers.fire_min_net, 0.3);
        assert_eq!(parsed.tiers.pass_conflict, 0.60);
        assert_eq!(parsed.ledger.stale_after_secs, 21600);
        assert!(parsed.weights.contains_key("nba"));
    }

    #[test]
    fn test_validate_rejects_non_monotonic_conflict() {
        let mut config = PipelineConfig::default();
        config.tiers.fire_max_conflict = 0.7;
        config.tiers.pass_conflict = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_staleness() {
        let mut config = PipelineConfig::default();
        config.ledger.stale_after_secs = 0;
        assert!(config.validate().is_err());

        config.ledger.stale_after_secs = MIN_STALE_AFTER_SECS;
        assert!(config.validate().is_ok());
    }
}
