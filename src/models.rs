//! Domain model for the recommendation pipeline
//!
//! Covers every record the pipeline reads or writes:
//! - Job runs tracked by the run ledger
//! - Driver signals and the per-market decisions built from them
//! - Recommendation cards and their tagged payload variants
//! - Settlement records, final outcomes and performance stats
//!
//! Enum variants serialize to the same strings that are stored in SQLite,
//! so `as_str` / `parse` and serde always agree.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::PipelineError;

/// Namespace for deterministic card identities.
const CARD_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_2c3e_9a47_4d0b_8e55_b1c0_7f3a_d2e4);

// =============================================================================
// JOB RUNS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of a job, keyed by an optional idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: i64,
    pub idempotency_key: Option<String>,
    pub job_name: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

// =============================================================================
// DRIVERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStatus {
    Actionable,
    Neutral,
    Missing,
}

/// A single named signal for one subject/market, produced upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSignal {
    pub key: String,
    pub score: f64,
    pub status: DriverStatus,
    /// Free-form model inputs, carried through for display only
    #[serde(default)]
    pub inputs: serde_json::Value,
}

// =============================================================================
// MARKETS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketKind {
    Moneyline,
    Spread,
    Total,
}

impl MarketKind {
    pub const ALL: [MarketKind; 3] = [Self::Moneyline, Self::Spread, Self::Total];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Moneyline => "moneyline",
            Self::Spread => "spread",
            Self::Total => "total",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "moneyline" => Some(Self::Moneyline),
            "spread" => Some(Self::Spread),
            "total" => Some(Self::Total),
            _ => None,
        }
    }

    /// Threshold markets settle against a line on the combined metric.
    pub fn is_threshold(&self) -> bool {
        matches!(self, Self::Total)
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The side a card recommends. `Pass` is the abstention value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    Home,
    Away,
    Over,
    Under,
    Pass,
}

impl Selection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Home => "home",
            Self::Away => "away",
            Self::Over => "over",
            Self::Under => "under",
            Self::Pass => "pass",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "home" => Some(Self::Home),
            "away" => Some(Self::Away),
            "over" => Some(Self::Over),
            "under" => Some(Self::Under),
            "pass" => Some(Self::Pass),
            _ => None,
        }
    }

    pub fn is_abstention(&self) -> bool {
        matches!(self, Self::Pass)
    }

    /// Whether this selection can be graded in the given market.
    pub fn valid_for(&self, market: MarketKind) -> bool {
        match self {
            Self::Pass => true,
            Self::Home | Self::Away => !market.is_threshold(),
            Self::Over | Self::Under => market.is_threshold(),
        }
    }

    /// Side implied by the sign of a net score. Positive leans home/over.
    pub fn from_lean(market: MarketKind, net_score: f64) -> Self {
        if net_score > 0.0 {
            if market.is_threshold() {
                Self::Over
            } else {
                Self::Home
            }
        } else if net_score < 0.0 {
            if market.is_threshold() {
                Self::Under
            } else {
                Self::Away
            }
        } else {
            Self::Pass
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discrete confidence bucket. Declaration order is rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Pass,
    Watch,
    Fire,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Watch => "WATCH",
            Self::Fire => "FIRE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PASS" => Some(Self::Pass),
            "WATCH" => Some(Self::Watch),
            "FIRE" => Some(Self::Fire),
            _ => None,
        }
    }

    pub fn qualifies(&self) -> bool {
        !matches!(self, Self::Pass)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market prices and lines captured when the card was generated.
///
/// Prices are American odds. The spread line is quoted for the home side;
/// the away line is its negation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub moneyline_home: Option<f64>,
    #[serde(default)]
    pub moneyline_away: Option<f64>,
    #[serde(default)]
    pub spread_home_line: Option<f64>,
    #[serde(default)]
    pub spread_home_price: Option<f64>,
    #[serde(default)]
    pub spread_away_price: Option<f64>,
    #[serde(default)]
    pub total_line: Option<f64>,
    #[serde(default)]
    pub over_price: Option<f64>,
    #[serde(default)]
    pub under_price: Option<f64>,
}

impl MarketSnapshot {
    /// Line from the selected side's perspective. Moneyline has no line.
    pub fn line_for(&self, market: MarketKind, selection: Selection) -> Option<f64> {
        match (market, selection) {
            (MarketKind::Spread, Selection::Home) => self.spread_home_line,
            (MarketKind::Spread, Selection::Away) => self.spread_home_line.map(|l| -l),
            (MarketKind::Total, Selection::Over | Selection::Under) => self.total_line,
            _ => None,
        }
        .filter(|l| l.is_finite())
    }

    pub fn price_for(&self, market: MarketKind, selection: Selection) -> Option<f64> {
        match (market, selection) {
            (MarketKind::Moneyline, Selection::Home) => self.moneyline_home,
            (MarketKind::Moneyline, Selection::Away) => self.moneyline_away,
            (MarketKind::Spread, Selection::Home) => self.spread_home_price,
            (MarketKind::Spread, Selection::Away) => self.spread_away_price,
            (MarketKind::Total, Selection::Over) => self.over_price,
            (MarketKind::Total, Selection::Under) => self.under_price,
            _ => None,
        }
    }
}

/// One driver's share of a market decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverContribution {
    pub key: String,
    pub status: DriverStatus,
    pub score: Option<f64>,
    pub weight: f64,
    pub impact: f64,
    pub eligible: bool,
}

/// Arbiter output for one subject/market. Rebuilt on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDecision {
    pub market: MarketKind,
    pub net_score: f64,
    pub conflict: f64,
    pub coverage: f64,
    pub tier: Tier,
    pub selection: Selection,
    pub line: Option<f64>,
    pub price: Option<f64>,
    pub drivers: Vec<DriverContribution>,
    /// Set on the single market promoted by expression choice
    pub headline: bool,
}

// =============================================================================
// RECOMMENDATION CARDS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    Base,
    Driver,
    Call,
}

impl CardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Driver => "driver",
            Self::Call => "call",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "base" => Some(Self::Base),
            "driver" => Some(Self::Driver),
            "call" => Some(Self::Call),
            _ => None,
        }
    }
}

/// The authoritative pick. Settlement grades against this, never the
/// display string in `CardBase::prediction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub selection: Selection,
    #[serde(default)]
    pub line: Option<f64>,
    #[serde(default)]
    pub price: Option<f64>,
}

/// Fields every card variant carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardBase {
    pub market: MarketKind,
    pub decision: Decision,
    /// Legacy display string; may disagree with `decision`
    #[serde(default)]
    pub prediction: Option<String>,
    pub confidence: f64,
    pub tier: Tier,
    pub generated_at: DateTime<Utc>,
    pub market_context: MarketSnapshot,
    #[serde(default)]
    pub reasoning: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverBreakdown {
    pub net_score: f64,
    pub conflict: f64,
    pub coverage: f64,
    pub drivers: Vec<DriverContribution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionCandidate {
    pub market: MarketKind,
    pub tier: Tier,
    pub net_score: f64,
    pub conflict: f64,
    pub coverage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionChoice {
    pub chosen: MarketKind,
    pub candidates: Vec<ExpressionCandidate>,
}

/// Card payload, tagged by `card_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "card_type", rename_all = "snake_case")]
pub enum CardPayload {
    Base {
        base: CardBase,
    },
    Driver {
        base: CardBase,
        breakdown: DriverBreakdown,
    },
    Call {
        base: CardBase,
        expression: ExpressionChoice,
    },
}

impl CardPayload {
    pub fn base(&self) -> &CardBase {
        match self {
            Self::Base { base } | Self::Driver { base, .. } | Self::Call { base, .. } => base,
        }
    }

    pub fn card_type(&self) -> CardType {
        match self {
            Self::Base { .. } => CardType::Base,
            Self::Driver { .. } => CardType::Driver,
            Self::Call { .. } => CardType::Call,
        }
    }
}

/// A card submitted for writing. The payload stays raw JSON until the
/// writer validates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardDraft {
    pub subject_id: String,
    pub sport: String,
    pub card_key: String,
    pub producer_version: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A persisted, renderable card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationCard {
    pub card_id: String,
    pub subject_id: String,
    pub sport: String,
    pub card_key: String,
    pub producer_version: String,
    pub card_type: CardType,
    pub market: MarketKind,
    pub selection: Selection,
    pub confidence: f64,
    pub tier: Tier,
    /// Stored verbatim; settlement re-parses it
    pub payload_json: String,
    pub payload_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RecommendationCard {
    /// Deterministic id for the (subject, card key, producer version) identity.
    pub fn identity_id(subject_id: &str, card_key: &str, producer_version: &str) -> String {
        let name = format!("{}\u{1f}{}\u{1f}{}", subject_id, card_key, producer_version);
        Uuid::new_v5(&CARD_NAMESPACE, name.as_bytes()).to_string()
    }
}

// =============================================================================
// SETTLEMENT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Pending,
    Settled,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Settled => "SETTLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SETTLED" => Some(Self::Settled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementResult {
    Win,
    Loss,
    Push,
}

impl SettlementResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Win => "WIN",
            Self::Loss => "LOSS",
            Self::Push => "PUSH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WIN" => Some(Self::Win),
            "LOSS" => Some(Self::Loss),
            "PUSH" => Some(Self::Push),
            _ => None,
        }
    }
}

impl fmt::Display for SettlementResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub id: i64,
    pub card_id: String,
    pub status: SettlementStatus,
    pub result: Option<SettlementResult>,
    pub pnl_units: Option<f64>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A settlement record joined with the card it grades.
#[derive(Debug, Clone)]
pub struct SettlementRow {
    pub record: SettlementRecord,
    pub card: RecommendationCard,
}

// =============================================================================
// FINAL OUTCOMES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    InProgress,
    Final,
    Cancelled,
    Postponed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Final => "FINAL",
            Self::Cancelled => "CANCELLED",
            Self::Postponed => "POSTPONED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IN_PROGRESS" => Some(Self::InProgress),
            "FINAL" => Some(Self::Final),
            "CANCELLED" => Some(Self::Cancelled),
            "POSTPONED" => Some(Self::Postponed),
            _ => None,
        }
    }
}

/// Per-subject final metrics from the results collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalOutcome {
    pub subject_id: String,
    pub home_score: f64,
    pub away_score: f64,
    pub status: OutcomeStatus,
    pub recorded_at: DateTime<Utc>,
}

// =============================================================================
// PERFORMANCE STATS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatPeriod {
    All,
    #[serde(rename = "last_30d")]
    Last30d,
    #[serde(rename = "last_7d")]
    Last7d,
}

impl StatPeriod {
    pub const ALL: [StatPeriod; 3] = [Self::All, Self::Last30d, Self::Last7d];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Last30d => "last_30d",
            Self::Last7d => "last_7d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "last_30d" => Some(Self::Last30d),
            "last_7d" => Some(Self::Last7d),
            _ => None,
        }
    }

    /// Lookback window; `None` means unbounded.
    pub fn window(&self) -> Option<Duration> {
        match self {
            Self::All => None,
            Self::Last30d => Some(Duration::days(30)),
            Self::Last7d => Some(Duration::days(7)),
        }
    }
}

/// Aggregate keyed by (sport, market key, period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStat {
    pub sport: String,
    pub market_key: String,
    pub period: StatPeriod,
    pub total: u64,
    pub settled: u64,
    pub wins: u64,
    pub losses: u64,
    pub pushes: u64,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub computed_at: DateTime<Utc>,
}

// =============================================================================
// INBOUND BATCHES
// =============================================================================

/// Market context and driver signals for one scheduled subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectContext {
    pub subject_id: String,
    pub sport: String,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub market_context: MarketSnapshot,
    #[serde(default)]
    pub drivers: BTreeMap<MarketKind, Vec<DriverSignal>>,
}

/// Input for one publish run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishBatch {
    #[serde(default)]
    pub subjects: Vec<SubjectContext>,
    /// Pre-built cards from external producers
    #[serde(default)]
    pub cards: Vec<CardDraft>,
}

// =============================================================================
// RUN SUMMARY
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectFailure {
    pub subject_id: String,
    /// Error class, e.g. `unresolvable_line`
    pub kind: String,
    pub reason: String,
}

/// Counts every run returns, whether or not some subjects failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub processed: u64,
    pub changed: u64,
    pub skipped: u64,
    pub failed: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<SubjectFailure>,
}

impl RunSummary {
    /// Count a recovered failure under its classified kind.
    pub fn record_failure(&mut self, error: &PipelineError) {
        self.failed += 1;
        let failure = match error {
            PipelineError::SubjectProcessing {
                subject_id,
                kind,
                reason,
            } => SubjectFailure {
                subject_id: subject_id.clone(),
                kind: kind.to_string(),
                reason: reason.clone(),
            },
            other => SubjectFailure {
                subject_id: String::new(),
                kind: other.kind().to_string(),
                reason: other.to_string(),
            },
        };
        self.failures.push(failure);
    }
}
