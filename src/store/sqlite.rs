//! SQLite-backed repository
//!
//! One connection behind a `parking_lot::Mutex`, WAL journal, schema created
//! on open. Timestamps are stored as UTC epoch milliseconds; enums as the
//! strings their `as_str` produces.
//!
//! Card replacement is a true upsert keyed by the deterministic card id,
//! with the PENDING settlement row created in the same transaction, so a
//! card is never briefly missing or duplicated.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{
    params, types::Type, Connection, ErrorCode, OpenFlags, OptionalExtension, Row,
    Transaction, TransactionBehavior,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    BeginOutcome, GateVerdict, ReplaceOutcome, Repository, SubjectReplace, ABANDONED_MESSAGE,
};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    CardType, FinalOutcome, JobRun, JobStatus, MarketKind, OutcomeStatus, PerformanceStat,
    RecommendationCard, Selection, SettlementRecord, SettlementResult, SettlementRow,
    SettlementStatus, StatPeriod, Tier,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS job_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    idempotency_key TEXT,
    job_name TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_job_runs_key
    ON job_runs(idempotency_key, id DESC);

-- At most one RUNNING record per non-null key, across processes
CREATE UNIQUE INDEX IF NOT EXISTS idx_job_runs_one_running
    ON job_runs(idempotency_key)
    WHERE status = 'RUNNING' AND idempotency_key IS NOT NULL;

CREATE TABLE IF NOT EXISTS recommendation_cards (
    card_id TEXT PRIMARY KEY,
    subject_id TEXT NOT NULL,
    sport TEXT NOT NULL,
    card_key TEXT NOT NULL,
    producer_version TEXT NOT NULL,
    card_type TEXT NOT NULL,
    market TEXT NOT NULL,
    selection TEXT NOT NULL,
    confidence REAL NOT NULL,
    tier TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    UNIQUE (subject_id, card_key, producer_version)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_cards_subject
    ON recommendation_cards(subject_id, card_key);

CREATE TABLE IF NOT EXISTS settlement_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    card_id TEXT NOT NULL UNIQUE REFERENCES recommendation_cards(card_id),
    status TEXT NOT NULL,
    result TEXT,
    pnl_units REAL,
    settled_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_settlement_status
    ON settlement_records(status, id);

CREATE TABLE IF NOT EXISTS final_outcomes (
    subject_id TEXT PRIMARY KEY,
    home_score REAL NOT NULL,
    away_score REAL NOT NULL,
    status TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS performance_stats (
    sport TEXT NOT NULL,
    market_key TEXT NOT NULL,
    period TEXT NOT NULL,
    total INTEGER NOT NULL,
    settled INTEGER NOT NULL,
    wins INTEGER NOT NULL,
    losses INTEGER NOT NULL,
    pushes INTEGER NOT NULL,
    total_pnl REAL NOT NULL,
    win_rate REAL NOT NULL,
    avg_pnl REAL NOT NULL,
    computed_at INTEGER NOT NULL,
    PRIMARY KEY (sport, market_key, period)
) WITHOUT ROWID;
"#;

const CARD_COLS: &str = "c.card_id, c.subject_id, c.sport, c.card_key, c.producer_version, \
     c.card_type, c.market, c.selection, c.confidence, c.tier, c.payload_json, c.payload_hash, \
     c.created_at, c.expires_at";
const CARD_COL_COUNT: usize = 14;

const SETTLE_COLS: &str =
    "s.id, s.card_id, s.status, s.result, s.pnl_units, s.settled_at, s.created_at";
const SETTLE_COL_COUNT: usize = 7;

const OUTCOME_COLS: &str = "o.subject_id, o.home_score, o.away_score, o.status, o.recorded_at";

const JOB_COLS: &str = "id, idempotency_key, job_name, status, started_at, ended_at, error";

/// SQLite repository
#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| PipelineError::Persistence(format!("open {}: {}", path.display(), e)))?;
        let repo = Self::with_connection(conn)?;
        info!("📊 Pick database initialized at: {}", path.display());
        Ok(repo)
    }

    /// In-memory database for tests and dry runs.
    pub fn in_memory() -> PipelineResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> PipelineResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            debug!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn query_rows(&self, sql: &str, key: Option<&str>) -> PipelineResult<Vec<SettlementRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = match key {
            Some(k) => stmt.query_map([k], row_to_settlement_row)?,
            None => stmt.query_map([], row_to_settlement_row)?,
        };
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

// =============================================================================
// ROW MAPPING
// =============================================================================

fn ts(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg)),
    )
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| conversion_err(idx, format!("invalid timestamp {}", ms)))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => ts_at(row, idx).map(Some),
        None => Ok(None),
    }
}

fn enum_at<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_err(idx, format!("unknown value '{}'", raw)))
}

fn row_to_card(row: &Row<'_>, o: usize) -> rusqlite::Result<RecommendationCard> {
    Ok(RecommendationCard {
        card_id: row.get(o)?,
        subject_id: row.get(o + 1)?,
        sport: row.get(o + 2)?,
        card_key: row.get(o + 3)?,
        producer_version: row.get(o + 4)?,
        card_type: enum_at(row, o + 5, CardType::parse)?,
        market: enum_at(row, o + 6, MarketKind::parse)?,
        selection: enum_at(row, o + 7, Selection::parse)?,
        confidence: row.get(o + 8)?,
        tier: enum_at(row, o + 9, Tier::parse)?,
        payload_json: row.get(o + 10)?,
        payload_hash: row.get(o + 11)?,
        created_at: ts_at(row, o + 12)?,
        expires_at: opt_ts_at(row, o + 13)?,
    })
}

fn row_to_settlement(row: &Row<'_>, o: usize) -> rusqlite::Result<SettlementRecord> {
    let result = match row.get::<_, Option<String>>(o + 3)? {
        Some(raw) => Some(
            SettlementResult::parse(&raw)
                .ok_or_else(|| conversion_err(o + 3, format!("unknown result '{}'", raw)))?,
        ),
        None => None,
    };
    Ok(SettlementRecord {
        id: row.get(o)?,
        card_id: row.get(o + 1)?,
        status: enum_at(row, o + 2, SettlementStatus::parse)?,
        result,
        pnl_units: row.get(o + 4)?,
        settled_at: opt_ts_at(row, o + 5)?,
        created_at: ts_at(row, o + 6)?,
    })
}

fn row_to_outcome(row: &Row<'_>, o: usize) -> rusqlite::Result<FinalOutcome> {
    Ok(FinalOutcome {
        subject_id: row.get(o)?,
        home_score: row.get(o + 1)?,
        away_score: row.get(o + 2)?,
        status: enum_at(row, o + 3, OutcomeStatus::parse)?,
        recorded_at: ts_at(row, o + 4)?,
    })
}

fn row_to_settlement_row(row: &Row<'_>) -> rusqlite::Result<SettlementRow> {
    Ok(SettlementRow {
        card: row_to_card(row, 0)?,
        record: row_to_settlement(row, CARD_COL_COUNT)?,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    Ok(JobRun {
        id: row.get(0)?,
        idempotency_key: row.get(1)?,
        job_name: row.get(2)?,
        status: enum_at(row, 3, JobStatus::parse)?,
        started_at: ts_at(row, 4)?,
        ended_at: opt_ts_at(row, 5)?,
        error: row.get(6)?,
    })
}

fn row_to_stat(row: &Row<'_>) -> rusqlite::Result<PerformanceStat> {
    Ok(PerformanceStat {
        sport: row.get(0)?,
        market_key: row.get(1)?,
        period: enum_at(row, 2, StatPeriod::parse)?,
        total: row.get::<_, i64>(3)? as u64,
        settled: row.get::<_, i64>(4)? as u64,
        wins: row.get::<_, i64>(5)? as u64,
        losses: row.get::<_, i64>(6)? as u64,
        pushes: row.get::<_, i64>(7)? as u64,
        total_pnl: row.get(8)?,
        win_rate: row.get(9)?,
        avg_pnl: row.get(10)?,
        computed_at: ts_at(row, 11)?,
    })
}

/// Upsert one card and insert its PENDING record if absent. A card whose
/// record is SETTLED is left alone.
fn replace_in_tx(
    tx: &Transaction<'_>,
    card: &RecommendationCard,
) -> PipelineResult<ReplaceOutcome> {
    let existing: Option<(String, Option<String>)> = tx
        .query_row(
            "SELECT c.payload_hash, s.status
             FROM recommendation_cards c
             LEFT JOIN settlement_records s ON s.card_id = c.card_id
             WHERE c.card_id = ?1",
            [&card.card_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let outcome = match &existing {
        Some((_, Some(status))) if status == SettlementStatus::Settled.as_str() => {
            return Ok(ReplaceOutcome::SettledLocked);
        }
        Some((hash, _)) if hash == &card.payload_hash => ReplaceOutcome::Unchanged,
        Some(_) => ReplaceOutcome::Updated,
        None => ReplaceOutcome::Inserted,
    };

    if outcome.is_write() {
        tx.execute(
            "INSERT INTO recommendation_cards
             (card_id, subject_id, sport, card_key, producer_version, card_type, market,
              selection, confidence, tier, payload_json, payload_hash, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(card_id) DO UPDATE SET
                sport = excluded.sport,
                card_type = excluded.card_type,
                market = excluded.market,
                selection = excluded.selection,
                confidence = excluded.confidence,
                tier = excluded.tier,
                payload_json = excluded.payload_json,
                payload_hash = excluded.payload_hash,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at",
            params![
                &card.card_id,
                &card.subject_id,
                &card.sport,
                &card.card_key,
                &card.producer_version,
                card.card_type.as_str(),
                card.market.as_str(),
                card.selection.as_str(),
                card.confidence,
                card.tier.as_str(),
                &card.payload_json,
                &card.payload_hash,
                ts(&card.created_at),
                card.expires_at.as_ref().map(ts),
            ],
        )?;
    }

    // Backfills the PENDING record if an earlier run lost it
    tx.execute(
        "INSERT INTO settlement_records (card_id, status, created_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(card_id) DO NOTHING",
        params![
            &card.card_id,
            SettlementStatus::Pending.as_str(),
            ts(&card.created_at)
        ],
    )?;

    Ok(outcome)
}

// =============================================================================
// REPOSITORY
// =============================================================================

impl Repository for SqliteRepository {
    fn latest_job_run(&self, key: &str) -> PipelineResult<Option<JobRun>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM job_runs WHERE idempotency_key = ?1 ORDER BY id DESC LIMIT 1",
            JOB_COLS
        ))?;
        Ok(stmt.query_row([key], row_to_job).optional()?)
    }

    fn begin_job_run(
        &self,
        key: Option<&str>,
        job_name: &str,
        started_at: DateTime<Utc>,
        gate: &dyn Fn(&JobRun) -> GateVerdict,
    ) -> PipelineResult<BeginOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut recovered = None;
        if let Some(k) = key {
            let latest = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM job_runs WHERE idempotency_key = ?1
                         ORDER BY id DESC LIMIT 1",
                        JOB_COLS
                    ),
                    [k],
                    row_to_job,
                )
                .optional()?;

            if let Some(latest) = latest {
                match gate(&latest) {
                    GateVerdict::Proceed => {}
                    GateVerdict::Blocked(status) => return Ok(BeginOutcome::Blocked(status)),
                    GateVerdict::Abandoned => {
                        tx.execute(
                            "UPDATE job_runs SET status = ?1, ended_at = ?2, error = ?3
                             WHERE id = ?4",
                            params![
                                JobStatus::Failed.as_str(),
                                ts(&started_at),
                                ABANDONED_MESSAGE,
                                latest.id
                            ],
                        )?;
                        recovered = Some(latest.id);
                    }
                }
            }
        }

        let inserted = tx.execute(
            "INSERT INTO job_runs (idempotency_key, job_name, status, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, job_name, JobStatus::Running.as_str(), ts(&started_at)],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                warn!(key = ?key, job = job_name, "run already in progress for key");
                return Err(PipelineError::IdempotencyConflict {
                    key: key.unwrap_or_default().to_string(),
                    status: JobStatus::Running,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let run = JobRun {
            id: tx.last_insert_rowid(),
            idempotency_key: key.map(str::to_string),
            job_name: job_name.to_string(),
            status: JobStatus::Running,
            started_at,
            ended_at: None,
            error: None,
        };
        tx.commit()?;
        Ok(BeginOutcome::Started { run, recovered })
    }

    fn finish_job_run(
        &self,
        id: i64,
        status: JobStatus,
        ended_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> PipelineResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE job_runs SET status = ?1, ended_at = ?2, error = ?3 WHERE id = ?4",
            params![status.as_str(), ts(&ended_at), error, id],
        )?;
        if changed == 0 {
            return Err(PipelineError::Persistence(format!("job run {} not found", id)));
        }
        Ok(())
    }

    fn list_job_runs(&self, key: Option<&str>, limit: usize) -> PipelineResult<Vec<JobRun>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock();
        let runs = match key {
            Some(k) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM job_runs WHERE idempotency_key = ?1 ORDER BY id DESC LIMIT ?2",
                    JOB_COLS
                ))?;
                let rows = stmt.query_map(params![k, limit], row_to_job)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM job_runs ORDER BY id DESC LIMIT ?1",
                    JOB_COLS
                ))?;
                let rows = stmt.query_map([limit], row_to_job)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(runs)
    }

    fn replace_card(&self, card: &RecommendationCard) -> PipelineResult<ReplaceOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = replace_in_tx(&tx, card)?;
        tx.commit()?;
        Ok(outcome)
    }

    fn replace_subject_cards(
        &self,
        subject_id: &str,
        producer_version: &str,
        cards: &[RecommendationCard],
    ) -> PipelineResult<SubjectReplace> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut outcomes = Vec::with_capacity(cards.len());
        for card in cards {
            outcomes.push(replace_in_tx(&tx, card)?);
        }

        let stale: Vec<(String, String)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT c.card_id, c.card_key
                 FROM recommendation_cards c
                 LEFT JOIN settlement_records s ON s.card_id = c.card_id
                 WHERE c.subject_id = ?1 AND c.producer_version = ?2
                   AND (s.status IS NULL OR s.status = ?3)
                 ORDER BY c.card_key",
            )?;
            let rows = stmt.query_map(
                params![subject_id, producer_version, SettlementStatus::Pending.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut retired = Vec::new();
        for (card_id, card_key) in stale {
            if cards.iter().any(|c| c.card_key == card_key) {
                continue;
            }
            tx.execute("DELETE FROM settlement_records WHERE card_id = ?1", [&card_id])?;
            tx.execute("DELETE FROM recommendation_cards WHERE card_id = ?1", [&card_id])?;
            retired.push(card_key);
        }

        tx.commit()?;
        if !retired.is_empty() {
            debug!(subject = subject_id, retired = ?retired, "🗑️ Retired superseded cards");
        }
        Ok(SubjectReplace { outcomes, retired })
    }

    fn cards_for_subject(&self, subject_id: &str) -> PipelineResult<Vec<RecommendationCard>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM recommendation_cards c WHERE c.subject_id = ?1
             ORDER BY c.card_key, c.producer_version",
            CARD_COLS
        ))?;
        let rows = stmt.query_map([subject_id], |row| row_to_card(row, 0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn get_settlement(&self, card_id: &str) -> PipelineResult<Option<SettlementRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM settlement_records s WHERE s.card_id = ?1",
            SETTLE_COLS
        ))?;
        Ok(stmt
            .query_row([card_id], |row| row_to_settlement(row, 0))
            .optional()?)
    }

    fn pending_with_final_outcome(&self) -> PipelineResult<Vec<(SettlementRow, FinalOutcome)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {}, {}, {}
             FROM settlement_records s
             JOIN recommendation_cards c ON c.card_id = s.card_id
             JOIN final_outcomes o ON o.subject_id = c.subject_id
             WHERE s.status = ?1 AND o.status = ?2
             ORDER BY c.subject_id, c.card_key, s.id",
            CARD_COLS, SETTLE_COLS, OUTCOME_COLS
        ))?;
        let rows = stmt.query_map(
            params![
                SettlementStatus::Pending.as_str(),
                OutcomeStatus::Final.as_str()
            ],
            |row| {
                Ok((
                    row_to_settlement_row(row)?,
                    row_to_outcome(row, CARD_COL_COUNT + SETTLE_COL_COUNT)?,
                ))
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn settled_rows(&self) -> PipelineResult<Vec<SettlementRow>> {
        self.query_rows(
            &format!(
                "SELECT {}, {}
                 FROM settlement_records s
                 JOIN recommendation_cards c ON c.card_id = s.card_id
                 WHERE s.status = ?1
                 ORDER BY s.id",
                CARD_COLS, SETTLE_COLS
            ),
            Some(SettlementStatus::Settled.as_str()),
        )
    }

    fn all_settlement_rows(&self) -> PipelineResult<Vec<SettlementRow>> {
        self.query_rows(
            &format!(
                "SELECT {}, {}
                 FROM settlement_records s
                 JOIN recommendation_cards c ON c.card_id = s.card_id
                 ORDER BY s.id",
                CARD_COLS, SETTLE_COLS
            ),
            None,
        )
    }

    fn settle_pending(
        &self,
        settlement_id: i64,
        result: SettlementResult,
        pnl_units: Option<f64>,
        settled_at: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE settlement_records
             SET status = ?1, result = ?2, pnl_units = ?3, settled_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                SettlementStatus::Settled.as_str(),
                result.as_str(),
                pnl_units,
                ts(&settled_at),
                settlement_id,
                SettlementStatus::Pending.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn correct_settlement(
        &self,
        settlement_id: i64,
        result: SettlementResult,
        pnl_units: Option<f64>,
    ) -> PipelineResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE settlement_records
             SET result = ?1, pnl_units = ?2
             WHERE id = ?3 AND status = ?4",
            params![
                result.as_str(),
                pnl_units,
                settlement_id,
                SettlementStatus::Settled.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn upsert_outcome(&self, outcome: &FinalOutcome) -> PipelineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO final_outcomes (subject_id, home_score, away_score, status, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(subject_id) DO UPDATE SET
                home_score = excluded.home_score,
                away_score = excluded.away_score,
                status = excluded.status,
                recorded_at = excluded.recorded_at",
            params![
                &outcome.subject_id,
                outcome.home_score,
                outcome.away_score,
                outcome.status.as_str(),
                ts(&outcome.recorded_at),
            ],
        )?;
        Ok(())
    }

    fn get_outcome(&self, subject_id: &str) -> PipelineResult<Option<FinalOutcome>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM final_outcomes o WHERE o.subject_id = ?1",
            OUTCOME_COLS
        ))?;
        Ok(stmt
            .query_row([subject_id], |row| row_to_outcome(row, 0))
            .optional()?)
    }

    fn replace_performance_stats(&self, stats: &[PerformanceStat]) -> PipelineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO performance_stats
                 (sport, market_key, period, total, settled, wins, losses, pushes,
                  total_pnl, win_rate, avg_pnl, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(sport, market_key, period) DO UPDATE SET
                    total = excluded.total,
                    settled = excluded.settled,
                    wins = excluded.wins,
                    losses = excluded.losses,
                    pushes = excluded.pushes,
                    total_pnl = excluded.total_pnl,
                    win_rate = excluded.win_rate,
                    avg_pnl = excluded.avg_pnl,
                    computed_at = excluded.computed_at",
            )?;
            for s in stats {
                stmt.execute(params![
                    &s.sport,
                    &s.market_key,
                    s.period.as_str(),
                    s.total as i64,
                    s.settled as i64,
                    s.wins as i64,
                    s.losses as i64,
                    s.pushes as i64,
                    s.total_pnl,
                    s.win_rate,
                    s.avg_pnl,
                    ts(&s.computed_at),
                ])?;
            }
        }
        tx.commit()?;
        debug!("📦 Wrote {} performance stats", stats.len());
        Ok(())
    }

    fn list_performance_stats(&self) -> PipelineResult<Vec<PerformanceStat>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT sport, market_key, period, total, settled, wins, losses, pushes,
                    total_pnl, win_rate, avg_pnl, computed_at
             FROM performance_stats
             ORDER BY sport, market_key, period",
        )?;
        let rows = stmt.query_map([], row_to_stat)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn card(subject: &str, key: &str, hash: &str) -> RecommendationCard {
        RecommendationCard {
            card_id: RecommendationCard::identity_id(subject, key, "drivers-v1"),
            subject_id: subject.to_string(),
            sport: "nba".to_string(),
            card_key: key.to_string(),
            producer_version: "drivers-v1".to_string(),
            card_type: CardType::Driver,
            market: MarketKind::Spread,
            selection: Selection::Home,
            confidence: 0.7,
            tier: Tier::Fire,
            payload_json: "{}".to_string(),
            payload_hash: hash.to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 10, 17, 18, 0, 0).unwrap(),
            expires_at: None,
        }
    }

    #[test]
    fn test_replace_card_is_idempotent_upsert() {
        let repo = SqliteRepository::in_memory().unwrap();
        let c = card("g1", "spread", "h1");

        assert_eq!(repo.replace_card(&c).unwrap(), ReplaceOutcome::Inserted);
        assert_eq!(repo.replace_card(&c).unwrap(), ReplaceOutcome::Unchanged);

        let mut updated = c.clone();
        updated.payload_hash = "h2".to_string();
        updated.selection = Selection::Away;
        assert_eq!(repo.replace_card(&updated).unwrap(), ReplaceOutcome::Updated);

        let cards = repo.cards_for_subject("g1").unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].selection, Selection::Away);

        let rows = repo.all_settlement_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.status, SettlementStatus::Pending);
    }

    #[test]
    fn test_settled_card_is_locked() {
        let repo = SqliteRepository::in_memory().unwrap();
        let c = card("g1", "spread", "h1");
        repo.replace_card(&c).unwrap();

        let record = repo.get_settlement(&c.card_id).unwrap().unwrap();
        let now = Utc::now();
        assert!(repo
            .settle_pending(record.id, SettlementResult::Win, Some(0.91), now)
            .unwrap());
        // second settle is a no-op
        assert!(!repo
            .settle_pending(record.id, SettlementResult::Loss, Some(-1.0), now)
            .unwrap());

        let mut changed = c.clone();
        changed.payload_hash = "h2".to_string();
        assert_eq!(
            repo.replace_card(&changed).unwrap(),
            ReplaceOutcome::SettledLocked
        );
        let stored = repo.get_settlement(&c.card_id).unwrap().unwrap();
        assert_eq!(stored.result, Some(SettlementResult::Win));
    }

    fn started(outcome: BeginOutcome) -> JobRun {
        match outcome {
            BeginOutcome::Started { run, .. } => run,
            BeginOutcome::Blocked(status) => panic!("unexpectedly blocked ({})", status),
        }
    }

    #[test]
    fn test_one_running_record_per_key() {
        let repo = SqliteRepository::in_memory().unwrap();
        let now = Utc::now();
        let open_gate = |_: &JobRun| GateVerdict::Proceed;
        let run = started(repo.begin_job_run(Some("k1"), "publish", now, &open_gate).unwrap());

        // the partial index rejects a second RUNNING record even past the gate
        let err = repo
            .begin_job_run(Some("k1"), "publish", now, &open_gate)
            .unwrap_err();
        assert!(matches!(err, PipelineError::IdempotencyConflict { .. }));

        // null keys never collide
        started(repo.begin_job_run(None, "publish", now, &open_gate).unwrap());
        started(repo.begin_job_run(None, "publish", now, &open_gate).unwrap());

        repo.finish_job_run(run.id, JobStatus::Failed, now, Some("boom"))
            .unwrap();
        let latest = repo.latest_job_run("k1").unwrap().unwrap();
        assert_eq!(latest.status, JobStatus::Failed);
        assert_eq!(latest.error.as_deref(), Some("boom"));
        started(repo.begin_job_run(Some("k1"), "publish", now, &open_gate).unwrap());
    }

    #[test]
    fn test_begin_applies_gate_verdict() {
        let repo = SqliteRepository::in_memory().unwrap();
        let now = Utc::now();
        let first = started(
            repo.begin_job_run(Some("k1"), "settle", now, &|_| GateVerdict::Proceed)
                .unwrap(),
        );

        let blocked = repo
            .begin_job_run(Some("k1"), "settle", now, &|latest| {
                GateVerdict::Blocked(latest.status)
            })
            .unwrap();
        assert_eq!(blocked, BeginOutcome::Blocked(JobStatus::Running));
        assert_eq!(repo.list_job_runs(Some("k1"), 10).unwrap().len(), 1);

        let later = now + Duration::hours(8);
        match repo
            .begin_job_run(Some("k1"), "settle", later, &|_| GateVerdict::Abandoned)
            .unwrap()
        {
            BeginOutcome::Started { run, recovered } => {
                assert_ne!(run.id, first.id);
                assert_eq!(recovered, Some(first.id));
            }
            other => panic!("expected a new run, got {:?}", other),
        }
        let runs = repo.list_job_runs(Some("k1"), 10).unwrap();
        let old = runs.iter().find(|r| r.id == first.id).unwrap();
        assert_eq!(old.status, JobStatus::Failed);
        assert_eq!(old.error.as_deref(), Some(ABANDONED_MESSAGE));
    }

    #[test]
    fn test_subject_replace_retires_pending_cards() {
        let repo = SqliteRepository::in_memory().unwrap();
        let spread = card("g1", "spread", "h1");
        let call = card("g1", "call", "h1");
        let other_version = RecommendationCard {
            card_id: RecommendationCard::identity_id("g1", "total", "manual-v1"),
            producer_version: "manual-v1".to_string(),
            card_key: "total".to_string(),
            ..card("g1", "total", "h1")
        };
        repo.replace_subject_cards("g1", "drivers-v1", &[spread.clone(), call.clone()])
            .unwrap();
        repo.replace_card(&other_version).unwrap();

        // spread is settled and stays; call is pending and goes
        let record = repo.get_settlement(&spread.card_id).unwrap().unwrap();
        repo.settle_pending(record.id, SettlementResult::Win, Some(0.91), Utc::now())
            .unwrap();

        let replaced = repo.replace_subject_cards("g1", "drivers-v1", &[]).unwrap();
        assert!(replaced.outcomes.is_empty());
        assert_eq!(replaced.retired, vec!["call".to_string()]);

        let keys: Vec<String> = repo
            .cards_for_subject("g1")
            .unwrap()
            .into_iter()
            .map(|c| c.card_key)
            .collect();
        assert_eq!(keys, vec!["spread".to_string(), "total".to_string()]);
        assert!(repo.get_settlement(&call.card_id).unwrap().is_none());
        assert_eq!(repo.all_settlement_rows().unwrap().len(), 2);
    }

    #[test]
    fn test_correction_keeps_settled_at() {
        let repo = SqliteRepository::in_memory().unwrap();
        let c = card("g1", "spread", "h1");
        repo.replace_card(&c).unwrap();
        let record = repo.get_settlement(&c.card_id).unwrap().unwrap();
        let settled_at = Utc.with_ymd_and_hms(2026, 8, 18, 20, 0, 0).unwrap();
        repo.settle_pending(record.id, SettlementResult::Loss, Some(-1.0), settled_at)
            .unwrap();

        assert!(repo
            .correct_settlement(record.id, SettlementResult::Win, Some(0.91))
            .unwrap());
        let stored = repo.get_settlement(&c.card_id).unwrap().unwrap();
        assert_eq!(stored.result, Some(SettlementResult::Win));
        assert_eq!(stored.settled_at, Some(settled_at));
    }

    #[test]
    fn test_pending_requires_final_outcome() {
        let repo = SqliteRepository::in_memory().unwrap();
        repo.replace_card(&card("g1", "spread", "h1")).unwrap();
        repo.replace_card(&card("g2", "spread", "h1")).unwrap();

        let recorded_at = Utc::now() - Duration::hours(1);
        repo.upsert_outcome(&FinalOutcome {
            subject_id: "g1".into(),
            home_score: 110.0,
            away_score: 102.0,
            status: OutcomeStatus::Final,
            recorded_at,
        })
        .unwrap();
        repo.upsert_outcome(&FinalOutcome {
            subject_id: "g2".into(),
            home_score: 50.0,
            away_score: 48.0,
            status: OutcomeStatus::InProgress,
            recorded_at,
        })
        .unwrap();

        let pending = repo.pending_with_final_outcome().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0.card.subject_id, "g1");
        assert_eq!(pending[0].1.home_score, 110.0);
    }
}
