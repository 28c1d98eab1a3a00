//! Healing history (the "K" in MAPE-K).
//!
//! Every attempt is appended to `healing.db` so later diagnoses of the same
//! pattern can weigh how often its remediation worked.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use super::analyzer::Diagnosis;
use super::healer::HealingResult;
use super::patterns::ErrorPattern;

/// Stored error lines are cut to this many characters.
const MAX_LINE_LEN: usize = 500;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("database: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KnowledgeError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingRecord {
    pub id: i64,
    pub pattern: ErrorPattern,
    pub error_line: String,
    pub diagnosis: String,
    pub action_taken: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub context: serde_json::Value,
}

/// Aggregate outcomes for one pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    pub pattern: ErrorPattern,
    pub total_attempts: u64,
    pub successful: u64,
    pub success_rate: f64,
    pub last_seen: Option<DateTime<Utc>>,
}

pub struct KnowledgeBase {
    conn: Connection,
}

impl KnowledgeBase {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let kb = Self {
            conn: Connection::open(path).await?,
        };
        kb.init_schema().await?;
        Ok(kb)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let kb = Self {
            conn: Connection::open_in_memory().await?,
        };
        kb.init_schema().await?;
        Ok(kb)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA busy_timeout=30000;

                    CREATE TABLE IF NOT EXISTS healing_history (
                        id           INTEGER PRIMARY KEY AUTOINCREMENT,
                        error_type   TEXT NOT NULL,
                        error_line   TEXT NOT NULL DEFAULT '',
                        diagnosis    TEXT NOT NULL DEFAULT '',
                        action_taken TEXT NOT NULL DEFAULT '',
                        success      INTEGER NOT NULL,
                        timestamp    TEXT NOT NULL,
                        context      TEXT NOT NULL DEFAULT '{}'
                    );

                    CREATE INDEX IF NOT EXISTS idx_healing_type ON healing_history(error_type);
                    CREATE INDEX IF NOT EXISTS idx_healing_time ON healing_history(timestamp);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Append one healing attempt.
    pub async fn record(&self, diagnosis: &Diagnosis, result: &HealingResult) -> Result<i64> {
        self.record_at(diagnosis, result, Utc::now()).await
    }

    /// [`record`](Self::record) with an explicit timestamp.
    pub async fn record_at(
        &self,
        diagnosis: &Diagnosis,
        result: &HealingResult,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let pattern = diagnosis.error.pattern.as_str();
        let line: String = diagnosis.error.line.chars().take(MAX_LINE_LEN).collect();
        let cause = diagnosis.root_cause.clone();
        let action = result
            .action_taken
            .clone()
            .unwrap_or_else(|| diagnosis.recommended_action.clone());
        let success = result.success;
        let context = result.context.to_string();
        let timestamp = ts(&at);

        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO healing_history
                        (error_type, error_line, diagnosis, action_taken, success, timestamp, context)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![pattern, line, cause, action, success, timestamp, context],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        debug!(pattern, success, "healing attempt recorded");
        Ok(id)
    }

    /// Most recent successful healings of `pattern`.
    pub async fn find_similar(&self, pattern: ErrorPattern, limit: usize) -> Result<Vec<HealingRecord>> {
        let kind = pattern.as_str();
        let limit = limit as i64;
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, error_type, error_line, diagnosis, action_taken, success,
                            timestamp, context
                     FROM healing_history
                     WHERE error_type = ?1 AND success = 1
                     ORDER BY timestamp DESC, id DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![kind, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(read_record(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    /// Per-pattern totals, ordered by pattern name.
    pub async fn statistics(&self) -> Result<Vec<PatternStats>> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT error_type, COUNT(*), SUM(CASE WHEN success THEN 1 ELSE 0 END),
                            MAX(timestamp)
                     FROM healing_history GROUP BY error_type ORDER BY error_type",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let raw: String = row.get(0)?;
                    let Some(pattern) = ErrorPattern::parse(&raw) else {
                        continue;
                    };
                    let total: i64 = row.get(1)?;
                    let successful: i64 = row.get(2)?;
                    let last: Option<String> = row.get(3)?;
                    let total = total.max(0) as u64;
                    let successful = successful.max(0) as u64;
                    out.push(PatternStats {
                        pattern,
                        total_attempts: total,
                        successful,
                        success_rate: if total > 0 {
                            successful as f64 / total as f64
                        } else {
                            0.0
                        },
                        last_seen: last.map(|s| parse_ts(3, &s)).transpose()?,
                    });
                }
                Ok(out)
            })
            .await?)
    }

    /// Drop records older than `retention_days`, then keep only the newest
    /// `max_per_type` per pattern. Returns the number of rows deleted.
    pub async fn cleanup(&self, retention_days: u32, max_per_type: u32) -> Result<usize> {
        let cutoff = ts(&(Utc::now() - chrono::Duration::days(i64::from(retention_days))));
        let cap = i64::from(max_per_type);
        let (expired, capped) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let expired = tx.execute(
                    "DELETE FROM healing_history WHERE timestamp < ?1",
                    rusqlite::params![cutoff],
                )?;
                let capped = tx.execute(
                    "DELETE FROM healing_history WHERE id IN (
                        SELECT id FROM (
                            SELECT id, ROW_NUMBER() OVER (
                                PARTITION BY error_type ORDER BY timestamp DESC, id DESC
                            ) AS rn
                            FROM healing_history
                        ) WHERE rn > ?1
                    )",
                    rusqlite::params![cap],
                )?;
                tx.commit()?;
                Ok((expired, capped))
            })
            .await?;
        if expired + capped > 0 {
            info!(expired, capped, "healing history cleaned up");
        }
        Ok(expired + capped)
    }

    pub async fn count(&self) -> Result<u64> {
        Ok(self
            .conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM healing_history", [], |r| r.get(0))?;
                Ok(n.max(0) as u64)
            })
            .await?)
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {raw:?}: {e}")))
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<HealingRecord> {
    let raw_type: String = row.get(1)?;
    let raw_ts: String = row.get(6)?;
    let raw_ctx: String = row.get(7)?;
    Ok(HealingRecord {
        id: row.get(0)?,
        pattern: ErrorPattern::parse(&raw_type)
            .ok_or_else(|| conversion_error(1, format!("unknown pattern {raw_type:?}")))?,
        error_line: row.get(2)?,
        diagnosis: row.get(3)?,
        action_taken: row.get(4)?,
        success: row.get(5)?,
        timestamp: parse_ts(6, &raw_ts)?,
        context: serde_json::from_str(&raw_ctx).unwrap_or(serde_json::Value::Null),
    })
}
