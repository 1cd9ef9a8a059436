//! Result store for the Pulse platform
//!
//! SQLite-backed persistence of classifications and alerts. Classifications
//! are deduplicated by content hash: a unique index on `text_hash` makes
//! exactly one insert win under concurrent writers, and re-inserting an
//! existing hash is a no-op that returns the stored record's id.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use pulse_common::{
    Alert, AlertKind, AlertSeverity, AlertStatus, Classification, Error, Result, SentimentLabel,
    VerdictSource,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of storing a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOutcome {
    /// Row id of the stored (or previously stored) classification
    pub id: i64,
    /// False when the content hash was already present
    pub inserted: bool,
}

/// Aggregated analytics over a trailing window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSummary {
    pub label_counts: HashMap<SentimentLabel, u64>,
    pub source_counts: HashMap<VerdictSource, u64>,
    pub avg_latency_ms: f64,
    pub alert_counts: HashMap<AlertKind, HashMap<AlertSeverity, u64>>,
}

/// Durable, deduplicated storage of classifications and alerts
pub struct ResultStore {
    pool: SqlitePool,
}

impl ResultStore {
    /// Connect to `dsn` and create the schema if missing.
    ///
    /// In-memory databases are pinned to a single pooled connection so the
    /// database survives between calls.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)
            .map_err(|e| Error::Store(format!("invalid store dsn {:?}: {}", dsn, e)))?
            .create_if_missing(true);

        let in_memory = dsn.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| Error::Store(format!("cannot open store at {:?}: {}", dsn, e)))?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(dsn, "result store ready");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS classifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                subreddit TEXT NOT NULL,
                author TEXT,
                text TEXT NOT NULL,
                text_hash TEXT NOT NULL,
                label TEXT NOT NULL,
                confidence REAL NOT NULL,
                compound REAL NOT NULL,
                model TEXT NOT NULL,
                source TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                item_created_at INTEGER NOT NULL,
                stored_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_classifications_text_hash
             ON classifications(text_hash)",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_classifications_stored_at
             ON classifications(stored_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                content_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                keywords_matched TEXT NOT NULL,
                status TEXT NOT NULL,
                note TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_status ON alerts(status)")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_created_at ON alerts(created_at)")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(())
    }

    /// Upsert keyed by `text_hash`; on conflict returns the existing row's
    /// id with `inserted = false`.
    pub async fn store_classification(&self, c: &Classification) -> Result<StoreOutcome> {
        let hash = c.item.text_hash.to_hex();
        let result = sqlx::query(
            r#"
            INSERT INTO classifications
                (content_id, kind, subreddit, author, text, text_hash, label,
                 confidence, compound, model, source, latency_ms,
                 item_created_at, stored_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(text_hash) DO NOTHING
            "#,
        )
        .bind(&c.item.raw.id)
        .bind(c.item.raw.kind.as_str())
        .bind(&c.item.raw.subreddit)
        .bind(&c.item.raw.author)
        .bind(&c.item.text)
        .bind(&hash)
        .bind(c.verdict.label.as_str())
        .bind(c.verdict.confidence)
        .bind(c.verdict.compound)
        .bind(&c.verdict.model)
        .bind(c.verdict.source.as_str())
        .bind(c.verdict.latency_ms as i64)
        .bind(c.item.raw.created_at.timestamp())
        .bind(c.stored_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        let inserted = result.rows_affected() > 0;
        let row = sqlx::query("SELECT id FROM classifications WHERE text_hash = ?")
            .bind(&hash)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        let id: i64 = row.try_get("id").map_err(store_err)?;

        debug!(id, inserted, hash = %hash, "classification stored");
        Ok(StoreOutcome { id, inserted })
    }

    pub async fn store_alert(&self, a: &Alert) -> Result<Uuid> {
        let keywords = serde_json::to_string(&a.keywords_matched)?;
        sqlx::query(
            r#"
            INSERT INTO alerts (id, content_id, kind, severity, keywords_matched, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(a.id.to_string())
        .bind(&a.content_id)
        .bind(a.kind.as_str())
        .bind(a.severity.as_str())
        .bind(&keywords)
        .bind(a.status.as_str())
        .bind(a.created_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(a.id)
    }

    /// Returns false when no alert with this id exists
    pub async fn update_alert_status(
        &self,
        id: Uuid,
        status: AlertStatus,
        note: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE alerts SET status = ?, note = COALESCE(?, note) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(note)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_alerts(
        &self,
        status: Option<AlertStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Alert>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT id, content_id, kind, severity, keywords_matched, status, created_at
                     FROM alerts WHERE status = ?
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(s.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, content_id, kind, severity, keywords_matched, status, created_at
                     FROM alerts ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(store_err)?;

        rows.into_iter().map(|row| alert_from_row(&row)).collect()
    }

    /// Aggregate counts and latency over the trailing `window`
    pub async fn summarize(&self, window: Duration) -> Result<StoreSummary> {
        let since = (Utc::now()
            - ChronoDuration::from_std(window)
                .map_err(|e| Error::Validation(format!("window too large: {}", e)))?)
        .timestamp();

        let mut label_counts = HashMap::new();
        let rows = sqlx::query(
            "SELECT label, COUNT(*) AS n FROM classifications WHERE stored_at >= ? GROUP BY label",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        for row in rows {
            let label: String = row.try_get("label").map_err(store_err)?;
            let n: i64 = row.try_get("n").map_err(store_err)?;
            if let Some(label) = SentimentLabel::parse(&label) {
                label_counts.insert(label, n as u64);
            }
        }

        let mut source_counts = HashMap::new();
        let rows = sqlx::query(
            "SELECT source, COUNT(*) AS n FROM classifications WHERE stored_at >= ? GROUP BY source",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        for row in rows {
            let source: String = row.try_get("source").map_err(store_err)?;
            let n: i64 = row.try_get("n").map_err(store_err)?;
            if let Some(source) = VerdictSource::parse(&source) {
                source_counts.insert(source, n as u64);
            }
        }

        let row = sqlx::query(
            "SELECT AVG(latency_ms) AS avg_latency FROM classifications WHERE stored_at >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        let avg_latency_ms: Option<f64> = row.try_get("avg_latency").map_err(store_err)?;

        let mut alert_counts: HashMap<AlertKind, HashMap<AlertSeverity, u64>> = HashMap::new();
        let rows = sqlx::query(
            "SELECT kind, severity, COUNT(*) AS n FROM alerts WHERE created_at >= ?
             GROUP BY kind, severity",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        for row in rows {
            let kind: String = row.try_get("kind").map_err(store_err)?;
            let severity: String = row.try_get("severity").map_err(store_err)?;
            let n: i64 = row.try_get("n").map_err(store_err)?;
            if let (Some(kind), Some(severity)) =
                (AlertKind::parse(&kind), AlertSeverity::parse(&severity))
            {
                alert_counts.entry(kind).or_default().insert(severity, n as u64);
            }
        }

        Ok(StoreSummary {
            label_counts,
            source_counts,
            avg_latency_ms: avg_latency_ms.unwrap_or(0.0),
            alert_counts,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn store_err(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

fn alert_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Alert> {
    let id: String = row.try_get("id").map_err(store_err)?;
    let kind: String = row.try_get("kind").map_err(store_err)?;
    let severity: String = row.try_get("severity").map_err(store_err)?;
    let status: String = row.try_get("status").map_err(store_err)?;
    let keywords: String = row.try_get("keywords_matched").map_err(store_err)?;
    let created_at: i64 = row.try_get("created_at").map_err(store_err)?;

    Ok(Alert {
        id: Uuid::parse_str(&id).map_err(|e| Error::Store(format!("bad alert id: {}", e)))?,
        content_id: row.try_get("content_id").map_err(store_err)?,
        kind: AlertKind::parse(&kind)
            .ok_or_else(|| Error::Store(format!("unknown alert kind {:?}", kind)))?,
        severity: AlertSeverity::parse(&severity)
            .ok_or_else(|| Error::Store(format!("unknown severity {:?}", severity)))?,
        keywords_matched: serde_json::from_str(&keywords)?,
        created_at: Utc
            .timestamp_opt(created_at, 0)
            .single()
            .ok_or_else(|| Error::Store(format!("bad alert timestamp {}", created_at)))?,
        status: AlertStatus::parse(&status)
            .ok_or_else(|| Error::Store(format!("unknown status {:?}", status)))?,
    })
}
