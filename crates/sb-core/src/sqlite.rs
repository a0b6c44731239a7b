use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use tokio_rusqlite::Connection;

use crate::store::{DateRange, PurgeCounts, SettingsMap, Store, StoreError, TABLES};
use crate::types::{LogEntry, LogLevel, ProviderConfig, UsageRecord};

/// SQLite-backed [`Store`]. Rows carry their full JSON form in `data`, with
/// the columns used for filtering and ordering broken out alongside.
pub struct SqliteStore {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamps so TEXT comparison matches time order.
fn ts_to_sql(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn json_from_sql<T: serde::de::DeserializeOwned>(raw: &str, col: usize) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e)))
}

impl SqliteStore {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS providers (
                        name        TEXT PRIMARY KEY,
                        data        TEXT NOT NULL,
                        updated_at  TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS usage_records (
                        id          TEXT PRIMARY KEY,
                        timestamp   TEXT NOT NULL,
                        provider    TEXT NOT NULL,
                        success     INTEGER NOT NULL,
                        data        TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_usage_ts ON usage_records(timestamp);

                    CREATE TABLE IF NOT EXISTS logs (
                        id          TEXT PRIMARY KEY,
                        timestamp   TEXT NOT NULL,
                        level       TEXT NOT NULL,
                        data        TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_logs_ts    ON logs(timestamp);
                    CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);

                    CREATE TABLE IF NOT EXISTS settings (
                        key         TEXT PRIMARY KEY,
                        value       TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    // -----------------------------------------------------------------------
    // Providers
    // -----------------------------------------------------------------------

    async fn get_provider(&self, name: &str) -> Result<Option<ProviderConfig>, StoreError> {
        let name = name.to_string();
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM providers WHERE name = ?1")?;
                let mut rows = stmt.query(rusqlite::params![name])?;
                match rows.next()? {
                    Some(row) => {
                        let raw: String = row.get(0)?;
                        Ok(Some(json_from_sql(&raw, 0)?))
                    }
                    None => Ok(None),
                }
            })
            .await?;
        Ok(found)
    }

    async fn list_providers(&self) -> Result<Vec<ProviderConfig>, StoreError> {
        let all = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT data FROM providers ORDER BY name")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let raw: String = row.get(0)?;
                    out.push(json_from_sql(&raw, 0)?);
                }
                Ok(out)
            })
            .await?;
        Ok(all)
    }

    async fn upsert_provider(&self, provider: &ProviderConfig) -> Result<(), StoreError> {
        let name = provider.name.clone();
        let data = serde_json::to_string(provider)?;
        let updated_at = ts_to_sql(provider.updated_at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO providers (name, data, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(name) DO UPDATE SET
                        data=excluded.data, updated_at=excluded.updated_at",
                    rusqlite::params![name, data, updated_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Usage records
    // -----------------------------------------------------------------------

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let id = record.id.to_string();
        let timestamp = ts_to_sql(record.timestamp);
        let provider = record.provider_used.clone();
        let success = record.success;
        let data = serde_json::to_string(record)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO usage_records (id, timestamp, provider, success, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id, timestamp, provider, success, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn scan_usage(&self, range: DateRange) -> Result<Vec<UsageRecord>, StoreError> {
        let from = ts_to_sql(range.from);
        let to = ts_to_sql(range.to);
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT data FROM usage_records
                     WHERE timestamp >= ?1 AND timestamp < ?2
                     ORDER BY timestamp ASC, rowid ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![from, to])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let raw: String = row.get(0)?;
                    out.push(json_from_sql(&raw, 0)?);
                }
                Ok(out)
            })
            .await?;
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Logs
    // -----------------------------------------------------------------------

    async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
        let id = entry.id.to_string();
        let timestamp = ts_to_sql(entry.timestamp);
        let level = entry.level.as_str();
        let data = serde_json::to_string(entry)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO logs (id, timestamp, level, data) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, timestamp, level, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn scan_logs(&self, range: DateRange) -> Result<Vec<LogEntry>, StoreError> {
        let from = ts_to_sql(range.from);
        let to = ts_to_sql(range.to);
        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT data FROM logs
                     WHERE timestamp >= ?1 AND timestamp < ?2
                     ORDER BY timestamp ASC, rowid ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![from, to])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let raw: String = row.get(0)?;
                    out.push(json_from_sql(&raw, 0)?);
                }
                Ok(out)
            })
            .await?;
        Ok(entries)
    }

    async fn recent_logs(
        &self,
        level: Option<LogLevel>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let level = level.map(|l| l.as_str());
        let limit = limit as i64;
        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT data FROM logs
                     WHERE ?1 IS NULL OR level = ?1
                     ORDER BY timestamp DESC, rowid DESC
                     LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![level, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let raw: String = row.get(0)?;
                    out.push(json_from_sql(&raw, 0)?);
                }
                Ok(out)
            })
            .await?;
        Ok(entries)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeCounts, StoreError> {
        let cutoff = ts_to_sql(cutoff);
        let counts = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let usage_records = tx.execute(
                    "DELETE FROM usage_records WHERE timestamp < ?1",
                    rusqlite::params![cutoff],
                )? as u64;
                let logs = tx.execute(
                    "DELETE FROM logs WHERE timestamp < ?1",
                    rusqlite::params![cutoff],
                )? as u64;
                tx.commit()?;
                Ok(PurgeCounts {
                    usage_records,
                    logs,
                })
            })
            .await?;
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    async fn load_settings(&self) -> Result<SettingsMap, StoreError> {
        let pairs: Vec<(String, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get(0)?, row.get(1)?));
                }
                Ok(out)
            })
            .await?;

        let mut map = SettingsMap::new();
        for (key, raw) in pairs {
            match serde_json::from_str(&raw) {
                Ok(value) => {
                    map.insert(key, value);
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable setting"),
            }
        }
        Ok(map)
    }

    async fn upsert_settings(&self, updates: &SettingsMap) -> Result<(), StoreError> {
        let rows: Vec<(String, String)> = updates
            .iter()
            .map(|(k, v)| Ok((k.clone(), serde_json::to_string(v)?)))
            .collect::<Result<_, serde_json::Error>>()?;
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for (key, value) in &rows {
                    tx.execute(
                        "INSERT INTO settings (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                        rusqlite::params![key, value],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn missing_tables(&self) -> Result<Vec<String>, StoreError> {
        let present: Vec<String> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get(0)?);
                }
                Ok(out)
            })
            .await?;
        Ok(TABLES
            .iter()
            .filter(|t| !present.iter().any(|p| p == *t))
            .map(|t| t.to_string())
            .collect())
    }
}
