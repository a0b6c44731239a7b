//! The persistence seam.
//!
//! Everything durable goes through [`Store`]: provider configurations, the
//! append-only usage and log streams, and the settings map. Two backends ship
//! with the crate: [`MemoryStore`] for tests and ephemeral daemons, and
//! [`crate::sqlite::SqliteStore`] for on-disk use.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::types::{LogEntry, LogLevel, ProviderConfig, UsageRecord};

/// Logical tables every backend must provide.
pub const TABLES: [&str; 4] = ["providers", "usage_records", "logs", "settings"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Half-open `[from, to)` time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// Window from `from` up to and including `until`.
    pub fn through(from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            from,
            to: until + chrono::Duration::milliseconds(1),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at < self.to
    }
}

/// Rows removed by a retention purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub usage_records: u64,
    pub logs: u64,
}

pub type SettingsMap = serde_json::Map<String, serde_json::Value>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_provider(&self, name: &str) -> Result<Option<ProviderConfig>, StoreError>;

    /// All persisted providers, ordered by name.
    async fn list_providers(&self) -> Result<Vec<ProviderConfig>, StoreError>;

    async fn upsert_provider(&self, provider: &ProviderConfig) -> Result<(), StoreError>;

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError>;

    /// Usage records inside `range`, oldest first.
    async fn scan_usage(&self, range: DateRange) -> Result<Vec<UsageRecord>, StoreError>;

    async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError>;

    /// Log entries inside `range`, oldest first.
    async fn scan_logs(&self, range: DateRange) -> Result<Vec<LogEntry>, StoreError>;

    /// Newest-first log entries, optionally filtered by level.
    async fn recent_logs(
        &self,
        level: Option<LogLevel>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError>;

    /// Delete usage records and logs strictly older than `cutoff`.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeCounts, StoreError>;

    async fn load_settings(&self) -> Result<SettingsMap, StoreError>;

    /// Write every key in `updates` in one transaction.
    async fn upsert_settings(&self, updates: &SettingsMap) -> Result<(), StoreError>;

    /// Names from [`TABLES`] the backend cannot find.
    async fn missing_tables(&self) -> Result<Vec<String>, StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    providers: BTreeMap<String, ProviderConfig>,
    usage: Vec<UsageRecord>,
    logs: Vec<LogEntry>,
    settings: SettingsMap,
}

/// In-process store. Records are kept in insertion order.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    dropped_tables: HashSet<String>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `table` as missing from [`Store::missing_tables`].
    pub fn without_table(mut self, table: &str) -> Self {
        self.dropped_tables.insert(table.to_string());
        self
    }

    /// Make every append and upsert fail with [`StoreError::Unavailable`].
    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

fn sorted_by_time<T: Clone>(
    items: &[T],
    range: DateRange,
    at: impl Fn(&T) -> DateTime<Utc>,
) -> Vec<T> {
    let mut out: Vec<T> = items
        .iter()
        .filter(|i| range.contains(at(i)))
        .cloned()
        .collect();
    out.sort_by_key(|i| at(i));
    out
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_provider(&self, name: &str) -> Result<Option<ProviderConfig>, StoreError> {
        Ok(self.inner.read().await.providers.get(name).cloned())
    }

    async fn list_providers(&self) -> Result<Vec<ProviderConfig>, StoreError> {
        Ok(self.inner.read().await.providers.values().cloned().collect())
    }

    async fn upsert_provider(&self, provider: &ProviderConfig) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner
            .write()
            .await
            .providers
            .insert(provider.name.clone(), provider.clone());
        Ok(())
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner.write().await.usage.push(record.clone());
        Ok(())
    }

    async fn scan_usage(&self, range: DateRange) -> Result<Vec<UsageRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(sorted_by_time(&inner.usage, range, |r| r.timestamp))
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner.write().await.logs.push(entry.clone());
        Ok(())
    }

    async fn scan_logs(&self, range: DateRange) -> Result<Vec<LogEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(sorted_by_time(&inner.logs, range, |l| l.timestamp))
    }

    async fn recent_logs(
        &self,
        level: Option<LogLevel>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<LogEntry> = inner
            .logs
            .iter()
            .filter(|l| level.is_none_or(|lvl| l.level == lvl))
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal timestamps; reverse it.
        out.reverse();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit);
        Ok(out)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeCounts, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let usage_before = inner.usage.len();
        inner.usage.retain(|r| r.timestamp >= cutoff);
        let logs_before = inner.logs.len();
        inner.logs.retain(|l| l.timestamp >= cutoff);
        Ok(PurgeCounts {
            usage_records: (usage_before - inner.usage.len()) as u64,
            logs: (logs_before - inner.logs.len()) as u64,
        })
    }

    async fn load_settings(&self) -> Result<SettingsMap, StoreError> {
        Ok(self.inner.read().await.settings.clone())
    }

    async fn upsert_settings(&self, updates: &SettingsMap) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        for (k, v) in updates {
            inner.settings.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn missing_tables(&self) -> Result<Vec<String>, StoreError> {
        Ok(TABLES
            .iter()
            .filter(|t| self.dropped_tables.contains(**t))
            .map(|t| t.to_string())
            .collect())
    }
}
