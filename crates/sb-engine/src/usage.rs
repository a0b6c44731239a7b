//! Usage recording and the aggregates behind the dashboard panels.
//!
//! Writes through [`UsageRecorder::record`] and [`UsageRecorder::log`] never
//! fail the caller. Persistence errors are reported via `tracing` and
//! dropped so that a struggling store cannot turn a successful task into a
//! failed one.

use std::sync::Arc;

use ahash::AHashMap;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};
use sb_core::store::{DateRange, PurgeCounts, Store, StoreError};
use sb_core::types::{LogEntry, LogLevel, UsageRecord};
use serde::{Deserialize, Serialize};

pub const MAX_CHART_DAYS: u32 = 90;

// ---------------------------------------------------------------------------
// Calendar helpers
// ---------------------------------------------------------------------------

pub(crate) fn local_date(at: DateTime<Utc>, tz: FixedOffset) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}

/// UTC instant of local midnight starting `date`.
pub(crate) fn day_start(date: NaiveDate, tz: FixedOffset) -> DateTime<Utc> {
    let local_midnight = date.and_time(NaiveTime::MIN);
    (local_midnight - Duration::seconds(i64::from(tz.local_minus_utc()))).and_utc()
}

/// Local calendar days `[today - (days - 1), today]` as a UTC range.
fn trailing_days(days: u32, now: DateTime<Utc>, tz: FixedOffset) -> (NaiveDate, DateRange) {
    let today = local_date(now, tz);
    let first = today - Duration::days(i64::from(days.max(1)) - 1);
    let range = DateRange::new(day_start(first, tz), day_start(today + Duration::days(1), tz));
    (first, range)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Aggregate types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TodayStats {
    pub requests_today: u64,
    /// Mean latency in whole milliseconds over attempts that reached a provider.
    pub avg_response_time: u64,
    pub costs_today: f64,
    pub content_generated: u64,
    pub error_rate_pct: f64,
}

impl TodayStats {
    pub fn from_records(records: &[UsageRecord]) -> Self {
        let total = records.len() as u64;
        let errors = records.iter().filter(|r| !r.success).count() as u64;
        let successes = total - errors;

        let reached: Vec<&UsageRecord> = records.iter().filter(|r| r.reached_provider()).collect();
        let avg_response_time = if reached.is_empty() {
            0
        } else {
            let sum: u64 = reached.iter().map(|r| r.response_time_ms).sum();
            (sum as f64 / reached.len() as f64).round() as u64
        };

        let error_rate_pct = if total == 0 {
            0.0
        } else {
            round1(100.0 * errors as f64 / total as f64)
        };

        Self {
            requests_today: total,
            avg_response_time,
            costs_today: records.iter().map(|r| r.cost).sum(),
            content_generated: successes,
            error_rate_pct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Usage,
    Errors,
}

impl std::str::FromStr for ChartKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "usage" => Ok(ChartKind::Usage),
            "errors" => Ok(ChartKind::Errors),
            other => Err(format!("unknown chart kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub values: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub key: String,
    pub requests: u64,
    pub failures: u64,
    pub cost: f64,
    pub avg_response_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
    pub days: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_cost: f64,
    pub by_provider: Vec<Breakdown>,
    pub by_task_type: Vec<Breakdown>,
}

#[derive(Default)]
struct Accumulator {
    requests: u64,
    failures: u64,
    cost: f64,
    latency_sum: u64,
}

fn breakdown<F>(records: &[UsageRecord], key: F) -> Vec<Breakdown>
where
    F: Fn(&UsageRecord) -> String,
{
    let mut groups: AHashMap<String, Accumulator> = AHashMap::new();
    for r in records {
        let acc = groups.entry(key(r)).or_default();
        acc.requests += 1;
        if !r.success {
            acc.failures += 1;
        }
        acc.cost += r.cost;
        acc.latency_sum += r.response_time_ms;
    }

    let mut out: Vec<Breakdown> = groups
        .into_iter()
        .map(|(key, acc)| Breakdown {
            key,
            requests: acc.requests,
            failures: acc.failures,
            cost: acc.cost,
            avg_response_time_ms: (acc.latency_sum as f64 / acc.requests as f64).round() as u64,
        })
        .collect();
    out.sort_by(|a, b| b.requests.cmp(&a.requests).then_with(|| a.key.cmp(&b.key)));
    out
}

// ---------------------------------------------------------------------------
// UsageRecorder
// ---------------------------------------------------------------------------

pub struct UsageRecorder {
    store: Arc<dyn Store>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn record(&self, record: &UsageRecord) {
        if let Err(e) = self.store.append_usage(record).await {
            tracing::warn!(
                provider = %record.provider_used,
                task_type = %record.task_type,
                error = %e,
                "failed to persist usage record"
            );
        }
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>, provider: Option<&str>) {
        let mut entry = LogEntry::new(level, message);
        if let Some(p) = provider {
            entry = entry.for_provider(p);
        }
        if let Err(e) = self.store.append_log(&entry).await {
            tracing::warn!(error = %e, message = %entry.message, "failed to persist log entry");
        }
    }

    pub async fn today_stats(
        &self,
        now: DateTime<Utc>,
        tz: FixedOffset,
    ) -> Result<TodayStats, StoreError> {
        let (_, range) = trailing_days(1, now, tz);
        let records = self.store.scan_usage(range).await?;
        Ok(TodayStats::from_records(&records))
    }

    /// One bucket per local calendar day, oldest first, zero-filled.
    pub async fn chart_series(
        &self,
        kind: ChartKind,
        days: u32,
        now: DateTime<Utc>,
        tz: FixedOffset,
    ) -> Result<ChartSeries, StoreError> {
        let days = days.clamp(1, MAX_CHART_DAYS);
        let (first, range) = trailing_days(days, now, tz);
        let records = self.store.scan_usage(range).await?;

        let mut values = vec![0u64; days as usize];
        for r in &records {
            if kind == ChartKind::Errors && r.success {
                continue;
            }
            let idx = (local_date(r.timestamp, tz) - first).num_days();
            if let Some(slot) = usize::try_from(idx).ok().and_then(|i| values.get_mut(i)) {
                *slot += 1;
            }
        }

        let labels = (0..days)
            .map(|i| {
                (first + Duration::days(i64::from(i)))
                    .format("%b %d")
                    .to_string()
            })
            .collect();
        Ok(ChartSeries { labels, values })
    }

    pub async fn analytics(
        &self,
        days: u32,
        now: DateTime<Utc>,
        tz: FixedOffset,
    ) -> Result<Analytics, StoreError> {
        let days = days.clamp(1, MAX_CHART_DAYS);
        let (_, range) = trailing_days(days, now, tz);
        let records = self.store.scan_usage(range).await?;

        Ok(Analytics {
            days,
            total_requests: records.len() as u64,
            total_failures: records.iter().filter(|r| !r.success).count() as u64,
            total_cost: records.iter().map(|r| r.cost).sum(),
            by_provider: breakdown(&records, |r| r.provider_used.clone()),
            by_task_type: breakdown(&records, |r| r.task_type.to_string()),
        })
    }

    pub async fn recent_activity(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        self.store.recent_logs(None, limit).await
    }

    pub async fn recent_errors(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        self.store.recent_logs(Some(LogLevel::Error), limit).await
    }

    /// Drop usage records and logs older than `days` days.
    pub async fn purge_older_than(
        &self,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<PurgeCounts, StoreError> {
        // Horizons past chrono's range keep everything.
        let cutoff = now
            .checked_sub_signed(Duration::days(i64::from(days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let counts = self.store.purge_before(cutoff).await?;
        tracing::info!(
            usage_records = counts.usage_records,
            logs = counts.logs,
            %cutoff,
            "retention purge complete"
        );
        Ok(counts)
    }
}
