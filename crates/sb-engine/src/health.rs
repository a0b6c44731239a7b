use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use sb_core::store::{DateRange, Store};
use sb_core::types::{LogEntry, LogLevel};
use serde::Serialize;

use crate::usage::{day_start, local_date};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub level: HealthLevel,
    pub message: String,
}

impl Status {
    fn new(level: HealthLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub database: Status,
    pub providers: Status,
    pub errors: Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverallHealth {
    pub status: OverallStatus,
    pub errors_today: usize,
}

/// Error LogEntries in the trailing hour.
pub fn classify_hourly_errors(count: usize) -> HealthLevel {
    match count {
        0..=4 => HealthLevel::Healthy,
        5..=19 => HealthLevel::Warning,
        _ => HealthLevel::Error,
    }
}

/// Error LogEntries in the current calendar day.
pub fn classify_daily_errors(count: usize) -> OverallStatus {
    match count {
        0..=10 => OverallStatus::Healthy,
        11..=50 => OverallStatus::Warning,
        _ => OverallStatus::Critical,
    }
}

fn count_errors(entries: &[LogEntry]) -> usize {
    entries.iter().filter(|e| e.level == LogLevel::Error).count()
}

/// Derives component and overall health from the store.
///
/// The component report and the daily rollup use different windows and
/// neither overrides the other.
pub struct HealthEvaluator {
    store: Arc<dyn Store>,
}

impl HealthEvaluator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn evaluate(&self, now: DateTime<Utc>) -> HealthReport {
        let database = match self.store.missing_tables().await {
            Ok(missing) if missing.is_empty() => Status::new(HealthLevel::Healthy, "all tables present"),
            Ok(missing) => Status::new(
                HealthLevel::Error,
                format!("missing tables: {}", missing.join(", ")),
            ),
            Err(e) => Status::new(HealthLevel::Error, format!("database unreachable: {e}")),
        };

        let providers = match self.store.list_providers().await {
            Ok(all) => {
                let enabled = all.iter().filter(|p| p.enabled).count();
                let level = if enabled == 0 {
                    HealthLevel::Warning
                } else {
                    HealthLevel::Healthy
                };
                Status::new(level, format!("{enabled} provider(s) enabled"))
            }
            Err(e) => Status::new(HealthLevel::Error, format!("providers unreadable: {e}")),
        };

        let errors = match self
            .store
            .scan_logs(DateRange::through(now - Duration::hours(1), now))
            .await
        {
            Ok(entries) => {
                let n = count_errors(&entries);
                Status::new(classify_hourly_errors(n), format!("{n} error(s) in the last hour"))
            }
            Err(e) => Status::new(HealthLevel::Error, format!("logs unreadable: {e}")),
        };

        HealthReport {
            database,
            providers,
            errors,
        }
    }

    pub async fn overall_status(&self, now: DateTime<Utc>, tz: FixedOffset) -> OverallHealth {
        let today = day_start(local_date(now, tz), tz);

        match self.store.scan_logs(DateRange::through(today, now)).await {
            Ok(entries) => {
                let errors_today = count_errors(&entries);
                OverallHealth {
                    status: classify_daily_errors(errors_today),
                    errors_today,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read logs for overall status");
                OverallHealth {
                    status: OverallStatus::Warning,
                    errors_today: 0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_core::store::MemoryStore;
    use sb_core::types::ProviderConfig;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    async fn seed_errors(store: &MemoryStore, n: usize, at: DateTime<Utc>) {
        for i in 0..n {
            store
                .append_log(&LogEntry::error(format!("failure {i}")).at(at))
                .await
                .unwrap();
        }
    }

    // -- Thresholds --

    #[test]
    fn hourly_thresholds() {
        assert_eq!(classify_hourly_errors(0), HealthLevel::Healthy);
        assert_eq!(classify_hourly_errors(4), HealthLevel::Healthy);
        assert_eq!(classify_hourly_errors(5), HealthLevel::Warning);
        assert_eq!(classify_hourly_errors(19), HealthLevel::Warning);
        assert_eq!(classify_hourly_errors(20), HealthLevel::Error);
    }

    #[test]
    fn daily_thresholds() {
        assert_eq!(classify_daily_errors(10), OverallStatus::Healthy);
        assert_eq!(classify_daily_errors(11), OverallStatus::Warning);
        assert_eq!(classify_daily_errors(50), OverallStatus::Warning);
        assert_eq!(classify_daily_errors(51), OverallStatus::Critical);
    }

    // -- Evaluate --

    #[tokio::test]
    async fn empty_store_warns_about_providers() {
        let eval = HealthEvaluator::new(Arc::new(MemoryStore::new()));
        let report = eval.evaluate(Utc::now()).await;
        assert_eq!(report.database.level, HealthLevel::Healthy);
        assert_eq!(report.providers.level, HealthLevel::Warning);
        assert_eq!(report.providers.message, "0 provider(s) enabled");
        assert_eq!(report.errors.level, HealthLevel::Healthy);
    }

    #[tokio::test]
    async fn missing_table_is_database_error() {
        let eval = HealthEvaluator::new(Arc::new(MemoryStore::new().without_table("usage_records")));
        let report = eval.evaluate(Utc::now()).await;
        assert_eq!(report.database.level, HealthLevel::Error);
        assert!(report.database.message.contains("usage_records"));
    }

    #[tokio::test]
    async fn enabled_provider_is_healthy() {
        let store = Arc::new(MemoryStore::new());
        let mut p = ProviderConfig::new("openai");
        p.enabled = true;
        store.upsert_provider(&p).await.unwrap();

        let report = HealthEvaluator::new(store).evaluate(Utc::now()).await;
        assert_eq!(report.providers.level, HealthLevel::Healthy);
    }

    #[tokio::test]
    async fn only_recent_errors_count_for_the_hour() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        seed_errors(&store, 25, now - Duration::hours(3)).await;
        seed_errors(&store, 6, now - Duration::minutes(10)).await;

        let report = HealthEvaluator::new(store).evaluate(now).await;
        assert_eq!(report.errors.level, HealthLevel::Warning);
        assert_eq!(report.errors.message, "6 error(s) in the last hour");
    }

    #[tokio::test]
    async fn overall_status_counts_the_whole_day() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        seed_errors(&store, 12, now).await;
        store.append_log(&LogEntry::warning("not an error").at(now)).await.unwrap();

        let overall = HealthEvaluator::new(store).overall_status(now, utc()).await;
        assert_eq!(overall.errors_today, 12);
        assert_eq!(overall.status, OverallStatus::Warning);
    }

    #[tokio::test]
    async fn overall_status_starts_at_local_midnight() {
        use chrono::TimeZone;

        let store = Arc::new(MemoryStore::new());
        let plus_five = FixedOffset::east_opt(5 * 3600).unwrap();
        // 02:00 local on March 10th; local midnight is 19:00 UTC on the 9th.
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 21, 0, 0).unwrap();
        seed_errors(&store, 60, Utc.with_ymd_and_hms(2026, 3, 9, 18, 30, 0).unwrap()).await;
        seed_errors(&store, 12, Utc.with_ymd_and_hms(2026, 3, 9, 19, 0, 0).unwrap()).await;

        let eval = HealthEvaluator::new(store);
        let local = eval.overall_status(now, plus_five).await;
        assert_eq!(local.errors_today, 12);
        assert_eq!(local.status, OverallStatus::Warning);

        let in_utc = eval.overall_status(now, utc()).await;
        assert_eq!(in_utc.errors_today, 72);
        assert_eq!(in_utc.status, OverallStatus::Critical);
    }
}
