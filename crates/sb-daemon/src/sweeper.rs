use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sb_core::settings::SettingsStore;
use sb_core::store::StoreError;
use sb_core::types::LogLevel;
use sb_engine::UsageRecorder;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Result of one retention sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Retention window applied, from `cleanup_days`.
    pub cleanup_days: u32,
    pub usage_records: u64,
    pub logs: u64,
    pub timestamp: DateTime<Utc>,
}

impl SweepReport {
    pub fn removed(&self) -> u64 {
        self.usage_records + self.logs
    }
}

/// Periodically drops usage records and log entries older than the
/// configured retention window.
pub struct RetentionSweeper {
    recorder: Arc<UsageRecorder>,
    settings: Arc<SettingsStore>,
}

impl RetentionSweeper {
    pub fn new(recorder: Arc<UsageRecorder>, settings: Arc<SettingsStore>) -> Self {
        Self { recorder, settings }
    }

    /// Run a single sweep. The window is re-read from settings every time so
    /// edits made through `save_settings` apply on the next pass.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let cleanup_days = self.settings.current().await.cleanup_days;
        debug!(cleanup_days, "retention sweep starting");

        let counts = self.recorder.purge_older_than(cleanup_days, now).await?;
        let report = SweepReport {
            cleanup_days,
            usage_records: counts.usage_records,
            logs: counts.logs,
            timestamp: now,
        };

        if report.removed() > 0 {
            self.recorder
                .log(
                    LogLevel::Info,
                    format!(
                        "retention sweep removed {} usage records and {} log entries older than {cleanup_days} days",
                        report.usage_records, report.logs
                    ),
                    None,
                )
                .await;
        }
        Ok(report)
    }

    /// Sweep every `interval` until `cancel` fires. The first sweep runs
    /// immediately.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown signal received, stopping retention sweeper");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) => info!(
                            usage_records = report.usage_records,
                            logs = report.logs,
                            cleanup_days = report.cleanup_days,
                            "retention sweep completed"
                        ),
                        Err(e) => error!(error = %e, "retention sweep failed"),
                    }
                }
            }
        }
    }
}
