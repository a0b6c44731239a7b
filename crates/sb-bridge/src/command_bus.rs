//! The secured command bus.
//!
//! Every admin-surface request arrives as `(action, params, tokens)` and
//! leaves as an [`Envelope`]. Read-only actions pass straight through.
//! Mutating actions must present a CSRF token that matches the session's
//! before anything else happens, and always leave a [`LogEntry`] behind.
//!
//! [`LogEntry`]: sb_core::types::LogEntry

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sb_core::settings::{SettingsError, SettingsStore};
use sb_core::store::{SettingsMap, Store, StoreError};
use sb_core::types::{LogLevel, TaskInput, TaskOptions, TaskRequest, TaskType};
use sb_engine::health::HealthEvaluator;
use sb_engine::registry::{ProviderUpdate, RegistryError};
use sb_engine::usage::ChartKind;
use sb_engine::{ErrorKind, ProviderRegistry, TaskError, TaskOrchestrator, UsageRecorder};
use sb_harness::provider::ClientSet;
use sb_harness::rate_limiter::RateLimiter;
use sb_harness::security::{verify_csrf, SecurityError};
use sb_telemetry::tracing_setup::command_span;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

/// Prompt used by `test_provider`.
pub const PROBE_PROMPT: &str = "Reply with the single word: pong";

const DEFAULT_FEED_LIMIT: u32 = 20;
const MAX_FEED_LIMIT: u32 = 200;
const DEFAULT_WINDOW_DAYS: u32 = 7;

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    GetStatus,
    GetStats,
    GetAnalytics,
    GetChartData,
    GetHealth,
    GetActivity,
    GetRecentErrors,
    GetProviders,
    GetSettings,
    ExecuteTask,
    TestProvider,
    SaveProviderConfig,
    SaveSettings,
}

impl Action {
    pub const ALL: [Action; 13] = [
        Action::GetStatus,
        Action::GetStats,
        Action::GetAnalytics,
        Action::GetChartData,
        Action::GetHealth,
        Action::GetActivity,
        Action::GetRecentErrors,
        Action::GetProviders,
        Action::GetSettings,
        Action::ExecuteTask,
        Action::TestProvider,
        Action::SaveProviderConfig,
        Action::SaveSettings,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::GetStatus => "get_status",
            Action::GetStats => "get_stats",
            Action::GetAnalytics => "get_analytics",
            Action::GetChartData => "get_chart_data",
            Action::GetHealth => "get_health",
            Action::GetActivity => "get_activity",
            Action::GetRecentErrors => "get_recent_errors",
            Action::GetProviders => "get_providers",
            Action::GetSettings => "get_settings",
            Action::ExecuteTask => "execute_task",
            Action::TestProvider => "test_provider",
            Action::SaveProviderConfig => "save_provider_config",
            Action::SaveSettings => "save_settings",
        }
    }

    /// Read-only actions never require a CSRF token.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Action::GetStatus
                | Action::GetStats
                | Action::GetAnalytics
                | Action::GetChartData
                | Action::GetHealth
                | Action::GetActivity
                | Action::GetRecentErrors
                | Action::GetProviders
                | Action::GetSettings
        )
    }
}

// ---------------------------------------------------------------------------
// Errors / envelope
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown action")]
    UnknownAction(String),
    /// Deliberately generic; the reason is only traced.
    #[error("security check failed")]
    Csrf(#[from] SecurityError),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::UnknownAction(_)
            | CommandError::Csrf(_)
            | CommandError::InvalidParams(_) => ErrorKind::Client,
            CommandError::Task(e) => e.kind(),
            CommandError::Registry(e) if e.is_client_error() => ErrorKind::Client,
            CommandError::Settings(e) if e.is_client_error() => ErrorKind::Client,
            CommandError::Registry(_) | CommandError::Settings(_) | CommandError::Store(_) => {
                ErrorKind::Configuration
            }
        }
    }
}

/// The uniform response shape of the command surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl Envelope {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
        }
    }

    pub fn failure(err: &CommandError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
        }
    }
}

// ---------------------------------------------------------------------------
// Params
// ---------------------------------------------------------------------------

fn param_u32(params: &SettingsMap, key: &str, default: u32) -> Result<u32, CommandError> {
    let parsed = match params.get(key) {
        None | Some(Value::Null) => return Ok(default),
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(_) => None,
    };
    parsed.ok_or_else(|| CommandError::InvalidParams(format!("`{key}` must be a positive integer")))
}

fn param_str<'a>(params: &'a SettingsMap, key: &str) -> Result<&'a str, CommandError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CommandError::InvalidParams(format!("`{key}` is required")))
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, CommandError> {
    serde_json::to_value(value).map_err(|e| CommandError::Store(StoreError::Serialization(e)))
}

/// `execute_task` parameters. Unset options take system defaults.
#[derive(Debug, Deserialize)]
struct ExecuteParams {
    task_type: TaskType,
    input: TaskInput,
    #[serde(default)]
    options: OptionOverrides,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OptionOverrides {
    provider_hint: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    #[serde(default)]
    stream: bool,
}

// ---------------------------------------------------------------------------
// CommandBus
// ---------------------------------------------------------------------------

pub struct CommandBus {
    orchestrator: Arc<TaskOrchestrator>,
    registry: Arc<ProviderRegistry>,
    settings: Arc<SettingsStore>,
    recorder: Arc<UsageRecorder>,
    health: Arc<HealthEvaluator>,
}

impl CommandBus {
    pub fn new(
        orchestrator: Arc<TaskOrchestrator>,
        registry: Arc<ProviderRegistry>,
        settings: Arc<SettingsStore>,
        recorder: Arc<UsageRecorder>,
        health: Arc<HealthEvaluator>,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            settings,
            recorder,
            health,
        }
    }

    /// Build every component on top of one store.
    pub async fn wire(store: Arc<dyn Store>, clients: ClientSet) -> Self {
        let settings = Arc::new(SettingsStore::new(store.clone()));
        let current = settings.current().await;
        let registry = Arc::new(ProviderRegistry::new(store.clone()).with_settings(settings.clone()));
        let recorder = Arc::new(UsageRecorder::new(store.clone()));
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(current.rate_window_secs)));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            registry.clone(),
            clients,
            recorder.clone(),
            limiter,
        ));
        let health = Arc::new(HealthEvaluator::new(store));
        Self::new(orchestrator, registry, settings, recorder, health)
    }

    pub fn recorder(&self) -> &Arc<UsageRecorder> {
        &self.recorder
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub async fn dispatch(
        &self,
        action: &str,
        params: SettingsMap,
        session_token: &str,
        supplied_token: &str,
    ) -> Envelope {
        self.dispatch_with_cancel(action, params, session_token, supplied_token, &CancellationToken::new())
            .await
    }

    pub async fn dispatch_with_cancel(
        &self,
        action: &str,
        params: SettingsMap,
        session_token: &str,
        supplied_token: &str,
        cancel: &CancellationToken,
    ) -> Envelope {
        let (span, trace_id) = command_span(action);
        async move {
            let Some(parsed) = Action::parse(action) else {
                debug!(action, "unknown action");
                return Envelope::failure(&CommandError::UnknownAction(action.to_string()));
            };

            if !parsed.is_read_only() {
                if let Err(e) = verify_csrf(session_token, supplied_token) {
                    warn!(action, %trace_id, reason = %e, "rejected mutating command");
                    return Envelope::failure(&CommandError::Csrf(e));
                }
            }

            let subject = params.get("name").and_then(Value::as_str).map(str::to_string);
            let result = self.run(parsed, params, cancel).await;
            if !parsed.is_read_only() {
                self.log_outcome(parsed, subject, &result).await;
            }

            match result {
                Ok(data) => Envelope::ok(data),
                Err(e) => {
                    debug!(action, error = %e, "command failed");
                    Envelope::failure(&e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn log_outcome(
        &self,
        action: Action,
        subject: Option<String>,
        result: &Result<Value, CommandError>,
    ) {
        match result {
            Ok(data) => {
                let provider = data
                    .get("provider_used")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or(subject);
                let message = match &provider {
                    Some(p) => format!("{} succeeded ({p})", action.as_str()),
                    None => format!("{} succeeded", action.as_str()),
                };
                self.recorder
                    .log(LogLevel::Info, message, provider.as_deref())
                    .await;
            }
            Err(e) => {
                let level = if e.kind() == ErrorKind::Client {
                    LogLevel::Warning
                } else {
                    LogLevel::Error
                };
                self.recorder
                    .log(level, format!("{} failed: {e}", action.as_str()), subject.as_deref())
                    .await;
            }
        }
    }

    async fn run(
        &self,
        action: Action,
        mut params: SettingsMap,
        cancel: &CancellationToken,
    ) -> Result<Value, CommandError> {
        let now = Utc::now();
        match action {
            Action::GetStatus => {
                let tz = self.settings.current().await.timezone();
                let overall = self.health.overall_status(now, tz).await;
                let enabled = self.registry.enabled_count().await?;
                Ok(json!({
                    "status": overall.status,
                    "errors_today": overall.errors_today,
                    "enabled_providers": enabled,
                }))
            }
            Action::GetStats => {
                let tz = self.settings.current().await.timezone();
                to_data(&self.recorder.today_stats(now, tz).await?)
            }
            Action::GetAnalytics => {
                let days = param_u32(&params, "days", DEFAULT_WINDOW_DAYS)?;
                let tz = self.settings.current().await.timezone();
                to_data(&self.recorder.analytics(days, now, tz).await?)
            }
            Action::GetChartData => {
                let kind: ChartKind = match params.get("kind").and_then(Value::as_str) {
                    None => ChartKind::Usage,
                    Some(raw) => raw.parse().map_err(CommandError::InvalidParams)?,
                };
                let days = param_u32(&params, "days", DEFAULT_WINDOW_DAYS)?;
                let tz = self.settings.current().await.timezone();
                to_data(&self.recorder.chart_series(kind, days, now, tz).await?)
            }
            Action::GetHealth => {
                let tz = self.settings.current().await.timezone();
                let report = self.health.evaluate(now).await;
                let overall = self.health.overall_status(now, tz).await;
                Ok(json!({ "components": report, "overall": overall }))
            }
            Action::GetActivity => {
                let limit = param_u32(&params, "limit", DEFAULT_FEED_LIMIT)?.clamp(1, MAX_FEED_LIMIT);
                to_data(&self.recorder.recent_activity(limit as usize).await?)
            }
            Action::GetRecentErrors => {
                let limit = param_u32(&params, "limit", DEFAULT_FEED_LIMIT)?.clamp(1, MAX_FEED_LIMIT);
                to_data(&self.recorder.recent_errors(limit as usize).await?)
            }
            Action::GetProviders => to_data(&self.registry.list().await?),
            Action::GetSettings => Ok(Value::Object(self.settings.current().await.to_map())),

            Action::ExecuteTask => {
                let parsed: ExecuteParams = serde_json::from_value(Value::Object(params))
                    .map_err(|e| CommandError::InvalidParams(e.to_string()))?;
                let defaults = self.settings.current().await;
                let options = TaskOptions {
                    provider_hint: parsed.options.provider_hint,
                    max_tokens: parsed.options.max_tokens.unwrap_or(defaults.max_tokens),
                    temperature: parsed.options.temperature.unwrap_or(defaults.temperature),
                    stream: parsed.options.stream,
                };
                let request = TaskRequest::new(parsed.task_type, parsed.input, options);
                to_data(&self.orchestrator.execute(request, cancel).await?)
            }
            Action::TestProvider => {
                let name = param_str(&params, "name")?.to_string();
                let mut request = TaskRequest::text(PROBE_PROMPT).with_hint(&name);
                request.options.max_tokens = 16;
                let result = self.orchestrator.execute(request, cancel).await?;
                Ok(json!({
                    "provider": name,
                    "ok": true,
                    "response_time_ms": result.response_time_ms,
                    "content": result.content,
                }))
            }
            Action::SaveProviderConfig => {
                let name = match params.remove("name") {
                    Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
                    _ => return Err(CommandError::InvalidParams("`name` is required".into())),
                };
                let update: ProviderUpdate = serde_json::from_value(Value::Object(params))
                    .map_err(|e| CommandError::InvalidParams(e.to_string()))?;
                self.registry.upsert(&name, update).await?;
                to_data(&self.registry.get(&name).await?)
            }
            Action::SaveSettings => {
                let saved = self.settings.save(&params).await?;
                self.orchestrator.apply_settings(&saved);
                Ok(Value::Object(saved.to_map()))
            }
        }
    }
}
