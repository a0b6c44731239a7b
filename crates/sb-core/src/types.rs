use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Provider name written on usage records that never reached a provider.
pub const NO_PROVIDER: &str = "none";

/// Display value for token counts a vendor did not report.
pub const NOT_REPORTED: &str = "N/A";

// ---------------------------------------------------------------------------
// ApiKey
// ---------------------------------------------------------------------------

/// A provider credential. Zeroed on drop and never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw secret. Only provider clients should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Masked form for read surfaces and logs.
    pub fn masked(&self) -> String {
        mask_secret(&self.0)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({})", self.masked())
    }
}

/// Shows only the first and last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let prefix: String = chars[..4].iter().collect();
    let suffix: String = chars[chars.len() - 4..].iter().collect();
    format!("{prefix}...{suffix}")
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Rolling health statistics kept alongside each provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub last_used: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_cost: f64,
    /// Percentage of successful requests (0–100).
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
}

impl ProviderStats {
    /// Fold one attempt into the rolling figures.
    pub fn record(&mut self, success: bool, cost: f64, response_time_ms: u64, at: DateTime<Utc>) {
        self.total_requests += 1;
        if success {
            self.total_successes += 1;
        }
        self.total_cost += cost;
        let n = self.total_requests as f64;
        self.avg_response_time_ms += (response_time_ms as f64 - self.avg_response_time_ms) / n;
        self.success_rate = 100.0 * self.total_successes as f64 / n;
        self.last_used = Some(at);
    }
}

/// A persisted provider configuration, keyed by `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub display_name: String,
    pub api_key: ApiKey,
    pub api_endpoint: String,
    pub model: String,
    pub enabled: bool,
    /// Lower values are tried first; ties break on `name`.
    pub priority: i32,
    /// Requests allowed per rate window. `0` disables the budget.
    pub rate_limit: u32,
    pub timeout_secs: u64,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub stats: ProviderStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            display_name: name.clone(),
            name,
            api_key: ApiKey::default(),
            api_endpoint: String::new(),
            model: String::new(),
            enabled: false,
            priority: 10,
            rate_limit: 60,
            timeout_secs: 30,
            settings: BTreeMap::new(),
            stats: ProviderStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    TextGeneration,
    Summarization,
    Translation,
    CodeGeneration,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::TextGeneration => "text_generation",
            TaskType::Summarization => "summarization",
            TaskType::Translation => "translation",
            TaskType::CodeGeneration => "code_generation",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text_generation" => Ok(TaskType::TextGeneration),
            "summarization" => Ok(TaskType::Summarization),
            "translation" => Ok(TaskType::Translation),
            "code_generation" => Ok(TaskType::CodeGeneration),
            other => Err(ValidationError::UnknownTaskType(other.to_string())),
        }
    }
}

/// Reasons a task request is rejected before any provider is contacted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("prompt is required")]
    EmptyPrompt,
    #[error("max_tokens must be greater than zero")]
    InvalidMaxTokens,
    #[error("temperature {0} is outside [0, 2]")]
    InvalidTemperature(f64),
    #[error("unknown task type `{0}`")]
    UnknownTaskType(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInput {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Task-specific fields (target language, source text, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskInput {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Explicit provider override. No cross-provider fallback when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_hint: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    #[serde(default)]
    pub stream: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            provider_hint: None,
            max_tokens: 1000,
            temperature: 0.7,
            stream: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: TaskType,
    pub input: TaskInput,
    #[serde(default)]
    pub options: TaskOptions,
}

impl TaskRequest {
    pub fn new(task_type: TaskType, input: TaskInput, options: TaskOptions) -> Self {
        Self {
            task_type,
            input,
            options,
        }
    }

    /// Text generation with default options.
    pub fn text(prompt: impl Into<String>) -> Self {
        Self::new(
            TaskType::TextGeneration,
            TaskInput::prompt(prompt),
            TaskOptions::default(),
        )
    }

    pub fn with_hint(mut self, provider: impl Into<String>) -> Self {
        self.options.provider_hint = Some(provider.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.input.prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        if self.options.max_tokens == 0 {
            return Err(ValidationError::InvalidMaxTokens);
        }
        let t = self.options.temperature;
        if !(0.0..=2.0).contains(&t) {
            return Err(ValidationError::InvalidTemperature(t));
        }
        Ok(())
    }
}

/// The normalized outcome of a successful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub content: String,
    pub provider_used: String,
    #[serde(with = "tokens_serde")]
    pub tokens_used: Option<u64>,
    pub cost: Option<f64>,
    pub response_time_ms: u64,
    pub task_type: TaskType,
}

mod tokens_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::NOT_REPORTED;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Count(u64),
        Label(String),
    }

    pub fn serialize<S: Serializer>(tokens: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match tokens {
            Some(n) => s.serialize_u64(*n),
            None => s.serialize_str(NOT_REPORTED),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Ok(match Repr::deserialize(d)? {
            Repr::Count(n) => Some(n),
            Repr::Label(_) => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Usage and log records
// ---------------------------------------------------------------------------

/// One execution attempt, successful or not. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub task_type: TaskType,
    pub provider_used: String,
    pub response_time_ms: u64,
    pub cost: f64,
    pub tokens_used: Option<u64>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl UsageRecord {
    pub fn success(task_type: TaskType, provider: impl Into<String>, response_time_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            task_type,
            provider_used: provider.into(),
            response_time_ms,
            cost: 0.0,
            tokens_used: None,
            success: true,
            error_message: None,
        }
    }

    pub fn failure(
        task_type: TaskType,
        provider: impl Into<String>,
        response_time_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            task_type,
            provider_used: provider.into(),
            response_time_ms,
            cost: 0.0,
            tokens_used: None,
            success: false,
            error_message: Some(error.into()),
        }
    }

    pub fn with_cost(mut self, cost: Option<f64>, tokens_used: Option<u64>) -> Self {
        self.cost = cost.unwrap_or(0.0);
        self.tokens_used = tokens_used;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether the attempt reached a provider.
    pub fn reached_provider(&self) -> bool {
        self.provider_used != NO_PROVIDER
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

/// Operational log line feeding the activity and error panels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
            provider: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn for_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
