//! Runtime system settings.
//!
//! [`SystemSettings`] is a closed struct with documented defaults. Updates
//! arrive from the admin surface as a loose key/value map and are coerced
//! against each field's type. A bad key or value rejects the whole update.

use std::sync::Arc;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::store::{SettingsMap, Store, StoreError};

pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Longest retention horizon accepted for `cleanup_days`.
pub const MAX_CLEANUP_DAYS: u32 = 3650;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("unknown setting `{0}`")]
    UnknownKey(String),
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SettingsError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        SettingsError::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the caller sent something unacceptable.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, SettingsError::Store(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    pub cache_ttl_secs: u64,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Default per-provider request budget for newly created providers.
    pub rate_limit: u32,
    pub rate_window_secs: u64,
    pub timeout_secs: u64,
    pub concurrency_cap: u32,
    pub cache_enabled: bool,
    pub log_level: String,
    /// Retention horizon for usage records and logs.
    pub cleanup_days: u32,
    /// Offset used for calendar-day aggregation.
    pub utc_offset_minutes: i32,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
            max_tokens: 1000,
            temperature: 0.7,
            rate_limit: 60,
            rate_window_secs: 60,
            timeout_secs: 30,
            concurrency_cap: 5,
            cache_enabled: true,
            log_level: "info".into(),
            cleanup_days: 30,
            utc_offset_minutes: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

fn coerce_bool(key: &str, value: &Value) -> Result<bool, SettingsError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(SettingsError::invalid(key, "expected a boolean")),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(SettingsError::invalid(key, "expected a boolean")),
        },
        _ => Err(SettingsError::invalid(key, "expected a boolean")),
    }
}

fn coerce_i64(key: &str, value: &Value) -> Result<i64, SettingsError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| SettingsError::invalid(key, "expected an integer"))
}

fn coerce_unsigned<T: TryFrom<i64>>(key: &str, value: &Value) -> Result<T, SettingsError> {
    let n = coerce_i64(key, value)?;
    T::try_from(n).map_err(|_| SettingsError::invalid(key, format!("{n} is out of range")))
}

fn coerce_f64(key: &str, value: &Value) -> Result<f64, SettingsError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(f) if f.is_finite() => Ok(f),
        _ => Err(SettingsError::invalid(key, "expected a number")),
    }
}

fn coerce_string(key: &str, value: &Value) -> Result<String, SettingsError> {
    match value {
        Value::String(s) => Ok(s.trim().to_string()),
        _ => Err(SettingsError::invalid(key, "expected a string")),
    }
}

impl SystemSettings {
    /// Coerce and assign a single key.
    fn set(&mut self, key: &str, value: &Value) -> Result<(), SettingsError> {
        match key {
            "cache_ttl_secs" => self.cache_ttl_secs = coerce_unsigned(key, value)?,
            "max_tokens" => self.max_tokens = coerce_unsigned(key, value)?,
            "temperature" => self.temperature = coerce_f64(key, value)?,
            "rate_limit" => self.rate_limit = coerce_unsigned(key, value)?,
            "rate_window_secs" => self.rate_window_secs = coerce_unsigned(key, value)?,
            "timeout_secs" => self.timeout_secs = coerce_unsigned(key, value)?,
            "concurrency_cap" => self.concurrency_cap = coerce_unsigned(key, value)?,
            "cache_enabled" => self.cache_enabled = coerce_bool(key, value)?,
            "log_level" => self.log_level = coerce_string(key, value)?.to_ascii_lowercase(),
            "cleanup_days" => self.cleanup_days = coerce_unsigned(key, value)?,
            "utc_offset_minutes" => {
                self.utc_offset_minutes = i32::try_from(coerce_i64(key, value)?)
                    .map_err(|_| SettingsError::invalid(key, "out of range"))?
            }
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_tokens == 0 {
            return Err(SettingsError::invalid("max_tokens", "must be greater than 0"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(SettingsError::invalid("temperature", "must be within [0, 2]"));
        }
        if self.rate_window_secs == 0 {
            return Err(SettingsError::invalid("rate_window_secs", "must be greater than 0"));
        }
        if self.timeout_secs == 0 {
            return Err(SettingsError::invalid("timeout_secs", "must be greater than 0"));
        }
        if self.concurrency_cap == 0 {
            return Err(SettingsError::invalid("concurrency_cap", "must be greater than 0"));
        }
        if !(1..=MAX_CLEANUP_DAYS).contains(&self.cleanup_days) {
            return Err(SettingsError::invalid(
                "cleanup_days",
                format!("must be within [1, {MAX_CLEANUP_DAYS}]"),
            ));
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(SettingsError::invalid(
                "log_level",
                format!("expected one of {}", LOG_LEVELS.join(", ")),
            ));
        }
        if !(-720..=840).contains(&self.utc_offset_minutes) {
            return Err(SettingsError::invalid(
                "utc_offset_minutes",
                "must be within [-720, 840]",
            ));
        }
        Ok(())
    }

    /// Apply `updates` to a copy of `self`. All-or-nothing.
    ///
    /// Returns the new settings together with the coerced values, ready to be
    /// persisted.
    pub fn apply_updates(&self, updates: &SettingsMap) -> Result<(Self, SettingsMap), SettingsError> {
        let mut next = self.clone();
        for (key, value) in updates {
            next.set(key, value)?;
        }
        next.validate()?;

        let full = next.to_map();
        let normalized = updates
            .keys()
            .filter_map(|k| full.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        Ok((next, normalized))
    }

    /// Build settings from persisted values, skipping anything unusable.
    pub fn from_stored(stored: &SettingsMap) -> Self {
        let mut settings = Self::default();
        for (key, value) in stored {
            let mut candidate = settings.clone();
            match candidate.set(key, value).and_then(|_| candidate.validate()) {
                Ok(()) => settings = candidate,
                Err(e) => tracing::warn!(key = %key, error = %e, "ignoring stored setting"),
            }
        }
        settings
    }

    pub fn to_map(&self) -> SettingsMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => SettingsMap::new(),
        }
    }

    /// The configured timezone for calendar-day aggregation.
    pub fn timezone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

// ---------------------------------------------------------------------------
// SettingsStore
// ---------------------------------------------------------------------------

/// Persisted settings with serialized writers.
pub struct SettingsStore {
    store: Arc<dyn Store>,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Current settings. Falls back to defaults when the store is unreadable.
    pub async fn current(&self) -> SystemSettings {
        match self.store.load_settings().await {
            Ok(stored) => SystemSettings::from_stored(&stored),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load settings, using defaults");
                SystemSettings::default()
            }
        }
    }

    pub async fn save(&self, updates: &SettingsMap) -> Result<SystemSettings, SettingsError> {
        let _guard = self.write_lock.lock().await;
        let stored = self.store.load_settings().await?;
        let current = SystemSettings::from_stored(&stored);
        let (next, normalized) = current.apply_updates(updates)?;
        self.store.upsert_settings(&normalized).await?;
        tracing::info!(keys = normalized.len(), "system settings updated");
        Ok(next)
    }
}
