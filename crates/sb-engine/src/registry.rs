//! Provider registry.
//!
//! Persisted provider configurations are merged with a built-in catalog of
//! known vendors. Writes for the same provider name are serialized through a
//! per-name async mutex. There is no registry-wide lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sb_core::settings::SettingsStore;
use sb_core::store::{Store, StoreError};
use sb_core::types::{ApiKey, ProviderConfig, ProviderStats};
use sb_harness::security::ApiKeyValidator;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// A vendor the admin surface knows about before it is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub display_name: &'static str,
    pub icon: &'static str,
    pub default_endpoint: &'static str,
    pub default_model: &'static str,
    pub requires_api_key: bool,
}

pub fn default_catalog() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry {
            name: "openai",
            display_name: "OpenAI",
            icon: "openai",
            default_endpoint: "https://api.openai.com/v1",
            default_model: "gpt-4o-mini",
            requires_api_key: true,
        },
        CatalogEntry {
            name: "anthropic",
            display_name: "Anthropic",
            icon: "anthropic",
            default_endpoint: "https://api.anthropic.com/v1",
            default_model: "claude-sonnet-4-20250514",
            requires_api_key: true,
        },
        CatalogEntry {
            name: "google",
            display_name: "Google Gemini",
            icon: "google",
            default_endpoint: "https://generativelanguage.googleapis.com/v1beta",
            default_model: "gemini-1.5-flash",
            requires_api_key: true,
        },
        CatalogEntry {
            name: "mistral",
            display_name: "Mistral AI",
            icon: "mistral",
            default_endpoint: "https://api.mistral.ai/v1",
            default_model: "mistral-small-latest",
            requires_api_key: true,
        },
        CatalogEntry {
            name: "ollama",
            display_name: "Ollama (local)",
            icon: "ollama",
            default_endpoint: "http://127.0.0.1:11434",
            default_model: "llama3.1",
            requires_api_key: false,
        },
    ]
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("provider `{0}` not found")]
    NotFound(String),
    #[error("invalid provider name `{0}`")]
    InvalidName(String),
    #[error("invalid provider update: {0}")]
    InvalidUpdate(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    pub fn is_client_error(&self) -> bool {
        !matches!(self, RegistryError::Store(_))
    }
}

// ---------------------------------------------------------------------------
// Update / view
// ---------------------------------------------------------------------------

/// Fields an admin may change. Absent fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderUpdate {
    pub display_name: Option<String>,
    pub api_key: Option<String>,
    pub api_endpoint: Option<String>,
    pub model: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
    pub rate_limit: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub settings: Option<BTreeMap<String, String>>,
}

impl ProviderUpdate {
    fn apply(self, provider: &mut ProviderConfig) {
        if let Some(v) = self.display_name {
            provider.display_name = v;
        }
        if let Some(v) = self.api_key {
            provider.api_key = ApiKey::new(v.trim());
        }
        if let Some(v) = self.api_endpoint {
            provider.api_endpoint = v;
        }
        if let Some(v) = self.model {
            provider.model = v;
        }
        if let Some(v) = self.enabled {
            provider.enabled = v;
        }
        if let Some(v) = self.priority {
            provider.priority = v;
        }
        if let Some(v) = self.rate_limit {
            provider.rate_limit = v;
        }
        if let Some(v) = self.timeout_secs {
            provider.timeout_secs = v;
        }
        if let Some(v) = self.settings {
            provider.settings = v;
        }
    }
}

/// Read-surface projection of a provider. The credential is masked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderView {
    pub name: String,
    pub display_name: String,
    pub icon: Option<String>,
    pub api_key: String,
    pub configured: bool,
    pub requires_api_key: bool,
    pub api_endpoint: String,
    pub model: String,
    pub enabled: bool,
    pub priority: i32,
    pub rate_limit: u32,
    pub timeout_secs: u64,
    pub settings: BTreeMap<String, String>,
    pub stats: ProviderStats,
    pub persisted: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// ProviderRegistry
// ---------------------------------------------------------------------------

pub struct ProviderRegistry {
    store: Arc<dyn Store>,
    catalog: Vec<CatalogEntry>,
    settings: Option<Arc<SettingsStore>>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    validator: ApiKeyValidator,
}

impl ProviderRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            catalog: default_catalog(),
            settings: None,
            key_locks: DashMap::new(),
            validator: ApiKeyValidator::new(),
        }
    }

    /// Source default budgets for new providers from system settings.
    pub fn with_settings(mut self, settings: Arc<SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn catalog_entry(&self, name: &str) -> Option<&CatalogEntry> {
        self.catalog.iter().find(|e| e.name == name)
    }

    /// Whether the orchestrator may route work to `provider`.
    ///
    /// A provider needs a persisted credential unless its catalog entry is a
    /// keyless local runner.
    pub fn is_selectable(&self, provider: &ProviderConfig) -> bool {
        if !provider.api_key.is_empty() {
            return true;
        }
        self.catalog_entry(&provider.name)
            .is_some_and(|e| !e.requires_api_key)
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    async fn new_provider(&self, name: &str) -> ProviderConfig {
        let mut provider = ProviderConfig::new(name);
        if let Some(entry) = self.catalog_entry(name) {
            provider.display_name = entry.display_name.to_string();
            provider.api_endpoint = entry.default_endpoint.to_string();
            provider.model = entry.default_model.to_string();
        }
        if let Some(settings) = &self.settings {
            let current = settings.current().await;
            provider.rate_limit = current.rate_limit;
            provider.timeout_secs = current.timeout_secs;
        }
        provider
    }

    fn validate_name(name: &str) -> Result<(), RegistryError> {
        let ok = !name.is_empty()
            && name.len() <= 64
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if ok {
            Ok(())
        } else {
            Err(RegistryError::InvalidName(name.to_string()))
        }
    }

    fn validate_update(&self, update: &ProviderUpdate) -> Result<(), RegistryError> {
        if let Some(key) = &update.api_key {
            let key = key.trim();
            if !key.is_empty() {
                self.validator
                    .validate(key)
                    .map_err(|e| RegistryError::InvalidUpdate(e.to_string()))?;
            }
        }
        if update.timeout_secs == Some(0) {
            return Err(RegistryError::InvalidUpdate(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if let Some(endpoint) = &update.api_endpoint {
            if !endpoint.is_empty()
                && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
            {
                return Err(RegistryError::InvalidUpdate(format!(
                    "api_endpoint `{endpoint}` must be an http(s) URL"
                )));
            }
        }
        Ok(())
    }

    /// Create or update the provider called `name`.
    pub async fn upsert(
        &self,
        name: &str,
        update: ProviderUpdate,
    ) -> Result<ProviderConfig, RegistryError> {
        Self::validate_name(name)?;
        self.validate_update(&update)?;

        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let mut provider = match self.store.get_provider(name).await? {
            Some(existing) => existing,
            None => self.new_provider(name).await,
        };
        update.apply(&mut provider);
        provider.updated_at = Utc::now();
        self.store.upsert_provider(&provider).await?;

        tracing::info!(
            provider = %provider.name,
            enabled = provider.enabled,
            priority = provider.priority,
            api_key = %provider.api_key.masked(),
            "provider config saved"
        );
        Ok(provider)
    }

    fn view(&self, provider: Option<&ProviderConfig>, entry: Option<&CatalogEntry>) -> Option<ProviderView> {
        let requires_api_key = entry.is_none_or(|e| e.requires_api_key);
        let icon = entry.map(|e| e.icon.to_string());
        match (provider, entry) {
            (Some(p), _) => Some(ProviderView {
                name: p.name.clone(),
                display_name: p.display_name.clone(),
                icon,
                api_key: p.api_key.masked(),
                configured: self.is_selectable(p),
                requires_api_key,
                api_endpoint: p.api_endpoint.clone(),
                model: p.model.clone(),
                enabled: p.enabled,
                priority: p.priority,
                rate_limit: p.rate_limit,
                timeout_secs: p.timeout_secs,
                settings: p.settings.clone(),
                stats: p.stats.clone(),
                persisted: true,
                created_at: Some(p.created_at),
                updated_at: Some(p.updated_at),
            }),
            (None, Some(e)) => {
                let defaults = ProviderConfig::new(e.name);
                Some(ProviderView {
                    name: e.name.to_string(),
                    display_name: e.display_name.to_string(),
                    icon,
                    api_key: String::new(),
                    configured: false,
                    requires_api_key,
                    api_endpoint: e.default_endpoint.to_string(),
                    model: e.default_model.to_string(),
                    enabled: false,
                    priority: defaults.priority,
                    rate_limit: defaults.rate_limit,
                    timeout_secs: defaults.timeout_secs,
                    settings: BTreeMap::new(),
                    stats: ProviderStats::default(),
                    persisted: false,
                    created_at: None,
                    updated_at: None,
                })
            }
            (None, None) => None,
        }
    }

    /// Persisted providers merged with the catalog, in candidate order.
    pub async fn list(&self) -> Result<Vec<ProviderView>, RegistryError> {
        let persisted = self.store.list_providers().await?;
        let mut views: Vec<ProviderView> = persisted
            .iter()
            .filter_map(|p| self.view(Some(p), self.catalog_entry(&p.name)))
            .collect();
        for entry in &self.catalog {
            if !persisted.iter().any(|p| p.name == entry.name) {
                views.extend(self.view(None, Some(entry)));
            }
        }
        views.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(views)
    }

    pub async fn get(&self, name: &str) -> Result<ProviderView, RegistryError> {
        let persisted = self.store.get_provider(name).await?;
        self.view(persisted.as_ref(), self.catalog_entry(name))
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Persisted, enabled and selectable providers by `(priority, name)`.
    pub async fn candidates(&self) -> Result<Vec<ProviderConfig>, RegistryError> {
        let mut providers: Vec<ProviderConfig> = self
            .store
            .list_providers()
            .await?
            .into_iter()
            .filter(|p| p.enabled && self.is_selectable(p))
            .collect();
        providers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(providers)
    }

    /// The hinted provider, if it is persisted, enabled and selectable.
    pub async fn hinted(&self, name: &str) -> Result<Option<ProviderConfig>, RegistryError> {
        Ok(self
            .store
            .get_provider(name)
            .await?
            .filter(|p| p.enabled && self.is_selectable(p)))
    }

    pub async fn enabled_count(&self) -> Result<usize, RegistryError> {
        Ok(self
            .store
            .list_providers()
            .await?
            .iter()
            .filter(|p| p.enabled)
            .count())
    }

    /// Fold one attempt into the provider's rolling stats. Never fails.
    pub async fn record_outcome(&self, name: &str, success: bool, cost: f64, response_time_ms: u64) {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        if let Err(e) = self
            .persist_outcome(name, success, cost, response_time_ms)
            .await
        {
            tracing::warn!(provider = %name, error = %e, "failed to persist provider stats");
        }
    }

    async fn persist_outcome(
        &self,
        name: &str,
        success: bool,
        cost: f64,
        response_time_ms: u64,
    ) -> Result<(), StoreError> {
        let Some(mut provider) = self.store.get_provider(name).await? else {
            return Ok(());
        };
        provider.stats.record(success, cost, response_time_ms, Utc::now());
        self.store.upsert_provider(&provider).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_core::store::MemoryStore;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn keyed(priority: i32) -> ProviderUpdate {
        ProviderUpdate {
            api_key: Some("sk-test-0123456789".into()),
            enabled: Some(true),
            priority: Some(priority),
            ..Default::default()
        }
    }

    // -- Upsert --

    #[tokio::test]
    async fn upsert_creates_with_catalog_defaults() {
        let reg = registry();
        let p = reg.upsert("anthropic", keyed(1)).await.unwrap();
        assert_eq!(p.display_name, "Anthropic");
        assert_eq!(p.api_endpoint, "https://api.anthropic.com/v1");
        assert!(p.enabled);
    }

    #[tokio::test]
    async fn upsert_keeps_unsupplied_fields() {
        let reg = registry();
        reg.upsert("openai", keyed(3)).await.unwrap();
        let p = reg
            .upsert(
                "openai",
                ProviderUpdate {
                    model: Some("gpt-4o".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(p.model, "gpt-4o");
        assert_eq!(p.priority, 3);
        assert_eq!(p.api_key.expose(), "sk-test-0123456789");
    }

    #[tokio::test]
    async fn upsert_twice_is_idempotent_except_updated_at() {
        let reg = registry();
        let first = reg.upsert("mistral", keyed(2)).await.unwrap();
        let second = reg.upsert("mistral", keyed(2)).await.unwrap();

        assert!(second.updated_at >= first.updated_at);
        let mut normalized = second.clone();
        normalized.updated_at = first.updated_at;
        assert_eq!(normalized, first);
    }

    #[tokio::test]
    async fn upsert_rejects_bad_input() {
        let reg = registry();
        assert!(matches!(
            reg.upsert("Open AI", ProviderUpdate::default()).await,
            Err(RegistryError::InvalidName(_))
        ));
        let bad_key = ProviderUpdate {
            api_key: Some("short".into()),
            ..Default::default()
        };
        assert!(matches!(
            reg.upsert("openai", bad_key).await,
            Err(RegistryError::InvalidUpdate(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_to_one_name_are_not_lost() {
        const OUTCOMES: usize = 48;
        let reg = Arc::new(registry());
        reg.upsert("relay", keyed(1)).await.unwrap();

        let updates = vec![
            ProviderUpdate {
                display_name: Some("Relay".into()),
                ..Default::default()
            },
            ProviderUpdate {
                model: Some("relay-large".into()),
                ..Default::default()
            },
            ProviderUpdate {
                api_endpoint: Some("https://relay.internal/v1".into()),
                ..Default::default()
            },
            ProviderUpdate {
                rate_limit: Some(120),
                ..Default::default()
            },
            ProviderUpdate {
                timeout_secs: Some(45),
                ..Default::default()
            },
        ];

        let mut handles = Vec::new();
        let mut pending = updates.into_iter();
        for i in 0..OUTCOMES {
            let r = reg.clone();
            handles.push(tokio::spawn(async move {
                r.record_outcome("relay", i % 3 != 0, 0.01, 100).await;
            }));
            if i % 8 == 0 {
                if let Some(update) = pending.next() {
                    let r = reg.clone();
                    handles.push(tokio::spawn(async move {
                        r.upsert("relay", update).await.unwrap();
                    }));
                }
            }
        }
        for h in handles {
            h.await.unwrap();
        }

        let stored = reg.store.get_provider("relay").await.unwrap().unwrap();
        assert_eq!(stored.stats.total_requests, OUTCOMES as u64);
        assert_eq!(stored.stats.total_successes, 32);
        assert_eq!(stored.display_name, "Relay");
        assert_eq!(stored.model, "relay-large");
        assert_eq!(stored.api_endpoint, "https://relay.internal/v1");
        assert_eq!(stored.rate_limit, 120);
        assert_eq!(stored.timeout_secs, 45);
        assert_eq!(stored.priority, 1);
        assert!(stored.enabled);
    }

    #[test]
    fn update_rejects_unknown_fields() {
        let parsed: Result<ProviderUpdate, _> =
            serde_json::from_value(serde_json::json!({"enabled": true, "colour": "red"}));
        assert!(parsed.is_err());
    }

    // -- Read surfaces --

    #[tokio::test]
    async fn list_merges_catalog_and_masks_keys() {
        let reg = registry();
        reg.upsert("openai", keyed(1)).await.unwrap();
        reg.upsert("custom-llm", keyed(5)).await.unwrap();

        let views = reg.list().await.unwrap();
        assert_eq!(views.len(), 6);
        let openai = views.iter().find(|v| v.name == "openai").unwrap();
        assert!(openai.persisted);
        assert_eq!(openai.api_key, "sk-t...6789");
        let google = views.iter().find(|v| v.name == "google").unwrap();
        assert!(!google.persisted);
        assert!(!google.configured);
    }

    #[tokio::test]
    async fn get_outside_catalog_and_store_is_not_found() {
        let reg = registry();
        assert!(reg.get("ollama").await.is_ok());
        assert!(matches!(
            reg.get("nope").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    // -- Selection --

    #[tokio::test]
    async fn candidates_order_by_priority_then_name() {
        let reg = registry();
        reg.upsert("openai", keyed(2)).await.unwrap();
        reg.upsert("anthropic", keyed(2)).await.unwrap();
        reg.upsert("mistral", keyed(1)).await.unwrap();

        let names: Vec<String> = reg
            .candidates()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["mistral", "anthropic", "openai"]);
    }

    #[tokio::test]
    async fn keyless_only_for_local_runner() {
        let reg = registry();
        let enable = ProviderUpdate {
            enabled: Some(true),
            ..Default::default()
        };
        reg.upsert("ollama", enable.clone()).await.unwrap();
        reg.upsert("openai", enable).await.unwrap();

        let names: Vec<String> = reg
            .candidates()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["ollama"]);
        assert!(reg.hinted("openai").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_outcome_updates_stats() {
        let reg = registry();
        reg.upsert("openai", keyed(1)).await.unwrap();
        reg.record_outcome("openai", true, 0.02, 120).await;
        reg.record_outcome("openai", false, 0.0, 80).await;

        let view = reg.get("openai").await.unwrap();
        assert_eq!(view.stats.total_requests, 2);
        assert!((view.stats.success_rate - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn record_outcome_swallows_store_failure() {
        let reg = ProviderRegistry::new(Arc::new(MemoryStore::new().failing_writes()));
        reg.record_outcome("openai", true, 0.0, 10).await;
    }
}
