use std::sync::Arc;

use async_trait::async_trait;
use sb_bridge::{CommandBus, Envelope};
use sb_core::store::{MemoryStore, SettingsMap, Store};
use sb_core::types::{LogLevel, ProviderConfig};
use sb_engine::ErrorKind;
use sb_harness::provider::{CallRequest, ClientSet, ProviderClient, ProviderError, ProviderResponse};
use serde_json::{json, Value};

const SESSION: &str = "0123456789abcdef0123456789abcdef";

struct EchoClient;

#[async_trait]
impl ProviderClient for EchoClient {
    async fn call(
        &self,
        _provider: &ProviderConfig,
        request: &CallRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            content: format!("echo: {}", request.prompt),
            tokens_used: Some(7),
            cost: Some(0.001),
        })
    }

    fn name(&self) -> &str {
        "echo"
    }
}

struct BrokenClient;

#[async_trait]
impl ProviderClient for BrokenClient {
    async fn call(
        &self,
        _provider: &ProviderConfig,
        _request: &CallRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::Api("HTTP 500".into()))
    }

    fn name(&self) -> &str {
        "broken"
    }
}

async fn setup() -> (CommandBus, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let clients = ClientSet::new()
        .with_client("openai", Arc::new(EchoClient))
        .with_client("anthropic", Arc::new(BrokenClient));
    let bus = CommandBus::wire(store.clone(), clients).await;
    (bus, store)
}

fn params(value: Value) -> SettingsMap {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

async fn secured(bus: &CommandBus, action: &str, value: Value) -> Envelope {
    bus.dispatch(action, params(value), SESSION, SESSION).await
}

async fn enable(bus: &CommandBus, name: &str, priority: i32) {
    let env = secured(
        bus,
        "save_provider_config",
        json!({"name": name, "api_key": "sk-test-0123456789", "enabled": true, "priority": priority}),
    )
    .await;
    assert!(env.success, "enable {name}: {:?}", env.error);
}

// -- CSRF gate --

#[tokio::test]
async fn read_only_action_needs_no_token() {
    let (bus, _store) = setup().await;
    let env = bus.dispatch("get_stats", SettingsMap::new(), "", "").await;
    assert!(env.success);
    assert_eq!(env.data.unwrap()["requests_today"], 0);
}

#[tokio::test]
async fn mutating_action_without_token_changes_nothing() {
    let (bus, store) = setup().await;
    let env = bus
        .dispatch(
            "save_provider_config",
            params(json!({"name": "openai", "enabled": true})),
            SESSION,
            "",
        )
        .await;

    assert!(!env.success);
    assert_eq!(env.error.as_deref(), Some("security check failed"));
    assert_eq!(env.error_kind, Some(ErrorKind::Client));
    assert!(store.get_provider("openai").await.unwrap().is_none());
    assert!(store.recent_logs(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn mismatched_token_is_rejected() {
    let (bus, store) = setup().await;
    let env = bus
        .dispatch(
            "save_settings",
            params(json!({"max_tokens": 50})),
            SESSION,
            "ffffffffffffffffffffffffffffffff",
        )
        .await;
    assert!(!env.success);
    assert_eq!(env.error.as_deref(), Some("security check failed"));
    assert!(store.load_settings().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_action_is_reported_before_csrf() {
    let (bus, _store) = setup().await;
    let env = bus.dispatch("drop_everything", SettingsMap::new(), "", "").await;
    assert!(!env.success);
    assert_eq!(env.error.as_deref(), Some("unknown action"));
}

// -- Providers --

#[tokio::test]
async fn saved_provider_is_listed_with_masked_key() {
    let (bus, _store) = setup().await;
    enable(&bus, "openai", 1).await;

    let env = bus.dispatch("get_providers", SettingsMap::new(), "", "").await;
    let list = env.data.unwrap();
    let openai = list
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["name"] == "openai")
        .cloned()
        .unwrap();
    assert_eq!(openai["enabled"], true);
    assert_eq!(openai["api_key"], "sk-t...6789");
    assert!(!list.to_string().contains("sk-test-0123456789"));
}

#[tokio::test]
async fn save_provider_requires_a_name() {
    let (bus, store) = setup().await;
    let env = secured(&bus, "save_provider_config", json!({"enabled": true})).await;
    assert!(!env.success);
    assert_eq!(env.error_kind, Some(ErrorKind::Client));

    let logs = store.recent_logs(Some(LogLevel::Warning), 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].message.starts_with("save_provider_config failed"));
}

#[tokio::test]
async fn save_provider_rejects_unknown_fields() {
    let (bus, _store) = setup().await;
    let env = secured(
        &bus,
        "save_provider_config",
        json!({"name": "openai", "colour": "blue"}),
    )
    .await;
    assert!(!env.success);
    assert_eq!(env.error_kind, Some(ErrorKind::Client));
}

// -- Tasks --

#[tokio::test]
async fn execute_task_uses_enabled_provider_and_logs() {
    let (bus, store) = setup().await;
    enable(&bus, "openai", 1).await;

    let env = secured(
        &bus,
        "execute_task",
        json!({"task_type": "summarization", "input": {"prompt": "long text"}}),
    )
    .await;
    assert!(env.success, "{:?}", env.error);
    let data = env.data.unwrap();
    assert_eq!(data["provider_used"], "openai");
    assert_eq!(data["content"], "echo: long text");
    assert_eq!(data["tokens_used"], 7);

    let logs = store.recent_logs(Some(LogLevel::Info), 1).await.unwrap();
    assert_eq!(logs[0].provider.as_deref(), Some("openai"));
    assert!(logs[0].message.starts_with("execute_task succeeded"));

    let stats = bus.dispatch("get_stats", SettingsMap::new(), "", "").await;
    assert_eq!(stats.data.unwrap()["requests_today"], 1);
}

#[tokio::test]
async fn execute_task_falls_back_past_failing_provider() {
    let (bus, _store) = setup().await;
    enable(&bus, "anthropic", 1).await;
    enable(&bus, "openai", 2).await;

    let env = secured(
        &bus,
        "execute_task",
        json!({"task_type": "text_generation", "input": {"prompt": "hi"}}),
    )
    .await;
    assert!(env.success);
    assert_eq!(env.data.unwrap()["provider_used"], "openai");

    let analytics = bus
        .dispatch("get_analytics", params(json!({"days": 1})), "", "")
        .await
        .data
        .unwrap();
    assert_eq!(analytics["total_requests"], 2);
    assert_eq!(analytics["total_failures"], 1);
}

#[tokio::test]
async fn execute_task_without_providers_is_a_configuration_error() {
    let (bus, store) = setup().await;
    let env = secured(
        &bus,
        "execute_task",
        json!({"task_type": "translation", "input": {"prompt": "bonjour"}}),
    )
    .await;
    assert!(!env.success);
    assert_eq!(env.error_kind, Some(ErrorKind::Configuration));
    assert_eq!(env.error.as_deref(), Some("no providers available"));

    let errors = store.recent_logs(Some(LogLevel::Error), 10).await.unwrap();
    assert!(errors.iter().any(|e| e.message.starts_with("execute_task failed")));
}

#[tokio::test]
async fn blank_prompt_is_a_client_error() {
    let (bus, _store) = setup().await;
    enable(&bus, "openai", 1).await;
    let env = secured(
        &bus,
        "execute_task",
        json!({"task_type": "text_generation", "input": {"prompt": "   "}}),
    )
    .await;
    assert!(!env.success);
    assert_eq!(env.error_kind, Some(ErrorKind::Client));
}

#[tokio::test]
async fn test_provider_reports_failure_for_broken_provider() {
    let (bus, _store) = setup().await;
    enable(&bus, "anthropic", 1).await;

    let env = secured(&bus, "test_provider", json!({"name": "anthropic"})).await;
    assert!(!env.success);
    assert_eq!(env.error_kind, Some(ErrorKind::Provider));

    enable(&bus, "openai", 2).await;
    let env = secured(&bus, "test_provider", json!({"name": "openai"})).await;
    assert!(env.success);
    assert_eq!(env.data.unwrap()["provider"], "openai");
}

// -- Settings --

#[tokio::test]
async fn save_settings_round_trips_through_get_settings() {
    let (bus, _store) = setup().await;
    let env = secured(&bus, "save_settings", json!({"max_tokens": "250", "cache_enabled": "false"})).await;
    assert!(env.success, "{:?}", env.error);

    let current = bus.dispatch("get_settings", SettingsMap::new(), "", "").await;
    let data = current.data.unwrap();
    assert_eq!(data["max_tokens"], 250);
    assert_eq!(data["cache_enabled"], false);
}

#[tokio::test]
async fn invalid_settings_are_rejected_whole() {
    let (bus, _store) = setup().await;
    let env = secured(&bus, "save_settings", json!({"max_tokens": 300, "temperature": 9.5})).await;
    assert!(!env.success);
    assert_eq!(env.error_kind, Some(ErrorKind::Client));

    let data = bus
        .dispatch("get_settings", SettingsMap::new(), "", "")
        .await
        .data
        .unwrap();
    assert_eq!(data["max_tokens"], 1000);
}

// -- Reads --

#[tokio::test]
async fn chart_data_rejects_unknown_kind() {
    let (bus, _store) = setup().await;
    let env = bus
        .dispatch("get_chart_data", params(json!({"kind": "latency"})), "", "")
        .await;
    assert!(!env.success);
    assert_eq!(env.error_kind, Some(ErrorKind::Client));

    let env = bus
        .dispatch("get_chart_data", params(json!({"kind": "errors", "days": 3})), "", "")
        .await;
    let data = env.data.unwrap();
    assert_eq!(data["labels"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn status_and_health_on_empty_store() {
    let (bus, _store) = setup().await;
    let status = bus.dispatch("get_status", SettingsMap::new(), "", "").await.data.unwrap();
    assert_eq!(status["status"], "healthy");
    assert_eq!(status["enabled_providers"], 0);

    let health = bus.dispatch("get_health", SettingsMap::new(), "", "").await.data.unwrap();
    assert_eq!(health["components"]["database"]["level"], "healthy");
    assert_eq!(health["components"]["providers"]["level"], "warning");
}

#[tokio::test]
async fn activity_feed_is_newest_first() {
    let (bus, _store) = setup().await;
    enable(&bus, "openai", 1).await;
    secured(&bus, "save_settings", json!({"log_level": "debug"})).await;

    let feed = bus
        .dispatch("get_activity", params(json!({"limit": 5})), "", "")
        .await
        .data
        .unwrap();
    let feed = feed.as_array().unwrap();
    assert_eq!(feed.len(), 2);
    assert!(feed[0]["message"].as_str().unwrap().starts_with("save_settings"));
}
