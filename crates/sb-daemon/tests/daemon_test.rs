use std::sync::Arc;
use std::time::Duration;

use sb_core::config::{Config, StorageBackend};
use sb_daemon::daemon::{open_store, Daemon};
use sb_harness::provider::ClientSet;
use serde_json::{json, Value};

fn sqlite_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Sqlite;
    config.storage.path = dir.path().join("switchboard.db").display().to_string();
    config
}

#[tokio::test]
async fn daemon_serves_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Arc::new(Daemon::new(sqlite_config(&dir), ClientSet::new()).await.unwrap());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.run_with_listener(listener).await })
    };

    let resp = reqwest::get(format!("http://{addr}/api/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["components"]["database"]["level"], "healthy");

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/command"))
        .json(&json!({"action": "get_providers"}))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert!(body["data"].as_array().unwrap().iter().any(|p| p["name"] == "ollama"));

    daemon.shutdown();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("daemon should stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn open_store_honours_backend() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&sqlite_config(&dir)).await.unwrap();
    assert!(store.missing_tables().await.unwrap().is_empty());
    assert!(dir.path().join("switchboard.db").exists());

    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    let store = open_store(&config).await.unwrap();
    assert!(store.list_providers().await.unwrap().is_empty());
}

#[tokio::test]
async fn dev_token_endpoint_follows_security_config() {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    config.security.require_csrf = false;
    let daemon = Arc::new(Daemon::new(config, ClientSet::new()).await.unwrap());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.run_with_listener(listener).await })
    };

    let resp = reqwest::get(format!("http://{addr}/api/session/csrf")).await.unwrap();
    assert_eq!(resp.status(), 200);

    daemon.shutdown();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("daemon should stop")
        .unwrap()
        .unwrap();
}
