//! Provider client abstraction.
//!
//! A [`ProviderClient`] is the one capability the orchestrator needs from a
//! vendor integration: take a normalized [`CallRequest`] plus the persisted
//! [`ProviderConfig`] (endpoint, model, credential) and return a
//! [`ProviderResponse`] or a [`ProviderError`].
//!
//! Clients are selected by provider name at runtime through a [`ClientSet`].
//! Names without a registered client resolve to [`StubClient`], which always
//! fails with [`ProviderError::NotConfigured`]. Concrete vendor HTTP clients
//! live outside this workspace.
//!
//! # Example
//!
//! ```rust,no_run
//! use sb_harness::provider::{CallRequest, ClientSet, ProviderError};
//! use sb_core::types::ProviderConfig;
//!
//! async fn probe(clients: &ClientSet, provider: &ProviderConfig) -> Result<(), ProviderError> {
//!     let client = clients.resolve(&provider.name);
//!     let response = client.call(provider, &CallRequest::new("ping")).await?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sb_core::types::ProviderConfig;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors a provider call can end in.
///
/// Every variant is a *provider failure* from the orchestrator's point of
/// view: the attempt is recorded and the next candidate is tried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// No client is wired for this provider, or it lacks required settings.
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// The vendor answered with an error (bad request, auth, quota, ...).
    #[error("api error: {0}")]
    Api(String),

    /// The call did not finish within the provider's timeout.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// Connection-level failure before a vendor response arrived.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Vendor-neutral request handed to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    #[serde(default)]
    pub stream: bool,
}

impl CallRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens: 1000,
            temperature: 0.7,
            stream: false,
        }
    }
}

/// What a client returns on success. Vendors that do not report token usage
/// or cost leave those fields empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub cost: Option<f64>,
}

impl ProviderResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tokens_used: None,
            cost: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// One implementation per vendor, shared across concurrent calls.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Execute a single completion. Callers apply the deadline.
    async fn call(
        &self,
        provider: &ProviderConfig,
        request: &CallRequest,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Client name, used in logs.
    fn name(&self) -> &str;
}

/// Placeholder client for providers without a wired implementation.
#[derive(Debug, Default, Clone)]
pub struct StubClient;

#[async_trait]
impl ProviderClient for StubClient {
    async fn call(
        &self,
        provider: &ProviderConfig,
        _request: &CallRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "no client registered for `{}`",
            provider.name
        )))
    }

    fn name(&self) -> &str {
        "stub"
    }
}

// ---------------------------------------------------------------------------
// ClientSet
// ---------------------------------------------------------------------------

/// Provider name to client lookup.
#[derive(Clone, Default)]
pub struct ClientSet {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
    fallback: Arc<StubClient>,
}

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, provider: impl Into<String>, client: Arc<dyn ProviderClient>) -> Self {
        self.register(provider, client);
        self
    }

    pub fn register(&mut self, provider: impl Into<String>, client: Arc<dyn ProviderClient>) {
        let provider = provider.into();
        tracing::debug!(provider = %provider, client = client.name(), "registered provider client");
        self.clients.insert(provider, client);
    }

    /// The client for `provider`, or the stub when none is registered.
    pub fn resolve(&self, provider: &str) -> Arc<dyn ProviderClient> {
        match self.clients.get(provider) {
            Some(client) => Arc::clone(client),
            None => self.fallback.clone() as Arc<dyn ProviderClient>,
        }
    }

    pub fn is_registered(&self, provider: &str) -> bool {
        self.clients.contains_key(provider)
    }
}

impl std::fmt::Debug for ClientSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.clients.keys().collect();
        names.sort();
        f.debug_struct("ClientSet").field("clients", &names).finish()
    }
}
