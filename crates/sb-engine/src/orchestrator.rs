//! Task orchestration.
//!
//! [`TaskOrchestrator::execute`] validates a request, resolves an ordered
//! candidate list from the [`ProviderRegistry`], and walks it strictly in
//! order: each candidate must pass its rate budget, is called once under its
//! timeout, and either returns the result or hands over to the next one.
//! Every attempt that reaches a provider produces one usage record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sb_core::settings::SystemSettings;
use sb_core::types::{
    LogLevel, ProviderConfig, TaskRequest, TaskResult, UsageRecord, ValidationError, NO_PROVIDER,
};
use sb_harness::provider::{CallRequest, ClientSet, ProviderError, ProviderResponse};
use sb_harness::rate_limiter::RateLimiter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{ProviderRegistry, RegistryError};
use crate::usage::UsageRecorder;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Coarse classification surfaced to callers and in envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The caller sent something unacceptable.
    Client,
    /// Providers were tried and none succeeded.
    Provider,
    /// Nothing could be tried with the current setup.
    Configuration,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] ValidationError),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("no providers available")]
    NoProvidersAvailable,
    #[error("all providers failed after {attempts} attempt(s): {last_error}")]
    AllProvidersFailed { attempts: usize, last_error: String },
    #[error("task cancelled")]
    Cancelled,
    #[error("provider registry unavailable: {0}")]
    Registry(String),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::InvalidInput(_) | TaskError::Cancelled => ErrorKind::Client,
            TaskError::AllProvidersFailed { .. } => ErrorKind::Provider,
            TaskError::ProviderUnavailable(_)
            | TaskError::NoProvidersAvailable
            | TaskError::Registry(_) => ErrorKind::Configuration,
        }
    }
}

impl From<RegistryError> for TaskError {
    fn from(e: RegistryError) -> Self {
        TaskError::Registry(e.to_string())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// TaskOrchestrator
// ---------------------------------------------------------------------------

pub struct TaskOrchestrator {
    registry: Arc<ProviderRegistry>,
    clients: ClientSet,
    recorder: Arc<UsageRecorder>,
    limiter: Arc<RateLimiter>,
}

enum Attempt {
    Done(Result<ProviderResponse, ProviderError>),
    Cancelled,
}

impl TaskOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        clients: ClientSet,
        recorder: Arc<UsageRecorder>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            registry,
            clients,
            recorder,
            limiter,
        }
    }

    /// Pick up runtime settings that affect execution.
    pub fn apply_settings(&self, settings: &SystemSettings) {
        self.limiter
            .set_window(Duration::from_secs(settings.rate_window_secs));
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    async fn select_candidates(
        &self,
        request: &TaskRequest,
    ) -> Result<Vec<ProviderConfig>, TaskError> {
        match request.options.provider_hint.as_deref() {
            Some(hint) => match self.registry.hinted(hint).await? {
                Some(p) => Ok(vec![p]),
                None => Err(TaskError::ProviderUnavailable(hint.to_string())),
            },
            None => {
                let candidates = self.registry.candidates().await?;
                if candidates.is_empty() {
                    Err(TaskError::NoProvidersAvailable)
                } else {
                    Ok(candidates)
                }
            }
        }
    }

    /// Run `request` against the first provider that succeeds.
    pub async fn execute(
        &self,
        request: TaskRequest,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, TaskError> {
        let task_type = request.task_type;

        if let Err(e) = request.validate() {
            self.recorder
                .log(LogLevel::Warning, format!("rejected {task_type} task: {e}"), None)
                .await;
            return Err(TaskError::InvalidInput(e));
        }
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let candidates = match self.select_candidates(&request).await {
            Ok(c) => c,
            Err(e) => {
                warn!(task_type = %task_type, error = %e, "no candidate provider");
                self.recorder
                    .record(&UsageRecord::failure(task_type, NO_PROVIDER, 0, e.to_string()))
                    .await;
                self.recorder
                    .log(LogLevel::Error, format!("{task_type} task failed: {e}"), None)
                    .await;
                return Err(e);
            }
        };

        let call = CallRequest {
            prompt: request.input.prompt.clone(),
            system: request.input.system.clone(),
            max_tokens: request.options.max_tokens,
            temperature: request.options.temperature,
            stream: request.options.stream,
        };

        let mut attempts = 0usize;
        let mut last_error: Option<String> = None;

        for provider in candidates {
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            if let Err(e) = self.limiter.try_acquire(&provider.name, provider.rate_limit) {
                warn!(provider = %provider.name, "rate limit exhausted, trying next provider");
                self.recorder
                    .log(
                        LogLevel::Warning,
                        format!("rate_limited: skipped {} ({e})", provider.name),
                        Some(&provider.name),
                    )
                    .await;
                last_error = Some(e.to_string());
                continue;
            }

            attempts += 1;
            let client = self.clients.resolve(&provider.name);
            let started = Instant::now();
            debug!(provider = %provider.name, task_type = %task_type, "calling provider");

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => Attempt::Cancelled,
                r = tokio::time::timeout(provider.timeout(), client.call(&provider, &call)) => {
                    Attempt::Done(r.unwrap_or(Err(ProviderError::Timeout(provider.timeout_secs))))
                }
            };
            let response_time_ms = elapsed_ms(started);

            match attempt {
                Attempt::Done(Ok(response)) => {
                    let record = UsageRecord::success(task_type, &provider.name, response_time_ms)
                        .with_cost(response.cost, response.tokens_used);
                    self.recorder.record(&record).await;
                    self.registry
                        .record_outcome(&provider.name, true, record.cost, response_time_ms)
                        .await;
                    info!(
                        provider = %provider.name,
                        task_type = %task_type,
                        response_time_ms,
                        "task completed"
                    );
                    return Ok(TaskResult {
                        content: response.content,
                        provider_used: provider.name,
                        tokens_used: response.tokens_used,
                        cost: response.cost,
                        response_time_ms,
                        task_type,
                    });
                }
                Attempt::Done(Err(e)) => {
                    warn!(provider = %provider.name, error = %e, "provider call failed, trying next provider");
                    self.recorder
                        .record(&UsageRecord::failure(
                            task_type,
                            &provider.name,
                            response_time_ms,
                            e.to_string(),
                        ))
                        .await;
                    self.recorder
                        .log(
                            LogLevel::Error,
                            format!("{} failed: {e}", provider.name),
                            Some(&provider.name),
                        )
                        .await;
                    self.registry
                        .record_outcome(&provider.name, false, 0.0, response_time_ms)
                        .await;
                    last_error = Some(e.to_string());
                }
                Attempt::Cancelled => {
                    self.recorder
                        .record(&UsageRecord::failure(
                            task_type,
                            &provider.name,
                            response_time_ms,
                            "cancelled",
                        ))
                        .await;
                    self.registry
                        .record_outcome(&provider.name, false, 0.0, response_time_ms)
                        .await;
                    info!(provider = %provider.name, "task cancelled mid-call");
                    return Err(TaskError::Cancelled);
                }
            }
        }

        let err = TaskError::AllProvidersFailed {
            attempts,
            last_error: last_error.unwrap_or_else(|| "no provider was attempted".into()),
        };
        self.recorder
            .record(&UsageRecord::failure(task_type, NO_PROVIDER, 0, err.to_string()))
            .await;
        warn!(task_type = %task_type, error = %err, "task failed");
        Err(err)
    }
}
