//! Integration with Large Language Model services.
//!
//! This module provides a thin wrapper around a completion backend (any
//! OpenAI-compatible chat-completions endpoint) for answering chat turns.
//!
//! The backend trait, [`GenericLlmClient`], performs exactly one attempt per
//! call. [`LlmClient`] layers the request timeout, the retry policy, and the
//! usage bookkeeping on top of it:
//! - `Auth` and `Protocol` failures are surfaced immediately;
//! - `TransientNetwork` failures are retried with exponential backoff until
//!   `max_transient_attempts` attempts have been made;
//! - a `RateLimit` is retried once, after `Retry-After` or the cooldown; a
//!   `Retry-After` longer than the cooldown is surfaced instead of waited out;
//! - `ModelUnavailable` is retried once against the fallback model.
//!
//! Every attempt produces one [`ApiCallRecord`], whatever its outcome.

pub mod http;

use std::{
    ops::Deref,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    base::{
        config::Config,
        events::{ErrorKind, EventBus, EventKind},
        types::PromptMessage,
    },
    interaction::prompt::PromptContext,
};

// Errors.

/// Typed failures of a completion round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited by provider: {detail}")]
    RateLimit { retry_after: Option<Duration>, detail: String },

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Model `{model}` unavailable: {detail}")]
    ModelUnavailable { model: String, detail: String },

    #[error("Unexpected response: {0}")]
    Protocol(String),
}

impl CompletionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompletionError::Auth(_) => ErrorKind::Auth,
            CompletionError::RateLimit { .. } => ErrorKind::RateLimit,
            CompletionError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            CompletionError::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            CompletionError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    fn status(&self) -> CallStatus {
        match self {
            CompletionError::Auth(_) => CallStatus::AuthError,
            CompletionError::RateLimit { .. } => CallStatus::RateLimited,
            CompletionError::TransientNetwork(_) => CallStatus::TransientNetworkError,
            CompletionError::ModelUnavailable { .. } => CallStatus::ModelUnavailable,
            CompletionError::Protocol(_) => CallStatus::ProtocolError,
        }
    }
}

// Types.

/// One request to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// What the backend returns for a single successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCompletion {
    pub text: String,
    pub tokens_used: u32,
}

/// A successful completion with its accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// The model that actually answered (the fallback, if it was used).
    pub model: String,
    pub tokens_used: u32,
    /// Wall time of the whole call, retries and backoff included.
    pub latency: Duration,
    pub cost_estimate: f64,
}

/// Per-turn request options.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub model: String,
    pub fallback_model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.clone(),
            fallback_model: config.fallback_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

/// Timeout and retry limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub request_timeout: Duration,
    /// Total attempts (not retries) allowed while failures are transient.
    pub max_transient_attempts: u32,
    pub backoff: Duration,
    pub rate_limit_cooldown: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: config.request_timeout,
            max_transient_attempts: config.max_transient_attempts,
            backoff: config.retry_backoff,
            rate_limit_cooldown: config.rate_limit_cooldown,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_transient_attempts: 2,
            backoff: Duration::from_millis(500),
            rate_limit_cooldown: Duration::from_secs(60),
        }
    }
}

/// Outcome of one attempt, as recorded for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    AuthError,
    RateLimited,
    TransientNetworkError,
    ModelUnavailable,
    ProtocolError,
}

/// Bookkeeping for one attempt. Never part of conversation state.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCallRecord {
    pub request_id: Uuid,
    pub model: String,
    pub tokens_used: u32,
    pub latency: Duration,
    pub cost_estimate: f64,
    pub status: CallStatus,
}

/// Running usage totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageStats {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_errors: u64,
    pub last_latency: Duration,
    pub estimated_cost: f64,
}

impl UsageStats {
    fn record(&mut self, record: &ApiCallRecord) {
        self.total_requests += 1;
        self.total_tokens += u64::from(record.tokens_used);
        self.last_latency = record.latency;
        self.estimated_cost += record.cost_estimate;

        if record.status != CallStatus::Success {
            self.total_errors += 1;
        }
    }

    /// Percentage of attempts that succeeded; 0 before the first request.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }

        (self.total_requests - self.total_errors) as f64 / self.total_requests as f64 * 100.0
    }
}

// Traits.

/// Generic LLM client trait that backends must implement.
///
/// Implementations make a single attempt and classify its failure; they do
/// not retry, sleep, or enforce the request timeout.
#[async_trait]
pub trait GenericLlmClient: Send + Sync + 'static {
    /// Execute one chat-completion request.
    async fn execute(&self, request: &CompletionRequest) -> Result<RawCompletion, CompletionError>;

    /// Check a credential with a minimal request. Never fails; any problem is `false`.
    async fn validate_credential(&self, key: &str) -> bool;
}

// Structs.

/// LLM client for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct LlmClient {
    inner: Arc<dyn GenericLlmClient>,
    policy: RetryPolicy,
    cost_per_1k_tokens: f64,
    stats: Arc<Mutex<UsageStats>>,
    events: EventBus,
}

impl Deref for LlmClient {
    type Target = dyn GenericLlmClient;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl LlmClient {
    pub fn new(inner: Arc<dyn GenericLlmClient>, policy: RetryPolicy, cost_per_1k_tokens: f64, events: EventBus) -> Self {
        Self {
            inner,
            policy,
            cost_per_1k_tokens,
            stats: Arc::new(Mutex::new(UsageStats::default())),
            events,
        }
    }

    /// Run a completion for `context`, applying the timeout and retry policy.
    #[instrument(name = "LlmClient::complete", skip_all, fields(model = %options.model))]
    pub async fn complete(&self, context: &PromptContext, options: &CompletionOptions) -> Result<Completion, CompletionError> {
        let started = Instant::now();
        let mut request = CompletionRequest {
            model: options.model.clone(),
            messages: context.messages(),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let mut transient_failures = 0u32;
        let mut rate_limited = false;
        let mut fell_back = false;

        loop {
            let result = self.attempt(&request).await;

            match result {
                Ok(raw) => {
                    info!("Completion succeeded with `{}` ({} tokens)", request.model, raw.tokens_used);

                    return Ok(Completion {
                        text: raw.text,
                        model: request.model,
                        tokens_used: raw.tokens_used,
                        latency: started.elapsed(),
                        cost_estimate: self.cost_of(raw.tokens_used),
                    });
                }
                Err(CompletionError::TransientNetwork(detail)) => {
                    transient_failures += 1;

                    if transient_failures >= self.policy.max_transient_attempts {
                        warn!("Giving up after {transient_failures} transient failures: {detail}");
                        return Err(CompletionError::TransientNetwork(detail));
                    }

                    let delay = self.policy.backoff.saturating_mul(2u32.saturating_pow(transient_failures - 1));
                    warn!("Transient failure {transient_failures}/{}, retrying in {delay:?}: {detail}", self.policy.max_transient_attempts);
                    tokio::time::sleep(delay).await;
                }
                Err(CompletionError::RateLimit { retry_after, detail }) if !rate_limited => {
                    rate_limited = true;

                    let cooldown = self.policy.rate_limit_cooldown;
                    let delay = match retry_after {
                        Some(wait) if wait > cooldown => {
                            warn!("Rate limited for {wait:?}, longer than the {cooldown:?} cooldown: {detail}");
                            return Err(CompletionError::RateLimit { retry_after, detail });
                        }
                        Some(wait) => wait,
                        None => cooldown,
                    };

                    warn!("Rate limited, retrying once in {delay:?}: {detail}");
                    tokio::time::sleep(delay).await;
                }
                Err(CompletionError::ModelUnavailable { model, detail }) if !fell_back => match &options.fallback_model {
                    Some(fallback) if *fallback != model => {
                        fell_back = true;

                        warn!("Model `{model}` unavailable ({detail}), retrying with `{fallback}`");
                        request.model = fallback.clone();
                    }
                    _ => return Err(CompletionError::ModelUnavailable { model, detail }),
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// One timed attempt plus its record.
    async fn attempt(&self, request: &CompletionRequest) -> Result<RawCompletion, CompletionError> {
        let started = Instant::now();

        let result = match timeout(self.policy.request_timeout, self.inner.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::TransientNetwork(format!(
                "Request timed out after {}s",
                self.policy.request_timeout.as_secs_f64()
            ))),
        };

        let (tokens_used, status) = match &result {
            Ok(raw) => (raw.tokens_used, CallStatus::Success),
            Err(err) => (0, err.status()),
        };

        let record = ApiCallRecord {
            request_id: Uuid::new_v4(),
            model: request.model.clone(),
            tokens_used,
            latency: started.elapsed(),
            cost_estimate: self.cost_of(tokens_used),
            status,
        };

        self.stats.lock().unwrap_or_else(PoisonError::into_inner).record(&record);
        self.events.emit(None, EventKind::ApiCall(record));

        result
    }

    fn cost_of(&self, tokens: u32) -> f64 {
        f64::from(tokens) * self.cost_per_1k_tokens / 1000.0
    }

    /// Snapshot of the usage totals.
    pub fn statistics(&self) -> UsageStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = UsageStats::default();
    }
}
