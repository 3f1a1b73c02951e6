//! LLM completion abstraction.
//!
//! A single async trait covers chat completions with token-usage
//! accounting. Concrete SDK-backed implementations live outside this
//! repository; this crate ships the trait plus in-process test providers.
//! Suspension happens inside [`CompletionProvider::complete`], which must
//! honor the caller's [`CancelToken`] and discard partial output on cancel.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::pricing::PriceTable;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("request timed out")]
    Timeout,
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("cancelled")]
    Cancelled,
}

impl CompletionError {
    /// Whether a failed call may be retried (bounded by the task's
    /// `max_attempts`). Auth failures and cancellations are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CompletionError::RateLimited { .. }
                | CompletionError::Timeout
                | CompletionError::Provider(_)
                | CompletionError::Network(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub model: String,
    pub cost_cents: i64,
}

// ---------------------------------------------------------------------------
// CompletionProvider trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Run one chat completion. Implementations must observe `cancel` and
    /// return [`CompletionError::Cancelled`] promptly, discarding any
    /// partial output.
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<Completion, CompletionError>;

    /// Human-readable provider name.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// StubProvider — fails every call
// ---------------------------------------------------------------------------

/// Placeholder provider for deployments without credentials. Every call
/// fails as a non-retryable auth error.
#[derive(Debug, Clone)]
pub struct StubProvider;

#[async_trait::async_trait]
impl CompletionProvider for StubProvider {
    async fn complete(
        &self,
        _request: CompletionRequest,
        _cancel: &CancelToken,
    ) -> Result<Completion, CompletionError> {
        Err(CompletionError::Auth(
            "no completion provider configured".into(),
        ))
    }

    fn name(&self) -> &str {
        "stub"
    }
}

// ---------------------------------------------------------------------------
// ScriptedProvider — canned outcomes for tests
// ---------------------------------------------------------------------------

/// One scripted step. Steps are consumed in order; when the script runs
/// dry the provider repeats the configured fallback reply.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply {
        text: String,
        tokens_in: u64,
        tokens_out: u64,
    },
    Fail(CompletionError),
    /// Park until the caller cancels, then report `Cancelled`.
    Hang,
}

impl ScriptStep {
    pub fn reply(text: impl Into<String>) -> Self {
        ScriptStep::Reply {
            text: text.into(),
            tokens_in: 100,
            tokens_out: 50,
        }
    }
}

/// Deterministic in-process provider: plays back a queue of steps and
/// records every request it sees. The test suites drive workers, discovery,
/// and decomposition through this.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<CompletionRequest>>,
    fallback: String,
    prices: PriceTable,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            fallback: "[]".into(),
            prices: PriceTable::empty(),
        }
    }

    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = text.into();
        self
    }

    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    /// Append further steps after construction.
    pub fn push_step(&self, step: ScriptStep) {
        self.script.lock().expect("script lock").push_back(step);
    }

    /// Requests observed so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

#[async_trait::async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<Completion, CompletionError> {
        if cancel.is_cancelled() {
            return Err(CompletionError::Cancelled);
        }
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());

        let step = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(ScriptStep::Reply {
                text: self.fallback.clone(),
                tokens_in: 10,
                tokens_out: 5,
            });

        match step {
            ScriptStep::Reply {
                text,
                tokens_in,
                tokens_out,
            } => {
                let cost_cents = self.prices.cost_cents(&request.model, tokens_in, tokens_out);
                Ok(Completion {
                    text,
                    tokens_in,
                    tokens_out,
                    model: request.model,
                    cost_cents,
                })
            }
            ScriptStep::Fail(err) => Err(err),
            ScriptStep::Hang => {
                cancel.cancelled().await;
                Err(CompletionError::Cancelled)
            }
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
