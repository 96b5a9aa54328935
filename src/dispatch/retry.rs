//! Strategy-ordered retry for local-model calls.
//!
//! [`RetryState`] is plain data: the strategy list, the index of the current
//! strategy and the attempt counter within it. [`RetryOrchestrator::run`]
//! drives it, sleeping through an injected [`Sleeper`] so tests can observe
//! backoff without real waits.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::dispatch::ParsedResponse;
use crate::error::{AiClientError, AttemptFailure};
use crate::prompt::LocalEndpoint;

/// One complete way of fulfilling a local-model request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Native `/api/chat` with structured messages.
    ChatApi,
    /// Native `/api/generate` with a flattened prompt.
    GenerateApi,
    /// The standard routed request (proxy or direct).
    Generic,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChatApi => "chat-api",
            Self::GenerateApi => "generate-api",
            Self::Generic => "generic",
        }
    }
}

/// Preferred endpoint first, the other second, generic always last.
pub fn strategy_order(preferred: LocalEndpoint) -> Vec<Strategy> {
    match preferred {
        LocalEndpoint::Chat => vec![Strategy::ChatApi, Strategy::GenerateApi, Strategy::Generic],
        LocalEndpoint::Generate => {
            vec![Strategy::GenerateApi, Strategy::ChatApi, Strategy::Generic]
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_retries: c.max_retries,
            initial_backoff: Duration::from_millis(c.initial_backoff_ms),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait after failed attempt `failed_attempt` (1-based):
    /// `initial_backoff * 2^(failed_attempt - 1)`.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor)
    }
}

/// The next transport attempt to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub strategy: Strategy,
    /// 1-based, resets for each strategy.
    pub attempt: u32,
    /// Backoff to wait before this attempt. `None` for a strategy's first attempt.
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RetryState {
    strategies: Vec<Strategy>,
    index: usize,
    attempt: u32,
    policy: RetryPolicy,
}

impl RetryState {
    pub fn new(strategies: Vec<Strategy>, policy: RetryPolicy) -> Self {
        Self {
            strategies,
            index: 0,
            attempt: 0,
            policy,
        }
    }

    pub fn next_step(&mut self) -> Option<Step> {
        if self.attempt >= self.policy.max_attempts() {
            self.index += 1;
            self.attempt = 0;
        }
        let strategy = *self.strategies.get(self.index)?;
        self.attempt += 1;
        let delay = (self.attempt > 1).then(|| self.policy.backoff(self.attempt - 1));
        Some(Step {
            strategy,
            attempt: self.attempt,
            delay,
        })
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.slept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        Box::pin(std::future::ready(()))
    }
}

pub struct RetryOrchestrator {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryOrchestrator {
    pub fn new(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    /// Try each strategy up to `max_retries + 1` times, returning the first
    /// success. Non-retryable errors (configuration, cancellation) end the
    /// sequence at once; a configuration error after earlier failures is
    /// appended to them. Otherwise every failure is collected into
    /// `RetriesExhausted`.
    pub async fn run<F, Fut>(
        &self,
        strategies: Vec<Strategy>,
        request_id: &str,
        cancellation: &CancellationToken,
        mut attempt: F,
    ) -> Result<ParsedResponse, AiClientError>
    where
        F: FnMut(Strategy, u32) -> Fut,
        Fut: Future<Output = Result<ParsedResponse, AiClientError>>,
    {
        let mut state = RetryState::new(strategies, self.policy);
        let mut failures: Vec<AttemptFailure> = Vec::new();

        while let Some(step) = state.next_step() {
            if let Some(delay) = step.delay {
                tracing::debug!(
                    request_id,
                    strategy = step.strategy.name(),
                    attempt = step.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        return Err(AiClientError::Cancelled(request_id.to_string()));
                    }
                    _ = self.sleeper.sleep(delay) => {}
                }
            }

            match attempt(step.strategy, step.attempt).await {
                Ok(parsed) => {
                    if !failures.is_empty() {
                        tracing::info!(
                            request_id,
                            strategy = step.strategy.name(),
                            attempt = step.attempt,
                            failed_attempts = failures.len(),
                            "local model request recovered"
                        );
                    }
                    return Ok(parsed);
                }
                Err(e) if e.is_cancelled() || (!e.is_retryable() && failures.is_empty()) => {
                    return Err(e);
                }
                Err(e) if !e.is_retryable() => {
                    tracing::warn!(
                        request_id,
                        strategy = step.strategy.name(),
                        attempt = step.attempt,
                        "local model attempt could not be built: {e}"
                    );
                    failures.push(attempt_failure(&step, &e));
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        request_id,
                        strategy = step.strategy.name(),
                        attempt = step.attempt,
                        status = e.status(),
                        "local model attempt failed: {e}"
                    );
                    failures.push(attempt_failure(&step, &e));
                }
            }
        }

        tracing::error!(
            request_id,
            attempts = failures.len(),
            "local model request failed"
        );
        Err(AiClientError::RetriesExhausted { attempts: failures })
    }
}

fn attempt_failure(step: &Step, e: &AiClientError) -> AttemptFailure {
    AttemptFailure {
        strategy: step.strategy.name().to_string(),
        attempt: step.attempt,
        kind: e.kind(),
        message: e.to_string(),
    }
}
