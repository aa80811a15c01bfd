//! Retry, backoff, and cancellation around the remote invocation boundary.
//!
//! Every agent turn crosses an unreliable, slow, rate-limited network call.
//! This module wraps that call with an explicit policy instead of letting
//! failures unwind: empty responses get an immediate nudged retry, transient
//! failures back off exponentially, and rate limits surface at once so the
//! caller can pause instead of burning quota. Cancellation is a generation
//! counter - a stale result from a cancelled attempt can never be told apart
//! from a fresh one by timing alone, so it is told apart by generation.

use crate::agent::{AgentClient, GenerationRequest, ProviderError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Nudge appended after an empty response.
const EMPTY_NUDGE: &str =
    "Your previous reply was empty. Continue the scene in character with at least one sentence.";

/// Retry schedule for one invocation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Backoff retries allowed after transient failures.
    pub max_attempts: u32,

    /// First backoff delay; doubles each retry.
    pub base_delay: Duration,

    pub multiplier: f64,

    pub max_delay: Duration,

    /// Immediate retries allowed after empty responses.
    pub empty_retries: u32,
}

impl RetryPolicy {
    /// The standard schedule: three backoff retries at 10s/20s/40s, two
    /// nudged retries for empty content.
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_delay: Duration::from_secs(120),
            empty_retries: 2,
        }
    }

    /// Delay before backoff retry number `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Terminal outcomes of a wrapped invocation. All are recoverable at the
/// scheduler boundary.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("agent produced empty content {attempts} times")]
    EmptyExhausted { attempts: u32 },

    #[error("transient failures exhausted after {attempts} attempts: {last}")]
    TransientExhausted { attempts: u32, last: String },

    #[error("rate limited; pausing instead of retrying")]
    RateLimited,

    #[error("provider failure: {0}")]
    Fatal(String),
}

/// Invoke an agent with the full retry policy applied.
///
/// The request is cloned per attempt; a retry is a new attempt, never a
/// reordering of prior ones.
pub async fn invoke_with_retry(
    client: &dyn AgentClient,
    request: GenerationRequest,
    policy: &RetryPolicy,
) -> Result<String, InvokeError> {
    let agent = request.agent_id.clone();
    let mut request = request;
    let mut empties = 0u32;
    let mut attempt = 0u32;

    loop {
        let outcome = client.generate(request.clone()).await;

        let error = match outcome {
            Ok(content) if !content.trim().is_empty() => return Ok(content),
            Ok(_) => ProviderError::Empty,
            Err(e) => e,
        };

        match error {
            ProviderError::Empty => {
                empties += 1;
                if empties > policy.empty_retries {
                    return Err(InvokeError::EmptyExhausted { attempts: empties });
                }
                debug!(agent = %agent, empties, "empty response; retrying with nudge");
                request.nudge = Some(EMPTY_NUDGE.to_string());
            }
            ProviderError::RateLimited => {
                warn!(agent = %agent, "rate limited; surfacing without retry");
                return Err(InvokeError::RateLimited);
            }
            e if e.is_backoff_retryable() => {
                if attempt >= policy.max_attempts {
                    return Err(InvokeError::TransientExhausted {
                        attempts: attempt + 1,
                        last: e.to_string(),
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(agent = %agent, attempt, delay_secs = delay.as_secs(), error = %e,
                    "transient failure; backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            e => return Err(InvokeError::Fatal(e.to_string())),
        }
    }
}

/// Monotonic generation counter for cancellation.
///
/// Work captures the current generation when it starts; a bump invalidates
/// every outstanding capture, so a late-arriving result from cancelled work
/// is discarded instead of written into newer state.
#[derive(Debug, Default)]
pub struct Generation {
    counter: AtomicU64,
}

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Invalidate all outstanding work; returns the new generation.
    pub fn bump(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_current(&self, token: u64) -> bool {
        self.current() == token
    }
}

/// Wall-clock progress tracker for stall detection.
///
/// `touch` after every successful advance; the driver cancels the in-flight
/// turn once `threshold` passes without one. The threshold must sit
/// comfortably above the worst legitimate round duration, retries included.
#[derive(Debug)]
pub struct StallWatchdog {
    threshold: Duration,
    last_progress: Mutex<Instant>,
}

impl StallWatchdog {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_progress: Mutex::new(Instant::now()),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub async fn touch(&self) {
        *self.last_progress.lock().await = Instant::now();
    }

    pub async fn since_progress(&self) -> Duration {
        self.last_progress.lock().await.elapsed()
    }

    pub async fn is_stalled(&self) -> bool {
        self.since_progress().await > self.threshold
    }
}
