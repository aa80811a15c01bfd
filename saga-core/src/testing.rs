//! Testing utilities.
//!
//! Deterministic stand-ins for every remote or random collaborator, so the
//! whole engine can be exercised without an API key:
//! - [`MockAgent`] returns scripted content or errors, then a default;
//! - [`FixedSummarizer`] / [`FailingSummarizer`] / [`SlowSummarizer`]
//!   drive the compression paths;
//! - [`SequenceRoller`] replays scripted d20 results.

use crate::agent::{AgentClient, GenerationRequest, ProviderError};
use crate::combat::Roller;
use crate::log::LogEntry;
use crate::memory::{SummarizeError, Summarizer};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// An agent client that replays scripted responses.
///
/// Once the script runs out it falls back to a tagged default line, so a
/// long autopilot run never starves.
pub struct MockAgent {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    default: String,
    calls: AtomicUsize,
}

impl MockAgent {
    /// A mock whose default output carries the agent's wire tag.
    pub fn speaking(agent_id: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: format!("[{agent_id}]: The tale continues."),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = default.into();
        self
    }

    /// Queue a scripted response.
    pub fn push(&self, content: impl Into<String>) {
        self.script
            .lock()
            .expect("mock script lock")
            .push_back(Ok(content.into()));
    }

    /// Queue a scripted error.
    pub fn push_error(&self, error: ProviderError) {
        self.script
            .lock()
            .expect("mock script lock")
            .push_back(Err(error));
    }

    /// How many times `generate` has been called.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl AgentClient for MockAgent {
    async fn generate(&self, _request: GenerationRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        match self.script.lock().expect("mock script lock").pop_front() {
            Some(response) => response,
            None => Ok(self.default.clone()),
        }
    }
}

/// Always returns the same summary text.
pub struct FixedSummarizer(pub String);

impl FixedSummarizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

#[async_trait]
impl Summarizer for FixedSummarizer {
    async fn summarize(
        &self,
        _prior_summary: &str,
        _entries: &[LogEntry],
    ) -> Result<String, SummarizeError> {
        Ok(self.0.clone())
    }
}

/// Always fails, forcing the emergency-trim path.
pub struct FailingSummarizer;

#[async_trait]
impl Summarizer for FailingSummarizer {
    async fn summarize(
        &self,
        _prior_summary: &str,
        _entries: &[LogEntry],
    ) -> Result<String, SummarizeError> {
        Err(SummarizeError::Failed("summarizer offline".to_string()))
    }
}

/// Sleeps past any reasonable deadline, forcing the timeout path.
pub struct SlowSummarizer(pub Duration);

#[async_trait]
impl Summarizer for SlowSummarizer {
    async fn summarize(
        &self,
        _prior_summary: &str,
        _entries: &[LogEntry],
    ) -> Result<String, SummarizeError> {
        tokio::time::sleep(self.0).await;
        Ok("too late".to_string())
    }
}

/// Replays a fixed sequence of d20 results. Panics once exhausted; a test
/// that rolls more than it scripted is wrong.
pub struct SequenceRoller {
    values: Vec<i32>,
    index: usize,
}

impl SequenceRoller {
    pub fn new(values: Vec<i32>) -> Self {
        Self { values, index: 0 }
    }
}

impl Roller for SequenceRoller {
    fn d20(&mut self) -> i32 {
        let value = self.values[self.index];
        self.index += 1;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_agent_script_then_default() {
        let mock = MockAgent::speaking("rogue");
        mock.push("[rogue]: scripted line");

        let request = GenerationRequest::new("rogue", "");
        assert_eq!(
            mock.generate(request.clone()).await.unwrap(),
            "[rogue]: scripted line"
        );
        assert_eq!(
            mock.generate(request).await.unwrap(),
            "[rogue]: The tale continues."
        );
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_agent_scripted_error() {
        let mock = MockAgent::speaking("narrator");
        mock.push_error(ProviderError::RateLimited);

        let result = mock.generate(GenerationRequest::new("narrator", "")).await;
        assert!(matches!(result, Err(ProviderError::RateLimited)));
    }

    #[test]
    fn test_sequence_roller() {
        let mut roller = SequenceRoller::new(vec![20, 1]);
        assert_eq!(roller.d20(), 20);
        assert_eq!(roller.d20(), 1);
    }
}
