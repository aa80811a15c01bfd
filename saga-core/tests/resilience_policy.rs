//! Integration tests for the resilience layer: backoff schedules, empty
//! retries, rate-limit semantics, emergency trims, and stall recovery.
//!
//! Timing-sensitive tests run under tokio's paused clock, so the 10s/20s
//! backoff schedule executes instantly while still being measurable.

use async_trait::async_trait;
use saga_core::agent::{AgentClient, GenerationRequest, ProviderError};
use saga_core::scheduler::AdvanceResult;
use saga_core::testing::{FailingSummarizer, MockAgent};
use saga_core::{
    AgentProfile, AutopilotOutcome, EngineError, InvokeError, SchedulerError, SessionConfig,
    StoryEngine,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn engine_with_narrator(
    dir: &TempDir,
    narrator: Arc<MockAgent>,
) -> StoryEngine {
    let config = SessionConfig::new("Resilience Run").with_player("rogue");

    StoryEngine::builder(config, dir.path())
        .agent(AgentProfile::narrator("narrator"), narrator)
        .agent(
            AgentProfile::player("rogue"),
            Arc::new(MockAgent::speaking("rogue")),
        )
        .build()
        .await
        .expect("engine builds")
}

// =============================================================================
// Scenario: timeouts, then success, with exponential backoff
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeouts_back_off_then_succeed() {
    let dir = TempDir::new().expect("temp dir");
    let narrator = Arc::new(MockAgent::speaking("narrator"));
    narrator.push_error(ProviderError::Timeout);
    narrator.push_error(ProviderError::Timeout);
    narrator.push_error(ProviderError::Timeout);
    narrator.push("[narrator]: Finally, the fog lifts.");

    let mut engine = engine_with_narrator(&dir, narrator.clone()).await;

    let start = tokio::time::Instant::now();
    let result = engine.advance().await.expect("turn completes on retry");
    let elapsed = start.elapsed();

    match result {
        AdvanceResult::Completed(record) => {
            assert_eq!(record.entry.content, "Finally, the fog lifts.");
        }
        other => panic!("expected a completed turn, got {other:?}"),
    }
    assert_eq!(narrator.calls(), 4);
    // Backoff waits were 10s + 20s + 40s.
    assert!(elapsed >= Duration::from_secs(30), "waited only {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_timeouts_leave_session_unmodified() {
    let dir = TempDir::new().expect("temp dir");
    let narrator = Arc::new(MockAgent::speaking("narrator"));
    for _ in 0..4 {
        narrator.push_error(ProviderError::Timeout);
    }

    let mut engine = engine_with_narrator(&dir, narrator.clone()).await;

    let error = engine.advance().await.expect_err("retries exhaust");
    assert!(matches!(
        error,
        EngineError::Scheduler(SchedulerError::Invoke(InvokeError::TransientExhausted {
            attempts: 4,
            ..
        }))
    ));

    assert_eq!(engine.session().turn_number, 0);
    assert!(engine.session().log.is_empty());

    // The failure is recoverable: a retry with a healthy provider works.
    let record = match engine.advance().await.expect("recovery succeeds") {
        AdvanceResult::Completed(record) => record,
        other => panic!("expected a completed turn, got {other:?}"),
    };
    assert_eq!(record.agent, "narrator");
    assert_eq!(engine.session().turn_number, 1);
}

// =============================================================================
// Scenario: rate limit pauses rather than retries
// =============================================================================

#[tokio::test]
async fn test_rate_limit_is_not_retried_and_session_is_untouched() {
    let dir = TempDir::new().expect("temp dir");
    let narrator = Arc::new(MockAgent::speaking("narrator"));
    narrator.push_error(ProviderError::RateLimited);

    let mut engine = engine_with_narrator(&dir, narrator.clone()).await;

    let error = engine.advance().await.expect_err("rate limit surfaces");
    assert!(matches!(
        error,
        EngineError::Scheduler(SchedulerError::Invoke(InvokeError::RateLimited))
    ));

    assert_eq!(narrator.calls(), 1, "no immediate retry after a rate limit");
    assert_eq!(engine.session().turn_number, 0);
    assert!(engine.session().log.is_empty());
}

#[tokio::test]
async fn test_autopilot_pauses_on_rate_limit() {
    let dir = TempDir::new().expect("temp dir");
    let narrator = Arc::new(MockAgent::speaking("narrator"));
    narrator.push_error(ProviderError::RateLimited);

    let mut engine = engine_with_narrator(&dir, narrator.clone()).await;

    let report = engine.start_autopilot(5).await.expect("run ends cleanly");
    assert_eq!(report.outcome, AutopilotOutcome::RateLimited);
    assert_eq!(report.turns, 0);
    assert!(engine.controls().is_paused());
    assert_eq!(engine.session().turn_number, 0);
}

// =============================================================================
// Empty responses
// =============================================================================

#[tokio::test]
async fn test_empty_response_retried_with_nudge() {
    let dir = TempDir::new().expect("temp dir");
    let narrator = Arc::new(MockAgent::speaking("narrator"));
    narrator.push("   ");
    narrator.push("[narrator]: Second try lands.");

    let mut engine = engine_with_narrator(&dir, narrator.clone()).await;

    let record = match engine.advance().await.expect("turn completes") {
        AdvanceResult::Completed(record) => record,
        other => panic!("expected a completed turn, got {other:?}"),
    };
    assert_eq!(record.entry.content, "Second try lands.");
    assert_eq!(narrator.calls(), 2, "exactly one immediate retry");
}

#[tokio::test]
async fn test_empty_responses_exhaust_after_fixed_count() {
    let dir = TempDir::new().expect("temp dir");
    let narrator = Arc::new(MockAgent::speaking("narrator"));
    for _ in 0..3 {
        narrator.push("");
    }

    let mut engine = engine_with_narrator(&dir, narrator.clone()).await;

    let error = engine.advance().await.expect_err("empties exhaust");
    assert!(matches!(
        error,
        EngineError::Scheduler(SchedulerError::Invoke(InvokeError::EmptyExhausted {
            attempts: 3
        }))
    ));
    assert_eq!(narrator.calls(), 3);
}

// =============================================================================
// Compression failure inside the live loop
// =============================================================================

#[tokio::test]
async fn test_emergency_trim_keeps_the_story_moving() {
    let dir = TempDir::new().expect("temp dir");
    let config = SessionConfig::new("Trim Run")
        .with_player("rogue")
        .with_chars_per_token(1.0);

    // Tiny budgets so a handful of turns crosses the threshold.
    let mut engine = StoryEngine::builder(config, dir.path())
        .agent(
            AgentProfile::narrator("narrator").with_token_budget(60),
            Arc::new(MockAgent::speaking("narrator")),
        )
        .agent(
            AgentProfile::player("rogue").with_token_budget(60),
            Arc::new(MockAgent::speaking("rogue")),
        )
        .summarizer(Arc::new(FailingSummarizer))
        .build()
        .await
        .expect("engine builds");

    // Enough cycles that every buffer trips the threshold repeatedly.
    for _ in 0..10 {
        match engine.advance().await.expect("turn completes despite trims") {
            AdvanceResult::Completed(_) => {}
            other => panic!("expected a completed turn, got {other:?}"),
        }
    }

    // Buffers were trimmed without summaries, and nothing stalled.
    assert_eq!(engine.session().turn_number, 10);
    let rogue = engine.memory().memory("rogue").unwrap();
    assert!(rogue.short_term().len() < 10);
    assert!(rogue.summary().is_empty());
}

// =============================================================================
// Stall detection and recovery
// =============================================================================

/// Hangs on its first call, then behaves.
struct HangOnceAgent {
    calls: AtomicUsize,
}

#[async_trait]
impl AgentClient for HangOnceAgent {
    async fn generate(&self, _request: GenerationRequest) -> Result<String, ProviderError> {
        if self.calls.fetch_add(1, Ordering::AcqRel) == 0 {
            tokio::time::sleep(Duration::from_secs(100_000)).await;
        }
        Ok("[narrator]: Back from the void.".to_string())
    }
}

#[tokio::test(start_paused = true)]
async fn test_stall_is_cancelled_and_recovered() {
    let dir = TempDir::new().expect("temp dir");
    let config = SessionConfig::new("Stall Run").with_player("rogue");

    let mut engine = StoryEngine::builder(config, dir.path())
        .agent(
            AgentProfile::narrator("narrator"),
            Arc::new(HangOnceAgent {
                calls: AtomicUsize::new(0),
            }),
        )
        .agent(
            AgentProfile::player("rogue"),
            Arc::new(MockAgent::speaking("rogue")),
        )
        .stall_threshold(Duration::from_secs(50))
        .build()
        .await
        .expect("engine builds");

    let report = engine.start_autopilot(1).await.expect("run completes");

    assert_eq!(report.stalls_recovered, 1);
    assert_eq!(report.rounds, 1);
    assert_eq!(engine.session().turn_number, 2);
    assert_eq!(
        engine.session().log.entries()[0].content,
        "Back from the void."
    );
}

// =============================================================================
// Generation counter
// =============================================================================

#[tokio::test]
async fn test_generation_bump_discards_stale_work() {
    let dir = TempDir::new().expect("temp dir");
    let narrator = Arc::new(MockAgent::speaking("narrator"));
    let engine = engine_with_narrator(&dir, narrator).await;

    let token = engine.generation().current();
    assert!(engine.generation().is_current(token));

    engine.generation().bump();
    assert!(
        !engine.generation().is_current(token),
        "work captured before the bump must be discardable"
    );
}
