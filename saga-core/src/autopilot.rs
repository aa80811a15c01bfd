//! The autopilot driver.
//!
//! A thin loop over [`StoryEngine::advance`] with the safety rails the
//! scheduler itself does not carry: a round cap against runaway cost,
//! pause/stop flags, a blocking wait while a human holds the controlled
//! seat, and a stall watchdog that cancels a wedged turn and reloads from
//! the last checkpoint. Re-running after any exit continues from the
//! persisted turn number; completed turns are never re-executed.

use crate::engine::{EngineError, StoryEngine};
use crate::resilience::InvokeError;
use crate::scheduler::{AdvanceResult, SchedulerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Shared pause/stop/human signals, cheap to clone behind an `Arc`.
#[derive(Debug, Default)]
pub struct AutopilotControls {
    paused: AtomicBool,
    stop: AtomicBool,
    human_signal: Notify,
}

impl AutopilotControls {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        self.human_signal.notify_one();
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.human_signal.notify_one();
    }

    pub(crate) fn take_stop(&self) -> bool {
        self.stop.swap(false, Ordering::AcqRel)
    }

    /// Wake the driver out of a human-suspension wait.
    pub(crate) fn signal_human(&self) {
        self.human_signal.notify_one();
    }

    pub(crate) async fn wait_for_human(&self) {
        self.human_signal.notified().await;
    }
}

/// Parameters for one autopilot run.
#[derive(Debug, Clone)]
pub struct AutopilotConfig {
    /// Completed rotation cycles before the run stops on its own.
    pub max_rounds: u32,

    /// Wall-clock budget for a single advance, retries included. Past it
    /// the turn is cancelled and the session reloads from its last
    /// checkpoint.
    pub stall_threshold: Duration,
}

impl AutopilotConfig {
    pub fn new(max_rounds: u32) -> Self {
        Self {
            max_rounds,
            stall_threshold: Duration::from_secs(600),
        }
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }
}

/// Why an autopilot run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutopilotOutcome {
    RoundCapReached,
    Paused,
    Stopped,
    /// A provider rate limit surfaced; the session was paused at the
    /// pre-failure turn rather than burning quota on retries.
    RateLimited,
}

/// Statistics from one autopilot run.
#[derive(Debug)]
pub struct AutopilotReport {
    pub turns: u32,
    pub rounds: u32,
    pub stalls_recovered: u32,
    pub outcome: AutopilotOutcome,
}

/// Drive the engine until the round cap, a pause/stop, or a rate limit.
pub async fn run(
    engine: &mut StoryEngine,
    config: AutopilotConfig,
) -> Result<AutopilotReport, EngineError> {
    let controls = engine.controls();
    let mut report = AutopilotReport {
        turns: 0,
        rounds: 0,
        stalls_recovered: 0,
        outcome: AutopilotOutcome::RoundCapReached,
    };

    info!(
        max_rounds = config.max_rounds,
        turn = engine.session().turn_number,
        "autopilot engaged"
    );

    while report.rounds < config.max_rounds {
        if controls.take_stop() {
            report.outcome = AutopilotOutcome::Stopped;
            break;
        }
        if controls.is_paused() {
            report.outcome = AutopilotOutcome::Paused;
            break;
        }

        match timeout(config.stall_threshold, engine.advance()).await {
            // Stall: dropping the advance future cancels the in-flight
            // turn; the generation bump keeps any orphaned work from
            // mutating session state afterwards.
            Err(_) => {
                warn!(
                    threshold_secs = config.stall_threshold.as_secs(),
                    "advance stalled past threshold; cancelling and reloading"
                );
                engine.invalidate_and_reload().await?;
                report.stalls_recovered += 1;
            }
            Ok(Ok(AdvanceResult::Completed(record))) => {
                report.turns += 1;
                if record.round_completed {
                    report.rounds += 1;
                }
            }
            Ok(Ok(AdvanceResult::AwaitingHuman { agent })) => {
                debug!(agent = %agent, "suspended for human; waiting for action or release");
                controls.wait_for_human().await;
            }
            Ok(Err(EngineError::Scheduler(SchedulerError::Invoke(InvokeError::RateLimited)))) => {
                warn!("rate limited; pausing at the pre-failure turn");
                controls.pause();
                report.outcome = AutopilotOutcome::RateLimited;
                break;
            }
            Ok(Err(e)) => return Err(e),
        }
    }

    info!(
        turns = report.turns,
        rounds = report.rounds,
        outcome = ?report.outcome,
        "autopilot disengaged"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controls_flags() {
        let controls = AutopilotControls::default();
        assert!(!controls.is_paused());

        controls.pause();
        assert!(controls.is_paused());
        controls.resume();
        assert!(!controls.is_paused());

        controls.request_stop();
        assert!(controls.take_stop());
        assert!(!controls.take_stop());
    }

    #[tokio::test]
    async fn test_human_signal_is_buffered() {
        let controls = AutopilotControls::default();
        // A signal sent before the driver waits must still wake it.
        controls.signal_human();
        controls.wait_for_human().await;
    }

    #[test]
    fn test_config_builder() {
        let config = AutopilotConfig::new(5).with_stall_threshold(Duration::from_secs(30));
        assert_eq!(config.max_rounds, 5);
        assert_eq!(config.stall_threshold, Duration::from_secs(30));
    }
}
