//! The story engine: the single owner of a running session.
//!
//! `StoryEngine` wires the session aggregate to its collaborators - memory
//! manager, persistence store, per-agent provider clients, summarizer,
//! roller, retry policy - and exposes the full control surface callers
//! (UI, CLI, tests) drive: autopilot, pause/resume, human drop-in, forks,
//! and checkpoint restore. It holds the only mutable handle to the
//! session, so one invocation in flight at a time is a compile-time
//! property, not a convention.

use crate::agent::{AgentClient, AgentProfile};
use crate::autopilot::{self, AutopilotConfig, AutopilotControls, AutopilotReport};
use crate::combat::{CombatantSpec, RandRoller, Roller};
use crate::fork::{ForkComparison, ForkError};
use crate::memory::{DigestSummarizer, MemoryManager, OpenTable, Summarizer, Visibility};
use crate::persist::{PersistError, SessionStore};
use crate::resilience::{Generation, RetryPolicy, StallWatchdog};
use crate::scheduler::{AdvanceResult, SchedulerError, TurnScheduler};
use crate::session::{Session, SessionConfig, SessionError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Errors from engine construction and control operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Fork(#[from] ForkError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("agent {0} appears in the session config but was never registered")]
    UnregisteredAgent(String),

    #[error("no checkpoint available to reload")]
    NoCheckpoint,
}

/// Builder for a [`StoryEngine`].
pub struct EngineBuilder {
    config: SessionConfig,
    store_root: PathBuf,
    profiles: HashMap<String, AgentProfile>,
    clients: HashMap<String, Arc<dyn AgentClient>>,
    summarizer: Arc<dyn Summarizer>,
    visibility: Arc<dyn Visibility>,
    roller: Box<dyn Roller>,
    retry: RetryPolicy,
    stall_threshold: Duration,
}

impl EngineBuilder {
    pub fn new(config: SessionConfig, store_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            store_root: store_root.into(),
            profiles: HashMap::new(),
            clients: HashMap::new(),
            summarizer: Arc::new(DigestSummarizer),
            visibility: Arc::new(OpenTable),
            roller: Box::new(RandRoller::new()),
            retry: RetryPolicy::standard(),
            stall_threshold: Duration::from_secs(600),
        }
    }

    /// Register an agent's profile and the client that speaks for it.
    pub fn agent(mut self, profile: AgentProfile, client: Arc<dyn AgentClient>) -> Self {
        self.clients.insert(profile.id.clone(), client);
        self.profiles.insert(profile.id.clone(), profile);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn visibility(mut self, visibility: Arc<dyn Visibility>) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn roller(mut self, roller: Box<dyn Roller>) -> Self {
        self.roller = roller;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    /// Validate the roster, create the session, and open its store.
    pub async fn build(self) -> Result<StoryEngine, EngineError> {
        let mut roster = vec![self.config.narrator.clone()];
        roster.extend(self.config.players.iter().cloned());
        for id in &roster {
            if !self.profiles.contains_key(id) {
                return Err(EngineError::UnregisteredAgent(id.clone()));
            }
        }

        let session = Session::new(self.config);
        let store = SessionStore::open(&self.store_root, &session).await?;

        let mut memory = MemoryManager::new(
            session.config.narrator.clone(),
            session.config.chars_per_token,
        );
        for id in &roster {
            let budget = self
                .profiles
                .get(id)
                .map(|p| p.token_budget)
                .unwrap_or(session.config.default_token_budget);
            memory.register_agent(id, budget);
        }

        info!(session = %session.id, name = %session.config.name, "session created");

        Ok(StoryEngine {
            session,
            memory,
            store,
            profiles: self.profiles,
            clients: self.clients,
            summarizer: self.summarizer,
            visibility: self.visibility,
            roller: self.roller,
            retry: self.retry,
            generation: Arc::new(Generation::new()),
            watchdog: Arc::new(StallWatchdog::new(self.stall_threshold)),
            controls: Arc::new(AutopilotControls::default()),
        })
    }
}

/// A running narrative session and everything needed to advance it.
pub struct StoryEngine {
    session: Session,
    memory: MemoryManager,
    store: SessionStore,
    profiles: HashMap<String, AgentProfile>,
    clients: HashMap<String, Arc<dyn AgentClient>>,
    summarizer: Arc<dyn Summarizer>,
    visibility: Arc<dyn Visibility>,
    roller: Box<dyn Roller>,
    retry: RetryPolicy,
    generation: Arc<Generation>,
    watchdog: Arc<StallWatchdog>,
    controls: Arc<AutopilotControls>,
}

impl StoryEngine {
    pub fn builder(config: SessionConfig, store_root: impl Into<PathBuf>) -> EngineBuilder {
        EngineBuilder::new(config, store_root)
    }

    /// Execute one turn, then checkpoint and export it best-effort.
    ///
    /// A checkpoint or transcript failure degrades durability but never
    /// blocks progression; it is logged and the turn still counts.
    pub async fn advance(&mut self) -> Result<AdvanceResult, EngineError> {
        let compression_timeout = Duration::from_secs(self.session.config.compression_timeout_secs);

        let result = {
            let mut scheduler = TurnScheduler {
                session: &mut self.session,
                memory: &mut self.memory,
                profiles: &self.profiles,
                clients: &self.clients,
                summarizer: self.summarizer.as_ref(),
                visibility: self.visibility.as_ref(),
                roller: self.roller.as_mut(),
                retry: &self.retry,
                generation: self.generation.as_ref(),
                compression_timeout,
            };
            scheduler.advance().await?
        };

        if let AdvanceResult::Completed(record) = &result {
            self.watchdog.touch().await;

            if let Err(e) = self.store.checkpoint(&self.session, &self.memory).await {
                warn!(error = %e, turn = self.session.turn_number,
                    "checkpoint write failed; durability degraded");
            }
            if let Err(e) = self
                .store
                .append_transcript(self.session.active_fork, &record.entry)
                .await
            {
                warn!(error = %e, "transcript append failed");
            }
        }

        Ok(result)
    }

    // ------------------------------------------------------------------
    // Autopilot
    // ------------------------------------------------------------------

    /// Run the autopilot until its round cap, a pause/stop, or a rate
    /// limit. Resumable: a later call continues from the persisted turn.
    pub async fn start_autopilot(&mut self, max_rounds: u32) -> Result<AutopilotReport, EngineError> {
        let config =
            AutopilotConfig::new(max_rounds).with_stall_threshold(self.watchdog.threshold());
        autopilot::run(self, config).await
    }

    pub fn stop_autopilot(&self) {
        self.controls.request_stop();
    }

    pub fn pause(&self) {
        self.controls.pause();
    }

    pub fn resume(&self) {
        self.controls.resume();
    }

    pub fn controls(&self) -> Arc<AutopilotControls> {
        Arc::clone(&self.controls)
    }

    // ------------------------------------------------------------------
    // Human control
    // ------------------------------------------------------------------

    pub fn drop_in(&mut self, character: impl Into<String>) -> Result<(), EngineError> {
        self.session.drop_in(character)?;
        Ok(())
    }

    pub fn release_control(&mut self) {
        self.session.release_control();
        self.controls.signal_human();
    }

    pub fn submit_human_action(&mut self, text: impl Into<String>) -> Result<(), EngineError> {
        self.session.submit_action(text)?;
        self.controls.signal_human();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Forks
    // ------------------------------------------------------------------

    pub fn create_fork(&mut self, name: impl Into<String>) -> Result<Uuid, EngineError> {
        Ok(self.session.create_fork(name)?)
    }

    pub fn switch_fork(&mut self, id: Uuid) -> Result<(), EngineError> {
        Ok(self.session.switch_fork(id)?)
    }

    pub fn promote_fork(&mut self, id: Uuid) -> Result<usize, EngineError> {
        Ok(self.session.promote_fork(id)?)
    }

    pub fn abandon_fork(&mut self, id: Uuid) -> Result<(), EngineError> {
        Ok(self.session.abandon_fork(id)?)
    }

    pub fn return_to_main(&mut self) {
        self.session.return_to_main();
    }

    pub fn compare_fork(&self, id: Uuid) -> Result<ForkComparison, EngineError> {
        Ok(self.session.compare_fork(id)?)
    }

    // ------------------------------------------------------------------
    // Combat (external trigger path; the narrator's directives are the
    // usual one)
    // ------------------------------------------------------------------

    pub fn start_combat(&mut self, specs: Vec<CombatantSpec>) -> Result<(), EngineError> {
        self.session
            .start_combat(specs, self.roller.as_mut())
            .map_err(SessionError::from)?;
        Ok(())
    }

    pub fn end_combat(&mut self) -> bool {
        self.session.end_combat()
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Replace live state with the snapshot at `turn` on the active
    /// timeline. Bumps the generation first so any in-flight work from the
    /// abandoned state can never land.
    pub async fn restore_checkpoint(&mut self, turn: u64) -> Result<(), EngineError> {
        self.generation.bump();
        let snapshot = self.store.restore(self.session.active_fork, turn).await?;
        self.session = snapshot.session;
        self.memory = snapshot.memories;
        self.watchdog.touch().await;
        info!(turn, "session restored from checkpoint");
        Ok(())
    }

    /// Stall recovery: invalidate outstanding work and reload the latest
    /// checkpoint if one exists. With nothing persisted yet the state is
    /// still pre-turn, so invalidation alone is enough.
    pub(crate) async fn invalidate_and_reload(&mut self) -> Result<(), EngineError> {
        self.generation.bump();
        let scope = self.session.active_fork;
        match self.store.latest_checkpoint(scope).await? {
            Some(turn) => self.restore_checkpoint(turn).await,
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }
}
