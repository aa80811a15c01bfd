//! Multi-agent narrative session engine.
//!
//! This crate is the orchestration core for long-running interactive
//! narratives co-authored by a narrator agent, any number of player
//! agents, and optionally a human who can take a seat mid-stream:
//! - a cyclical turn scheduler with a combat sub-state machine,
//! - per-agent memory with asymmetric isolation and compression,
//! - checkpoint-per-turn persistence with fork/branch timelines,
//! - a retry/backoff/stall resilience layer around every remote call,
//! - an autopilot driver with a round cap and pause/resume.
//!
//! # Quick Start
//!
//! ```ignore
//! use saga_core::{AgentProfile, ClaudeAgent, SessionConfig, StoryEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Arc::new(ClaudeAgent::from_env()?);
//!
//!     let config = SessionConfig::new("The Sunken Keep")
//!         .with_player("rogue")
//!         .with_player("bard");
//!
//!     let mut engine = StoryEngine::builder(config, "saves")
//!         .agent(AgentProfile::narrator("narrator"), client.clone())
//!         .agent(AgentProfile::player("rogue"), client.clone())
//!         .agent(AgentProfile::player("bard"), client)
//!         .build()
//!         .await?;
//!
//!     let report = engine.start_autopilot(10).await?;
//!     println!("played {} turns", report.turns);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod autopilot;
pub mod combat;
pub mod directive;
pub mod engine;
pub mod fork;
pub mod log;
pub mod memory;
pub mod persist;
pub mod resilience;
pub mod scheduler;
pub mod session;
pub mod testing;

// Primary public API
pub use agent::{AgentClient, AgentProfile, ClaudeAgent, GenerationRequest, ProviderError, Role};
pub use autopilot::{AutopilotConfig, AutopilotControls, AutopilotOutcome, AutopilotReport};
pub use combat::{CombatError, CombatMode, CombatState, Combatant, CombatantSpec, RandRoller, Roller};
pub use directive::{Directive, DirectiveError};
pub use engine::{EngineBuilder, EngineError, StoryEngine};
pub use fork::{Fork, ForkComparison, ForkError};
pub use log::{GroundTruthLog, LogEntry};
pub use memory::{
    AgentContext, AgentMemory, CharacterFacts, CompressionOutcome, DigestSummarizer, FactKind,
    LlmSummarizer, MemoryError, MemoryManager, NarratorContext, OpenTable, PlayerContext,
    SummarizeError, Summarizer, Visibility,
};
pub use persist::{PersistError, SessionSnapshot, SessionStore, SnapshotMetadata};
pub use resilience::{Generation, InvokeError, RetryPolicy, StallWatchdog};
pub use scheduler::{AdvanceResult, SchedulerError, TurnRecord, TurnScheduler};
pub use session::{HumanControl, Phase, Session, SessionConfig, SessionError};
