//! The session root aggregate.
//!
//! `Session` is the single mutable state record of a running narrative:
//! the ground-truth log, whose-turn rotation, scheduler phase, human
//! control, combat, and fork bookkeeping. It is mutated by exactly one
//! component at a time - the scheduler owns the write path, and everything
//! here is synchronous state manipulation.

use crate::combat::{CombatError, CombatMode, CombatState, CombatantSpec, Roller};
use crate::fork::Fork;
use crate::log::{GroundTruthLog, LogEntry};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from session-level operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0} is not a player in this session")]
    NotAPlayer(String),

    #[error("no human is in control")]
    NoHumanControl,

    #[error(transparent)]
    Combat(#[from] CombatError),
}

/// Configuration fixed at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Campaign/session name; also used for the storage directory.
    pub name: String,

    /// The narrator agent's id.
    pub narrator: String,

    /// Player agent ids in seat order.
    pub players: Vec<String>,

    /// Default per-agent context budget in tokens.
    pub default_token_budget: usize,

    /// Heuristic chars-per-token ratio used for the compression threshold.
    /// Approximate by design; correctness must not depend on it.
    pub chars_per_token: f32,

    /// Hard cap on tactical combat rounds.
    pub max_combat_rounds: u32,

    /// How long a summarization call may run before the emergency trim.
    pub compression_timeout_secs: u64,
}

impl SessionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            narrator: "narrator".to_string(),
            players: Vec::new(),
            default_token_budget: 8_000,
            chars_per_token: 4.0,
            max_combat_rounds: 20,
            compression_timeout_secs: 60,
        }
    }

    pub fn with_narrator(mut self, id: impl Into<String>) -> Self {
        self.narrator = id.into();
        self
    }

    pub fn with_player(mut self, id: impl Into<String>) -> Self {
        self.players.push(id.into());
        self
    }

    pub fn with_token_budget(mut self, tokens: usize) -> Self {
        self.default_token_budget = tokens;
        self
    }

    pub fn with_chars_per_token(mut self, ratio: f32) -> Self {
        self.chars_per_token = ratio;
        self
    }

    pub fn with_max_combat_rounds(mut self, rounds: u32) -> Self {
        self.max_combat_rounds = rounds;
        self
    }

    pub fn with_compression_timeout_secs(mut self, secs: u64) -> Self {
        self.compression_timeout_secs = secs;
        self
    }
}

/// Scheduler state, persisted so a restored session resumes mid-cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Compression pass before the next cycle of turns.
    ContextCheck,

    /// Normal turn execution.
    Turn,

    /// Blocked at the controlled character's slot until a human acts.
    AwaitingHuman,
}

/// Human drop-in state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanControl {
    pub active: bool,

    /// The player character the human is driving.
    pub controlled: Option<String>,

    /// Action submitted while suspended, consumed at the controlled slot.
    pub pending_action: Option<String>,
}

/// The root aggregate for one narrative session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub config: SessionConfig,

    /// Turns completed on the active timeline. Equals the timeline length.
    pub turn_number: u64,

    /// The main timeline's append-only record.
    pub log: GroundTruthLog,

    /// Narrator-first rotation. Never mutated by combat; tactical mode
    /// overlays an initiative order instead, so ending combat restores
    /// this queue exactly because it never left.
    pub turn_queue: Vec<String>,

    /// Index into the current rotation.
    pub current_slot: usize,

    pub phase: Phase,
    pub human: HumanControl,
    pub combat: Option<CombatState>,

    pub forks: Vec<Fork>,
    pub active_fork: Option<Uuid>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let mut turn_queue = vec![config.narrator.clone()];
        turn_queue.extend(config.players.iter().cloned());

        Self {
            id: Uuid::new_v4(),
            config,
            turn_number: 0,
            log: GroundTruthLog::new(),
            turn_queue,
            current_slot: 0,
            phase: Phase::ContextCheck,
            human: HumanControl::default(),
            combat: None,
            forks: Vec::new(),
            active_fork: None,
        }
    }

    /// The rotation currently in effect: initiative order during tactical
    /// combat, the standing queue otherwise.
    pub fn rotation(&self) -> &[String] {
        match &self.combat {
            Some(c) if c.mode == CombatMode::Tactical => c.initiative_order(),
            _ => &self.turn_queue,
        }
    }

    /// The agent whose turn it is.
    pub fn current_agent(&self) -> &str {
        let rotation = self.rotation();
        &rotation[self.current_slot.min(rotation.len() - 1)]
    }

    /// Move to the next slot. Returns true when the rotation wrapped.
    pub fn advance_slot(&mut self) -> bool {
        let len = self.rotation().len();
        self.current_slot += 1;
        if self.current_slot >= len {
            self.current_slot = 0;
            true
        } else {
            false
        }
    }

    /// Append an entry to the active timeline (main log or fork tail).
    pub fn append_entry(&mut self, agent: &str, content: impl Into<String>) -> LogEntry {
        match self.active_fork_index() {
            Some(i) => self.forks[i].append(agent, content),
            None => self.log.append(agent, content),
        }
    }

    pub(crate) fn active_fork_index(&self) -> Option<usize> {
        let id = self.active_fork?;
        self.forks.iter().position(|f| f.id == id)
    }

    /// Length of the active timeline in entries.
    pub fn timeline_len(&self) -> u64 {
        match self.active_fork_index() {
            Some(i) => self.forks[i].next_sequence(),
            None => self.log.next_sequence(),
        }
    }

    // ------------------------------------------------------------------
    // Combat lifecycle
    // ------------------------------------------------------------------

    /// Enter tactical combat. `specs` are re-ordered to match the standing
    /// queue before initiative is rolled, so the tie-break is the original
    /// queue order.
    pub fn start_combat(
        &mut self,
        mut specs: Vec<CombatantSpec>,
        roller: &mut dyn Roller,
    ) -> Result<(), CombatError> {
        if self.combat.is_some() {
            return Err(CombatError::AlreadyActive);
        }

        let queue_position = |agent: &str| {
            self.turn_queue
                .iter()
                .position(|a| a == agent)
                .unwrap_or(usize::MAX)
        };
        specs.sort_by_key(|s| queue_position(&s.agent));

        self.combat = Some(CombatState::new(
            specs,
            self.config.max_combat_rounds,
            roller,
        )?);
        self.current_slot = 0;
        Ok(())
    }

    /// Leave combat. The standing queue was never touched, so the rotation
    /// reverts to it exactly. Returns whether combat had been active.
    pub fn end_combat(&mut self) -> bool {
        if self.combat.take().is_none() {
            return false;
        }
        self.current_slot = 0;
        self.phase = Phase::ContextCheck;
        true
    }

    // ------------------------------------------------------------------
    // Human control
    // ------------------------------------------------------------------

    /// A human takes over a player character.
    pub fn drop_in(&mut self, character: impl Into<String>) -> Result<(), SessionError> {
        let character = character.into();
        if !self.config.players.contains(&character) {
            return Err(SessionError::NotAPlayer(character));
        }
        self.human.active = true;
        self.human.controlled = Some(character);
        Ok(())
    }

    /// The human releases control; the AI resumes at the same slot.
    pub fn release_control(&mut self) {
        self.human = HumanControl::default();
        if self.phase == Phase::AwaitingHuman {
            self.phase = Phase::Turn;
        }
    }

    /// Queue the human's action for the controlled character's slot.
    pub fn submit_action(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        if !self.human.active {
            return Err(SessionError::NoHumanControl);
        }
        self.human.pending_action = Some(text.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat::RandRoller;

    fn goblin_spec() -> Vec<CombatantSpec> {
        vec![CombatantSpec::new("Goblin", "narrator", 0)]
    }

    #[test]
    fn test_narrative_mode_combat_keeps_standing_rotation() {
        let mut s = session();
        let mut roller = RandRoller::seeded(1);
        s.start_combat(goblin_spec(), &mut roller).unwrap();

        s.combat.as_mut().unwrap().mode = CombatMode::Narrative;
        assert_eq!(s.rotation(), s.turn_queue.as_slice());
    }

    fn session() -> Session {
        Session::new(
            SessionConfig::new("Test Tale")
                .with_player("rogue")
                .with_player("bard"),
        )
    }

    #[test]
    fn test_queue_is_narrator_first() {
        let s = session();
        assert_eq!(s.turn_queue, ["narrator", "rogue", "bard"]);
        assert_eq!(s.current_agent(), "narrator");
        assert_eq!(s.phase, Phase::ContextCheck);
    }

    #[test]
    fn test_slot_rotation_wraps() {
        let mut s = session();
        assert!(!s.advance_slot());
        assert_eq!(s.current_agent(), "rogue");
        assert!(!s.advance_slot());
        assert!(s.advance_slot());
        assert_eq!(s.current_agent(), "narrator");
    }

    #[test]
    fn test_combat_overlays_rotation_and_restores_queue() {
        let mut s = session();
        let before = s.turn_queue.clone();
        let mut roller = RandRoller::seeded(7);

        s.start_combat(
            vec![
                CombatantSpec::new("Goblin", "narrator", 2),
                CombatantSpec::new("Rogue", "rogue", 3),
            ],
            &mut roller,
        )
        .unwrap();

        assert_eq!(s.rotation().len(), 2);
        assert!(s.end_combat());
        assert_eq!(s.turn_queue, before);
        assert_eq!(s.rotation(), before.as_slice());
        assert!(!s.end_combat());
    }

    #[test]
    fn test_double_combat_start_rejected() {
        let mut s = session();
        let mut roller = RandRoller::seeded(7);
        let spec = || vec![CombatantSpec::new("Goblin", "narrator", 0)];

        s.start_combat(spec(), &mut roller).unwrap();
        assert!(matches!(
            s.start_combat(spec(), &mut roller),
            Err(CombatError::AlreadyActive)
        ));
    }

    #[test]
    fn test_drop_in_requires_known_player() {
        let mut s = session();
        assert!(s.drop_in("rogue").is_ok());
        assert!(matches!(
            s.drop_in("stranger"),
            Err(SessionError::NotAPlayer(_))
        ));
    }

    #[test]
    fn test_submit_requires_active_control() {
        let mut s = session();
        assert!(matches!(
            s.submit_action("hello"),
            Err(SessionError::NoHumanControl)
        ));

        s.drop_in("rogue").unwrap();
        s.submit_action("I search the room").unwrap();
        assert_eq!(s.human.pending_action.as_deref(), Some("I search the room"));

        s.release_control();
        assert!(!s.human.active);
        assert!(s.human.pending_action.is_none());
    }

    #[test]
    fn test_append_entry_goes_to_main_without_fork() {
        let mut s = session();
        let entry = s.append_entry("narrator", "It begins.");
        assert_eq!(entry.sequence, 0);
        assert_eq!(s.log.len(), 1);
        assert_eq!(s.timeline_len(), 1);
    }
}
