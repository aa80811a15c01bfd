//! The cyclical turn scheduler.
//!
//! One `advance` call executes one turn: a context check when a new cycle
//! begins, then the current agent's contribution - generated remotely, or
//! supplied by a human who has taken the seat. The scheduler is
//! single-threaded and cooperative on purpose: every turn is causally
//! dependent on all prior turns, so there is never more than one agent
//! invocation in flight.
//!
//! Failure semantics: if the resilience layer gives up, `advance` returns a
//! recoverable error and the session is unmodified at the start of the
//! failed turn, so the caller can retry or restore.

use crate::agent::{AgentClient, AgentProfile, GenerationRequest};
use crate::combat::{CombatError, CombatMode, Roller};
use crate::directive::{extract_directives, Directive, DirectiveError};
use crate::log::{parse_wire, LogEntry};
use crate::memory::{
    AgentContext, CompressionOutcome, MemoryError, MemoryManager, Summarizer, Visibility,
};
use crate::resilience::{invoke_with_retry, Generation, InvokeError, RetryPolicy};
use crate::session::{Phase, Session};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from an advance. All of these are recoverable at this boundary;
/// only an explicit user abort ends a session.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no profile registered for agent {0}")]
    UnknownAgent(String),

    #[error("no client registered for agent {0}")]
    UnknownClient(String),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("turn cancelled; a newer generation superseded it")]
    Cancelled,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// What one advance produced.
#[derive(Debug)]
pub enum AdvanceResult {
    /// A turn completed and was appended to the log.
    Completed(TurnRecord),

    /// The controlled character's slot was reached with no pending human
    /// action. Nothing was mutated; the same slot runs once one arrives.
    AwaitingHuman { agent: String },
}

/// Details of a completed turn.
#[derive(Debug)]
pub struct TurnRecord {
    pub entry: LogEntry,

    /// The agent whose slot this was (the entry author can differ when
    /// untagged output falls back to the narrator).
    pub agent: String,

    /// Whether the content came from the human rather than a provider.
    pub human: bool,

    /// Whether this turn wrapped the rotation.
    pub round_completed: bool,

    pub combat_started: bool,
    pub combat_ended: bool,

    /// Combat was ended by the round cap rather than a directive.
    pub combat_forced: bool,

    /// Directives that failed to parse or apply this turn. The turn itself
    /// still completed.
    pub directive_errors: Vec<DirectiveError>,
}

/// One advance's view of the world: the session plus every collaborator,
/// borrowed for the duration of the call.
pub struct TurnScheduler<'a> {
    pub session: &'a mut Session,
    pub memory: &'a mut MemoryManager,
    pub profiles: &'a HashMap<String, AgentProfile>,
    pub clients: &'a HashMap<String, Arc<dyn AgentClient>>,
    pub summarizer: &'a dyn Summarizer,
    pub visibility: &'a dyn Visibility,
    pub roller: &'a mut dyn Roller,
    pub retry: &'a RetryPolicy,
    pub generation: &'a Generation,
    pub compression_timeout: Duration,
}

impl TurnScheduler<'_> {
    /// Execute one turn of the cycle.
    pub async fn advance(&mut self) -> Result<AdvanceResult, SchedulerError> {
        if self.session.phase == Phase::ContextCheck {
            self.run_context_check().await;
            self.session.phase = Phase::Turn;
        }

        let agent = self.session.current_agent().to_string();

        // Human suspension point: the only place besides the remote await
        // where wall-clock time may pass.
        if self.session.human.active
            && self.session.human.controlled.as_deref() == Some(agent.as_str())
        {
            return match self.session.human.pending_action.take() {
                None => {
                    self.session.phase = Phase::AwaitingHuman;
                    Ok(AdvanceResult::AwaitingHuman { agent })
                }
                Some(text) => {
                    self.session.phase = Phase::Turn;
                    let record = self.complete_turn(agent.clone(), agent, text, true);
                    Ok(AdvanceResult::Completed(record))
                }
            };
        }

        let profile = self
            .profiles
            .get(&agent)
            .ok_or_else(|| SchedulerError::UnknownAgent(agent.clone()))?;
        let client = self
            .clients
            .get(&agent)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownClient(agent.clone()))?;
        let context = self.memory.build_context(&agent)?;
        let request = build_request(profile, &context);

        // No session mutation happens past this point until the invocation
        // succeeds, which is what makes an exhausted failure clean to retry.
        let token = self.generation.current();
        let raw = invoke_with_retry(client.as_ref(), request, self.retry).await?;
        if !self.generation.is_current(token) {
            return Err(SchedulerError::Cancelled);
        }

        let (author, content) = parse_wire(&raw, self.memory.narrator_id());
        let record = self.complete_turn(agent, author, content, false);
        Ok(AdvanceResult::Completed(record))
    }

    /// Compress any over-budget buffer before the next cycle of turns, so
    /// no agent is ever invoked with an over-budget context.
    async fn run_context_check(&mut self) {
        let ids: Vec<String> = self.memory.agent_ids().map(str::to_string).collect();
        for id in ids {
            match self
                .memory
                .maybe_compress(&id, self.summarizer, self.compression_timeout)
                .await
            {
                Ok(CompressionOutcome::NotNeeded) => {}
                Ok(CompressionOutcome::Compressed { folded }) => {
                    debug!(agent = %id, folded, "compressed buffer into summary");
                }
                Ok(CompressionOutcome::EmergencyTrimmed { dropped }) => {
                    warn!(agent = %id, dropped, "buffer emergency-trimmed");
                }
                Err(e) => warn!(agent = %id, error = %e, "context check skipped agent"),
            }
        }
    }

    /// Append the turn's entry and run all post-turn bookkeeping.
    fn complete_turn(
        &mut self,
        scheduled: String,
        author: String,
        content: String,
        human: bool,
    ) -> TurnRecord {
        let entry = self.session.append_entry(&author, content);
        self.memory.record_entry(&entry, self.visibility);

        let mut directive_errors = Vec::new();
        let mut combat_started = false;
        let mut combat_ended = false;

        // Only the narrator steers mechanics.
        if author == self.memory.narrator_id() {
            for parsed in extract_directives(&entry.content) {
                match parsed.and_then(|d| self.apply_directive(d)) {
                    Ok(applied) => {
                        combat_started |= applied.started;
                        combat_ended |= applied.ended;
                    }
                    Err(e) => {
                        warn!(error = %e, "directive dropped; turn continues");
                        directive_errors.push(e);
                    }
                }
            }
        }

        // A combat transition resets the slot into the new rotation, so the
        // normal slot advance is skipped for this turn.
        let round_completed = if combat_started || combat_ended {
            false
        } else {
            self.session.advance_slot()
        };

        let mut combat_forced = false;
        if round_completed {
            self.session.phase = Phase::ContextCheck;
            if let Some(combat) = self.session.combat.as_mut() {
                if combat.mode == CombatMode::Tactical && !combat.next_round() {
                    warn!(
                        round = combat.round,
                        "combat exceeded the round cap; resolving narratively"
                    );
                    self.session.end_combat();
                    combat_forced = true;
                    combat_ended = true;
                }
            }
        }

        self.session.turn_number += 1;

        TurnRecord {
            entry,
            agent: scheduled,
            human,
            round_completed,
            combat_started,
            combat_ended,
            combat_forced,
            directive_errors,
        }
    }

    fn apply_directive(&mut self, directive: Directive) -> Result<AppliedDirective, DirectiveError> {
        match directive {
            Directive::StartCombat { combatants } => {
                self.session
                    .start_combat(combatants, self.roller)
                    .map_err(|e| match e {
                        CombatError::AlreadyActive => DirectiveError::AlreadyInCombat,
                        CombatError::NoCombatants => {
                            DirectiveError::MalformedCombatant(String::new())
                        }
                    })?;
                Ok(AppliedDirective {
                    started: true,
                    ended: false,
                })
            }
            Directive::EndCombat => {
                if self.session.end_combat() {
                    Ok(AppliedDirective {
                        started: false,
                        ended: true,
                    })
                } else {
                    Err(DirectiveError::NotInCombat)
                }
            }
            Directive::Harm { name, amount } => {
                let combat = self
                    .session
                    .combat
                    .as_mut()
                    .ok_or(DirectiveError::NotInCombat)?;
                combat
                    .apply_damage(&name, amount)
                    .ok_or(DirectiveError::UnknownTarget(name))?;
                Ok(AppliedDirective {
                    started: false,
                    ended: false,
                })
            }
        }
    }
}

struct AppliedDirective {
    started: bool,
    ended: bool,
}

/// Assemble the provider request from a profile and its role-gated context.
fn build_request(profile: &AgentProfile, context: &AgentContext<'_>) -> GenerationRequest {
    let mut system = profile.persona.clone();
    let block = context.system_block();
    if !block.is_empty() {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&block);
    }

    GenerationRequest {
        agent_id: profile.id.clone(),
        system,
        transcript: context.transcript(),
        nudge: None,
        model: profile.model.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Role;
    use crate::memory::FactKind;

    #[test]
    fn test_build_request_combines_persona_and_memory() {
        let mut memory = MemoryManager::new("narrator", 4.0);
        memory.register_agent("narrator", 8_000);
        memory.register_agent("rogue", 8_000);
        memory
            .note_fact("rogue", FactKind::Trait, "never trusts doors")
            .unwrap();

        let profile = AgentProfile::new("rogue", Role::Player).with_persona("A wary burglar.");
        let context = memory.build_context("rogue").unwrap();
        let request = build_request(&profile, &context);

        assert_eq!(request.agent_id, "rogue");
        assert!(request.system.starts_with("A wary burglar."));
        assert!(request.system.contains("never trusts doors"));
        assert!(request.transcript.is_empty());
    }

    #[test]
    fn test_build_request_empty_memory_is_just_persona() {
        let mut memory = MemoryManager::new("narrator", 4.0);
        memory.register_agent("narrator", 8_000);
        memory.register_agent("rogue", 8_000);

        let profile = AgentProfile::new("rogue", Role::Player).with_persona("A wary burglar.");
        let context = memory.build_context("rogue").unwrap();
        let request = build_request(&profile, &context);

        assert_eq!(request.system, "A wary burglar.");
    }
}
