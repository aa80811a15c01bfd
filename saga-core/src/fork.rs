//! Fork lifecycle: alternate timelines sharing the main log's prefix.
//!
//! A fork never copies the log. It is `{branch_turn, own tail}`: entries up
//! to `branch_turn` are read from main, and the tail continues main's
//! sequence numbering from there. Promotion copies the tail onto main with
//! fresh sequence numbers and retires the fork; the fork's own recorded
//! history is never mutated.

use crate::log::LogEntry;
use crate::session::Session;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from fork operations.
#[derive(Debug, Error)]
pub enum ForkError {
    #[error("no fork with id {0}")]
    NotFound(Uuid),

    #[error("fork {0} is retired")]
    Retired(Uuid),

    #[error("a fork is already active; return to main before branching again")]
    NestedFork,
}

/// An alternate timeline branched from main.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fork {
    pub id: Uuid,
    pub name: String,

    /// Main-timeline turn at which this fork branched. The fork's first
    /// tail entry has this sequence number.
    pub branch_turn: u64,

    tail: Vec<LogEntry>,

    /// Set once promoted or abandoned; a retired fork is read-only.
    pub retired: bool,
}

impl Fork {
    fn new(name: impl Into<String>, branch_turn: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            branch_turn,
            tail: Vec::new(),
            retired: false,
        }
    }

    /// The divergent entries owned by this fork.
    pub fn tail(&self) -> &[LogEntry] {
        &self.tail
    }

    /// Sequence the next tail entry will get; continues main's numbering.
    pub fn next_sequence(&self) -> u64 {
        self.branch_turn + self.tail.len() as u64
    }

    pub(crate) fn append(&mut self, agent: &str, content: impl Into<String>) -> LogEntry {
        let entry = LogEntry::new(agent, content, self.next_sequence());
        self.tail.push(entry.clone());
        entry
    }
}

/// A fork's divergent tail aligned against main's corresponding span.
///
/// Pure data for external diffing; no merge logic.
#[derive(Debug, Clone)]
pub struct ForkComparison {
    pub branch_turn: u64,
    pub fork_tail: Vec<LogEntry>,
    pub main_span: Vec<LogEntry>,
}

impl Session {
    /// Branch a new fork at the current main turn and make it active.
    pub fn create_fork(&mut self, name: impl Into<String>) -> Result<Uuid, ForkError> {
        if self.active_fork.is_some() {
            return Err(ForkError::NestedFork);
        }
        let fork = Fork::new(name, self.log.next_sequence());
        let id = fork.id;
        self.forks.push(fork);
        self.active_fork = Some(id);
        Ok(id)
    }

    /// Make an existing fork the active timeline.
    pub fn switch_fork(&mut self, id: Uuid) -> Result<(), ForkError> {
        let fork = self.fork(id)?;
        if fork.retired {
            return Err(ForkError::Retired(id));
        }
        self.turn_number = fork.next_sequence();
        self.active_fork = Some(id);
        Ok(())
    }

    /// Return to the main timeline, leaving fork tails intact.
    pub fn return_to_main(&mut self) {
        self.active_fork = None;
        self.turn_number = self.log.next_sequence();
    }

    /// Copy a fork's tail onto main and retire it.
    ///
    /// Promotion appends; it never rewrites main's existing entries and
    /// never touches the fork's recorded tail, so promoting is safe to
    /// attempt twice - the second call fails with [`ForkError::Retired`]
    /// rather than double-appending. Returns the number of entries
    /// appended.
    pub fn promote_fork(&mut self, id: Uuid) -> Result<usize, ForkError> {
        let fork = self.fork(id)?;
        if fork.retired {
            return Err(ForkError::Retired(id));
        }

        let tail: Vec<LogEntry> = fork.tail.clone();
        for entry in &tail {
            self.log.append(entry.agent.clone(), entry.content.clone());
        }

        let fork = self.fork_mut(id)?;
        fork.retired = true;

        if self.active_fork == Some(id) {
            self.return_to_main();
        }
        Ok(tail.len())
    }

    /// Abandon a fork without promoting it. Its history stays readable.
    pub fn abandon_fork(&mut self, id: Uuid) -> Result<(), ForkError> {
        let fork = self.fork_mut(id)?;
        if fork.retired {
            return Err(ForkError::Retired(id));
        }
        fork.retired = true;
        if self.active_fork == Some(id) {
            self.return_to_main();
        }
        Ok(())
    }

    /// Align a fork's tail against main's span from the branch point.
    pub fn compare_fork(&self, id: Uuid) -> Result<ForkComparison, ForkError> {
        let fork = self.fork(id)?;
        Ok(ForkComparison {
            branch_turn: fork.branch_turn,
            fork_tail: fork.tail.clone(),
            main_span: self.log.span_from(fork.branch_turn).to_vec(),
        })
    }

    pub fn fork(&self, id: Uuid) -> Result<&Fork, ForkError> {
        self.forks
            .iter()
            .find(|f| f.id == id)
            .ok_or(ForkError::NotFound(id))
    }

    fn fork_mut(&mut self, id: Uuid) -> Result<&mut Fork, ForkError> {
        self.forks
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or(ForkError::NotFound(id))
    }
}
