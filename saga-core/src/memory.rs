//! Per-agent memory and the role-gated context model.
//!
//! Each agent owns a short-term buffer of recent entries, a long-term
//! summary that only ever grows, and a small set of bounded character
//! facts. Players see their own memory and nothing else; the narrator sees
//! the union of everyone's. The asymmetry is intentional - it is what lets
//! the narrator react to things players keep from each other.
//!
//! Isolation is enforced by construction: a [`PlayerContext`] can only be
//! built from a single agent's memory, so there is no code path by which
//! one player's buffer leaks into another's prompt.

use crate::agent::TranscriptMessage;
use crate::log::LogEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Entries kept in the buffer after a compression pass.
pub const RETAINED_AFTER_COMPRESSION: usize = 4;

/// Fraction of the char budget at which compression triggers.
const COMPRESSION_TRIGGER: f32 = 0.8;

const TRAIT_CAP: usize = 10;
const RELATIONSHIP_CAP: usize = 20;
const EVENT_CAP: usize = 20;

/// Errors from memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("no memory registered for agent {0}")]
    UnknownAgent(String),
}

/// Errors from a summarization call.
#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("summarization timed out")]
    Timeout,

    #[error("summarization failed: {0}")]
    Failed(String),
}

/// Folds evicted buffer entries into prose. Usually LLM-backed.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        prior_summary: &str,
        entries: &[LogEntry],
    ) -> Result<String, SummarizeError>;
}

/// Model-free fallback summarizer: folds evicted entries into a terse
/// digest. Loses detail but never blocks on the network, so compression
/// always has a working default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestSummarizer;

#[async_trait]
impl Summarizer for DigestSummarizer {
    async fn summarize(
        &self,
        _prior_summary: &str,
        entries: &[LogEntry],
    ) -> Result<String, SummarizeError> {
        let mut out = format!("Condensed {} earlier turns.", entries.len());
        let tail_start = entries.len().saturating_sub(3);
        for entry in &entries[tail_start..] {
            let content: String = entry.content.chars().take(80).collect();
            let ellipsis = if entry.content.chars().count() > 80 {
                "..."
            } else {
                ""
            };
            out.push_str(&format!("\n- [{}] {content}{ellipsis}", entry.agent));
        }
        Ok(out)
    }
}

/// LLM-backed summarizer that folds entries into an updated prose summary.
pub struct LlmSummarizer {
    client: claude::Claude,
    model: Option<String>,
}

impl LlmSummarizer {
    pub fn new(client: claude::Claude) -> Self {
        Self {
            client,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        prior_summary: &str,
        entries: &[LogEntry],
    ) -> Result<String, SummarizeError> {
        let mut prompt = String::new();
        if !prior_summary.is_empty() {
            prompt.push_str("Summary so far:\n");
            prompt.push_str(prior_summary);
            prompt.push_str("\n\n");
        }
        prompt.push_str("New transcript to fold in:\n");
        for entry in entries {
            prompt.push_str(&entry.wire_format());
            prompt.push('\n');
        }

        let mut request = claude::Request::new(vec![claude::Message::user(prompt)])
            .with_system(
                "You condense role-play transcripts. Fold the new transcript into a short \
                 running summary that preserves names, goals, and unresolved threads. \
                 Respond with the new summary paragraph only.",
            )
            .with_max_tokens(1024);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }

        let response = self
            .client
            .complete(request)
            .await
            .map_err(|e| SummarizeError::Failed(e.to_string()))?;

        let text = response.text.trim().to_string();
        if text.is_empty() {
            return Err(SummarizeError::Failed(
                "summarizer returned empty text".to_string(),
            ));
        }
        Ok(text)
    }
}

/// Decides which agents may see a given entry.
///
/// The narrator is exempt: its composite view always includes everything.
/// The actual secrecy rules (whispers, hidden rolls) live with the caller;
/// the default lets every agent see every entry.
pub trait Visibility: Send + Sync {
    fn visible_to(&self, entry: &LogEntry, viewer: &str) -> bool;
}

/// Everything visible to everyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenTable;

impl Visibility for OpenTable {
    fn visible_to(&self, _entry: &LogEntry, _viewer: &str) -> bool {
        true
    }
}

/// What kind of character fact is being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactKind {
    Trait,
    Relationship,
    NotableEvent,
}

/// Bounded lists of durable notes about a character.
///
/// Each list dedups by value and evicts its oldest entry past the cap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterFacts {
    traits: Vec<String>,
    relationships: Vec<String>,
    notable_events: Vec<String>,
}

impl CharacterFacts {
    pub fn note(&mut self, kind: FactKind, value: impl Into<String>) {
        let (list, cap) = match kind {
            FactKind::Trait => (&mut self.traits, TRAIT_CAP),
            FactKind::Relationship => (&mut self.relationships, RELATIONSHIP_CAP),
            FactKind::NotableEvent => (&mut self.notable_events, EVENT_CAP),
        };
        let value = value.into();
        if list.contains(&value) {
            return;
        }
        list.push(value);
        if list.len() > cap {
            list.remove(0);
        }
    }

    pub fn traits(&self) -> &[String] {
        &self.traits
    }

    pub fn relationships(&self) -> &[String] {
        &self.relationships
    }

    pub fn notable_events(&self) -> &[String] {
        &self.notable_events
    }

    pub fn is_empty(&self) -> bool {
        self.traits.is_empty() && self.relationships.is_empty() && self.notable_events.is_empty()
    }

    fn render(&self, out: &mut String) {
        if self.is_empty() {
            return;
        }
        out.push_str("### Character notes\n");
        for (label, list) in [
            ("Traits", &self.traits),
            ("Relationships", &self.relationships),
            ("Notable events", &self.notable_events),
        ] {
            if list.is_empty() {
                continue;
            }
            out.push_str(&format!("**{label}:**\n"));
            for item in list {
                out.push_str(&format!("- {item}\n"));
            }
        }
    }
}

/// One agent's complete memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMemory {
    short_term: Vec<LogEntry>,
    long_term_summary: String,
    pub facts: CharacterFacts,
    token_budget: usize,
}

impl AgentMemory {
    pub fn new(token_budget: usize) -> Self {
        Self {
            short_term: Vec::new(),
            long_term_summary: String::new(),
            facts: CharacterFacts::default(),
            token_budget,
        }
    }

    /// Record an entry this agent can see.
    pub fn observe(&mut self, entry: &LogEntry) {
        self.short_term.push(entry.clone());
    }

    pub fn short_term(&self) -> &[LogEntry] {
        &self.short_term
    }

    pub fn summary(&self) -> &str {
        &self.long_term_summary
    }

    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    /// Character length of the buffer, tag overhead included.
    pub fn buffer_chars(&self) -> usize {
        self.short_term
            .iter()
            .map(|e| e.agent.len() + e.content.len() + 4)
            .sum()
    }

    /// Append a new paragraph to the summary; it never shrinks.
    fn absorb_summary(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.long_term_summary.is_empty() {
            self.long_term_summary.push_str("\n\n");
        }
        self.long_term_summary.push_str(text);
    }

    /// Entries that would be folded by a compression pass.
    fn compressible(&self) -> &[LogEntry] {
        let keep_from = self.short_term.len().saturating_sub(RETAINED_AFTER_COMPRESSION);
        &self.short_term[..keep_from]
    }

    fn drop_compressed(&mut self, count: usize) {
        self.short_term.drain(..count.min(self.short_term.len()));
    }
}

/// What `maybe_compress` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionOutcome {
    /// Buffer under threshold; nothing happened.
    NotNeeded,

    /// Entries folded into the summary.
    Compressed { folded: usize },

    /// Summarization failed; oldest entries were dropped without summary.
    EmergencyTrimmed { dropped: usize },
}

/// Owns every agent's memory and builds role-gated contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryManager {
    memories: BTreeMap<String, AgentMemory>,
    narrator: String,
    chars_per_token: f32,
}

impl MemoryManager {
    pub fn new(narrator: impl Into<String>, chars_per_token: f32) -> Self {
        Self {
            memories: BTreeMap::new(),
            narrator: narrator.into(),
            chars_per_token,
        }
    }

    pub fn register_agent(&mut self, id: impl Into<String>, token_budget: usize) {
        self.memories
            .entry(id.into())
            .or_insert_with(|| AgentMemory::new(token_budget));
    }

    pub fn narrator_id(&self) -> &str {
        &self.narrator
    }

    pub fn agent_ids(&self) -> impl Iterator<Item = &str> {
        self.memories.keys().map(String::as_str)
    }

    pub fn memory(&self, id: &str) -> Result<&AgentMemory, MemoryError> {
        self.memories
            .get(id)
            .ok_or_else(|| MemoryError::UnknownAgent(id.to_string()))
    }

    pub fn memory_mut(&mut self, id: &str) -> Result<&mut AgentMemory, MemoryError> {
        self.memories
            .get_mut(id)
            .ok_or_else(|| MemoryError::UnknownAgent(id.to_string()))
    }

    /// Fan a freshly appended entry out to every buffer allowed to see it.
    ///
    /// The narrator's buffer receives everything regardless of the
    /// visibility rule; player buffers receive what the rule permits.
    pub fn record_entry(&mut self, entry: &LogEntry, visibility: &dyn Visibility) {
        for (id, memory) in &mut self.memories {
            if *id == self.narrator || visibility.visible_to(entry, id) {
                memory.observe(entry);
            }
        }
    }

    /// Record a durable character fact for one agent.
    pub fn note_fact(
        &mut self,
        id: &str,
        kind: FactKind,
        value: impl Into<String>,
    ) -> Result<(), MemoryError> {
        self.memory_mut(id)?.facts.note(kind, value);
        Ok(())
    }

    /// Build the context for an agent's turn, gated by role.
    pub fn build_context(&self, agent_id: &str) -> Result<AgentContext<'_>, MemoryError> {
        if agent_id == self.narrator {
            let views: Vec<(&str, &AgentMemory)> = self
                .memories
                .iter()
                .map(|(id, m)| (id.as_str(), m))
                .collect();
            Ok(AgentContext::Narrator(NarratorContext {
                narrator: &self.narrator,
                views,
            }))
        } else {
            let (id, memory) = self
                .memories
                .get_key_value(agent_id)
                .ok_or_else(|| MemoryError::UnknownAgent(agent_id.to_string()))?;
            Ok(AgentContext::Player(PlayerContext {
                agent_id: id,
                memory,
            }))
        }
    }

    /// The char length past which an agent's buffer must compress.
    pub fn compression_threshold(&self, memory: &AgentMemory) -> usize {
        (memory.token_budget as f32 * self.chars_per_token * COMPRESSION_TRIGGER) as usize
    }

    pub fn needs_compression(&self, id: &str) -> Result<bool, MemoryError> {
        let memory = self.memory(id)?;
        Ok(memory.buffer_chars() > self.compression_threshold(memory))
    }

    /// Compress one agent's buffer if it is over threshold.
    ///
    /// On summarizer failure or timeout the oldest entries are dropped
    /// outright - losing recall is better than stalling the scheduler on an
    /// ever-growing buffer.
    pub async fn maybe_compress(
        &mut self,
        id: &str,
        summarizer: &dyn Summarizer,
        timeout: Duration,
    ) -> Result<CompressionOutcome, MemoryError> {
        if !self.needs_compression(id)? {
            return Ok(CompressionOutcome::NotNeeded);
        }

        let memory = self.memory(id)?;
        let to_fold = memory.compressible().to_vec();
        if to_fold.is_empty() {
            return Ok(CompressionOutcome::NotNeeded);
        }
        let prior = memory.summary().to_string();

        let result = tokio::time::timeout(timeout, summarizer.summarize(&prior, &to_fold)).await;

        let memory = self.memory_mut(id)?;
        match result {
            Ok(Ok(summary)) => {
                memory.absorb_summary(&summary);
                memory.drop_compressed(to_fold.len());
                Ok(CompressionOutcome::Compressed {
                    folded: to_fold.len(),
                })
            }
            Ok(Err(e)) => {
                warn!(agent = id, error = %e, "summarization failed; applying emergency trim");
                memory.drop_compressed(to_fold.len());
                Ok(CompressionOutcome::EmergencyTrimmed {
                    dropped: to_fold.len(),
                })
            }
            Err(_) => {
                warn!(agent = id, "summarization timed out; applying emergency trim");
                memory.drop_compressed(to_fold.len());
                Ok(CompressionOutcome::EmergencyTrimmed {
                    dropped: to_fold.len(),
                })
            }
        }
    }
}

/// A context ready to hand to the resilience layer, gated by role.
#[derive(Debug)]
pub enum AgentContext<'a> {
    Player(PlayerContext<'a>),
    Narrator(NarratorContext<'a>),
}

impl AgentContext<'_> {
    pub fn agent_id(&self) -> &str {
        match self {
            AgentContext::Player(c) => c.agent_id,
            AgentContext::Narrator(c) => c.narrator,
        }
    }

    /// The memory-derived portion of the system prompt.
    pub fn system_block(&self) -> String {
        match self {
            AgentContext::Player(c) => c.system_block(),
            AgentContext::Narrator(c) => c.system_block(),
        }
    }

    /// The visible conversation, oldest first.
    pub fn transcript(&self) -> Vec<TranscriptMessage> {
        match self {
            AgentContext::Player(c) => c.transcript(),
            AgentContext::Narrator(c) => c.transcript(),
        }
    }
}

/// A single player's view: its own memory, nothing else.
#[derive(Debug)]
pub struct PlayerContext<'a> {
    agent_id: &'a str,
    memory: &'a AgentMemory,
}

impl PlayerContext<'_> {
    pub fn memory(&self) -> &AgentMemory {
        self.memory
    }

    fn system_block(&self) -> String {
        let mut out = String::new();
        if !self.memory.summary().is_empty() {
            out.push_str("## What you remember\n");
            out.push_str(self.memory.summary());
            out.push_str("\n\n");
        }
        self.memory.facts.render(&mut out);
        out
    }

    fn transcript(&self) -> Vec<TranscriptMessage> {
        self.memory
            .short_term()
            .iter()
            .map(|e| TranscriptMessage {
                speaker: e.agent.clone(),
                text: e.content.clone(),
            })
            .collect()
    }
}

/// The narrator's composite view: the union of every agent's memory.
///
/// Built fresh at context time rather than kept as a shared buffer, so the
/// superset guarantee survives independent per-agent compression.
#[derive(Debug)]
pub struct NarratorContext<'a> {
    narrator: &'a str,
    views: Vec<(&'a str, &'a AgentMemory)>,
}

impl NarratorContext<'_> {
    pub fn views(&self) -> &[(&str, &AgentMemory)] {
        &self.views
    }

    fn system_block(&self) -> String {
        let mut out = String::new();
        for (id, memory) in &self.views {
            if memory.summary().is_empty() && memory.facts.is_empty() {
                continue;
            }
            out.push_str(&format!("## {id}\n"));
            if !memory.summary().is_empty() {
                out.push_str(memory.summary());
                out.push_str("\n\n");
            }
            memory.facts.render(&mut out);
            out.push('\n');
        }
        out
    }

    /// Union of all buffers, deduplicated by sequence, in log order.
    fn transcript(&self) -> Vec<TranscriptMessage> {
        let mut merged: BTreeMap<u64, &LogEntry> = BTreeMap::new();
        for (_, memory) in &self.views {
            for entry in memory.short_term() {
                merged.entry(entry.sequence).or_insert(entry);
            }
        }
        merged
            .values()
            .map(|e| TranscriptMessage {
                speaker: e.agent.clone(),
                text: e.content.clone(),
            })
            .collect()
    }
}
