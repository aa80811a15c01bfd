//! The ground-truth narrative log.
//!
//! Everything that happens in a session lands here exactly once, in order,
//! and never changes afterwards. Entries arrive from the wire in the form
//! `"[agentId]: content"`; parsing is lenient (a missing tag falls back to
//! the narrator) because model output is not always well-behaved.

use serde::{Deserialize, Serialize};

/// A single immutable entry in the narrative record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Agent that authored the entry.
    pub agent: String,

    /// The narrative content, without the leading agent tag.
    pub content: String,

    /// Position in the owning timeline. Assigned on append, never reused.
    pub sequence: u64,
}

impl LogEntry {
    pub fn new(agent: impl Into<String>, content: impl Into<String>, sequence: u64) -> Self {
        Self {
            agent: agent.into(),
            content: content.into(),
            sequence,
        }
    }

    /// Render back to the wire form `"[agent]: content"`.
    pub fn wire_format(&self) -> String {
        format!("[{}]: {}", self.agent, self.content)
    }
}

/// Parse raw agent output into `(author, content)`.
///
/// An entry without a recognizable `[agentId]` prefix is attributed to
/// `fallback` (the narrator). An agent that echoes its own tag a second
/// time inside the content has the duplicate stripped once.
pub fn parse_wire(raw: &str, fallback: &str) -> (String, String) {
    let trimmed = raw.trim();

    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(close) = rest.find("]:") {
            let agent = rest[..close].trim();
            // An empty or multi-line tag is not a tag.
            if !agent.is_empty() && !agent.contains('\n') {
                let mut content = rest[close + 2..].trim_start();
                let echoed = format!("[{agent}]:");
                if let Some(stripped) = content.strip_prefix(echoed.as_str()) {
                    content = stripped.trim_start();
                }
                return (agent.to_string(), content.trim_end().to_string());
            }
        }
    }

    (fallback.to_string(), trimmed.to_string())
}

/// The append-only sequence of entries for one timeline.
///
/// Sequence numbers equal positions: entry `n` has `sequence == n`. That
/// invariant is what lets a fork refer into the shared prefix by index
/// alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundTruthLog {
    entries: Vec<LogEntry>,
}

impl GroundTruthLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new entry, assigning the next sequence number.
    pub fn append(&mut self, agent: impl Into<String>, content: impl Into<String>) -> LogEntry {
        let entry = LogEntry::new(agent, content, self.entries.len() as u64);
        self.entries.push(entry.clone());
        entry
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_sequence(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Entries from `start` (a sequence number) to the end.
    pub fn span_from(&self, start: u64) -> &[LogEntry] {
        let start = (start as usize).min(self.entries.len());
        &self.entries[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_entry() {
        let (agent, content) = parse_wire("[rogue]: I slip into the shadows.", "narrator");
        assert_eq!(agent, "rogue");
        assert_eq!(content, "I slip into the shadows.");
    }

    #[test]
    fn test_parse_untagged_falls_back_to_narrator() {
        let (agent, content) = parse_wire("The door creaks open.", "narrator");
        assert_eq!(agent, "narrator");
        assert_eq!(content, "The door creaks open.");
    }

    #[test]
    fn test_parse_strips_echoed_tag_once() {
        let (agent, content) = parse_wire("[bard]: [bard]: I strum a chord.", "narrator");
        assert_eq!(agent, "bard");
        assert_eq!(content, "I strum a chord.");

        // A third repetition is content, not an echo.
        let (_, content) = parse_wire("[bard]: [bard]: [bard]: hello", "narrator");
        assert_eq!(content, "[bard]: hello");
    }

    #[test]
    fn test_parse_bracket_without_tag() {
        let (agent, content) = parse_wire("[sudden noise] Everyone freezes.", "narrator");
        assert_eq!(agent, "narrator");
        assert_eq!(content, "[sudden noise] Everyone freezes.");
    }

    #[test]
    fn test_append_assigns_sequences() {
        let mut log = GroundTruthLog::new();
        let a = log.append("narrator", "It begins.");
        let b = log.append("rogue", "I listen at the door.");

        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        assert_eq!(log.len(), 2);
        assert_eq!(log.next_sequence(), 2);
    }

    #[test]
    fn test_span_from() {
        let mut log = GroundTruthLog::new();
        for i in 0..5 {
            log.append("narrator", format!("turn {i}"));
        }

        assert_eq!(log.span_from(3).len(), 2);
        assert_eq!(log.span_from(3)[0].sequence, 3);
        assert!(log.span_from(99).is_empty());
    }

    #[test]
    fn test_wire_format_round_trip() {
        let entry = LogEntry::new("warden", "The gate holds.", 7);
        let (agent, content) = parse_wire(&entry.wire_format(), "narrator");
        assert_eq!(agent, "warden");
        assert_eq!(content, "The gate holds.");
    }
}
