//! Checkpoint persistence and transcript export.
//!
//! Layout, one directory per session under the store root:
//!
//! ```text
//! <root>/<session-name>/
//!   config.json                    session id + configuration
//!   checkpoints/turn_000042.json   one self-contained snapshot per turn
//!   transcript.md                  append-only export of the main timeline
//!   forks/<fork-id>/
//!     checkpoints/turn_000043.json checkpoints taken while the fork was active
//!     transcript.md
//! ```
//!
//! Every snapshot is independently loadable: it carries the full session
//! (log, queue, combat, forks, phase) and every agent's memory. Durability
//! is best-effort by contract - a failed checkpoint write is a warning, not
//! a reason to stop the story.

use crate::memory::MemoryManager;
use crate::log::LogEntry;
use crate::session::{Session, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("No checkpoint for turn {turn}")]
    CheckpointMissing { turn: u64 },
}

/// A full, independently-loadable snapshot of a session at one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Snapshot format version for compatibility checking.
    pub version: u32,

    /// When the snapshot was written (unix seconds).
    pub saved_at: String,

    pub session: Session,

    pub memories: MemoryManager,

    /// Quick-access metadata, readable without the full state.
    pub metadata: SnapshotMetadata,
}

/// Metadata about a snapshot for listing and peeking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub session_name: String,
    pub turn_number: u64,
    pub agent_count: usize,
    pub in_combat: bool,
    pub active_fork: Option<Uuid>,
}

impl SessionSnapshot {
    pub fn new(session: Session, memories: MemoryManager) -> Self {
        let metadata = SnapshotMetadata {
            session_name: session.config.name.clone(),
            turn_number: session.turn_number,
            agent_count: memories.agent_ids().count(),
            in_combat: session.combat.is_some(),
            active_fork: session.active_fork,
        };

        Self {
            version: SNAPSHOT_VERSION,
            saved_at: unix_now(),
            session,
            memories,
            metadata,
        }
    }
}

/// On-disk persistence for one session.
#[derive(Debug, Clone)]
pub struct SessionStore {
    session_dir: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the directory for a session and write its
    /// config record.
    pub async fn open(root: impl AsRef<Path>, session: &Session) -> Result<Self, PersistError> {
        let session_dir = root.as_ref().join(sanitize(&session.config.name));
        fs::create_dir_all(session_dir.join("checkpoints")).await?;

        let config_record = ConfigRecord {
            session_id: session.id,
            config: session.config.clone(),
        };
        let content = serde_json::to_string_pretty(&config_record)?;
        fs::write(session_dir.join("config.json"), content).await?;

        Ok(Self { session_dir })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Write a checkpoint for the current turn of the active timeline.
    pub async fn checkpoint(
        &self,
        session: &Session,
        memories: &MemoryManager,
    ) -> Result<u64, PersistError> {
        let snapshot = SessionSnapshot::new(session.clone(), memories.clone());
        let turn = snapshot.session.turn_number;

        let dir = self.checkpoint_dir(session.active_fork);
        fs::create_dir_all(&dir).await?;

        let content = serde_json::to_string_pretty(&snapshot)?;
        fs::write(dir.join(checkpoint_file(turn)), content).await?;
        Ok(turn)
    }

    /// Load the snapshot written at `turn` on the given timeline.
    pub async fn restore(
        &self,
        fork: Option<Uuid>,
        turn: u64,
    ) -> Result<SessionSnapshot, PersistError> {
        let path = self.checkpoint_dir(fork).join(checkpoint_file(turn));
        if !path.exists() {
            return Err(PersistError::CheckpointMissing { turn });
        }

        let content = fs::read_to_string(path).await?;
        let snapshot: SessionSnapshot = serde_json::from_str(&content)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SNAPSHOT_VERSION,
                found: snapshot.version,
            });
        }

        Ok(snapshot)
    }

    /// Turn numbers with checkpoints on the given timeline, ascending.
    pub async fn list_checkpoints(&self, fork: Option<Uuid>) -> Result<Vec<u64>, PersistError> {
        let dir = self.checkpoint_dir(fork);
        let mut turns = Vec::new();

        if !dir.exists() {
            return Ok(turns);
        }

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(turn) = name
                .strip_prefix("turn_")
                .and_then(|s| s.strip_suffix(".json"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                turns.push(turn);
            }
        }

        turns.sort_unstable();
        Ok(turns)
    }

    /// The most recent checkpointed turn on the given timeline.
    pub async fn latest_checkpoint(&self, fork: Option<Uuid>) -> Result<Option<u64>, PersistError> {
        Ok(self.list_checkpoints(fork).await?.last().copied())
    }

    /// Read a checkpoint's metadata without loading the full state.
    pub async fn peek_metadata(
        &self,
        fork: Option<Uuid>,
        turn: u64,
    ) -> Result<SnapshotMetadata, PersistError> {
        let path = self.checkpoint_dir(fork).join(checkpoint_file(turn));
        if !path.exists() {
            return Err(PersistError::CheckpointMissing { turn });
        }
        let content = fs::read_to_string(path).await?;

        #[derive(Deserialize)]
        struct Partial {
            version: u32,
            metadata: SnapshotMetadata,
        }

        let partial: Partial = serde_json::from_str(&content)?;
        if partial.version != SNAPSHOT_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SNAPSHOT_VERSION,
                found: partial.version,
            });
        }

        Ok(partial.metadata)
    }

    /// Append one entry to the active timeline's transcript export.
    pub async fn append_transcript(
        &self,
        fork: Option<Uuid>,
        entry: &LogEntry,
    ) -> Result<(), PersistError> {
        let dir = self.timeline_dir(fork);
        fs::create_dir_all(&dir).await?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("transcript.md"))
            .await?;
        file.write_all(format!("{}\n\n", entry.wire_format()).as_bytes())
            .await?;
        Ok(())
    }

    fn timeline_dir(&self, fork: Option<Uuid>) -> PathBuf {
        match fork {
            Some(id) => self.session_dir.join("forks").join(id.to_string()),
            None => self.session_dir.clone(),
        }
    }

    fn checkpoint_dir(&self, fork: Option<Uuid>) -> PathBuf {
        self.timeline_dir(fork).join("checkpoints")
    }
}

/// The durable record of how the session was configured.
#[derive(Debug, Serialize, Deserialize)]
struct ConfigRecord {
    session_id: Uuid,
    config: SessionConfig,
}

fn checkpoint_file(turn: u64) -> String {
    format!("turn_{turn:06}.json")
}

/// Reduce a session name to a path-safe directory name.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// Current timestamp as unix seconds.
fn unix_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use tempfile::TempDir;

    fn session() -> Session {
        Session::new(SessionConfig::new("Persist Test").with_player("rogue"))
    }

    fn memories(session: &Session) -> MemoryManager {
        let mut manager =
            MemoryManager::new(session.config.narrator.clone(), session.config.chars_per_token);
        manager.register_agent(&session.config.narrator, 8_000);
        for player in &session.config.players {
            manager.register_agent(player, 8_000);
        }
        manager
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("My Tale: Part 2!"), "My_Tale__Part_2_");
    }

    #[test]
    fn test_checkpoint_file_name() {
        assert_eq!(checkpoint_file(42), "turn_000042.json");
    }

    #[tokio::test]
    async fn test_open_writes_config_record() {
        let dir = TempDir::new().expect("temp dir");
        let session = session();

        let store = SessionStore::open(dir.path(), &session).await.unwrap();
        assert!(store.session_dir().join("config.json").exists());
    }

    #[tokio::test]
    async fn test_checkpoint_and_restore() {
        let dir = TempDir::new().expect("temp dir");
        let mut session = session();
        let mut manager = memories(&session);

        let entry = session.append_entry("narrator", "It begins.");
        manager.record_entry(&entry, &crate::memory::OpenTable);
        session.turn_number = 1;

        let store = SessionStore::open(dir.path(), &session).await.unwrap();
        let turn = store.checkpoint(&session, &manager).await.unwrap();
        assert_eq!(turn, 1);

        let snapshot = store.restore(None, 1).await.unwrap();
        assert_eq!(snapshot.session.turn_number, 1);
        assert_eq!(snapshot.session.log.len(), 1);
        assert_eq!(snapshot.metadata.agent_count, 2);
        assert_eq!(
            snapshot
                .memories
                .memory("rogue")
                .unwrap()
                .short_term()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_restore_missing_turn() {
        let dir = TempDir::new().expect("temp dir");
        let session = session();
        let store = SessionStore::open(dir.path(), &session).await.unwrap();

        assert!(matches!(
            store.restore(None, 99).await,
            Err(PersistError::CheckpointMissing { turn: 99 })
        ));
    }

    #[tokio::test]
    async fn test_list_and_latest() {
        let dir = TempDir::new().expect("temp dir");
        let mut session = session();
        let manager = memories(&session);
        let store = SessionStore::open(dir.path(), &session).await.unwrap();

        for turn in [3u64, 1, 2] {
            session.turn_number = turn;
            store.checkpoint(&session, &manager).await.unwrap();
        }

        assert_eq!(store.list_checkpoints(None).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(store.latest_checkpoint(None).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_fork_checkpoints_live_alongside_main() {
        let dir = TempDir::new().expect("temp dir");
        let mut session = session();
        let manager = memories(&session);
        let store = SessionStore::open(dir.path(), &session).await.unwrap();

        session.turn_number = 1;
        store.checkpoint(&session, &manager).await.unwrap();

        let fork_id = session.create_fork("branch").unwrap();
        session.turn_number = 2;
        store.checkpoint(&session, &manager).await.unwrap();

        assert_eq!(store.list_checkpoints(None).await.unwrap(), vec![1]);
        assert_eq!(
            store.list_checkpoints(Some(fork_id)).await.unwrap(),
            vec![2]
        );
    }

    #[tokio::test]
    async fn test_peek_metadata() {
        let dir = TempDir::new().expect("temp dir");
        let mut session = session();
        let manager = memories(&session);
        let store = SessionStore::open(dir.path(), &session).await.unwrap();

        session.turn_number = 5;
        store.checkpoint(&session, &manager).await.unwrap();

        let metadata = store.peek_metadata(None, 5).await.unwrap();
        assert_eq!(metadata.session_name, "Persist Test");
        assert_eq!(metadata.turn_number, 5);
        assert!(!metadata.in_combat);
    }

    #[tokio::test]
    async fn test_transcript_appends() {
        let dir = TempDir::new().expect("temp dir");
        let session = session();
        let store = SessionStore::open(dir.path(), &session).await.unwrap();

        let a = LogEntry::new("narrator", "First.", 0);
        let b = LogEntry::new("rogue", "Second.", 1);
        store.append_transcript(None, &a).await.unwrap();
        store.append_transcript(None, &b).await.unwrap();

        let text = std::fs::read_to_string(store.session_dir().join("transcript.md")).unwrap();
        assert_eq!(text, "[narrator]: First.\n\n[rogue]: Second.\n\n");
    }
}
