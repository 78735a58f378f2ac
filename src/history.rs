use serde::{Deserialize, Serialize};

use crate::images::ImageAttachment;
use crate::storage::{Storage, StorageError};

/// Storage key the serialized transcript lives under.
pub const STORAGE_KEY: &str = "dalma_chat";

/// How many trailing turns are replayed to the upstream provider.
pub const TRANSPORT_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    /// The web client historically sent "bot" for this role.
    #[serde(alias = "bot")]
    Assistant,
}

/// One message in the transcript. Attached images never survive
/// persistence; only role, text, timestamp and the error marker do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    #[serde(skip)]
    pub images: Vec<ImageAttachment>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

impl Turn {
    /// A user turn must carry text or at least one image. Returns `None`
    /// otherwise so an empty turn can never enter the transcript.
    pub fn user(text: &str, images: Vec<ImageAttachment>, timestamp: i64) -> Option<Turn> {
        if text.trim().is_empty() && images.is_empty() {
            return None;
        }
        Some(Turn {
            role: Role::User,
            text: text.to_string(),
            images,
            timestamp,
            error: false,
        })
    }

    pub fn assistant(text: String, timestamp: i64) -> Turn {
        Turn {
            role: Role::Assistant,
            text,
            images: Vec::new(),
            timestamp,
            error: false,
        }
    }

    /// The synthetic apology turn appended when a send fails.
    pub fn assistant_error(text: &str, timestamp: i64) -> Turn {
        Turn {
            role: Role::Assistant,
            text: text.to_string(),
            images: Vec::new(),
            timestamp,
            error: true,
        }
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Append-only transcript with best-effort persistence. Interior turns are
/// never removed; the only truncation is the whole-log eviction when the
/// storage backend reports it is full.
pub struct HistoryStore {
    turns: Vec<Turn>,
    storage: Box<dyn Storage>,
}

impl HistoryStore {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        HistoryStore {
            turns: Vec::new(),
            storage,
        }
    }

    /// Timestamps are kept non-decreasing: a turn stamped earlier than the
    /// current tail is clamped to the tail's timestamp.
    pub fn append(&mut self, mut turn: Turn) {
        if let Some(last) = self.turns.last() {
            if turn.timestamp < last.timestamp {
                turn.timestamp = last.timestamp;
            }
        }
        self.turns.push(turn);
    }

    /// The last `n` turns, oldest first. For `n` past the log length this
    /// is the whole log.
    pub fn trailing(&self, n: usize) -> Vec<Turn> {
        let start = self.turns.len().saturating_sub(n);
        self.turns[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Replace the in-memory log from storage. Absent, unreadable or
    /// malformed state all start an empty transcript rather than failing.
    pub fn load(&mut self) {
        self.turns = match self.storage.get(STORAGE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(turns) => turns,
                Err(err) => {
                    tracing::warn!(error = %err, "discarding malformed chat history");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                tracing::warn!(error = %err, "could not read chat history");
                Vec::new()
            }
        };
    }

    /// Best-effort persist. When the backend reports it is full the oldest
    /// half of the log (by count) is evicted and the write retried exactly
    /// once; any remaining failure is logged and swallowed.
    pub fn persist(&mut self) {
        let result = match self.write_snapshot() {
            Err(StorageError::CapacityExceeded) => {
                let half = self.turns.len() / 2;
                self.turns.drain(..half);
                tracing::warn!(evicted = half, "storage full, evicted oldest half of history");
                self.write_snapshot()
            }
            other => other,
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "chat history not persisted");
        }
    }

    fn write_snapshot(&self) -> Result<(), StorageError> {
        let raw = serde_json::to_string(&self.turns)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.storage.put(STORAGE_KEY, &raw)
    }
}
