//! Session journal — durable, append-only NDJSON record of a conversation.
//!
//! Line 1 is the session header; every later line is one message entry.
//! Opening a journal written by an older version migrates it in memory and
//! rewrites the file atomically (tmp + rename) before anything is appended.
//! Appends are fsync'd; the journal is the durable source of truth and
//! `build_context()` must equal the in-memory context after every append.

use crate::types::{new_id, now_ms, Message};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CURRENT_VERSION: u32 = 2;

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEntry {
    #[serde(rename = "session")]
    Header {
        #[serde(default = "default_version")]
        version: u32,
        id: String,
        cwd: String,
        timestamp: u64,
    },
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        id: String,
        #[serde(rename = "parentId", default)]
        parent_id: Option<String>,
        timestamp: u64,
        message: Message,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal format: {0}")]
    Format(String),
}

/// Owns one session file. External concurrent writers yield undefined
/// behaviour; a single `SessionJournal` per file.
pub struct SessionJournal {
    path: PathBuf,
    file: File,
    session_id: String,
    version: u32,
    last_entry_id: Option<String>,
}

impl SessionJournal {
    /// Create a fresh journal, writing and fsync'ing the header line.
    pub fn create(path: impl Into<PathBuf>, cwd: impl Into<String>) -> Result<Self, JournalError> {
        let path = path.into();
        let session_id = new_id();
        let header = SessionEntry::Header {
            version: CURRENT_VERSION,
            id: session_id.clone(),
            cwd: cwd.into(),
            timestamp: now_ms(),
        };
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        let line = serde_json::to_string(&header)
            .map_err(|e| JournalError::Format(e.to_string()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        debug!(path = %path.display(), session_id = session_id.as_str(), "session journal created");
        Ok(Self {
            path,
            file,
            session_id,
            version: CURRENT_VERSION,
            last_entry_id: None,
        })
    }

    /// Open an existing journal, migrating it upward if the header is stale.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path)?;
        let mut lines: Vec<serde_json::Value> = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| JournalError::Format(format!("malformed journal line: {}", e)))?;
            lines.push(value);
        }

        let header = lines
            .first()
            .filter(|value| value["type"] == "session")
            .ok_or_else(|| JournalError::Format("missing session header".into()))?;
        let version = header["version"].as_u64().unwrap_or(1) as u32;
        let session_id = header["id"].as_str().unwrap_or_default().to_string();

        if version > CURRENT_VERSION {
            return Err(JournalError::Format(format!(
                "journal version {} is newer than supported {}",
                version, CURRENT_VERSION
            )));
        }

        if version < CURRENT_VERSION {
            debug!(from = version, to = CURRENT_VERSION, "migrating session journal");
            migrate(&mut lines);
            rewrite_atomic(&path, &lines)?;
        }

        let last_entry_id = lines
            .iter()
            .rev()
            .find(|value| value["type"] == "message")
            .and_then(|value| value["id"].as_str())
            .map(str::to_string);

        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            session_id,
            version: CURRENT_VERSION,
            last_entry_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Append one message entry and fsync.
    pub fn append_message(&mut self, message: &Message) -> Result<(), JournalError> {
        let entry = SessionEntry::Message {
            id: new_id(),
            parent_id: self.last_entry_id.clone(),
            timestamp: now_ms(),
            message: message.clone(),
        };
        let line = serde_json::to_string(&entry)
            .map_err(|e| JournalError::Format(e.to_string()))?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.sync_data()?;
        if let SessionEntry::Message { id, .. } = entry {
            self.last_entry_id = Some(id);
        }
        Ok(())
    }

    /// Reconstruct the conversation from disk, in file order. Header and
    /// malformed lines are filtered out (the latter with a warning).
    pub fn build_context(&self) -> Result<Vec<Message>, JournalError> {
        let raw = std::fs::read_to_string(&self.path)?;
        let mut messages = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionEntry>(line) {
                Ok(SessionEntry::Message { message, .. }) => messages.push(message),
                Ok(SessionEntry::Header { .. }) => {}
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "skipping malformed journal line");
                }
            }
        }
        Ok(messages)
    }
}

/// In-memory upward migration: bump the header version and backfill every
/// missing or empty entry id with a fresh opaque id. Never removes a line.
fn migrate(lines: &mut [serde_json::Value]) {
    for (index, value) in lines.iter_mut().enumerate() {
        if index == 0 {
            value["version"] = serde_json::json!(CURRENT_VERSION);
            continue;
        }
        if value["type"] == "message" {
            let id_missing = value["id"].as_str().map(str::is_empty).unwrap_or(true);
            if id_missing {
                value["id"] = serde_json::json!(new_id());
            }
        }
    }
}

/// Write tmp + rename so readers never observe a torn file.
fn rewrite_atomic(path: &Path, lines: &[serde_json::Value]) -> Result<(), JournalError> {
    let tmp_path = path.with_extension("jsonl.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        for value in lines {
            let line = serde_json::to_string(value)
                .map_err(|e| JournalError::Format(e.to_string()))?;
            tmp.write_all(line.as_bytes())?;
            tmp.write_all(b"\n")?;
        }
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
