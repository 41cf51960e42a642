// SPDX-License-Identifier: AGPL-3.0
// Lanpost Core - Message history persistence
//
// Stores past messages in a local JSON file so a frontend can restore the
// conversation across restarts. The live Inbox stays the source of truth
// while the session runs; history is written from its snapshots.

use crate::types::{Message, SessionError};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

/// Maximum number of history entries to keep
const MAX_HISTORY_ENTRIES: usize = 500;

/// File-based message history storage
pub struct MessageHistory {
    messages: RwLock<Vec<Message>>,
    file_path: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct HistoryFile {
    messages: Vec<Message>,
}

impl MessageHistory {
    /// Create a new history store at the default location, loading from
    /// disk if available
    pub fn new() -> Result<Self, SessionError> {
        Self::with_path(Self::get_history_path()?)
    }

    /// Create a history store backed by an explicit file path
    pub fn with_path(file_path: PathBuf) -> Result<Self, SessionError> {
        let messages = if file_path.exists() {
            let content = fs::read_to_string(&file_path)
                .map_err(|e| SessionError::FileIo(format!("Failed to read history: {}", e)))?;

            let file: HistoryFile = serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse history, starting fresh: {}", e);
                HistoryFile {
                    messages: Vec::new(),
                }
            });

            file.messages
        } else {
            Vec::new()
        };

        Ok(Self {
            messages: RwLock::new(messages),
            file_path,
        })
    }

    /// Get the path to the history file
    fn get_history_path() -> Result<PathBuf, SessionError> {
        let config_dir = directories::ProjectDirs::from("org", "lanpost", "lanpost")
            .ok_or_else(|| {
                SessionError::FileIo("Could not determine config directory".to_string())
            })?
            .config_dir()
            .to_path_buf();

        fs::create_dir_all(&config_dir)
            .map_err(|e| SessionError::FileIo(format!("Failed to create config dir: {}", e)))?;

        Ok(config_dir.join("history.json"))
    }

    /// Persist history to disk
    fn persist(&self) -> Result<(), SessionError> {
        let messages = self.messages.read().unwrap();
        let file = HistoryFile {
            messages: messages.clone(),
        };

        let content = serde_json::to_string_pretty(&file).map_err(|e| {
            SessionError::Serialization(format!("Failed to serialize history: {}", e))
        })?;

        fs::write(&self.file_path, content)
            .map_err(|e| SessionError::FileIo(format!("Failed to write history: {}", e)))?;

        Ok(())
    }

    /// Get all stored messages, oldest first
    pub fn list(&self) -> Vec<Message> {
        self.messages.read().unwrap().clone()
    }

    /// Replace the stored history with an inbox snapshot and persist it.
    /// Keeps only the newest MAX_HISTORY_ENTRIES messages.
    pub fn record(&self, snapshot: Vec<Message>) -> Result<(), SessionError> {
        {
            let mut messages = self.messages.write().unwrap();
            *messages = snapshot;

            if messages.len() > MAX_HISTORY_ENTRIES {
                let drop = messages.len() - MAX_HISTORY_ENTRIES;
                messages.drain(..drop);
            }
        }

        self.persist()
    }

    /// Clear all history
    pub fn clear(&self) -> Result<(), SessionError> {
        {
            let mut messages = self.messages.write().unwrap();
            messages.clear();
        }

        self.persist()
    }

    /// Get the count of history entries
    pub fn count(&self) -> usize {
        self.messages.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_history() -> MessageHistory {
        let path = std::env::temp_dir().join(format!("lanpost-history-{}.json", uuid::Uuid::new_v4()));
        MessageHistory::with_path(path).unwrap()
    }

    #[test]
    fn test_record_and_reload() {
        let history = temp_history();
        let path = history.file_path.clone();

        history
            .record(vec![Message::new("A", "hello"), Message::new("B", "world")])
            .unwrap();
        assert_eq!(history.count(), 2);

        let reloaded = MessageHistory::with_path(path.clone()).unwrap();
        assert_eq!(reloaded.count(), 2);
        assert_eq!(reloaded.list()[0].content, "hello");

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_record_trims_to_limit() {
        let history = temp_history();
        let path = history.file_path.clone();

        let snapshot: Vec<Message> = (0..MAX_HISTORY_ENTRIES + 10)
            .map(|i| Message::new("A", format!("{}", i)))
            .collect();
        history.record(snapshot).unwrap();

        assert_eq!(history.count(), MAX_HISTORY_ENTRIES);
        // Oldest entries were dropped
        assert_eq!(history.list()[0].content, "10");

        let _ = fs::remove_file(path);
    }
}
