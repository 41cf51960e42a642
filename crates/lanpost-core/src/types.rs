// SPDX-License-Identifier: AGPL-3.0
// Lanpost Core - Type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use uuid::Uuid;

/// One chat message. Immutable once created; the Inbox owns it after append
/// and readers only ever see clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id, generated at creation
    pub id: Uuid,
    /// Display name of the sending peer
    pub sender: String,
    /// Message body
    pub content: String,
    /// Creation time (RFC 3339 on the wire)
    pub timestamp: DateTime<Utc>,
    /// Optional reference to an attached file, omitted on the wire if absent
    #[serde(rename = "fileURL", default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

impl Message {
    /// Build a new message with a fresh id and the current time
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            content: content.into(),
            timestamp: Utc::now(),
            file_url: None,
        }
    }

    /// Build a message referencing a received or attached file
    pub fn with_file(sender: impl Into<String>, content: impl Into<String>, url: String) -> Self {
        Self {
            file_url: Some(url),
            ..Self::new(sender, content)
        }
    }
}

/// Header travelling in front of the raw bytes of a file frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHeader {
    /// Original file name as chosen by the sender
    pub name: String,
    /// Display name of the sending peer
    pub sender: String,
    /// Exact number of payload bytes following the header
    pub size: u64,
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    Closed,
}

/// Events emitted by the session engine for the display collaborator
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A chat message was decoded from a peer and appended to the inbox
    MessageReceived { message: Message },
    /// A file payload was received and saved to the download directory
    FileReceived {
        from: String,
        path: PathBuf,
        size: u64,
    },
    /// A send attempt finished; fires exactly once per attempt
    SendCompleted {
        message_id: Uuid,
        peer: SocketAddr,
        error: Option<String>,
    },
    /// An inbound or outbound connection reached Ready
    PeerConnected { addr: SocketAddr },
    /// A connection transitioned to Closed
    ConnectionClosed {
        addr: SocketAddr,
        reason: Option<String>,
    },
}

/// Error types for the session engine
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to bind listener: {0}")]
    Bind(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("File I/O error: {0}")]
    FileIo(String),

    #[error("Not connected to {0}")]
    NotConnected(SocketAddr),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}
