// SPDX-License-Identifier: AGPL-3.0
// Lanpost Core - Shared session engine for all frontends
//
// This crate provides:
// - Message and SessionError types
// - Length-prefixed JSON wire codec
// - Connection state machine and Session engine
// - Inbox shared with display frontends
// - SettingsStore and MessageHistory for local persistence
//
// Frontend-specific code lives in separate crates.

pub mod codec;
pub mod connection;
pub mod history;
pub mod inbox;
pub mod session;
pub mod settings;
pub mod types;

// Re-export commonly used items
pub use codec::{Frame, MAX_FRAME_SIZE};
pub use connection::Connection;
pub use history::MessageHistory;
pub use inbox::Inbox;
pub use session::Session;
pub use settings::{SessionSettings, SettingsStore};
pub use types::{ConnectionState, FileHeader, Message, SessionError, SessionEvent};
