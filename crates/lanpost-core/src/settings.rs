// SPDX-License-Identifier: AGPL-3.0
// Lanpost Core - Settings
//
// Settings are stored in a local JSON file.
// No cloud sync, no tracking, just simple local persistence.

use crate::types::SessionError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

/// Session settings (frontend-agnostic)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    /// Port the session listener binds (default: 12345)
    pub port: u16,
    /// Device name used as the sender field of outgoing messages
    pub device_name: String,
    /// Directory where received file payloads are saved
    pub download_dir: PathBuf,
    /// Outbound connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Optional receive idle timeout in seconds. None means a connection
    /// may sit idle indefinitely, which is normal for a chat link.
    #[serde(default)]
    pub read_timeout_secs: Option<u64>,
    /// Maximum retry attempts for a failed outbound connect
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between connect retries in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for SessionSettings {
    fn default() -> Self {
        let download_dir = directories::UserDirs::new()
            .and_then(|d| d.download_dir().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            port: 12345,
            device_name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "Lanpost Device".to_string()),
            download_dir,
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: None,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl SessionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// In-memory cache of settings, persisted to disk on changes
pub struct SettingsStore {
    settings: RwLock<SessionSettings>,
    file_path: PathBuf,
}

impl SettingsStore {
    /// Create a new settings store, loading from disk if available
    pub fn new() -> Result<Self, SessionError> {
        let file_path = Self::get_settings_path()?;
        tracing::info!("Settings file path: {:?}", file_path);

        let settings = if file_path.exists() {
            let content = fs::read_to_string(&file_path)
                .map_err(|e| SessionError::FileIo(format!("Failed to read settings: {}", e)))?;

            serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse settings, using defaults: {}", e);
                SessionSettings::default()
            })
        } else {
            tracing::info!("No settings file found, using defaults");
            SessionSettings::default()
        };

        let store = Self {
            settings: RwLock::new(settings),
            file_path,
        };

        if !store.file_path.exists() {
            store.persist()?;
        }

        Ok(store)
    }

    /// Get the path to the settings file
    fn get_settings_path() -> Result<PathBuf, SessionError> {
        let config_dir = directories::ProjectDirs::from("org", "lanpost", "lanpost")
            .ok_or_else(|| {
                SessionError::FileIo("Could not determine config directory".to_string())
            })?
            .config_dir()
            .to_path_buf();

        fs::create_dir_all(&config_dir)
            .map_err(|e| SessionError::FileIo(format!("Failed to create config dir: {}", e)))?;

        Ok(config_dir.join("settings.json"))
    }

    /// Persist settings to disk
    fn persist(&self) -> Result<(), SessionError> {
        let settings = self.settings.read().unwrap();

        let content = serde_json::to_string_pretty(&*settings).map_err(|e| {
            SessionError::Serialization(format!("Failed to serialize settings: {}", e))
        })?;

        fs::write(&self.file_path, content)
            .map_err(|e| SessionError::FileIo(format!("Failed to write settings: {}", e)))?;

        Ok(())
    }

    /// Get current settings
    pub fn get(&self) -> SessionSettings {
        self.settings.read().unwrap().clone()
    }

    /// Update settings and persist to disk
    pub fn update(&self, new_settings: SessionSettings) -> Result<(), SessionError> {
        {
            let mut settings = self.settings.write().unwrap();
            *settings = new_settings;
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = SessionSettings::default();
        assert_eq!(settings.port, 12345);
        assert_eq!(settings.max_retries, 3);
        assert!(settings.read_timeout_secs.is_none());
    }

    #[test]
    fn test_partial_settings_file_gets_defaults() {
        let settings: SessionSettings = serde_json::from_str(
            r#"{"port": 9000, "deviceName": "test", "downloadDir": "/tmp"}"#,
        )
        .unwrap();
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.connect_timeout_secs, 30);
        assert_eq!(settings.retry_delay_ms, 1000);
    }
}
