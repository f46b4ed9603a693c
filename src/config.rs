//! Konfiguration eines Anrufs
//!
//! Quellen, spätere gewinnen:
//! 1. Eingebaute Defaults
//! 2. `call.json` im Konfigurationsverzeichnis der App
//! 3. Umgebungsvariablen (`AIRING_CALL_URL`, `AIRING_CALL_VOICE`, `AIRING_ACCESS_TOKEN`)

use crate::audio::DEFAULT_MAX_QUEUED;
use crate::call_engine::CallPolicy;
use crate::transport::{Modality, TransportConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const ENV_CALL_URL: &str = "AIRING_CALL_URL";
pub const ENV_CALL_VOICE: &str = "AIRING_CALL_VOICE";
pub const ENV_ACCESS_TOKEN: &str = "AIRING_ACCESS_TOKEN";

const CONFIG_FILE_NAME: &str = "call.json";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No voice service endpoint configured (set AIRING_CALL_URL)")]
    MissingEndpoint,

    #[error("Invalid voice service endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Could not determine app config directory")]
    NoConfigDir,
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// WebSocket URL des Voice-Service (`ws://` oder `wss://`)
    pub endpoint: Option<String>,
    pub voice: Option<String>,
    pub access_token: Option<String>,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// 0 deaktiviert Keepalive-Pings
    pub keepalive_secs: u64,
    pub max_playback_queue_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            voice: None,
            access_token: None,
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 2_000,
            connect_timeout_ms: 10_000,
            keepalive_secs: 25,
            max_playback_queue_ms: DEFAULT_MAX_QUEUED.as_millis() as u64,
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus Datei und Umgebung
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load_with(&path, |key| std::env::var(key).ok())
    }

    /// Wie `load`, mit expliziter Datei und Umgebung
    pub fn load_with(
        path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            tracing::info!("Loading call config from {:?}", path);
            Self::from_file(path)?
        } else {
            Self::default()
        };

        config.apply_env(env);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Pfad zur Konfigurationsdatei
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs = directories::ProjectDirs::from("kr", "airing", "airing-call")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(proj_dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = non_empty(ENV_CALL_URL) {
            self.endpoint = Some(url);
        }
        if let Some(voice) = non_empty(ENV_CALL_VOICE) {
            self.voice = Some(voice);
        }
        if let Some(token) = non_empty(ENV_ACCESS_TOKEN) {
            self.access_token = Some(token);
        }
    }

    /// Endgültige Verbindungs-URL inkl. `voice` und `accessToken` Query
    pub fn call_url(&self) -> Result<String, ConfigError> {
        let endpoint = self.endpoint.as_deref().ok_or(ConfigError::MissingEndpoint)?;
        let mut url =
            Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        if self.voice.is_some() || self.access_token.is_some() {
            let mut query = url.query_pairs_mut();
            if let Some(voice) = &self.voice {
                query.append_pair("voice", voice);
            }
            if let Some(token) = &self.access_token {
                query.append_pair("accessToken", token);
            }
        }

        Ok(url.into())
    }

    pub fn policy(&self) -> CallPolicy {
        CallPolicy {
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_playback_queue: Duration::from_millis(self.max_playback_queue_ms),
            ..CallPolicy::default()
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            keepalive: (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs)),
            response_modalities: BTreeSet::from([Modality::Audio]),
        }
    }
}

impl std::fmt::Debug for CallConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallConfig")
            .field("endpoint", &self.endpoint)
            .field("voice", &self.voice)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("keepalive_secs", &self.keepalive_secs)
            .field("max_playback_queue_ms", &self.max_playback_queue_ms)
            .finish()
    }
}
