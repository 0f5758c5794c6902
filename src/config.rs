//! Runtime configuration.
//!
//! Loaded from an optional JSON file and the environment. Every field has a
//! default so an empty `{}` (or no file at all) yields a working config that
//! points at the public relay.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Public relay used when nothing else is configured. Also the string the
/// relay signs during key exchange.
pub const DEFAULT_SERVER: &str = "https://www.node-m2m.com";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Relay base URL; `http(s)` is mapped onto `ws(s)`.
    pub server: String,
    /// Where the session token is persisted. Overridden by `M2M_TOKEN_PATH`.
    pub token_path: PathBuf,
    /// Event log file.
    pub log_path: PathBuf,
    /// File written to ask a supervising process for a restart.
    pub restart_marker: PathBuf,
    /// Directory that relative paths of pushed module updates resolve against.
    pub module_root: PathBuf,
    /// Base64 Ed25519 public key of the relay. The key exchange refuses any
    /// relay that does not present exactly this key.
    pub server_key: Option<String>,
    /// String the relay signs to prove its identity.
    pub verification_string: String,
    pub handshake_timeout_ms: u64,
    /// Outbound frames are dropped while this many bytes are still unflushed.
    pub send_threshold: usize,
    /// How long derived keys are retained after registration.
    pub key_retention_ms: u64,
    pub watch_interval_ms: u64,
    /// Set when a supervisor can restart the process. Overridden by `M2M_RESTARTABLE`.
    pub restartable: bool,
    pub reconnect: ReconnectConfig,
    pub liveness: LivenessConfig,
    pub code: CodeConfig,
    pub user_settings: UserSettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    pub base_ms: u64,
    pub spread_ms: u64,
    pub extension_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            spread_ms: 20_000,
            extension_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LivenessConfig {
    pub base_ms: u64,
    pub step_ms: u64,
    pub max_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            step_ms: 50,
            max_ms: 10_000,
        }
    }
}

/// Remote code upload/update permission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeConfig {
    pub allow: bool,
    pub filename: Option<PathBuf>,
}

/// Free-form labels reported to the relay. Each is truncated to 20 characters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSettings {
    pub name: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
}

const CODE_FILENAME_MAX: usize = 30;
const USER_SETTING_MAX: usize = 20;

impl Default for Config {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            token_path: PathBuf::from("m2m_log/tk"),
            log_path: PathBuf::from("m2m_log/log.txt"),
            restart_marker: PathBuf::from("m2m_log/mon"),
            module_root: PathBuf::from("."),
            server_key: None,
            verification_string: DEFAULT_SERVER.to_string(),
            handshake_timeout_ms: 7_000,
            send_threshold: 1_024,
            key_retention_ms: 5_000,
            watch_interval_ms: 5_000,
            restartable: false,
            reconnect: ReconnectConfig::default(),
            liveness: LivenessConfig::default(),
            code: CodeConfig::default(),
            user_settings: UserSettings::default(),
        }
    }
}

impl Config {
    /// Loads `path` when it exists (defaults otherwise), then applies the
    /// environment and validates.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
            }
            Some(path) => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Config::default()
            }
            None => Config::default(),
        };
        config.apply_env();
        config.normalize()?;
        Ok(config)
    }

    /// Environment overrides: `M2M_SERVER`, `M2M_TOKEN_PATH`, `M2M_RESTARTABLE`.
    pub fn apply_env(&mut self) {
        if let Ok(server) = std::env::var("M2M_SERVER") {
            if !server.trim().is_empty() {
                self.server = server.trim().to_string();
            }
        }
        if let Ok(path) = std::env::var("M2M_TOKEN_PATH") {
            if !path.trim().is_empty() {
                self.token_path = PathBuf::from(path.trim());
            }
        }
        if let Ok(flag) = std::env::var("M2M_RESTARTABLE") {
            self.restartable = matches!(flag.trim(), "1" | "true" | "yes");
        }
    }

    /// Checks limits and truncates the user labels.
    pub fn normalize(&mut self) -> Result<()> {
        if let Some(filename) = &self.code.filename {
            if filename.as_os_str().len() > CODE_FILENAME_MAX {
                return Err(Error::Config(format!(
                    "code filename must not exceed {CODE_FILENAME_MAX} characters"
                )));
            }
        }
        if self.code.allow && self.code.filename.is_none() {
            return Err(Error::Config("code.allow requires code.filename".into()));
        }
        for label in [
            &mut self.user_settings.name,
            &mut self.user_settings.location,
            &mut self.user_settings.description,
        ]
        .into_iter()
        .flatten()
        {
            if label.chars().count() > USER_SETTING_MAX {
                *label = label.chars().take(USER_SETTING_MAX).collect();
            }
        }
        self.ws_base()?;
        Ok(())
    }

    /// Relay base URL with the scheme mapped onto WebSocket.
    pub fn ws_base(&self) -> Result<String> {
        let server = self.server.trim_end_matches('/');
        let mapped = if let Some(rest) = server.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if server.starts_with("wss://") || server.starts_with("ws://") {
            server.to_string()
        } else {
            return Err(Error::Config(format!("unsupported server address {server}")));
        };
        Ok(mapped)
    }

    /// Full URL of a relay endpoint such as `/m2m` or `/ckm`.
    pub fn endpoint(&self, path: &str) -> Result<String> {
        Ok(format!("{}{}", self.ws_base()?, path))
    }

    /// The pinned relay identity.
    pub fn relay_key(&self) -> Result<VerifyingKey> {
        let encoded = self
            .server_key
            .as_deref()
            .ok_or_else(|| Error::Config("relay identity key (serverKey) is not configured".into()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Config(format!("serverKey: {e}")))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Config("serverKey must be 32 bytes".into()))?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| Error::Config(format!("serverKey: {e}")))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn key_retention(&self) -> Duration {
        Duration::from_millis(self.key_retention_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}
