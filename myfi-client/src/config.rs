use anyhow::Context;
use config::{Config, Environment, File};
use myfi_audio::config::AudioConfig;
use myfi_call::{CallConfig, DEFAULT_NO_ANSWER_TIMEOUT};
use myfi_webrtc::IceConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// User-Agent string used for all HTTP requests.
pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_SETTINGS_FILE_NAME: &str = "config.toml";
pub const ENV_PREFIX: &str = "myfi_client";
pub const MAX_CALL_HISTORY: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    pub backend: BackendConfig,
    pub signaling: SignalingConfig,
    pub call: CallSettings,
    pub ice: IceConfig,
    pub audio: AudioConfig,
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Layers built-in defaults, `config.toml` in `config_dir`, `config.toml` in the working
    /// directory and `MYFI_CLIENT_*` environment variables (nested keys separated by `__`).
    pub fn parse(config_dir: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&ClientConfig::default())?);
        if let Some(config_dir) = config_dir {
            builder = builder
                .add_source(File::from(config_dir.join(DEFAULT_SETTINGS_FILE_NAME)).required(false));
        }

        builder
            .add_source(File::with_name(DEFAULT_SETTINGS_FILE_NAME).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to build config")?
            .try_deserialize()
            .context("Failed to deserialize config")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub ws_url: String,
    pub contacts_endpoint: String,
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            ws_url: "ws://localhost:5000/ws".to_string(),
            contacts_endpoint: "/call/api/contacts".to_string(),
            timeout_ms: 2000,
        }
    }
}

impl BackendConfig {
    pub fn contacts_url(&self) -> String {
        format!("{}{}", self.base_url, self.contacts_endpoint)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub auto_reconnect: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
        }
    }
}

impl SignalingConfig {
    pub fn max_reconnect_attempts(&self) -> u8 {
        if self.auto_reconnect { 8 } else { 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    pub no_answer_timeout_secs: u64,
    /// Own user ID on the relay. Needed to settle crossed calls.
    pub user_id: Option<String>,
    /// Look up the callee before dialing and fail fast if they are offline.
    pub check_online: bool,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            no_answer_timeout_secs: DEFAULT_NO_ANSWER_TIMEOUT.as_secs(),
            user_id: None,
            check_online: true,
        }
    }
}

impl From<&CallSettings> for CallConfig {
    fn from(settings: &CallSettings) -> Self {
        CallConfig {
            no_answer_timeout: Duration::from_secs(settings.no_answer_timeout_secs),
            local_id: settings.user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
