//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.talkbridge/config.json`) and environment.
//! Environment variables override file values so secrets can stay out of the file.

use crate::channels::{
    FetchWindow, TalkSettings, WhatsAppSettings, DEFAULT_LONG_POLL_TIMEOUT, DEFAULT_PAGE_SIZE,
    DEFAULT_POLL_INTERVAL, DEFAULT_READY_TIMEOUT, DEFAULT_SIDECAR_URL,
};
use crate::error::BridgeError;
use crate::relay::{RelayConfig, DEFAULT_PULL_ORIGIN_PREFIX, DEFAULT_PUSH_ORIGIN_PREFIX};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for the server-side wait; Talk itself caps it at 30 seconds.
const MAX_LONG_POLL_TIMEOUT_SECS: u64 = 3600;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Nextcloud Talk connection and polling.
    #[serde(default)]
    pub nextcloud: NextcloudConfig,

    /// WhatsApp sidecar connection and the bridged chat.
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,

    /// Origin tags on relayed messages.
    #[serde(default)]
    pub relay: RelayPrefixes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextcloudConfig {
    /// Server base URL, e.g. "https://cloud.example.org". Overridden by NEXTCLOUD_URL.
    pub url: Option<String>,
    /// Login of the bridge account. Overridden by NEXTCLOUD_USERNAME.
    pub username: Option<String>,
    /// Password or app password. Overridden by NEXTCLOUD_PASSWORD.
    pub password: Option<String>,
    /// Conversation token (last path segment of the Talk room URL). Overridden by NEXTCLOUD_TALK_TOKEN.
    pub talk_token: Option<String>,
    /// Delay between the end of one poll cycle and the start of the next (default 5000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Messages fetched per poll (default 50).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Server-side wait per poll in seconds (default 30).
    #[serde(default = "default_long_poll_timeout_secs")]
    pub long_poll_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppConfig {
    /// Chat to bridge, e.g. "491234567890@c.us" or "1203630...@g.us". Overridden by WHATSAPP_CHAT_ID.
    pub chat_id: Option<String>,
    /// Sidecar WebSocket URL (default ws://127.0.0.1:3100/ws). Overridden by WHATSAPP_SIDECAR_URL.
    #[serde(default = "default_sidecar_url")]
    pub sidecar_url: String,
    /// How long to wait for the sidecar's ready event, including QR pairing (default 120).
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayPrefixes {
    /// Prefix on Talk messages relayed to WhatsApp. Overridden by NC_TO_WA_PREFIX.
    #[serde(default = "default_nc_to_wa_prefix")]
    pub nc_to_wa_prefix: String,
    /// Prefix on WhatsApp messages relayed to Talk. Overridden by WA_TO_NC_PREFIX.
    #[serde(default = "default_wa_to_nc_prefix")]
    pub wa_to_nc_prefix: String,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_long_poll_timeout_secs() -> u64 {
    DEFAULT_LONG_POLL_TIMEOUT.as_secs()
}

fn default_sidecar_url() -> String {
    DEFAULT_SIDECAR_URL.to_string()
}

fn default_ready_timeout_secs() -> u64 {
    DEFAULT_READY_TIMEOUT.as_secs()
}

fn default_nc_to_wa_prefix() -> String {
    DEFAULT_PULL_ORIGIN_PREFIX.to_string()
}

fn default_wa_to_nc_prefix() -> String {
    DEFAULT_PUSH_ORIGIN_PREFIX.to_string()
}

impl Default for NextcloudConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            talk_token: None,
            poll_interval_ms: default_poll_interval_ms(),
            page_size: default_page_size(),
            long_poll_timeout_secs: default_long_poll_timeout_secs(),
        }
    }
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            chat_id: None,
            sidecar_url: default_sidecar_url(),
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

impl Default for RelayPrefixes {
    fn default() -> Self {
        Self {
            nc_to_wa_prefix: default_nc_to_wa_prefix(),
            wa_to_nc_prefix: default_wa_to_nc_prefix(),
        }
    }
}

/// Trimmed, non-empty value of an environment variable.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Trimmed, non-empty config value.
fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Config {
    /// Apply environment overrides in place.
    pub fn apply_env(&mut self) {
        self.apply_overrides(env_value);
    }

    /// Apply overrides from `lookup` (variable name → value). Split out from `apply_env` for tests.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("NEXTCLOUD_URL") {
            self.nextcloud.url = Some(v);
        }
        if let Some(v) = lookup("NEXTCLOUD_USERNAME") {
            self.nextcloud.username = Some(v);
        }
        if let Some(v) = lookup("NEXTCLOUD_PASSWORD") {
            self.nextcloud.password = Some(v);
        }
        if let Some(v) = lookup("NEXTCLOUD_TALK_TOKEN") {
            self.nextcloud.talk_token = Some(v);
        }
        if let Some(v) = lookup("WHATSAPP_CHAT_ID") {
            self.whatsapp.chat_id = Some(v);
        }
        if let Some(v) = lookup("WHATSAPP_SIDECAR_URL") {
            self.whatsapp.sidecar_url = v;
        }
        if let Some(v) = lookup("NC_TO_WA_PREFIX") {
            self.relay.nc_to_wa_prefix = v;
        }
        if let Some(v) = lookup("WA_TO_NC_PREFIX") {
            self.relay.wa_to_nc_prefix = v;
        }
    }

    /// Check that every required value is present; the error names all missing ones.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let required = [
            ("nextcloud.url (NEXTCLOUD_URL)", &self.nextcloud.url),
            ("nextcloud.username (NEXTCLOUD_USERNAME)", &self.nextcloud.username),
            ("nextcloud.password (NEXTCLOUD_PASSWORD)", &self.nextcloud.password),
            ("nextcloud.talkToken (NEXTCLOUD_TALK_TOKEN)", &self.nextcloud.talk_token),
            ("whatsapp.chatId (WHATSAPP_CHAT_ID)", &self.whatsapp.chat_id),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, v)| non_empty(v).is_none())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(BridgeError::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }
        if self.nextcloud.long_poll_timeout_secs > MAX_LONG_POLL_TIMEOUT_SECS {
            return Err(BridgeError::Config(format!(
                "nextcloud.longPollTimeoutSecs must be at most {}",
                MAX_LONG_POLL_TIMEOUT_SECS
            )));
        }
        if self.nextcloud.poll_interval_ms == 0 {
            return Err(BridgeError::Config(
                "nextcloud.pollIntervalMs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn talk_settings(&self) -> Result<TalkSettings, BridgeError> {
        self.validate()?;
        Ok(TalkSettings {
            url: non_empty(&self.nextcloud.url).unwrap_or_default(),
            username: non_empty(&self.nextcloud.username).unwrap_or_default(),
            password: non_empty(&self.nextcloud.password).unwrap_or_default(),
            talk_token: non_empty(&self.nextcloud.talk_token).unwrap_or_default(),
        })
    }

    pub fn whatsapp_settings(&self) -> WhatsAppSettings {
        WhatsAppSettings {
            sidecar_url: self.whatsapp.sidecar_url.trim().to_string(),
            ready_timeout: Duration::from_secs(self.whatsapp.ready_timeout_secs),
        }
    }

    pub fn fetch_window(&self) -> FetchWindow {
        FetchWindow {
            limit: self.nextcloud.page_size.max(1),
            timeout: Duration::from_secs(self.nextcloud.long_poll_timeout_secs),
            ..FetchWindow::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.nextcloud.poll_interval_ms)
    }

    pub fn relay_config(&self) -> Result<RelayConfig, BridgeError> {
        self.validate()?;
        Ok(RelayConfig {
            push_chat_id: non_empty(&self.whatsapp.chat_id).unwrap_or_default(),
            pull_conversation_token: non_empty(&self.nextcloud.talk_token).unwrap_or_default(),
            push_origin_prefix: self.relay.wa_to_nc_prefix.clone(),
            pull_origin_prefix: self.relay.nc_to_wa_prefix.clone(),
        })
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("TALKBRIDGE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".talkbridge").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default), then apply environment overrides.
/// Missing file => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    config.apply_env();
    Ok((config, path))
}
