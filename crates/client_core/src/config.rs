use std::{fmt, fs, path::PathBuf, time::Duration};

use serde::Deserialize;
use shared::domain::{ConversationId, UserId};
use tracing::warn;
use url::Url;

use crate::error::ChatError;

const DEFAULT_CONFIG_FILE: &str = "chat_client.toml";

#[derive(Clone)]
pub struct Settings {
    /// HTTP(S) origin of the chat server; the channel address is derived from it.
    pub server_url: String,
    pub access_token: Option<String>,
    /// Sender id of the local user, used to match echoes of optimistic sends.
    pub local_user_id: Option<UserId>,
    pub typing_timeout: Duration,
    pub reconcile_window: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    pub page_size: u32,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("server_url", &self.server_url)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("local_user_id", &self.local_user_id)
            .field("typing_timeout", &self.typing_timeout)
            .field("reconcile_window", &self.reconcile_window)
            .field("reconnect_base_delay", &self.reconnect_base_delay)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("connect_timeout", &self.connect_timeout)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            access_token: None,
            local_user_id: None,
            typing_timeout: Duration::from_secs(3),
            reconcile_window: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(15),
            page_size: 50,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    access_token: Option<String>,
    local_user_id: Option<i64>,
    typing_timeout_ms: Option<u64>,
    reconcile_window_ms: Option<u64>,
    reconnect_base_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    connect_timeout_ms: Option<u64>,
    page_size: Option<u32>,
}

/// Loads settings from `chat_client.toml` (or `CHAT_CLIENT_CONFIG`) and the environment.
pub fn load_settings() -> Settings {
    let path = std::env::var("CHAT_CLIENT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    let raw = fs::read_to_string(&path).ok();
    Settings::from_sources(raw.as_deref(), |key| std::env::var(key).ok())
}

impl Settings {
    /// Layers a TOML document and then environment lookups over the defaults.
    pub fn from_sources(raw_file: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Settings::default();

        if let Some(raw) = raw_file {
            match toml::from_str::<FileSettings>(raw) {
                Ok(file_cfg) => settings.apply_file(file_cfg),
                Err(error) => warn!(%error, "ignoring unreadable chat client config file"),
            }
        }

        let lookup = |name: &str| env(&format!("CHAT_{name}")).or_else(|| env(&format!("APP__{name}")));

        if let Some(v) = lookup("SERVER_URL") {
            settings.server_url = v;
        }
        if let Some(v) = lookup("ACCESS_TOKEN") {
            settings.access_token = Some(v);
        }
        if let Some(v) = parse_env::<i64>("LOCAL_USER_ID", lookup("LOCAL_USER_ID")) {
            settings.local_user_id = Some(UserId(v));
        }
        if let Some(ms) = parse_env::<u64>("TYPING_TIMEOUT_MS", lookup("TYPING_TIMEOUT_MS")) {
            settings.typing_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("RECONCILE_WINDOW_MS", lookup("RECONCILE_WINDOW_MS")) {
            settings.reconcile_window = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>(
            "RECONNECT_BASE_DELAY_MS",
            lookup("RECONNECT_BASE_DELAY_MS"),
        ) {
            settings.reconnect_base_delay = Duration::from_millis(ms);
        }
        if let Some(v) = parse_env::<u32>(
            "MAX_RECONNECT_ATTEMPTS",
            lookup("MAX_RECONNECT_ATTEMPTS"),
        ) {
            settings.max_reconnect_attempts = v;
        }
        if let Some(ms) = parse_env::<u64>("CONNECT_TIMEOUT_MS", lookup("CONNECT_TIMEOUT_MS")) {
            settings.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = parse_env::<u32>("PAGE_SIZE", lookup("PAGE_SIZE")) {
            settings.page_size = v;
        }

        settings
    }

    fn apply_file(&mut self, file_cfg: FileSettings) {
        if let Some(v) = file_cfg.server_url {
            self.server_url = v;
        }
        if let Some(v) = file_cfg.access_token {
            self.access_token = Some(v);
        }
        if let Some(v) = file_cfg.local_user_id {
            self.local_user_id = Some(UserId(v));
        }
        if let Some(ms) = file_cfg.typing_timeout_ms {
            self.typing_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file_cfg.reconcile_window_ms {
            self.reconcile_window = Duration::from_millis(ms);
        }
        if let Some(ms) = file_cfg.reconnect_base_delay_ms {
            self.reconnect_base_delay = Duration::from_millis(ms);
        }
        if let Some(v) = file_cfg.max_reconnect_attempts {
            self.max_reconnect_attempts = v;
        }
        if let Some(ms) = file_cfg.connect_timeout_ms {
            self.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = file_cfg.page_size {
            self.page_size = v;
        }
    }

    /// Base of the REST collaborator endpoints.
    pub fn api_base(&self) -> String {
        format!("{}/api", self.server_url.trim_end_matches('/'))
    }

    /// Channel address for one conversation, carrying the access token as a query credential.
    pub fn channel_url(&self, conversation_id: ConversationId) -> Result<Url, ChatError> {
        let server_url = self.server_url.trim_end_matches('/');
        let ws_base = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(ChatError::InvalidServerUrl(self.server_url.clone()));
        };
        let mut url = Url::parse(&format!("{ws_base}/ws/chat/{conversation_id}/"))
            .map_err(|_| ChatError::InvalidServerUrl(self.server_url.clone()))?;
        if let Some(token) = &self.access_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(setting = name, value = %raw, "ignoring unparsable setting override");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
