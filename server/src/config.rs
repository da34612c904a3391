use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

use crate::alarm::model::TimeDisplayMode;
use crate::api::DEFAULT_CONNECTED_CLIENT_TTL_MS;
use crate::notification::Notification;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AppConfig {
    pub notification: Notification,
    pub client_ttl_ms: i64,
    pub poll_interval_ms: u64,
    pub alert_sound: Option<PathBuf>,
    pub time_display: TimeDisplayMode,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            notification: Notification::default(),
            client_ttl_ms: DEFAULT_CONNECTED_CLIENT_TTL_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            alert_sound: None,
            time_display: TimeDisplayMode::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AppConfigFile {
    version: u32,
    #[serde(default)]
    notification: NotificationFile,
    #[serde(default = "default_client_ttl_ms")]
    client_ttl_ms: i64,
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default)]
    alert_sound: Option<PathBuf>,
    #[serde(default)]
    time_display: TimeDisplayToken,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct NotificationFile {
    title: String,
    body: String,
    icon: String,
    tag: String,
    require_interaction: bool,
}

impl Default for NotificationFile {
    fn default() -> Self {
        let Notification {
            title,
            body,
            icon,
            tag,
            require_interaction,
        } = Notification::default();
        Self {
            title,
            body,
            icon,
            tag,
            require_interaction,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
enum TimeDisplayToken {
    #[default]
    #[serde(rename = "24h")]
    Hour24,
    #[serde(rename = "12h")]
    Hour12,
}

impl TimeDisplayToken {
    fn to_mode(self) -> TimeDisplayMode {
        match self {
            Self::Hour24 => TimeDisplayMode::Hour24,
            Self::Hour12 => TimeDisplayMode::Hour12,
        }
    }
}

fn default_client_ttl_ms() -> i64 {
    DEFAULT_CONNECTED_CLIENT_TTL_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// Loads the config file, falling back to defaults when it does not exist.
pub fn load_app_config(path: &Path) -> Result<AppConfig> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found; using defaults");
            return Ok(AppConfig::default());
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("unable to read config file {}", path.display()));
        }
    };
    parse_app_config_text(&content)
        .with_context(|| format!("invalid config file {}", path.display()))
}

pub fn parse_app_config_text(content: &str) -> Result<AppConfig> {
    let raw = serde_json::from_str::<AppConfigFile>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow::anyhow!("invalid JSON at line {line}, column {column}: {err}")
    })?;

    if raw.version != 1 {
        bail!(
            "unsupported config version {}; expected version 1",
            raw.version
        );
    }
    if raw.client_ttl_ms <= 0 {
        bail!("client_ttl_ms must be > 0");
    }
    if raw.poll_interval_ms == 0 {
        bail!("poll_interval_ms must be > 0");
    }
    if raw.notification.tag.trim().is_empty() {
        bail!("notification.tag must not be empty");
    }

    Ok(AppConfig {
        notification: Notification {
            title: raw.notification.title,
            body: raw.notification.body,
            icon: raw.notification.icon,
            tag: raw.notification.tag,
            require_interaction: raw.notification.require_interaction,
        },
        client_ttl_ms: raw.client_ttl_ms,
        poll_interval_ms: raw.poll_interval_ms,
        alert_sound: raw.alert_sound,
        time_display: raw.time_display.to_mode(),
    })
}
