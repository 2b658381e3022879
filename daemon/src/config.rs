use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::event::WatcherEvent;

pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_EMBED_CONFIG: &str = "embeds.toml";
pub const DEFAULT_FOOTER: &str = "Status-Bot";
pub const DEFAULT_OFFLINE_TITLE: &str = "User is now offline";
pub const DEFAULT_OFFLINE_DESCRIPTION: &str = "{user} just went offline.";
pub const DEFAULT_OFFLINE_REASON: &str = "Unknown";
pub const DEFAULT_ONLINE_TITLE: &str = "User is back online";
pub const DEFAULT_ONLINE_DESCRIPTION: &str = "{user} is back online.";
pub const DEFAULT_OFFLINE_COLOR: u32 = 0xE7_4C_3C;
pub const DEFAULT_ONLINE_COLOR: u32 = 0x2E_CC_71;

/// Placeholder replaced with a mention of the monitored user in descriptions.
pub const USER_PLACEHOLDER: &str = "{user}";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Process settings read from the environment at startup.
#[derive(Clone)]
pub struct Settings {
    pub bot_token: String,
    pub guild_id: u64,
    pub user_id: u64,
    pub webhook_id: u64,
    pub webhook_token: String,
    pub check_interval: Duration,
    /// Optional TOML file with embed overrides; absent means built-in defaults.
    pub embed_config: PathBuf,
}

// Tokens stay out of log output.
impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("bot_token", &"<redacted>")
            .field("guild_id", &self.guild_id)
            .field("user_id", &self.user_id)
            .field("webhook_id", &self.webhook_id)
            .field("webhook_token", &"<redacted>")
            .field("check_interval", &self.check_interval)
            .field("embed_config", &self.embed_config)
            .finish()
    }
}

impl Settings {
    /// Loads settings from the process environment. `main` has already
    /// merged any `.env` file into it.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| -> Result<String, ConfigError> {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(var))
        };

        let bot_token = required("BOT_TOKEN")?;
        let guild_id = parse_snowflake("GUILD_ID", required("GUILD_ID")?)?;
        let user_id = parse_snowflake("USER_ID", required("USER_ID")?)?;
        let webhook_id = parse_snowflake("WEBHOOK_ID", required("WEBHOOK_ID")?)?;
        let webhook_token = required("WEBHOOK_TOKEN")?;

        let check_interval = match lookup("CHECK_INTERVAL").map(|v| v.trim().to_string()) {
            None => Duration::from_millis(DEFAULT_CHECK_INTERVAL_MS),
            Some(v) if v.is_empty() => Duration::from_millis(DEFAULT_CHECK_INTERVAL_MS),
            Some(v) => match v.parse::<u64>() {
                Ok(0) => {
                    return Err(ConfigError::Invalid {
                        var: "CHECK_INTERVAL",
                        value: v,
                        reason: "must be greater than zero",
                    })
                }
                Ok(ms) => Duration::from_millis(ms),
                Err(_) => {
                    return Err(ConfigError::Invalid {
                        var: "CHECK_INTERVAL",
                        value: v,
                        reason: "expected milliseconds as an unsigned integer",
                    })
                }
            },
        };

        let embed_config = lookup("EMBED_CONFIG")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EMBED_CONFIG));

        Ok(Self {
            bot_token,
            guild_id,
            user_id,
            webhook_id,
            webhook_token,
            check_interval,
            embed_config,
        })
    }
}

fn parse_snowflake(var: &'static str, value: String) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::Invalid {
        var,
        value,
        reason: "expected a numeric id",
    })
}

/// Embed customisation. Deserialized from the file named by `EMBED_CONFIG`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EmbedTemplates {
    /// Footer text shown on both notifications.
    #[serde(default = "default_footer")]
    pub footer: String,
    #[serde(default)]
    pub offline: OfflineEmbed,
    #[serde(default)]
    pub online: OnlineEmbed,
}

impl Default for EmbedTemplates {
    fn default() -> Self {
        Self {
            footer: DEFAULT_FOOTER.to_string(),
            offline: OfflineEmbed::default(),
            online: OnlineEmbed::default(),
        }
    }
}

/// Sent when the user goes offline.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct OfflineEmbed {
    #[serde(default = "default_offline_title")]
    pub title: String,
    /// `{user}` expands to a mention of the monitored user.
    #[serde(default = "default_offline_description")]
    pub description: String,
    /// Value of the "Reason" field.
    #[serde(default = "default_offline_reason")]
    pub reason: String,
    #[serde(default = "default_offline_color")]
    pub color: u32,
}

impl Default for OfflineEmbed {
    fn default() -> Self {
        Self {
            title: DEFAULT_OFFLINE_TITLE.to_string(),
            description: DEFAULT_OFFLINE_DESCRIPTION.to_string(),
            reason: DEFAULT_OFFLINE_REASON.to_string(),
            color: DEFAULT_OFFLINE_COLOR,
        }
    }
}

/// Sent when the user comes back.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct OnlineEmbed {
    #[serde(default = "default_online_title")]
    pub title: String,
    #[serde(default = "default_online_description")]
    pub description: String,
    #[serde(default = "default_online_color")]
    pub color: u32,
}

impl Default for OnlineEmbed {
    fn default() -> Self {
        Self {
            title: DEFAULT_ONLINE_TITLE.to_string(),
            description: DEFAULT_ONLINE_DESCRIPTION.to_string(),
            color: DEFAULT_ONLINE_COLOR,
        }
    }
}

/// Loads the template file at `path`, returning defaults if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<EmbedTemplates> {
    if !path.exists() {
        return Ok(EmbedTemplates::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read embed config: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse embed config: {}", path.display()))
}

/// Watches the parent directory of `path`. Whenever the template file is
/// created or modified, reloads it and sends a `TemplatesReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<WatcherEvent>) {
    let path = match std::path::absolute(&path) {
        Ok(p) => p,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot resolve embed config path");
            return;
        }
    };

    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "Failed to create embed config watcher");
            return;
        }
    };

    // Watch the directory so editor-style atomic saves (write-new + rename) are seen.
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            warn!(path = %path.display(), "Embed config path has no parent directory");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        warn!(dir = %watch_dir.display(), error = %e, "Failed to watch embed config directory");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        if !affects_file(&event, &path) {
            continue;
        }
        match load_or_default(&path) {
            Ok(templates) => {
                info!(path = %path.display(), "Embed config reloaded");
                if tx.send(WatcherEvent::TemplatesReloaded(templates)).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %format!("{e:#}"), "Keeping previous embed config"),
        }
    }
}

// notify may report canonicalized paths, so match on the file name within
// the watched directory.
fn affects_file(event: &notify::Event, path: &Path) -> bool {
    let is_write = matches!(
        event.kind,
        notify::EventKind::Create(_) | notify::EventKind::Modify(_)
    );
    is_write && event.paths.iter().any(|p| p.file_name() == path.file_name())
}

fn default_footer() -> String {
    DEFAULT_FOOTER.to_string()
}

fn default_offline_title() -> String {
    DEFAULT_OFFLINE_TITLE.to_string()
}

fn default_offline_description() -> String {
    DEFAULT_OFFLINE_DESCRIPTION.to_string()
}

fn default_offline_reason() -> String {
    DEFAULT_OFFLINE_REASON.to_string()
}

fn default_offline_color() -> u32 {
    DEFAULT_OFFLINE_COLOR
}

fn default_online_title() -> String {
    DEFAULT_ONLINE_TITLE.to_string()
}

fn default_online_description() -> String {
    DEFAULT_ONLINE_DESCRIPTION.to_string()
}

fn default_online_color() -> u32 {
    DEFAULT_ONLINE_COLOR
}
