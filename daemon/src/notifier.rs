/// Webhook notifications for presence transitions.
///
/// A `Notifier` turns an `(old, new)` presence pair into an embed and hands it
/// to a [`WebhookSink`] on a spawned task. Delivery is fire-and-forget: the
/// caller gets the task handle back but never has to await it, and a failed
/// delivery is only logged.
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{EmbedTemplates, USER_PLACEHOLDER};
use crate::presence::PresenceStatus;

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
/// Format of the human-readable "Timestamp" field.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const FIELD_REASON: &str = "Reason";
pub const FIELD_CURRENT_STATUS: &str = "Current Status";
pub const FIELD_TIMESTAMP: &str = "Timestamp";

/// A presence change that crosses the offline boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentOffline,
    BackOnline,
}

impl Transition {
    /// Returns `None` when both sides are offline or both are present.
    pub fn classify(old: PresenceStatus, new: PresenceStatus) -> Option<Self> {
        match (old.is_offline(), new.is_offline()) {
            (false, true) => Some(Transition::WentOffline),
            (true, false) => Some(Transition::BackOnline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl EmbedField {
    fn inline(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            inline: true,
        }
    }
}

/// One embed, built fresh for every transition.
#[derive(Debug, Clone)]
pub struct NotificationPayload {
    pub transition: Transition,
    pub title: String,
    pub description: String,
    pub timestamp: DateTime<Local>,
    pub color: u32,
    pub footer: String,
    pub fields: Vec<EmbedField>,
}

impl NotificationPayload {
    pub fn build(
        templates: &EmbedTemplates,
        user_id: u64,
        old: PresenceStatus,
        new: PresenceStatus,
        now: DateTime<Local>,
    ) -> Option<Self> {
        let transition = Transition::classify(old, new)?;
        let mention = format!("<@{user_id}>");
        let when = now.format(TIMESTAMP_FORMAT).to_string();

        let (title, description, color, fields) = match transition {
            Transition::WentOffline => {
                let t = &templates.offline;
                (
                    t.title.clone(),
                    t.description.replace(USER_PLACEHOLDER, &mention),
                    t.color,
                    vec![
                        EmbedField::inline(FIELD_REASON, t.reason.clone()),
                        EmbedField::inline(FIELD_TIMESTAMP, when),
                    ],
                )
            }
            Transition::BackOnline => {
                let t = &templates.online;
                (
                    t.title.clone(),
                    t.description.replace(USER_PLACEHOLDER, &mention),
                    t.color,
                    vec![
                        EmbedField::inline(FIELD_CURRENT_STATUS, new.as_str()),
                        EmbedField::inline(FIELD_TIMESTAMP, when),
                    ],
                )
            }
        };

        Some(Self {
            transition,
            title,
            description,
            timestamp: now,
            color,
            footer: templates.footer.clone(),
            fields,
        })
    }

    #[cfg(test)]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    /// JSON body for the execute-webhook endpoint.
    pub fn to_webhook_body(&self) -> serde_json::Value {
        serde_json::json!({
            "embeds": [{
                "title": self.title,
                "description": self.description,
                "timestamp": self.timestamp.to_rfc3339(),
                "color": self.color,
                "footer": { "text": self.footer },
                "fields": self.fields,
            }]
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook request failed: {0}")]
    Http(reqwest::Error),
    #[error("webhook rejected the message with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Destination for notification payloads.
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), WebhookError>;
}

/// Executes a Discord webhook identified by id and token.
pub struct DiscordWebhook {
    client: reqwest::Client,
    url: String,
}

impl DiscordWebhook {
    pub fn new(webhook_id: u64, webhook_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{DISCORD_API_BASE}/webhooks/{webhook_id}/{webhook_token}"),
        }
    }
}

#[async_trait]
impl WebhookSink for DiscordWebhook {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), WebhookError> {
        // The URL embeds the webhook token, so strip it from any error.
        let response = self
            .client
            .post(&self.url)
            .json(&payload.to_webhook_body())
            .send()
            .await
            .map_err(|e| WebhookError::Http(e.without_url()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(WebhookError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

pub struct Notifier {
    sink: Arc<dyn WebhookSink>,
    templates: EmbedTemplates,
    user_id: u64,
}

impl Notifier {
    pub fn new(sink: Arc<dyn WebhookSink>, templates: EmbedTemplates, user_id: u64) -> Self {
        Self {
            sink,
            templates,
            user_id,
        }
    }

    pub fn set_templates(&mut self, templates: EmbedTemplates) {
        self.templates = templates;
    }

    /// Builds the embed for `old -> new` and dispatches it in the background.
    /// Returns `None` without side effects if the pair is not a boundary crossing.
    pub fn notify_transition(
        &self,
        old: PresenceStatus,
        new: PresenceStatus,
    ) -> Option<JoinHandle<()>> {
        let payload =
            NotificationPayload::build(&self.templates, self.user_id, old, new, Local::now())?;
        let sink = Arc::clone(&self.sink);
        Some(tokio::spawn(deliver(sink, payload)))
    }
}

async fn deliver(sink: Arc<dyn WebhookSink>, payload: NotificationPayload) {
    match sink.send(&payload).await {
        Ok(()) => info!(transition = ?payload.transition, "Webhook message sent"),
        Err(e) => error!(transition = ?payload.transition, error = %e, "Webhook delivery failed"),
    }
}
