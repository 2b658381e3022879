mod config;
mod event;
mod gateway;
mod notifier;
mod presence;
mod tracker;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::event::WatcherEvent;
use crate::gateway::{GatewayClient, GatewayConfig};
use crate::notifier::{DiscordWebhook, Notifier};
use crate::tracker::{MonitoredUser, Poller, Tracker};

#[tokio::main]
async fn main() {
    // Before tracing, so RUST_LOG and LOG_FORMAT may come from .env too.
    let _ = dotenvy::dotenv();
    init_tracing();

    // ── Configuration ─────────────────────────────────────────────────────────
    let settings = match config::Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    let templates = config::load_or_default(&settings.embed_config).unwrap_or_else(|e| {
        error!(error = %format!("{e:#}"), "Embed config unusable, using defaults");
        config::EmbedTemplates::default()
    });

    let (event_tx, mut event_rx) = mpsc::channel::<WatcherEvent>(32);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_config(
        settings.embed_config.clone(),
        event_tx.clone(),
    ));

    let gateway = GatewayClient::start(
        GatewayConfig {
            token: settings.bot_token.clone(),
            guild_id: settings.guild_id,
            user_id: settings.user_id,
        },
        event_tx.clone(),
    );

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(WatcherEvent::Shutdown).await;
            }
        });
    }

    let notifier = Notifier::new(
        Arc::new(DiscordWebhook::new(
            settings.webhook_id,
            &settings.webhook_token,
        )),
        templates,
        settings.user_id,
    );
    let mut tracker = Tracker::new(
        MonitoredUser {
            guild_id: settings.guild_id,
            user_id: settings.user_id,
        },
        Arc::new(gateway),
        notifier,
        Poller::new(settings.check_interval, event_tx.clone()),
    );
    drop(event_tx);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        guild_id = settings.guild_id,
        user_id = settings.user_id,
        interval = ?settings.check_interval,
        "presence-watch started"
    );

    // ── Event loop ────────────────────────────────────────────────────────────
    let mut exit_code = 0;
    while let Some(evt) = event_rx.recv().await {
        match evt {
            WatcherEvent::Ready { bot_tag } => {
                info!(bot = %bot_tag, "Logged in to gateway");
                tracker.initialize().await;
            }

            WatcherEvent::PresenceUpdate { user_id, old, new } => {
                tracker.on_presence_event(user_id, old, new);
            }

            WatcherEvent::PollTick => {
                tracker.on_poll_tick().await;
            }

            WatcherEvent::TemplatesReloaded(templates) => {
                tracker.set_templates(templates);
            }

            WatcherEvent::GatewayFailed(reason) => {
                error!(%reason, "Gateway unavailable, exiting");
                exit_code = 1;
                break;
            }

            WatcherEvent::Shutdown => {
                info!(
                    last_known = ?tracker.last_known(),
                    polling = tracker.is_polling(),
                    "Shutting down"
                );
                break;
            }
        }
    }

    tracker.shutdown();
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

/// `RUST_LOG` filters (default `info`); `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
