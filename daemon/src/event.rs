use crate::config::EmbedTemplates;
use crate::presence::PresenceStatus;

pub enum WatcherEvent {
    /// The gateway session is identified and ready; (re)run the initial lookup.
    Ready { bot_tag: String },
    /// A user's presence changed in the watched guild.
    PresenceUpdate {
        user_id: u64,
        old: PresenceStatus,
        new: PresenceStatus,
    },
    /// The offline poller's interval elapsed.
    PollTick,
    /// The embed config file changed on disk and was successfully re-parsed.
    TemplatesReloaded(EmbedTemplates),
    /// The gateway refused the session for good (bad token, disallowed intents).
    GatewayFailed(String),
    /// Ctrl+C received; stop polling and exit.
    Shutdown,
}
