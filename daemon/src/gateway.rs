//! Discord gateway client.
//!
//! A background task owns the WebSocket: it identifies, heartbeats, forwards
//! presence changes for the watched guild as [`WatcherEvent`]s, and answers
//! presence lookups issued through [`GatewayClient`]. Lost sessions are
//! re-established with a capped exponential delay; a fresh `READY` is sent
//! to the event loop after each one.

mod protocol;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::{self, protocol::CloseFrame, Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::event::WatcherEvent;
use crate::presence::PresenceStatus;
use protocol::{
    GatewayPayload, GuildCreate, GuildMembersChunk, Hello, PresenceUpdate, Ready, Snowflake,
};

pub const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
/// Guild metadata, member lookups with presence, and live presence updates.
pub const INTENTS: u64 =
    protocol::INTENT_GUILDS | protocol::INTENT_GUILD_MEMBERS | protocol::INTENT_GUILD_PRESENCES;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY_SECS: u64 = 1;
const MAX_RECONNECT_DELAY_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway session is not ready")]
    NotConnected,
    #[error("gateway client has shut down")]
    Shutdown,
    #[error("presence lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("user {user_id} is not a member of guild {guild_id}")]
    MemberNotFound { guild_id: u64, user_id: u64 },
    #[error("connecting to the gateway timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("malformed gateway payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("expected HELLO, got opcode {0}")]
    UnexpectedOpcode(u8),
    #[error("heartbeat was not acknowledged")]
    Zombie,
    #[error("gateway closed the session with code {code}: {reason}")]
    SessionClosed { code: u16, reason: String },
    #[error("gateway dropped the connection")]
    Disconnected,
}

impl GatewayError {
    /// Reconnecting after this error would be refused again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::SessionClosed { code, .. } if protocol::is_fatal_close(*code))
    }
}

/// Looks up a member's current presence on the chat platform.
#[async_trait]
pub trait PresenceSource: Send + Sync {
    async fn fetch_presence(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<PresenceStatus, GatewayError>;
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub token: String,
    /// Presence updates from any other guild are dropped.
    pub guild_id: u64,
    /// Only this user's presence updates are forwarded to the event loop.
    pub user_id: u64,
}

type Reply = oneshot::Sender<Result<PresenceStatus, GatewayError>>;

enum GatewayCommand {
    FetchPresence {
        guild_id: u64,
        user_id: u64,
        reply: Reply,
    },
}

/// Handle to the background gateway task.
#[derive(Clone)]
pub struct GatewayClient {
    command_tx: mpsc::Sender<GatewayCommand>,
}

impl GatewayClient {
    /// Spawns the connection task. Gateway events are delivered on `event_tx`.
    pub fn start(config: GatewayConfig, event_tx: mpsc::Sender<WatcherEvent>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        tokio::spawn(connection_loop(connect, config, event_tx, command_rx));
        Self { command_tx }
    }
}

#[async_trait]
impl PresenceSource for GatewayClient {
    async fn fetch_presence(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<PresenceStatus, GatewayError> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(GatewayCommand::FetchPresence {
                guild_id,
                user_id,
                reply,
            })
            .await
            .map_err(|_| GatewayError::Shutdown)?;

        match timeout(REQUEST_TIMEOUT, response).await {
            Ok(Ok(result)) => result,
            // The session ended and dropped the request.
            Ok(Err(_)) => Err(GatewayError::NotConnected),
            Err(_) => Err(GatewayError::Timeout(REQUEST_TIMEOUT)),
        }
    }
}

// ── Connection loop ───────────────────────────────────────────────────────────

async fn connect() -> Result<
    impl Stream<Item = Result<WsMessage, tungstenite::Error>>
        + Sink<WsMessage, Error = tungstenite::Error>
        + Unpin,
    GatewayError,
> {
    match timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(GATEWAY_URL)).await {
        Ok(Ok((ws, _))) => Ok(ws),
        Ok(Err(e)) => Err(GatewayError::WebSocket(e)),
        Err(_) => Err(GatewayError::ConnectTimeout(CONNECT_TIMEOUT)),
    }
}

async fn connection_loop<C, F, W>(
    mut connect: C,
    config: GatewayConfig,
    event_tx: mpsc::Sender<WatcherEvent>,
    mut command_rx: mpsc::Receiver<GatewayCommand>,
) where
    C: FnMut() -> F,
    F: Future<Output = Result<W, GatewayError>>,
    W: Stream<Item = Result<WsMessage, tungstenite::Error>>
        + Sink<WsMessage, Error = tungstenite::Error>
        + Unpin,
{
    let mut reconnect_delay = RECONNECT_DELAY_SECS;

    loop {
        info!("Connecting to Discord gateway");
        let mut session = Session::new(config.guild_id, config.user_id);

        let result = match connect().await {
            Ok(ws) => session.run(ws, &config, &event_tx, &mut command_rx).await,
            Err(e) => Err(e),
        };
        session.fail_pending();

        match result {
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Gateway refused the session");
                let _ = event_tx.send(WatcherEvent::GatewayFailed(e.to_string())).await;
                return;
            }
            Err(e) => warn!(error = %e, "Gateway session ended"),
            Ok(()) => info!("Gateway session ended"),
        }

        if event_tx.is_closed() {
            return;
        }
        if session.ready {
            reconnect_delay = RECONNECT_DELAY_SECS;
        }

        info!(delay_secs = reconnect_delay, "Reconnecting to gateway");
        if !refuse_commands_for(Duration::from_secs(reconnect_delay), &mut command_rx).await {
            return;
        }
        reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY_SECS);
    }
}

/// Answers every lookup with `NotConnected` until `delay` elapses.
/// Returns `false` once all client handles are gone.
async fn refuse_commands_for(
    delay: Duration,
    command_rx: &mut mpsc::Receiver<GatewayCommand>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = command_rx.recv() => match command {
                Some(GatewayCommand::FetchPresence { reply, .. }) => {
                    let _ = reply.send(Err(GatewayError::NotConnected));
                }
                None => return false,
            },
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

struct PendingLookup {
    guild_id: u64,
    user_id: u64,
    reply: Reply,
}

/// What the read loop should do after a payload.
enum Step {
    Continue,
    Emit(WatcherEvent),
    HeartbeatNow,
    Reconnect,
}

/// State for a single gateway connection.
struct Session {
    guild_id: u64,
    user_id: u64,
    ready: bool,
    sequence: Option<u64>,
    awaiting_ack: bool,
    /// Last seen status per user in the watched guild.
    presences: HashMap<u64, PresenceStatus>,
    pending: HashMap<String, PendingLookup>,
    next_nonce: u64,
}

impl Session {
    fn new(guild_id: u64, user_id: u64) -> Self {
        Self {
            guild_id,
            user_id,
            ready: false,
            sequence: None,
            awaiting_ack: false,
            presences: HashMap::new(),
            pending: HashMap::new(),
            next_nonce: 0,
        }
    }

    async fn run<W>(
        &mut self,
        ws: W,
        config: &GatewayConfig,
        event_tx: &mpsc::Sender<WatcherEvent>,
        command_rx: &mut mpsc::Receiver<GatewayCommand>,
    ) -> Result<(), GatewayError>
    where
        W: Stream<Item = Result<WsMessage, tungstenite::Error>>
            + Sink<WsMessage, Error = tungstenite::Error>
            + Unpin,
    {
        let (mut write, mut read) = ws.split();

        let hello = loop {
            match read.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let payload: GatewayPayload = serde_json::from_str(&text)?;
                    if payload.op != protocol::OP_HELLO {
                        return Err(GatewayError::UnexpectedOpcode(payload.op));
                    }
                    break serde_json::from_value::<Hello>(payload.d)?;
                }
                Some(Ok(WsMessage::Close(frame))) => return Err(close_error(frame)),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(GatewayError::Disconnected),
            }
        };

        send_json(&mut write, &protocol::identify(&config.token, INTENTS)).await?;

        let period = Duration::from_millis(hello.heartbeat_interval.max(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        debug!(interval_ms = hello.heartbeat_interval, "Gateway HELLO received");

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if self.awaiting_ack {
                        return Err(GatewayError::Zombie);
                    }
                    self.send_heartbeat(&mut write).await?;
                }
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if let Some(request) = self.register_lookup(command) {
                            send_json(&mut write, &request).await?;
                        }
                    }
                    None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return Ok(());
                    }
                },
                message = read.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        let payload: GatewayPayload = match serde_json::from_str(&text) {
                            Ok(p) => p,
                            Err(e) => {
                                debug!(error = %e, "Unrecognized gateway message");
                                continue;
                            }
                        };
                        match self.handle_payload(payload) {
                            Step::Continue => {}
                            Step::Emit(event) => {
                                if event_tx.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Step::HeartbeatNow => self.send_heartbeat(&mut write).await?,
                            Step::Reconnect => return Ok(()),
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => return Err(close_error(frame)),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(GatewayError::Disconnected),
                },
            }
        }
    }

    async fn send_heartbeat<S>(&mut self, write: &mut S) -> Result<(), GatewayError>
    where
        S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
    {
        self.awaiting_ack = true;
        send_json(write, &protocol::heartbeat(self.sequence)).await
    }

    fn handle_payload(&mut self, payload: GatewayPayload) -> Step {
        if let Some(seq) = payload.s {
            self.sequence = Some(seq);
        }
        match payload.op {
            protocol::OP_DISPATCH => match payload.t.as_deref() {
                Some(kind) => self.handle_dispatch(kind, payload.d),
                None => Step::Continue,
            },
            protocol::OP_HEARTBEAT => Step::HeartbeatNow,
            protocol::OP_HEARTBEAT_ACK => {
                self.awaiting_ack = false;
                Step::Continue
            }
            protocol::OP_RECONNECT => {
                info!("Gateway requested a reconnect");
                Step::Reconnect
            }
            protocol::OP_INVALID_SESSION => {
                warn!("Gateway invalidated the session");
                Step::Reconnect
            }
            op => {
                debug!(op, "Ignoring gateway opcode");
                Step::Continue
            }
        }
    }

    fn handle_dispatch(&mut self, kind: &str, data: serde_json::Value) -> Step {
        match kind {
            "READY" => match serde_json::from_value::<Ready>(data) {
                Ok(ready) => {
                    self.ready = true;
                    let bot_tag = ready
                        .user
                        .username
                        .unwrap_or_else(|| ready.user.id.0.to_string());
                    Step::Emit(WatcherEvent::Ready { bot_tag })
                }
                Err(e) => {
                    warn!(error = %e, "Malformed READY payload");
                    Step::Continue
                }
            },
            "GUILD_CREATE" => {
                match serde_json::from_value::<GuildCreate>(data) {
                    Ok(guild) if guild.id.0 == self.guild_id => {
                        for presence in guild.presences {
                            self.presences.insert(presence.user.id.0, presence.status);
                        }
                        debug!(cached = self.presences.len(), "Watched guild available");
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "Skipping GUILD_CREATE"),
                }
                Step::Continue
            }
            "PRESENCE_UPDATE" => match serde_json::from_value::<PresenceUpdate>(data) {
                Ok(update) if update.guild_id == Some(Snowflake(self.guild_id)) => {
                    let user_id = update.user.id.0;
                    let old = self
                        .presences
                        .insert(user_id, update.status)
                        .unwrap_or(PresenceStatus::Offline);
                    if user_id != self.user_id {
                        return Step::Continue;
                    }
                    Step::Emit(WatcherEvent::PresenceUpdate {
                        user_id,
                        old,
                        new: update.status,
                    })
                }
                Ok(_) => Step::Continue,
                Err(e) => {
                    debug!(error = %e, "Skipping PRESENCE_UPDATE");
                    Step::Continue
                }
            },
            "GUILD_MEMBERS_CHUNK" => {
                match serde_json::from_value::<GuildMembersChunk>(data) {
                    Ok(chunk) => self.resolve_lookup(chunk),
                    Err(e) => debug!(error = %e, "Skipping GUILD_MEMBERS_CHUNK"),
                }
                Step::Continue
            }
            _ => Step::Continue,
        }
    }

    /// Records a lookup and returns the request to put on the wire, or answers
    /// it immediately when the session cannot serve it.
    fn register_lookup(&mut self, command: GatewayCommand) -> Option<serde_json::Value> {
        let GatewayCommand::FetchPresence {
            guild_id,
            user_id,
            reply,
        } = command;

        if !self.ready {
            let _ = reply.send(Err(GatewayError::NotConnected));
            return None;
        }

        // Callers that timed out have dropped their receiver.
        self.pending.retain(|_, lookup| !lookup.reply.is_closed());

        self.next_nonce += 1;
        let nonce = self.next_nonce.to_string();
        let request = protocol::request_member_presence(guild_id, user_id, &nonce);
        self.pending.insert(
            nonce,
            PendingLookup {
                guild_id,
                user_id,
                reply,
            },
        );
        Some(request)
    }

    fn resolve_lookup(&mut self, chunk: GuildMembersChunk) {
        let Some(lookup) = chunk.nonce.as_deref().and_then(|n| self.pending.remove(n)) else {
            return;
        };

        let result = if chunk.not_found.contains(&Snowflake(lookup.user_id)) {
            Err(GatewayError::MemberNotFound {
                guild_id: lookup.guild_id,
                user_id: lookup.user_id,
            })
        } else {
            // Members without a presence entry are offline.
            let status = chunk
                .presences
                .iter()
                .find(|p| p.user.id.0 == lookup.user_id)
                .map(|p| p.status)
                .unwrap_or(PresenceStatus::Offline);
            if chunk.guild_id.0 == self.guild_id {
                self.presences.insert(lookup.user_id, status);
            }
            Ok(status)
        };
        let _ = lookup.reply.send(result);
    }

    fn fail_pending(&mut self) {
        for (_, lookup) in self.pending.drain() {
            let _ = lookup.reply.send(Err(GatewayError::NotConnected));
        }
    }
}

async fn send_json<S>(write: &mut S, value: &serde_json::Value) -> Result<(), GatewayError>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    write.send(WsMessage::Text(value.to_string().into())).await?;
    Ok(())
}

fn close_error(frame: Option<CloseFrame>) -> GatewayError {
    match frame {
        Some(frame) => GatewayError::SessionClosed {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_string(),
        },
        None => GatewayError::Disconnected,
    }
}
