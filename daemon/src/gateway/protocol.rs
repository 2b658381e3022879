//! Discord gateway wire types (API v10, JSON encoding).

use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use crate::presence::PresenceStatus;

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RECONNECT: u8 = 7;
pub const OP_REQUEST_GUILD_MEMBERS: u8 = 8;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

pub const INTENT_GUILDS: u64 = 1 << 0;
pub const INTENT_GUILD_MEMBERS: u64 = 1 << 1;
pub const INTENT_GUILD_PRESENCES: u64 = 1 << 8;

/// Close codes after which reconnecting cannot succeed.
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4004;
pub const CLOSE_INVALID_INTENTS: u16 = 4013;
pub const CLOSE_DISALLOWED_INTENTS: u16 = 4014;

pub fn is_fatal_close(code: u16) -> bool {
    matches!(
        code,
        CLOSE_AUTHENTICATION_FAILED | CLOSE_INVALID_INTENTS | CLOSE_DISALLOWED_INTENTS
    )
}

/// Envelope shared by every gateway message.
#[derive(Debug, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Hello {
    /// Milliseconds.
    pub heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
pub struct Ready {
    pub user: PartialUser,
}

#[derive(Debug, Deserialize)]
pub struct PartialUser {
    pub id: Snowflake,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PresenceUpdate {
    pub user: PartialUser,
    /// Absent on presences embedded in GUILD_CREATE and member chunks.
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    pub status: PresenceStatus,
}

#[derive(Debug, Deserialize)]
pub struct GuildCreate {
    pub id: Snowflake,
    #[serde(default)]
    pub presences: Vec<PresenceUpdate>,
}

#[derive(Debug, Deserialize)]
pub struct GuildMembersChunk {
    pub guild_id: Snowflake,
    #[serde(default)]
    pub presences: Vec<PresenceUpdate>,
    #[serde(default)]
    pub not_found: Vec<Snowflake>,
    #[serde(default)]
    pub nonce: Option<String>,
}

/// Discord ids arrive as decimal strings; older payloads sometimes use numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Snowflake(pub u64);

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(Snowflake(n)),
            Raw::Str(s) => s
                .parse()
                .map(Snowflake)
                .map_err(|_| serde::de::Error::custom(format!("invalid snowflake {s:?}"))),
        }
    }
}

pub fn identify(token: &str, intents: u64) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": intents,
            "properties": {
                "os": std::env::consts::OS,
                "browser": env!("CARGO_PKG_NAME"),
                "device": env!("CARGO_PKG_NAME"),
            }
        }
    })
}

pub fn heartbeat(last_sequence: Option<u64>) -> Value {
    json!({ "op": OP_HEARTBEAT, "d": last_sequence })
}

/// Asks for one member of `guild_id` together with their presence.
pub fn request_member_presence(guild_id: u64, user_id: u64, nonce: &str) -> Value {
    json!({
        "op": OP_REQUEST_GUILD_MEMBERS,
        "d": {
            "guild_id": guild_id.to_string(),
            "user_ids": [user_id.to_string()],
            "presences": true,
            "nonce": nonce,
        }
    })
}
