use serde::Deserialize;
use std::fmt;

/// Availability reported by the chat platform for a single user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    #[serde(rename = "dnd")]
    DoNotDisturb,
    /// Invisible users are reported to everyone else as offline.
    #[serde(alias = "invisible")]
    Offline,
}

/// Coarse view of a presence: `Offline` or anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Offline,
    Present,
}

impl PresenceStatus {
    pub fn is_offline(self) -> bool {
        self == PresenceStatus::Offline
    }

    pub fn reachability(self) -> Reachability {
        if self.is_offline() {
            Reachability::Offline
        } else {
            Reachability::Present
        }
    }

    /// Wire name, as the gateway spells it.
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Idle => "idle",
            PresenceStatus::DoNotDisturb => "dnd",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True when exactly one side of the transition is offline.
pub fn crosses_offline_boundary(old: PresenceStatus, new: PresenceStatus) -> bool {
    old.reachability() != new.reachability()
}
