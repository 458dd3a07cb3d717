//! # Domain Model
//!
//! The stable, normalized types the rest of the crate (and the UI on top of
//! it) works with. Nothing in here knows about JSON field names or STOMP;
//! the wire codec in [`crate::core::wire`] is the only producer of
//! [`DomainMessage`] values.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Room identifiers are opaque strings handed out by the room directory.
pub type RoomId = String;
/// Game identifiers scope event rooms and the betting stats feed.
pub type GameId = String;

/// Display name used whenever the sender did not provide one.
pub const ANONYMOUS_DISPLAY_NAME: &str = "anonymous";

/// One of the two opposing participants of an event-scoped room.
///
/// The server encodes sides as small integers: `1` is [`Side::Home`]
/// (side A) and `2` is [`Side::Away`] (side B). No other value is a side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Home,
    Away,
}

impl Side {
    /// Both sides, in bucket order.
    pub const ALL: [Side; 2] = [Side::Home, Side::Away];

    /// The wire integer for this side.
    pub const fn team_id(self) -> i64 {
        match self {
            Side::Home => 1,
            Side::Away => 2,
        }
    }

    /// Inverse of [`Side::team_id`]. Anything other than 1 or 2 is `None`.
    pub const fn from_team_id(id: i64) -> Option<Side> {
        match id {
            1 => Some(Side::Home),
            2 => Some(Side::Away),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Side::Home => "home",
            Side::Away => "away",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Side::Home => 0,
            Side::Away => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "home" | "a" | "1" => Ok(Side::Home),
            "away" | "b" | "2" => Ok(Side::Away),
            other => Err(format!("`{}` is not a side (expected home/away)", other)),
        }
    }
}

/// Where a message belongs inside its room.
///
/// Event rooms carry a [`Side`]; the general room carries whatever numeric
/// category the sender picked, which is deliberately not interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageScope {
    Side(Side),
    Category(i64),
}

impl MessageScope {
    pub fn side(&self) -> Option<Side> {
        match self {
            MessageScope::Side(side) => Some(*side),
            MessageScope::Category(_) => None,
        }
    }
}

/// What kind of entry a message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    #[default]
    Chat,
    Join,
    Leave,
    System,
}

impl MessageKind {
    /// Lenient parse: unknown or missing kinds are treated as chat.
    pub fn from_wire(raw: Option<&str>) -> MessageKind {
        match raw.map(|s| s.trim().to_ascii_uppercase()) {
            Some(s) if s == "JOIN" || s == "ENTER" => MessageKind::Join,
            Some(s) if s == "LEAVE" || s == "EXIT" => MessageKind::Leave,
            Some(s) if s == "SYSTEM" || s == "NOTICE" => MessageKind::System,
            _ => MessageKind::Chat,
        }
    }

    pub const fn as_wire(self) -> &'static str {
        match self {
            MessageKind::Chat => "CHAT",
            MessageKind::Join => "JOIN",
            MessageKind::Leave => "LEAVE",
            MessageKind::System => "SYSTEM",
        }
    }
}

/// A normalized chat message. Immutable once produced by the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainMessage {
    pub id: String,
    pub author_display_name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub scope: MessageScope,
    pub origin_user_id: Option<String>,
    pub kind: MessageKind,
    /// Set on entries the sender inserted locally because delivery could not
    /// be confirmed.
    pub local_only: bool,
}

/// How a room's message history is bucketed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partitioning {
    /// General room: one bucket.
    Unpartitioned,
    /// Event room: one bucket per [`Side`].
    BySide,
}

/// Connectivity of one channel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// The server rejected the session. Stays here until the caller asks
    /// for an explicit reconnect.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(label)
    }
}

/// A chat room as listed by the room directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDescriptor {
    pub room_id: RoomId,
    /// Game id for event rooms, `None` for the general room.
    pub scope_id: Option<GameId>,
    pub display_name: String,
    pub capacity: usize,
}

impl RoomDescriptor {
    pub const MIN_CAPACITY: usize = 50;
    pub const MAX_CAPACITY: usize = 200;

    /// Builds a descriptor, clamping `capacity` into the supported window.
    pub fn new(
        room_id: impl Into<RoomId>,
        scope_id: Option<GameId>,
        display_name: impl Into<String>,
        capacity: usize,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            scope_id,
            display_name: display_name.into(),
            capacity: capacity.clamp(Self::MIN_CAPACITY, Self::MAX_CAPACITY),
        }
    }

    pub fn partitioning(&self) -> Partitioning {
        match self.scope_id {
            Some(_) => Partitioning::BySide,
            None => Partitioning::Unpartitioned,
        }
    }

    pub fn game_id(&self) -> Option<&str> {
        self.scope_id.as_deref()
    }
}

/// Per-room counter pair. `home` is side A, `away` is side B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub home: u64,
    pub away: u64,
}

impl CounterSnapshot {
    pub fn new(home: u64, away: u64) -> Self {
        Self { home, away }
    }

    pub fn get(&self, side: Side) -> u64 {
        match side {
            Side::Home => self.home,
            Side::Away => self.away,
        }
    }

    pub(crate) fn bump(&mut self, side: Side) {
        match side {
            Side::Home => self.home = self.home.saturating_add(1),
            Side::Away => self.away = self.away.saturating_add(1),
        }
    }
}

/// Who is sending. Supplied by the embedding application; this crate never
/// authenticates anybody.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub user_id: Option<String>,
    pub display_name: Option<String>,
}

impl CallerIdentity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            display_name: Some(display_name.into()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn display_name_or_anonymous(&self) -> String {
        self.display_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(ANONYMOUS_DISPLAY_NAME)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_mapping_is_fixed() {
        assert_eq!(Side::from_team_id(1), Some(Side::Home));
        assert_eq!(Side::from_team_id(2), Some(Side::Away));
        assert_eq!(Side::from_team_id(0), None);
        assert_eq!(Side::from_team_id(3), None);
        assert_eq!(Side::Away.team_id(), 2);
        assert_eq!("B".parse::<Side>(), Ok(Side::Away));
        assert!("left".parse::<Side>().is_err());
    }

    #[test]
    fn descriptor_clamps_capacity_and_derives_partitioning() {
        let general = RoomDescriptor::new("1", None, "General", 10);
        assert_eq!(general.capacity, 50);
        assert_eq!(general.partitioning(), Partitioning::Unpartitioned);

        let event = RoomDescriptor::new("42", Some("g-7".into()), "LG vs Doosan", 500);
        assert_eq!(event.capacity, 200);
        assert_eq!(event.partitioning(), Partitioning::BySide);
        assert_eq!(event.game_id(), Some("g-7"));
    }

    #[test]
    fn blank_display_name_falls_back_to_anonymous() {
        let caller = CallerIdentity {
            user_id: Some("u1".into()),
            display_name: Some("   ".into()),
        };
        assert_eq!(caller.display_name_or_anonymous(), ANONYMOUS_DISPLAY_NAME);
        assert!(!CallerIdentity::anonymous().is_authenticated());
    }
}
