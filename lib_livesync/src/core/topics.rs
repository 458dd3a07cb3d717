//! Topic and destination naming. Publish destinations mirror the scoping of
//! the inbound topic they belong to.

use crate::model::{Partitioning, RoomDescriptor};

/// Which downstream consumer a topic feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicClass {
    /// Chat messages, room- or game-scoped.
    Messages,
    /// `{roomId, teamId}` increments. Never full snapshots.
    CountDeltas,
    /// Whole betting-stats objects that replace local state.
    Stats,
}

const COUNT_SUFFIX: &str = "count";

pub fn general_messages(room_id: &str) -> String {
    format!("/topic/chat/room/{}", room_id)
}

pub fn event_messages(game_id: &str) -> String {
    format!("/topic/chat/game/{}", game_id)
}

pub fn general_publish(room_id: &str) -> String {
    format!("/app/chat/room/{}", room_id)
}

pub fn event_publish(game_id: &str) -> String {
    format!("/app/chat/game/{}", game_id)
}

pub fn count_deltas(room_id: &str) -> String {
    format!("/topic/chat/room/{}/{}", room_id, COUNT_SUFFIX)
}

pub fn betting_stats(game_id: &str) -> String {
    format!("/topic/betting/{}", game_id)
}

pub fn betting_stats_request(game_id: &str) -> String {
    format!("/app/betting.getStats/{}", game_id)
}

/// The message topic for a room, by room type.
pub fn messages_for(room: &RoomDescriptor) -> String {
    match (room.partitioning(), room.game_id()) {
        (Partitioning::BySide, Some(game_id)) => event_messages(game_id),
        _ => general_messages(&room.room_id),
    }
}
