//! # Wire Codec
//!
//! Pure, stateless conversion between JSON bodies and domain types.
//!
//! Inbound chat payloads arrive in two places (live `MESSAGE` frames and the
//! history endpoint) with the same shape, and in practice with a fair amount
//! of slack: ids may be numbers or strings, display names and timestamps may
//! be missing. Everything optional gets a documented default here so nothing
//! downstream has to care.
//!
//! Outbound, the two room types disagree on what the numeric `teamId` means:
//! event rooms send the side (1/2), the general room sends whatever category
//! the caller picked. [`OutboundIntent`] makes that choice once, up front.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::stats::BettingStats;
use crate::core::topics;
use crate::error::DecodeError;
use crate::model::{
    ANONYMOUS_DISPLAY_NAME, CallerIdentity, DomainMessage, GameId, MessageKind, MessageScope,
    Partitioning, RoomId, Side,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatFrameDto {
    #[serde(default, alias = "id")]
    message_id: Option<Value>,
    #[serde(default, alias = "senderNickname")]
    nickname: Option<String>,
    #[serde(default, alias = "message")]
    content: Option<String>,
    #[serde(default, alias = "timestamp")]
    created_at: Option<Value>,
    #[serde(default)]
    team_id: Option<i64>,
    #[serde(default, alias = "senderId")]
    user_id: Option<Value>,
    #[serde(default)]
    message_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountDeltaDto {
    #[serde(default)]
    room_id: Option<Value>,
    #[serde(default)]
    team_id: Option<i64>,
}

/// A +1 on one side of one room's counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountDelta {
    pub room_id: RoomId,
    pub side: Side,
}

/// Decodes a pushed chat frame body.
///
/// `received_at` is used as `created_at` when the payload has no timestamp.
pub fn decode_message(
    body: &str,
    partitioning: Partitioning,
    received_at: DateTime<Utc>,
) -> Result<DomainMessage, DecodeError> {
    let dto: ChatFrameDto = serde_json::from_str(body)?;
    normalize(dto, partitioning, received_at)
}

/// Decodes one row of a history response. Same rules as [`decode_message`].
pub fn decode_history_row(
    row: Value,
    partitioning: Partitioning,
    fetched_at: DateTime<Utc>,
) -> Result<DomainMessage, DecodeError> {
    let dto: ChatFrameDto = serde_json::from_value(row)?;
    normalize(dto, partitioning, fetched_at)
}

fn normalize(
    dto: ChatFrameDto,
    partitioning: Partitioning,
    received_at: DateTime<Utc>,
) -> Result<DomainMessage, DecodeError> {
    let body = dto.content.ok_or(DecodeError::MissingField("content"))?;

    let scope = match partitioning {
        Partitioning::BySide => {
            let team_id = dto.team_id.ok_or(DecodeError::MissingField("teamId"))?;
            let side = Side::from_team_id(team_id).ok_or(DecodeError::UnknownSide(team_id))?;
            MessageScope::Side(side)
        }
        Partitioning::Unpartitioned => MessageScope::Category(dto.team_id.unwrap_or(0)),
    };

    let created_at = match dto.created_at {
        None | Some(Value::Null) => received_at,
        Some(raw) => parse_timestamp(&raw)?,
    };

    let author_display_name = dto
        .nickname
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| ANONYMOUS_DISPLAY_NAME.to_string());

    let id = id_string(dto.message_id).unwrap_or_else(|| format!("gen-{}", uuid::Uuid::new_v4()));

    Ok(DomainMessage {
        id,
        author_display_name,
        body,
        created_at,
        scope,
        origin_user_id: id_string(dto.user_id),
        kind: MessageKind::from_wire(dto.message_type.as_deref()),
        local_only: false,
    })
}

/// Decodes a count-delta push.
pub fn decode_count_delta(body: &str) -> Result<CountDelta, DecodeError> {
    let dto: CountDeltaDto = serde_json::from_str(body)?;
    let room_id = id_string(dto.room_id).ok_or(DecodeError::MissingField("roomId"))?;
    let team_id = dto.team_id.ok_or(DecodeError::MissingField("teamId"))?;
    let side = Side::from_team_id(team_id).ok_or(DecodeError::UnknownSide(team_id))?;
    Ok(CountDelta { room_id, side })
}

/// Decodes a full betting stats push.
pub fn decode_stats(body: &str) -> Result<BettingStats, DecodeError> {
    Ok(serde_json::from_str(body)?)
}

fn id_string(raw: Option<Value>) -> Option<String> {
    match raw? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts RFC 3339, zone-less ISO local date-times (read as UTC) and epoch
/// milliseconds.
pub(crate) fn parse_timestamp(raw: &Value) -> Result<DateTime<Utc>, DecodeError> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| DecodeError::BadTimestamp(n.to_string())),
        Value::String(s) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(ts.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| naive.and_utc())
                .map_err(|_| DecodeError::BadTimestamp(s.clone()))
        }
        other => Err(DecodeError::BadTimestamp(other.to_string())),
    }
}

/// An outbound chat message, resolved to its room type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundIntent {
    /// General room: `category_id` goes on the wire as-is.
    General {
        room_id: RoomId,
        category_id: i64,
        body: String,
    },
    /// Event room: the side is mapped to 1/2.
    Event {
        room_id: RoomId,
        game_id: GameId,
        side: Side,
        body: String,
    },
}

impl OutboundIntent {
    pub fn room_id(&self) -> &str {
        match self {
            OutboundIntent::General { room_id, .. } | OutboundIntent::Event { room_id, .. } => room_id,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            OutboundIntent::General { body, .. } | OutboundIntent::Event { body, .. } => body,
        }
    }

    pub fn scope(&self) -> MessageScope {
        match self {
            OutboundIntent::General { category_id, .. } => MessageScope::Category(*category_id),
            OutboundIntent::Event { side, .. } => MessageScope::Side(*side),
        }
    }

    /// Wire value of `teamId`.
    pub fn side_or_category_id(&self) -> i64 {
        match self {
            OutboundIntent::General { category_id, .. } => *category_id,
            OutboundIntent::Event { side, .. } => side.team_id(),
        }
    }

    /// STOMP destination, mirroring the inbound topic scoping.
    pub fn destination(&self) -> String {
        match self {
            OutboundIntent::General { room_id, .. } => topics::general_publish(room_id),
            OutboundIntent::Event { game_id, .. } => topics::event_publish(game_id),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    team_id: i64,
    content: &'a str,
    message_type: &'static str,
}

/// Serializes an outbound message. `userId` is left out entirely for
/// anonymous callers.
pub fn encode(intent: &OutboundIntent, caller: &CallerIdentity) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutboundPayload {
        user_id: caller.user_id.as_deref(),
        team_id: intent.side_or_category_id(),
        content: intent.body(),
        message_type: MessageKind::Chat.as_wire(),
    })
}

/// The message the sender sees locally when delivery could not be confirmed.
pub fn local_echo(intent: &OutboundIntent, caller: &CallerIdentity, now: DateTime<Utc>) -> DomainMessage {
    DomainMessage {
        id: format!("local-{}", uuid::Uuid::new_v4()),
        author_display_name: caller.display_name_or_anonymous(),
        body: intent.body().to_string(),
        created_at: now,
        scope: intent.scope(),
        origin_user_id: caller.user_id.clone(),
        kind: MessageKind::Chat,
        local_only: true,
    }
}

/// Body of the stats request sent after (re)connecting to a game.
pub fn encode_stats_request(game_id: &str) -> String {
    serde_json::json!({ "gameId": game_id }).to_string()
}
