//! REST implementation of [`SyncBackend`].

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::core::stats::{BettingStats, UserBetStatus};
use crate::error::FetchError;
use crate::model::{CounterSnapshot, RoomDescriptor, RoomId};
use crate::retrieve::SyncBackend;
use crate::retrieve::ky_http::ApiClient;

const ROOMS_PATH: &str = "api/chat/rooms";
const GAMES_PATH: &str = "api/betting/games";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomDto {
    room_id: Value,
    #[serde(default, alias = "gameId")]
    scope_id: Option<Value>,
    #[serde(default, alias = "name", alias = "roomName")]
    display_name: Option<String>,
    #[serde(default)]
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountDto {
    room_id: Value,
    #[serde(default, alias = "homeCount")]
    side_a_count: u64,
    #[serde(default, alias = "awayCount")]
    side_b_count: u64,
}

fn id_text(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl RoomDto {
    fn into_descriptor(self) -> Option<RoomDescriptor> {
        let room_id = id_text(&self.room_id)?;
        let scope_id = self.scope_id.as_ref().and_then(id_text);
        let display_name = self.display_name.unwrap_or_else(|| room_id.clone());
        Some(RoomDescriptor::new(
            room_id,
            scope_id,
            display_name,
            self.capacity.unwrap_or(RoomDescriptor::MIN_CAPACITY),
        ))
    }
}

/// Accepts a bare array or a page object wrapping one.
fn history_rows(doc: Value) -> Result<Vec<Value>, FetchError> {
    match doc {
        Value::Array(rows) => Ok(rows),
        Value::Object(mut map) => ["messages", "content"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(rows)) => Some(rows),
                _ => None,
            })
            .ok_or_else(|| FetchError::Body("history response has no message array".into())),
        other => Err(FetchError::Body(format!("unexpected history payload: {}", other))),
    }
}

/// Talks to the chat and betting REST APIs.
pub struct HttpBackend {
    client: ApiClient,
}

impl HttpBackend {
    pub fn new(api_base_url: &str, auth_token: Option<String>) -> Result<Self, FetchError> {
        Ok(Self {
            client: ApiClient::new(api_base_url, auth_token)?,
        })
    }
}

impl SyncBackend for HttpBackend {
    async fn fetch_history(&self, room_id: &str) -> Result<Vec<Value>, FetchError> {
        let path = format!("{}/{}/messages", ROOMS_PATH, room_id);
        let doc: Value = self.client.get_json(&path, &[]).await?;
        history_rows(doc)
    }

    async fn fetch_directory(&self) -> Result<Vec<RoomDescriptor>, FetchError> {
        let rows: Vec<RoomDto> = self.client.get_json(ROOMS_PATH, &[]).await?;
        let mut rooms = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_descriptor() {
                Some(room) => rooms.push(room),
                None => tracing::warn!("Directory row without a usable roomId skipped"),
            }
        }
        Ok(rooms)
    }

    async fn fetch_counts(&self, room_ids: &[RoomId]) -> Result<HashMap<RoomId, CounterSnapshot>, FetchError> {
        if room_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let path = format!("{}/counts", ROOMS_PATH);
        let rows: Vec<CountDto> = self
            .client
            .get_json(&path, &[("roomIds", room_ids.join(","))])
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                id_text(&row.room_id).map(|id| (id, CounterSnapshot::new(row.side_a_count, row.side_b_count)))
            })
            .collect())
    }

    async fn fetch_stats(&self, game_id: &str) -> Result<BettingStats, FetchError> {
        let path = format!("{}/{}/stats", GAMES_PATH, game_id);
        self.client.get_json(&path, &[]).await
    }

    async fn fetch_user_bet_status(&self, game_id: &str) -> Result<UserBetStatus, FetchError> {
        let path = format!("{}/{}/my-status", GAMES_PATH, game_id);
        self.client.get_json(&path, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serves one canned HTTP response and hands back the request line.
    fn serve_once(status: &str, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
        let port = listener.local_addr().unwrap().port();
        let status = status.to_string();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 2048];
            let n = stream.read(&mut buf).unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
            request.lines().next().unwrap_or_default().to_string()
        });
        (format!("http://127.0.0.1:{}", port), handle)
    }

    #[tokio::test]
    async fn directory_clamps_capacity_and_reads_scope() {
        let (base, server) = serve_once(
            "200 OK",
            r#"[{"roomId":1,"scopeId":null,"displayName":"General"},{"roomId":"42","scopeId":7,"displayName":"LG vs Doosan","capacity":999}]"#,
        );
        let backend = HttpBackend::new(&base, None).unwrap();
        let rooms = backend.fetch_directory().await.unwrap();
        let request_line = server.join().unwrap();

        assert!(request_line.starts_with("GET /api/chat/rooms "));
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0].scope_id, None);
        assert_eq!(rooms[0].capacity, 50);
        assert_eq!(rooms[1].game_id(), Some("7"));
        assert_eq!(rooms[1].capacity, 200);
    }

    #[tokio::test]
    async fn counts_query_lists_rooms() {
        let (base, server) = serve_once("200 OK", r#"[{"roomId":42,"sideACount":3,"sideBCount":4}]"#);
        let backend = HttpBackend::new(&base, None).unwrap();
        let counts = backend.fetch_counts(&["42".to_string(), "43".to_string()]).await.unwrap();
        let request_line = server.join().unwrap();

        assert!(request_line.contains("/api/chat/rooms/counts?roomIds=42%2C43"));
        assert_eq!(counts["42"], CounterSnapshot::new(3, 4));
        assert!(!counts.contains_key("43"));
    }

    #[tokio::test]
    async fn missing_stats_are_not_found() {
        let (base, server) = serve_once("404 Not Found", r#"{"message":"no bets"}"#);
        let backend = HttpBackend::new(&base, Some("tok".into())).unwrap();
        let result = backend.fetch_stats("g-9").await;
        server.join().unwrap();
        assert!(matches!(result, Err(FetchError::NotFound(_))));
    }

    #[tokio::test]
    async fn user_status_is_read_from_my_status() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"gameId":"g-9","totalBetPoints":400,"remainingPoints":9600,"predictedWinnerTeamId":1,"betCount":2,"canBet":true}"#,
        );
        let backend = HttpBackend::new(&base, Some("tok".into())).unwrap();
        let status = backend.fetch_user_bet_status("g-9").await.unwrap();
        let request_line = server.join().unwrap();

        assert!(request_line.starts_with("GET /api/betting/games/g-9/my-status "));
        assert_eq!(status.remaining_points, 9600);
        assert_eq!(status.predicted_winner_team_id, Some(1));
    }

    #[test]
    fn history_accepts_wrapped_pages() {
        let rows = history_rows(serde_json::json!({"content": [{"content": "hi"}]})).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(history_rows(serde_json::json!({"nope": 1})).is_err());
    }
}
