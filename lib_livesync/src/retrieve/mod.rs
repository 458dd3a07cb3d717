//! # Data Retrieval Module
//!
//! Pull side of the sync layer: message history, the room directory, counter
//! snapshots, betting stats and the caller's own bet status. Push and pull meet in the session, which
//! only depends on the [`SyncBackend`] trait so it can run against an
//! in-memory backend in tests.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: a generic HTTP `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, retrying transient failures with exponential
//!   backoff.
//! - **`backend`**: [`HttpBackend`](backend::HttpBackend), the REST
//!   implementation of [`SyncBackend`].

use std::collections::HashMap;
use std::future::Future;

use serde_json::Value;

use crate::core::stats::{BettingStats, UserBetStatus};
use crate::error::FetchError;
use crate::model::{CounterSnapshot, RoomDescriptor, RoomId};

/// Generic HTTP API client with retry middleware.
#[cfg(feature = "retrieve")]
pub mod ky_http;
/// REST endpoints of the chat and betting services.
#[cfg(feature = "retrieve")]
pub mod backend;

#[cfg(feature = "retrieve")]
pub use backend::HttpBackend;

/// Everything the sync layer ever pulls.
///
/// History rows come back undecoded; the wire codec turns them into
/// messages once the caller knows the room's partitioning.
pub trait SyncBackend: Send + Sync + 'static {
    /// `GET` the recent history of one room, oldest first.
    fn fetch_history(&self, room_id: &str) -> impl Future<Output = Result<Vec<Value>, FetchError>> + Send;

    /// `GET` the list of chat rooms.
    fn fetch_directory(&self) -> impl Future<Output = Result<Vec<RoomDescriptor>, FetchError>> + Send;

    /// `GET` counter snapshots for a set of rooms. Rooms the server does not
    /// know are simply absent from the map.
    fn fetch_counts(
        &self,
        room_ids: &[RoomId],
    ) -> impl Future<Output = Result<HashMap<RoomId, CounterSnapshot>, FetchError>> + Send;

    /// `GET` the betting aggregate of one game. `FetchError::NotFound` means
    /// nobody has bet yet.
    fn fetch_stats(&self, game_id: &str) -> impl Future<Output = Result<BettingStats, FetchError>> + Send;

    /// `GET` the authenticated caller's own bets on one game.
    /// `FetchError::NotFound` means they have not bet yet.
    fn fetch_user_bet_status(&self, game_id: &str) -> impl Future<Output = Result<UserBetStatus, FetchError>> + Send;
}
