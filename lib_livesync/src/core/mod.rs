//! # Core Engine Module
//!
//! Everything between the socket and the UI-facing state.
//!
//! ## Core Components:
//!
//! - **`stomp`** and **`wire`**: the two codec layers. STOMP envelopes on the
//!   outside, JSON chat/count/stats payloads inside.
//! - **`transport`**: the text-message link the connection runs on.
//! - **`registry`**: the topic table of one channel group, replayed on every
//!   reconnect.
//! - **`connection`**: one driver task per channel group handling handshake,
//!   heart-beats, fixed-delay reconnect and the connection state.
//! - **`store`**, **`counters`**, **`stats`**: the per-room state fed by
//!   pushes and pulls.
//! - **`publish`**: outbound chat with local fallback.
//! - **`session`**: [`LiveSync`], which wires all of the above together for
//!   the room the user is looking at.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// One STOMP connection per channel group, with reconnect and heart-beats.
pub mod connection;
/// Snapshot-plus-delta room counters.
pub mod counters;
/// Outbound chat with local fallback.
pub mod publish;
/// Topic table replayed on every reconnect.
pub mod registry;
/// The session coordinator.
pub mod session;
/// Betting stats per game.
pub mod stats;
/// STOMP 1.2 frame codec.
pub mod stomp;
/// Bounded per-room message history.
pub mod store;
/// Destination naming.
pub mod topics;
/// Text-message link abstraction and its WebSocket implementation.
pub mod transport;
/// JSON payload codec.
pub mod wire;

// --- Public API Re-exports ---
pub use connection::{ChannelGroup, ConnectionSettings, ReconnectCallback};
pub use counters::CounterSynchronizer;
pub use publish::{Delivery, PublishPipeline};
pub use registry::{SubscriptionRegistry, TopicHandler};
pub use session::{Diagnostics, LiveSync, SyncEvent};
pub use stats::{BettingStats, StatsBoard, UserBetStatus};
pub use store::RoomMessageStore;
pub use transport::{Link, Transport};
#[cfg(feature = "ws")]
pub use transport::WsTransport;
pub use wire::OutboundIntent;

/// Locks a state mutex. A panic in another holder does not make the data
/// unusable here: every critical section leaves it consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
