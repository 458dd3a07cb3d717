//! # lib_livesync
//!
//! Client-side real-time sync for live game chat rooms: STOMP pub/sub over a
//! WebSocket for chat, per-room counters and betting stats, with REST pulls
//! for history and snapshots.
//!
//! Most applications only need [`LiveSync`]:
//!
//! ```no_run
//! # #[cfg(all(feature = "retrieve", feature = "ws"))]
//! # async fn demo() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use lib_livesync::{ConnectionSettings, HttpBackend, LiveSync, MessageScope, SyncConfig, WsTransport};
//!
//! let config = SyncConfig::default();
//! let backend = Arc::new(HttpBackend::new(&config.api_base_url, config.auth_token.clone())?);
//! let sync = LiveSync::new(backend, Arc::new(WsTransport), ConnectionSettings::from_config(&config));
//!
//! let rooms = sync.directory().await?;
//! sync.join_room(rooms[0].clone()).await;
//! sync.connect().await;
//! sync.send("hello", MessageScope::Category(0)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod configs;
pub mod core;
pub mod error;
#[cfg(feature = "loggers")]
pub mod loggers;
pub mod model;
pub mod retrieve;

pub use configs::{ConfigOverlay, SyncConfig};
pub use core::{
    BettingStats, ChannelGroup, ConnectionSettings, CounterSynchronizer, Delivery, Diagnostics, LiveSync,
    OutboundIntent, ReconnectCallback, RoomMessageStore, StatsBoard, SyncEvent, Transport, UserBetStatus,
};
#[cfg(feature = "ws")]
pub use core::WsTransport;
pub use error::{ConfigError, DecodeError, FetchError, ProtocolError, PublishError, SyncError, TransportError};
pub use model::{
    CallerIdentity, ConnectionState, CounterSnapshot, DomainMessage, GameId, MessageKind, MessageScope, Partitioning,
    RoomDescriptor, RoomId, Side,
};
#[cfg(feature = "retrieve")]
pub use retrieve::HttpBackend;
pub use retrieve::SyncBackend;
