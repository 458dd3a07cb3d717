//! # Session Coordinator
//!
//! [`LiveSync`] is what an application holds. It owns the two channel
//! groups (chat and counts), the message store, the counters and the stats
//! board, and keeps them pointed at exactly one room at a time.
//!
//! Switching rooms is strictly teardown-then-setup. On top of that every
//! handler remembers the room it was registered for and ignores deliveries
//! once that room is no longer active, so a frame that was already in
//! flight when the user navigated away cannot land in the new room.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, watch};

use crate::core::connection::{ChannelGroup, ConnectionSettings};
use crate::core::counters::CounterSynchronizer;
use crate::core::lock;
use crate::core::publish::{Delivery, PublishPipeline};
use crate::core::registry::TopicHandler;
use crate::core::stats::{BettingStats, StatsBoard, UserBetStatus};
use crate::core::store::RoomMessageStore;
use crate::core::topics::{self, TopicClass};
use crate::core::transport::Transport;
use crate::core::wire::{self, OutboundIntent};
use crate::error::{FetchError, ProtocolError, SyncError};
use crate::model::{
    CallerIdentity, ConnectionState, CounterSnapshot, DomainMessage, GameId, MessageScope, Partitioning,
    RoomDescriptor, RoomId, Side,
};
use crate::retrieve::SyncBackend;

const EVENT_BUFFER: usize = 256;

/// Change notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectionChanged {
        group: &'static str,
        state: ConnectionState,
    },
    MessagesChanged {
        room_id: RoomId,
    },
    CountersChanged {
        room_id: RoomId,
        counters: CounterSnapshot,
    },
    StatsChanged {
        game_id: GameId,
    },
}

/// Most recent failures, for display or logging by the embedder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    pub history: Option<String>,
    pub directory: Option<String>,
    pub counters: Option<String>,
    pub stats: Option<String>,
    pub chat_rejected: Option<ProtocolError>,
    pub counts_rejected: Option<ProtocolError>,
}

/// The room currently shown. Handlers check it on every delivery.
#[derive(Default)]
struct ActiveRoom(Mutex<Option<RoomDescriptor>>);

impl ActiveRoom {
    fn is(&self, room_id: &str) -> bool {
        lock(&self.0).as_ref().is_some_and(|r| r.room_id == room_id)
    }

    fn get(&self) -> Option<RoomDescriptor> {
        lock(&self.0).clone()
    }

    fn replace(&self, next: Option<RoomDescriptor>) -> Option<RoomDescriptor> {
        std::mem::replace(&mut *lock(&self.0), next)
    }
}

pub struct LiveSync<B: SyncBackend, T: Transport> {
    backend: Arc<B>,
    chat: Arc<ChannelGroup<T>>,
    counts: Arc<ChannelGroup<T>>,
    store: Arc<RoomMessageStore>,
    counters: Arc<CounterSynchronizer>,
    stats: Arc<StatsBoard>,
    publisher: PublishPipeline<T>,
    caller: Mutex<CallerIdentity>,
    active: Arc<ActiveRoom>,
    events: broadcast::Sender<SyncEvent>,
    history_error: Mutex<Option<String>>,
    directory_error: Mutex<Option<String>>,
    watchers_started: AtomicBool,
    /// Serializes room switches.
    switching: tokio::sync::Mutex<()>,
}

impl<B: SyncBackend, T: Transport> LiveSync<B, T> {
    /// Builds a session. Nothing connects until [`LiveSync::connect`].
    pub fn new(backend: Arc<B>, transport: Arc<T>, settings: ConnectionSettings) -> Self {
        let chat = Arc::new(ChannelGroup::new("chat", Arc::clone(&transport), settings.clone()));
        let counts = Arc::new(ChannelGroup::new("counts", transport, settings));
        let store = Arc::new(RoomMessageStore::new());
        let active = Arc::new(ActiveRoom::default());
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        counts.on_reconnect(stats_request_callback(Arc::downgrade(&counts), Arc::clone(&active)));

        Self {
            backend,
            publisher: PublishPipeline::new(Arc::clone(&chat), Arc::clone(&store)),
            chat,
            counts,
            store,
            counters: Arc::new(CounterSynchronizer::new()),
            stats: Arc::new(StatsBoard::new()),
            caller: Mutex::new(CallerIdentity::anonymous()),
            active,
            events,
            history_error: Mutex::new(None),
            directory_error: Mutex::new(None),
            watchers_started: AtomicBool::new(false),
            switching: tokio::sync::Mutex::new(()),
        }
    }

    /// Who subsequent sends are attributed to.
    pub fn set_caller(&self, caller: CallerIdentity) {
        *lock(&self.caller) = caller;
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Connects both channel groups.
    pub async fn connect(&self) {
        if !self.watchers_started.swap(true, Ordering::SeqCst) {
            forward_state(self.chat.name(), self.chat.watch_state(), self.events.clone());
            forward_state(self.counts.name(), self.counts.watch_state(), self.events.clone());
        }
        self.chat.connect().await;
        self.counts.connect().await;
    }

    /// Explicit reconnect of both groups. Required after a server rejection.
    pub async fn reconnect(&self) {
        self.chat.reconnect().await;
        self.counts.reconnect().await;
    }

    /// Leaves the current room and closes both groups.
    pub async fn disconnect(&self) {
        self.leave_room().await;
        self.chat.disconnect().await;
        self.counts.disconnect().await;
    }

    pub fn connection_state(&self) -> (ConnectionState, ConnectionState) {
        (self.chat.state(), self.counts.state())
    }

    /// Lists the available rooms.
    pub async fn directory(&self) -> Result<Vec<RoomDescriptor>, FetchError> {
        let listed = self.backend.fetch_directory().await;
        if let Err(e) = &listed {
            tracing::warn!(error = %e, "Room directory pull failed");
            *lock(&self.directory_error) = Some(e.to_string());
        }
        listed
    }

    /// Makes `room` the active room. The previous room is torn down first.
    pub async fn join_room(&self, room: RoomDescriptor) {
        let _switch = self.switching.lock().await;
        self.teardown_active();

        let room_id = room.room_id.clone();
        let partitioning = room.partitioning();
        tracing::info!(room_id = %room_id, display_name = %room.display_name, ?partitioning, "Joining room");

        self.store.open_room(&room_id, partitioning, room.capacity);
        self.active.replace(Some(room.clone()));

        self.load_history(&room_id, partitioning).await;

        self.chat.subscribe(
            topics::messages_for(&room),
            TopicClass::Messages,
            message_handler(&room, &self.active, &self.store, &self.events),
        );
        self.counts.subscribe(
            topics::count_deltas(&room_id),
            TopicClass::CountDeltas,
            delta_handler(&room_id, &self.active, &self.counters, &self.events),
        );
        if let Some(game_id) = room.game_id() {
            self.counts.subscribe(
                topics::betting_stats(game_id),
                TopicClass::Stats,
                stats_handler(&room_id, game_id, &self.active, &self.stats, &self.events),
            );
        }

        self.refresh_active_counts().await;
        if let Some(game_id) = room.game_id() {
            self.load_betting(game_id).await;
        }
    }

    /// Tears down the active room, if any.
    pub async fn leave_room(&self) {
        let _switch = self.switching.lock().await;
        self.teardown_active();
    }

    fn teardown_active(&self) {
        let Some(room) = self.active.replace(None) else {
            return;
        };
        tracing::info!(room_id = %room.room_id, "Leaving room");
        self.chat.unsubscribe(&topics::messages_for(&room));
        self.counts.unsubscribe(&topics::count_deltas(&room.room_id));
        if let Some(game_id) = room.game_id() {
            self.counts.unsubscribe(&topics::betting_stats(game_id));
            self.stats.clear_stats(game_id);
        }
        self.store.close_room(&room.room_id);
        self.counters.drop_rooms(std::slice::from_ref(&room.room_id));
    }

    async fn load_history(&self, room_id: &str, partitioning: Partitioning) {
        match self.backend.fetch_history(room_id).await {
            Ok(rows) => {
                let fetched_at = Utc::now();
                let total = rows.len();
                let decoded: Vec<DomainMessage> = rows
                    .into_iter()
                    .filter_map(|row| match wire::decode_history_row(row, partitioning, fetched_at) {
                        Ok(message) => Some(message),
                        Err(e) => {
                            tracing::warn!(room_id, error = %e, "History row dropped");
                            None
                        }
                    })
                    .collect();
                let stored = self.store.extend(room_id, decoded);
                tracing::debug!(room_id, total, stored, "History loaded");
                *lock(&self.history_error) = None;
            }
            Err(e) => {
                tracing::warn!(room_id, error = %e, "History pull failed; room starts empty");
                *lock(&self.history_error) = Some(e.to_string());
            }
        }
        let _ = self.events.send(SyncEvent::MessagesChanged {
            room_id: room_id.to_string(),
        });
    }

    /// Pulls the game's stats and, for a signed-in caller, their own status.
    async fn load_betting(&self, game_id: &str) -> BettingStats {
        let fetched = self.backend.fetch_stats(game_id).await;
        let stats = self.stats.install_fetched(game_id, fetched);
        let signed_in = lock(&self.caller).is_authenticated();
        if signed_in {
            let fetched = self.backend.fetch_user_bet_status(game_id).await;
            self.stats.install_user_status(game_id, fetched);
        }
        let _ = self.events.send(SyncEvent::StatsChanged {
            game_id: game_id.to_string(),
        });
        stats
    }

    /// Re-pulls stats and the caller's bet status for the active game, e.g.
    /// after the caller placed a bet. `None` if `game_id` is not the game of
    /// the active room.
    pub async fn refresh_betting(&self, game_id: &str) -> Option<BettingStats> {
        let _switch = self.switching.lock().await;
        let room = self.active.get()?;
        if room.game_id() != Some(game_id) {
            tracing::debug!(game_id, room_id = %room.room_id, "Betting refresh for an inactive game ignored");
            return None;
        }
        Some(self.load_betting(game_id).await)
    }

    /// Re-pulls the active room's counters. This is how drift is corrected.
    pub async fn refresh_counts(&self) -> Option<CounterSnapshot> {
        let _switch = self.switching.lock().await;
        self.refresh_active_counts().await
    }

    /// Callers hold `switching`, so the room cannot change under the pull.
    async fn refresh_active_counts(&self) -> Option<CounterSnapshot> {
        let room = self.active.get()?;
        let ids = [room.room_id.clone()];
        let loaded = self.counters.load_snapshot(self.backend.as_ref(), &ids).await;
        let counters = loaded.get(&room.room_id).copied()?;
        let _ = self.events.send(SyncEvent::CountersChanged {
            room_id: room.room_id,
            counters,
        });
        Some(counters)
    }

    /// Sends `body` to the active room.
    ///
    /// Event rooms need a side (a category of 1 or 2 is accepted as one); the
    /// general room takes any category, and a side is sent as its number.
    pub async fn send(&self, body: &str, scope: MessageScope) -> Result<Delivery, SyncError> {
        let room = self.active.get().ok_or(SyncError::NoActiveRoom)?;
        let intent = intent_for(&room, body, scope)?;
        let caller = lock(&self.caller).clone();
        let delivery = self.publisher.send(&intent, &caller).await;
        if matches!(delivery, Delivery::LocalFallback(_)) {
            let _ = self.events.send(SyncEvent::MessagesChanged {
                room_id: room.room_id,
            });
        }
        Ok(delivery)
    }

    pub fn active_room(&self) -> Option<RoomDescriptor> {
        self.active.get()
    }

    /// Messages of the active room, oldest first.
    pub fn messages(&self) -> Vec<DomainMessage> {
        self.active
            .get()
            .map(|room| self.store.get_ordered(&room.room_id))
            .unwrap_or_default()
    }

    /// One side of the active event room.
    pub fn side_messages(&self, side: Side) -> Vec<DomainMessage> {
        self.active
            .get()
            .map(|room| self.store.get_side(&room.room_id, side))
            .unwrap_or_default()
    }

    pub fn counters(&self) -> Option<CounterSnapshot> {
        self.active.get().and_then(|room| self.counters.get(&room.room_id))
    }

    pub fn stats(&self) -> Option<BettingStats> {
        self.active
            .get()
            .and_then(|room| room.game_id().and_then(|g| self.stats.get(g)))
    }

    /// The caller's own bets on the active game. Only pulled when signed in.
    pub fn user_bet_status(&self) -> Option<UserBetStatus> {
        self.active
            .get()
            .and_then(|room| room.game_id().and_then(|g| self.stats.user_status(g)))
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            history: lock(&self.history_error).clone(),
            directory: lock(&self.directory_error).clone(),
            counters: self.counters.last_error(),
            stats: self.stats.last_error(),
            chat_rejected: self.chat.last_error(),
            counts_rejected: self.counts.last_error(),
        }
    }
}

fn intent_for(room: &RoomDescriptor, body: &str, scope: MessageScope) -> Result<OutboundIntent, SyncError> {
    let body = body.to_string();
    match room.game_id() {
        Some(game_id) => {
            let side = match scope {
                MessageScope::Side(side) => side,
                MessageScope::Category(id) => {
                    Side::from_team_id(id).ok_or_else(|| SyncError::InvalidTarget(format!("category {}", id)))?
                }
            };
            Ok(OutboundIntent::Event {
                room_id: room.room_id.clone(),
                game_id: game_id.to_string(),
                side,
                body,
            })
        }
        None => {
            let category_id = match scope {
                MessageScope::Category(id) => id,
                MessageScope::Side(side) => side.team_id(),
            };
            Ok(OutboundIntent::General {
                room_id: room.room_id.clone(),
                category_id,
                body,
            })
        }
    }
}

fn message_handler(
    room: &RoomDescriptor,
    active: &Arc<ActiveRoom>,
    store: &Arc<RoomMessageStore>,
    events: &broadcast::Sender<SyncEvent>,
) -> TopicHandler {
    let room_id = room.room_id.clone();
    let partitioning = room.partitioning();
    let active = Arc::clone(active);
    let store = Arc::clone(store);
    let events = events.clone();
    Arc::new(move |body: &str| {
        if !active.is(&room_id) {
            tracing::trace!(room_id = %room_id, "Stale message delivery dropped");
            return Ok(());
        }
        let message = wire::decode_message(body, partitioning, Utc::now())?;
        if store.append(&room_id, message) {
            let _ = events.send(SyncEvent::MessagesChanged {
                room_id: room_id.clone(),
            });
        }
        Ok(())
    })
}

fn delta_handler(
    room_id: &str,
    active: &Arc<ActiveRoom>,
    counters: &Arc<CounterSynchronizer>,
    events: &broadcast::Sender<SyncEvent>,
) -> TopicHandler {
    let room_id = room_id.to_string();
    let active = Arc::clone(active);
    let counters = Arc::clone(counters);
    let events = events.clone();
    Arc::new(move |body: &str| {
        if !active.is(&room_id) {
            return Ok(());
        }
        let delta = wire::decode_count_delta(body)?;
        if delta.room_id != room_id {
            tracing::debug!(topic_room = %room_id, delta_room = %delta.room_id, "Delta for another room ignored");
            return Ok(());
        }
        if let Some(counters) = counters.apply_delta(&delta.room_id, delta.side) {
            let _ = events.send(SyncEvent::CountersChanged {
                room_id: delta.room_id,
                counters,
            });
        }
        Ok(())
    })
}

fn stats_handler(
    room_id: &str,
    game_id: &str,
    active: &Arc<ActiveRoom>,
    stats: &Arc<StatsBoard>,
    events: &broadcast::Sender<SyncEvent>,
) -> TopicHandler {
    let room_id = room_id.to_string();
    let topic_game = game_id.to_string();
    let active = Arc::clone(active);
    let stats = Arc::clone(stats);
    let events = events.clone();
    Arc::new(move |body: &str| {
        if !active.is(&room_id) {
            return Ok(());
        }
        let pushed = wire::decode_stats(body)?;
        if pushed.game_id != topic_game {
            tracing::debug!(topic_game = %topic_game, pushed_game = %pushed.game_id, "Stats for another game ignored");
            return Ok(());
        }
        let game_id = pushed.game_id.clone();
        stats.replace(pushed);
        let _ = events.send(SyncEvent::StatsChanged { game_id });
        Ok(())
    })
}

/// After every (re)connect of the counts group, asks the server to push
/// fresh stats for the active game.
fn stats_request_callback<T: Transport>(
    counts: Weak<ChannelGroup<T>>,
    active: Arc<ActiveRoom>,
) -> crate::core::connection::ReconnectCallback {
    Arc::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
        let counts = counts.clone();
        let active = Arc::clone(&active);
        Box::pin(async move {
            let Some(group) = counts.upgrade() else {
                return Ok(());
            };
            let Some(game_id) = active.get().and_then(|r| r.scope_id) else {
                return Ok(());
            };
            group
                .publish(&topics::betting_stats_request(&game_id), wire::encode_stats_request(&game_id))
                .await?;
            tracing::debug!(game_id = %game_id, "Requested fresh betting stats");
            Ok(())
        })
    })
}

fn forward_state(group: &'static str, mut state: watch::Receiver<ConnectionState>, events: broadcast::Sender<SyncEvent>) {
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            let _ = events.send(SyncEvent::ConnectionChanged { group, state: current });
        }
    });
}
