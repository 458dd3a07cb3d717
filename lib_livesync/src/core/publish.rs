//! # Publish Pipeline
//!
//! Fire-and-forget outbound chat. The caller never sees a send failure:
//! whenever delivery cannot be confirmed the sender gets a local-only copy
//! of their message in the room instead.

use std::sync::Arc;

use chrono::Utc;

use crate::core::connection::ChannelGroup;
use crate::core::store::RoomMessageStore;
use crate::core::transport::Transport;
use crate::core::wire::{self, OutboundIntent};
use crate::error::PublishError;
use crate::model::{CallerIdentity, ConnectionState};

/// What happened to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the transport. The server echo will show it.
    Sent,
    /// Not confirmed; a local-only copy was inserted.
    LocalFallback(PublishError),
}

pub struct PublishPipeline<T: Transport> {
    group: Arc<ChannelGroup<T>>,
    store: Arc<RoomMessageStore>,
}

impl<T: Transport> PublishPipeline<T> {
    pub fn new(group: Arc<ChannelGroup<T>>, store: Arc<RoomMessageStore>) -> Self {
        Self { group, store }
    }

    pub async fn send(&self, intent: &OutboundIntent, caller: &CallerIdentity) -> Delivery {
        let outcome = match wire::encode(intent, caller) {
            Err(e) => Err(PublishError::Transport(format!("payload encoding failed: {}", e))),
            // No transport call at all unless the group is up.
            Ok(_) if self.group.state() != ConnectionState::Connected => Err(PublishError::NotConnected),
            Ok(payload) => self.group.publish(&intent.destination(), payload).await,
        };

        match outcome {
            Ok(()) => Delivery::Sent,
            Err(reason) => {
                tracing::info!(room_id = intent.room_id(), reason = %reason, "Send not confirmed; showing local copy");
                let echo = wire::local_echo(intent, caller, Utc::now());
                self.store.append_local_fallback(intent.room_id(), echo);
                Delivery::LocalFallback(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::ConnectionSettings;
    use crate::core::stomp::Command;
    use crate::core::transport::mock::MockTransport;
    use crate::model::{Partitioning, Side};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn settings() -> ConnectionSettings {
        let mut settings = ConnectionSettings::new("ws://chat.test/chat-socket");
        settings.reconnect_delay = Duration::from_millis(20);
        settings
    }

    #[tokio::test]
    async fn send_while_connecting_falls_back_locally_once() {
        let (transport, mut peers) = MockTransport::new();
        let group = Arc::new(ChannelGroup::new("chat", Arc::clone(&transport), settings()));
        let store = Arc::new(RoomMessageStore::new());
        store.open_room("7", Partitioning::Unpartitioned, 50);
        let pipeline = PublishPipeline::new(Arc::clone(&group), Arc::clone(&store));

        group.connect().await;
        let mut peer = peers.recv().await.unwrap();
        let connect = peer.next_frame().await;
        assert_eq!(connect.command, Command::Connect);
        assert_eq!(group.state(), ConnectionState::Connecting);

        let caller = CallerIdentity::authenticated("u-5", "Lee");
        let intent = OutboundIntent::General {
            room_id: "7".into(),
            category_id: 3,
            body: "anyone here?".into(),
        };
        let delivery = pipeline.send(&intent, &caller).await;
        assert_eq!(delivery, Delivery::LocalFallback(PublishError::NotConnected));

        let room = store.get_ordered("7");
        assert_eq!(room.len(), 1);
        assert!(room[0].local_only);
        assert_eq!(room[0].author_display_name, "Lee");
        assert_eq!(room[0].origin_user_id.as_deref(), Some("u-5"));
        // Nothing after CONNECT reached the wire.
        assert!(peer.sent.try_recv().is_err());
        group.disconnect().await;
    }

    #[tokio::test]
    async fn failed_transport_send_falls_back() {
        let (transport, mut peers) = MockTransport::new();
        let group = Arc::new(ChannelGroup::new("chat", Arc::clone(&transport), settings()));
        let store = Arc::new(RoomMessageStore::new());
        store.open_room("42", Partitioning::BySide, 50);
        let pipeline = PublishPipeline::new(Arc::clone(&group), Arc::clone(&store));

        group.connect().await;
        let mut peer = peers.recv().await.unwrap();
        peer.accept().await;
        let mut state = group.watch_state();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();

        let intent = OutboundIntent::Event {
            room_id: "42".into(),
            game_id: "g-7".into(),
            side: Side::Home,
            body: "let's go".into(),
        };
        assert_eq!(pipeline.send(&intent, &CallerIdentity::anonymous()).await, Delivery::Sent);
        let sent = peer.next_frame().await;
        assert_eq!(sent.get("destination"), Some("/app/chat/game/g-7"));
        assert!(store.get_ordered("42").is_empty());

        transport.fail_sends.store(true, Ordering::SeqCst);
        let delivery = pipeline.send(&intent, &CallerIdentity::anonymous()).await;
        assert!(matches!(delivery, Delivery::LocalFallback(PublishError::Transport(_))));
        let room = store.get_side("42", Side::Home);
        assert_eq!(room.len(), 1);
        assert_eq!(room[0].author_display_name, "anonymous");
        group.disconnect().await;
    }
}
