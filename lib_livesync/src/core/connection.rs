//! # Connection Manager
//!
//! One STOMP connection per channel group (chat, counts). The public
//! [`ChannelGroup`] is a handle; the connection itself lives in a driver task
//! that owns the link and is the only writer of the group's
//! [`ConnectionState`].
//!
//! ```text
//! Disconnected --connect--> Connecting --CONNECTED--> Connected
//!      ^                      ^    |                      |
//!      |                      |    +--ERROR frame--> Error (waits for reconnect)
//!      |                      +--- link lost / silent ----+
//!      +------------------------ disconnect --------------+
//! ```
//!
//! Transport trouble is retried after a fixed delay. A server rejection is
//! not: the group parks in `Error` until the caller reconnects explicitly.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until, timeout};

use crate::configs::SyncConfig;
use crate::core::lock;
use crate::core::registry::{LiveSubscribe, LiveUnsubscribe, SharedRegistry, SubscriptionRegistry, TopicHandler};
use crate::core::stomp::{Command, Frame, Inbound, parse_stream};
use crate::core::topics::TopicClass;
use crate::core::transport::{Link, Transport};
use crate::error::{FrameError, ProtocolError, PublishError, TransportError};
use crate::model::ConnectionState;

/// Zero-argument async action run after every successful (re)connect.
pub type ReconnectCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Timing and addressing of a channel group's connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Pub/sub endpoint, e.g. `ws://host:8080/chat-socket`.
    pub endpoint: String,
    pub heartbeat_outgoing: Duration,
    pub heartbeat_incoming: Duration,
    pub liveness_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_delay: Duration,
    pub auth_token: Option<String>,
}

impl ConnectionSettings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            heartbeat_outgoing: Duration::from_millis(4000),
            heartbeat_incoming: Duration::from_millis(4000),
            liveness_timeout: Duration::from_millis(10_000),
            handshake_timeout: Duration::from_millis(10_000),
            reconnect_delay: Duration::from_millis(5000),
            auth_token: None,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            endpoint: config.socket_url.clone(),
            heartbeat_outgoing: Duration::from_millis(config.heartbeat_outgoing_ms),
            heartbeat_incoming: Duration::from_millis(config.heartbeat_incoming_ms),
            liveness_timeout: Duration::from_millis(config.liveness_timeout_ms),
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            auth_token: config.auth_token.clone(),
        }
    }

    /// The raw WebSocket URL under the endpoint.
    pub fn url(&self) -> String {
        let base = self.endpoint.trim_end_matches('/');
        if base.ends_with("/websocket") {
            base.to_string()
        } else {
            format!("{}/websocket", base)
        }
    }

    fn host(&self) -> String {
        url::Url::parse(&self.endpoint)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Heart-beat intervals agreed in the handshake. `None` means off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Heartbeats {
    outgoing: Option<Duration>,
    incoming: Option<Duration>,
}

impl Heartbeats {
    /// STOMP negotiation: each direction is on only if both ends want it, at
    /// the slower of the two rates.
    fn negotiate(settings: &ConnectionSettings, server: Option<&str>) -> Self {
        let (sx, sy) = server
            .and_then(|h| h.split_once(','))
            .map(|(x, y)| (x.trim().parse::<u64>().unwrap_or(0), y.trim().parse::<u64>().unwrap_or(0)))
            .unwrap_or((0, 0));
        let pick = |ours: Duration, theirs: u64| {
            (!ours.is_zero() && theirs > 0).then(|| ours.max(Duration::from_millis(theirs)))
        };
        Self {
            outgoing: pick(settings.heartbeat_outgoing, sy),
            incoming: pick(settings.heartbeat_incoming, sx),
        }
    }
}

enum DriverCommand {
    Subscribe(LiveSubscribe),
    Unsubscribe(LiveUnsubscribe),
    Publish {
        destination: String,
        body: String,
        done: oneshot::Sender<Result<(), PublishError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

enum SessionEnd {
    Shutdown(Option<oneshot::Sender<()>>),
    Transport(TransportError),
    Protocol(ProtocolError),
}

struct DriverHandle {
    cmd_tx: mpsc::UnboundedSender<DriverCommand>,
    task: JoinHandle<()>,
}

/// Handle to one channel group's connection.
pub struct ChannelGroup<T: Transport> {
    name: &'static str,
    transport: Arc<T>,
    settings: ConnectionSettings,
    registry: SharedRegistry,
    callbacks: Arc<Mutex<Vec<ReconnectCallback>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    last_error: Arc<Mutex<Option<ProtocolError>>>,
    driver: Mutex<Option<DriverHandle>>,
    /// Serializes connect/disconnect so at most one driver exists.
    lifecycle: tokio::sync::Mutex<()>,
}

impl<T: Transport> ChannelGroup<T> {
    pub fn new(name: &'static str, transport: Arc<T>, settings: ConnectionSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            name,
            transport,
            settings,
            registry: SubscriptionRegistry::shared(),
            callbacks: Arc::new(Mutex::new(Vec::new())),
            state: Arc::new(state),
            last_error: Arc::new(Mutex::new(None)),
            driver: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The rejection that put the group into `Error`, if any.
    pub fn last_error(&self) -> Option<ProtocolError> {
        lock(&self.last_error).clone()
    }

    /// Registers an action to run after every successful (re)connect.
    /// Callbacks run in registration order.
    pub fn on_reconnect(&self, callback: ReconnectCallback) {
        lock(&self.callbacks).push(callback);
    }

    /// Starts (or restarts) the connection. Any previous instance is torn
    /// down first.
    pub async fn connect(&self) {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;
        *lock(&self.last_error) = None;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            name: self.name,
            transport: Arc::clone(&self.transport),
            settings: self.settings.clone(),
            registry: Arc::clone(&self.registry),
            callbacks: Arc::clone(&self.callbacks),
            state: Arc::clone(&self.state),
            last_error: Arc::clone(&self.last_error),
            cmd_rx,
        };
        let task = tokio::spawn(driver.run());
        *lock(&self.driver) = Some(DriverHandle { cmd_tx, task });
    }

    /// Explicit reconnect, the only way out of `Error`.
    pub async fn reconnect(&self) {
        tracing::info!(group = self.name, "Reconnect requested");
        self.connect().await;
    }

    /// Closes the connection. Registered topics stay registered and are
    /// replayed by the next `connect`.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;
    }

    async fn teardown(&self) {
        let Some(driver) = lock(&self.driver).take() else {
            return;
        };
        let (done, acked) = oneshot::channel();
        if driver.cmd_tx.send(DriverCommand::Shutdown { done }).is_ok() {
            let _ = acked.await;
        }
        if let Err(e) = driver.task.await {
            tracing::error!(group = self.name, error = %e, "Connection task ended abnormally");
        }
        lock(&self.registry).detach();
        set_state(self.name, &self.state, ConnectionState::Disconnected);
    }

    fn command(&self, cmd: DriverCommand) {
        if let Some(driver) = lock(&self.driver).as_ref() {
            let _ = driver.cmd_tx.send(cmd);
        }
    }

    /// Registers `topic`. Subscribes right away when connected, otherwise on
    /// the next (re)connect.
    pub fn subscribe(&self, topic: impl Into<String>, class: TopicClass, handler: TopicHandler) {
        let live = lock(&self.registry).subscribe(topic, class, handler);
        if let Some(live) = live {
            self.command(DriverCommand::Subscribe(live));
        }
    }

    pub fn unsubscribe(&self, topic: &str) {
        let live = lock(&self.registry).unsubscribe(topic);
        if let Some(live) = live {
            self.command(DriverCommand::Unsubscribe(live));
        }
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        lock(&self.registry).topics()
    }

    /// Sends a JSON body to `destination`. Fails fast when not connected;
    /// nothing touches the transport in that case.
    pub async fn publish(&self, destination: &str, body: String) -> Result<(), PublishError> {
        if self.state() != ConnectionState::Connected {
            return Err(PublishError::NotConnected);
        }
        let (done, result) = oneshot::channel();
        let sent = {
            let driver = lock(&self.driver);
            match driver.as_ref() {
                Some(d) => d
                    .cmd_tx
                    .send(DriverCommand::Publish {
                        destination: destination.to_string(),
                        body,
                        done,
                    })
                    .is_ok(),
                None => false,
            }
        };
        if !sent {
            return Err(PublishError::DriverGone);
        }
        result.await.unwrap_or(Err(PublishError::DriverGone))
    }
}

fn set_state(group: &'static str, state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    let changed = state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
    if changed {
        tracing::info!(group, state = %next, "Connection state changed");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(beat: &mut Option<Interval>) {
    match beat {
        Some(beat) => {
            beat.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn protocol_error(frame: &Frame) -> ProtocolError {
    ProtocolError {
        message: frame.get("message").unwrap_or("ERROR frame").to_string(),
        details: (!frame.body.is_empty()).then(|| frame.body.clone()),
    }
}

/// A server that sends frames we cannot parse is treated like one that
/// rejected us.
fn malformed_frame(e: &FrameError) -> ProtocolError {
    ProtocolError {
        message: "malformed frame".to_string(),
        details: Some(e.to_string()),
    }
}

struct Driver<T: Transport> {
    name: &'static str,
    transport: Arc<T>,
    settings: ConnectionSettings,
    registry: SharedRegistry,
    callbacks: Arc<Mutex<Vec<ReconnectCallback>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    last_error: Arc<Mutex<Option<ProtocolError>>>,
    cmd_rx: mpsc::UnboundedReceiver<DriverCommand>,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);
            let end = self.session().await;
            lock(&self.registry).detach();

            let parked = match end {
                SessionEnd::Shutdown(done) => ControlFlow::Break(done),
                SessionEnd::Transport(e) => {
                    self.set_state(ConnectionState::Connecting);
                    tracing::warn!(
                        group = self.name,
                        error = %e,
                        "Connection lost. Retrying in {}ms...",
                        millis(self.settings.reconnect_delay)
                    );
                    self.idle(Some(Instant::now() + self.settings.reconnect_delay)).await
                }
                SessionEnd::Protocol(e) => {
                    tracing::error!(group = self.name, error = %e, details = ?e.details, "Server rejected the session");
                    *lock(&self.last_error) = Some(e);
                    self.set_state(ConnectionState::Error);
                    self.idle(None).await
                }
            };

            if let ControlFlow::Break(done) = parked {
                self.set_state(ConnectionState::Disconnected);
                if let Some(done) = done {
                    let _ = done.send(());
                }
                return;
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        set_state(self.name, &self.state, next);
    }

    /// Waits out `deadline` (forever if `None`) while no link is up.
    async fn idle(&mut self, deadline: Option<Instant>) -> ControlFlow<Option<oneshot::Sender<()>>> {
        loop {
            tokio::select! {
                _ = sleep_until_opt(deadline) => return ControlFlow::Continue(()),
                cmd = self.cmd_rx.recv() => {
                    if let ControlFlow::Break(done) = Self::answer_offline(cmd) {
                        return ControlFlow::Break(done);
                    }
                }
            }
        }
    }

    /// Answers a command while there is no usable link.
    fn answer_offline(cmd: Option<DriverCommand>) -> ControlFlow<Option<oneshot::Sender<()>>> {
        match cmd {
            None => ControlFlow::Break(None),
            Some(DriverCommand::Shutdown { done }) => ControlFlow::Break(Some(done)),
            Some(DriverCommand::Publish { done, .. }) => {
                let _ = done.send(Err(PublishError::NotConnected));
                ControlFlow::Continue(())
            }
            // Queued in the registry; replayed on connect.
            Some(DriverCommand::Subscribe(_)) | Some(DriverCommand::Unsubscribe(_)) => ControlFlow::Continue(()),
        }
    }

    async fn session(&mut self) -> SessionEnd {
        let url = self.settings.url();
        let handshake = self.settings.handshake_timeout;
        let deadline = Instant::now() + handshake;

        tracing::debug!(group = self.name, url = %url, "Opening connection");
        let mut link = {
            let opening = timeout(handshake, self.transport.open(&url));
            tokio::pin!(opening);
            loop {
                tokio::select! {
                    opened = &mut opening => match opened {
                        Ok(Ok(link)) => break link,
                        Ok(Err(e)) => return SessionEnd::Transport(e),
                        Err(_) => return SessionEnd::Transport(TransportError::HandshakeTimeout(millis(handshake))),
                    },
                    cmd = self.cmd_rx.recv() => {
                        if let ControlFlow::Break(done) = Self::answer_offline(cmd) {
                            return SessionEnd::Shutdown(done);
                        }
                    }
                }
            }
        };

        let connect = Frame::connect(
            &self.settings.host(),
            millis(self.settings.heartbeat_outgoing),
            millis(self.settings.heartbeat_incoming),
            self.settings.auth_token.as_deref(),
        );
        if let Err(e) = link.send(connect.encode()).await {
            return SessionEnd::Transport(e);
        }

        let heartbeats = 'handshake: loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    link.close().await;
                    return SessionEnd::Transport(TransportError::HandshakeTimeout(millis(handshake)));
                }
                cmd = self.cmd_rx.recv() => {
                    if let ControlFlow::Break(done) = Self::answer_offline(cmd) {
                        link.close().await;
                        return SessionEnd::Shutdown(done);
                    }
                }
                incoming = link.recv() => match incoming {
                    None => return SessionEnd::Transport(TransportError::Closed),
                    Some(Err(e)) => return SessionEnd::Transport(e),
                    Some(Ok(text)) => {
                        let mut connected = None;
                        for item in parse_stream(&text) {
                            // Whatever follows CONNECTED in the same message is routed as usual.
                            let outcome = match (connected, item) {
                                (Some(_), item) => self.handle(item),
                                (None, Ok(Inbound::Frame(frame))) if frame.command == Command::Connected => {
                                    connected = Some(Heartbeats::negotiate(&self.settings, frame.get("heart-beat")));
                                    Ok(())
                                }
                                (None, Ok(Inbound::Frame(frame))) if frame.command == Command::Error => {
                                    Err(protocol_error(&frame))
                                }
                                (None, Ok(_)) => Ok(()),
                                (None, Err(e)) => Err(malformed_frame(&e)),
                            };
                            if let Err(rejected) = outcome {
                                link.close().await;
                                return SessionEnd::Protocol(rejected);
                            }
                        }
                        if let Some(heartbeats) = connected {
                            break 'handshake heartbeats;
                        }
                    }
                },
            }
        };

        // Every registered topic goes out before anybody sees `Connected`.
        let replay = lock(&self.registry).resubscribe_all();
        for sub in &replay {
            if let Err(e) = link.send(Frame::subscribe(&sub.id, &sub.topic).encode()).await {
                return SessionEnd::Transport(e);
            }
        }
        tracing::debug!(group = self.name, topics = replay.len(), "Subscriptions replayed");

        self.set_state(ConnectionState::Connected);
        self.spawn_callbacks();

        self.pump(&mut link, heartbeats).await
    }

    async fn pump(&mut self, link: &mut T::Link, heartbeats: Heartbeats) -> SessionEnd {
        let liveness = heartbeats.incoming.map(|beat| beat.max(self.settings.liveness_timeout));
        let mut beat = heartbeats.outgoing.map(|period| {
            let mut beat = interval_at(Instant::now() + period, period);
            beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            beat
        });
        let mut last_rx = Instant::now();

        loop {
            let silent_after = liveness.map(|window| last_rx + window);
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        Self::close_gracefully(link).await;
                        return SessionEnd::Shutdown(None);
                    };
                    match cmd {
                        DriverCommand::Shutdown { done } => {
                            Self::close_gracefully(link).await;
                            return SessionEnd::Shutdown(Some(done));
                        }
                        DriverCommand::Subscribe(sub) => {
                            if !lock(&self.registry).is_current(sub.generation) {
                                tracing::debug!(group = self.name, topic = %sub.topic, "Stale subscribe dropped");
                                continue;
                            }
                            if let Err(e) = link.send(Frame::subscribe(&sub.id, &sub.topic).encode()).await {
                                return SessionEnd::Transport(e);
                            }
                        }
                        DriverCommand::Unsubscribe(unsub) => {
                            if !lock(&self.registry).is_current(unsub.generation) {
                                continue;
                            }
                            if let Err(e) = link.send(Frame::unsubscribe(&unsub.id).encode()).await {
                                return SessionEnd::Transport(e);
                            }
                        }
                        DriverCommand::Publish { destination, body, done } => {
                            match link.send(Frame::send(&destination, body).encode()).await {
                                Ok(()) => {
                                    let _ = done.send(Ok(()));
                                }
                                Err(e) => {
                                    let _ = done.send(Err(PublishError::Transport(e.to_string())));
                                    return SessionEnd::Transport(e);
                                }
                            }
                        }
                    }
                }
                incoming = link.recv() => match incoming {
                    None => return SessionEnd::Transport(TransportError::Closed),
                    Some(Err(e)) => return SessionEnd::Transport(e),
                    Some(Ok(text)) => {
                        last_rx = Instant::now();
                        if let Err(rejected) = self.dispatch(&text) {
                            link.close().await;
                            return SessionEnd::Protocol(rejected);
                        }
                    }
                },
                _ = sleep_until_opt(silent_after) => {
                    let window = liveness.map(millis).unwrap_or_default();
                    tracing::warn!(group = self.name, "Watchdog triggered: no traffic for {}ms. Reconnecting...", window);
                    link.close().await;
                    return SessionEnd::Transport(TransportError::Silent(window));
                }
                _ = tick_opt(&mut beat) => {
                    if let Err(e) = link.send("\n".to_string()).await {
                        return SessionEnd::Transport(e);
                    }
                }
            }
        }
    }

    async fn close_gracefully(link: &mut T::Link) {
        let _ = link.send(Frame::disconnect().encode()).await;
        link.close().await;
    }

    /// Routes one transport message. Frames are handled in arrival order.
    fn dispatch(&self, text: &str) -> Result<(), ProtocolError> {
        parse_stream(text).into_iter().try_for_each(|item| self.handle(item))
    }

    fn handle(&self, item: Result<Inbound, FrameError>) -> Result<(), ProtocolError> {
        match item {
            Ok(Inbound::Heartbeat) => {}
            Ok(Inbound::Frame(frame)) => match frame.command {
                Command::Message => self.deliver(&frame),
                Command::Error => return Err(protocol_error(&frame)),
                Command::Receipt | Command::Connected => {}
                other => tracing::debug!(group = self.name, command = %other, "Unexpected frame ignored"),
            },
            Err(e) => {
                tracing::warn!(group = self.name, error = %e, "Unparseable frame from server");
                return Err(malformed_frame(&e));
            }
        }
        Ok(())
    }

    fn deliver(&self, frame: &Frame) {
        let routed = lock(&self.registry).route(frame.get("subscription"), frame.get("destination"));
        let Some((topic, class, handler)) = routed else {
            tracing::debug!(group = self.name, destination = ?frame.get("destination"), "Message for unknown subscription dropped");
            return;
        };
        if let Err(e) = handler(&frame.body) {
            tracing::warn!(group = self.name, topic = %topic, class = ?class, error = %e, "Dropping undecodable frame");
        }
    }

    fn spawn_callbacks(&self) {
        let callbacks: Vec<ReconnectCallback> = lock(&self.callbacks).clone();
        if callbacks.is_empty() {
            return;
        }
        let group = self.name;
        tokio::spawn(async move {
            for (index, callback) in callbacks.iter().enumerate() {
                if let Err(e) = callback().await {
                    tracing::error!(group, index, error = %e, "Reconnect callback failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::mock::{MockPeer, MockTransport};
    use crate::error::DecodeError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_settings() -> ConnectionSettings {
        let mut settings = ConnectionSettings::new("ws://chat.test:8080/chat-socket");
        settings.reconnect_delay = Duration::from_millis(20);
        settings.handshake_timeout = Duration::from_secs(2);
        settings
    }

    async fn wait_for(group: &ChannelGroup<MockTransport>, wanted: ConnectionState) {
        let mut rx = group.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached")
            .expect("state channel closed");
    }

    async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MockPeer>) -> MockPeer {
        tokio::time::timeout(Duration::from_secs(5), peers.recv())
            .await
            .expect("no connection attempt")
            .expect("transport gone")
    }

    fn counting(hits: &Arc<AtomicUsize>) -> TopicHandler {
        let hits = Arc::clone(hits);
        Arc::new(move |body: &str| {
            serde_json::from_str::<serde_json::Value>(body)?;
            hits.fetch_add(1, Ordering::SeqCst);
            Ok::<(), DecodeError>(())
        })
    }

    #[test]
    fn heartbeat_negotiation() {
        let settings = ConnectionSettings::new("ws://h");
        let hb = Heartbeats::negotiate(&settings, Some("10000,0"));
        assert_eq!(hb.incoming, Some(Duration::from_millis(10_000)));
        assert_eq!(hb.outgoing, None);
        assert_eq!(Heartbeats::negotiate(&settings, None).incoming, None);
        assert_eq!(settings.url(), "ws://h/websocket");
        assert_eq!(settings.host(), "h");
    }

    #[tokio::test]
    async fn queued_topics_are_subscribed_before_connected() {
        let (transport, mut peers) = MockTransport::new();
        let group = ChannelGroup::new("chat", Arc::clone(&transport), fast_settings());
        let hits = Arc::new(AtomicUsize::new(0));
        group.subscribe("/topic/chat/room/1", TopicClass::Messages, counting(&hits));

        group.connect().await;
        let mut peer = next_peer(&mut peers).await;
        peer.accept().await;

        let sub = peer.next_frame().await;
        assert_eq!(sub.command, Command::Subscribe);
        assert_eq!(sub.get("destination"), Some("/topic/chat/room/1"));
        wait_for(&group, ConnectionState::Connected).await;

        peer.message(sub.get("id").unwrap(), "/topic/chat/room/1", r#"{"content":"hi"}"#);
        peer.message(sub.get("id").unwrap(), "/topic/chat/room/1", "not json");
        peer.message(sub.get("id").unwrap(), "/topic/chat/room/1", r#"{"content":"again"}"#);
        tokio::time::timeout(Duration::from_secs(5), async {
            while hits.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("messages not delivered");
        assert_eq!(group.state(), ConnectionState::Connected);

        group.disconnect().await;
        assert_eq!(group.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn publish_while_connecting_never_reaches_the_wire() {
        let (transport, mut peers) = MockTransport::new();
        let group = ChannelGroup::new("chat", Arc::clone(&transport), fast_settings());
        group.connect().await;
        let mut peer = next_peer(&mut peers).await;

        assert_eq!(group.publish("/app/chat/room/7", "{}".into()).await, Err(PublishError::NotConnected));

        peer.accept().await;
        wait_for(&group, ConnectionState::Connected).await;
        group.publish("/app/chat/room/7", r#"{"content":"x"}"#.into()).await.unwrap();
        let send = peer.next_frame().await;
        assert_eq!(send.command, Command::Send);
        assert_eq!(send.get("destination"), Some("/app/chat/room/7"));
        group.disconnect().await;
    }

    #[tokio::test]
    async fn lost_link_reconnects_and_replays_only_registered_topics() {
        let (transport, mut peers) = MockTransport::new();
        let group = ChannelGroup::new("counts", Arc::clone(&transport), fast_settings());
        let hits = Arc::new(AtomicUsize::new(0));
        group.subscribe("/topic/a", TopicClass::Messages, counting(&hits));
        group.subscribe("/topic/b", TopicClass::CountDeltas, counting(&hits));
        group.connect().await;

        let mut peer = next_peer(&mut peers).await;
        peer.accept().await;
        let first_a = peer.next_frame().await;
        peer.next_frame().await;
        wait_for(&group, ConnectionState::Connected).await;

        group.unsubscribe("/topic/b");
        let unsub = peer.next_frame().await;
        assert_eq!(unsub.command, Command::Unsubscribe);

        drop(peer);
        wait_for(&group, ConnectionState::Connecting).await;

        let mut peer = next_peer(&mut peers).await;
        peer.accept().await;
        let replayed = peer.next_frame().await;
        assert_eq!(replayed.get("destination"), Some("/topic/a"));
        assert_ne!(replayed.get("id"), first_a.get("id"));
        wait_for(&group, ConnectionState::Connected).await;
        assert_eq!(group.subscribed_topics(), vec!["/topic/a".to_string()]);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
        group.disconnect().await;
    }

    #[tokio::test]
    async fn error_frame_parks_until_explicit_reconnect() {
        let (transport, mut peers) = MockTransport::new();
        let group = ChannelGroup::new("chat", Arc::clone(&transport), fast_settings());
        group.connect().await;

        let mut peer = next_peer(&mut peers).await;
        peer.next_frame().await;
        peer.send(Frame::new(Command::Error).header("message", "bad credentials"));
        wait_for(&group, ConnectionState::Error).await;
        assert_eq!(group.last_error().unwrap().message, "bad credentials");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        assert_eq!(group.state(), ConnectionState::Error);

        group.reconnect().await;
        let mut peer = next_peer(&mut peers).await;
        peer.accept().await;
        wait_for(&group, ConnectionState::Connected).await;
        assert!(group.last_error().is_none());
        group.disconnect().await;
    }

    #[tokio::test]
    async fn malformed_server_frame_parks_the_group() {
        let (transport, mut peers) = MockTransport::new();
        let group = ChannelGroup::new("chat", Arc::clone(&transport), fast_settings());
        group.connect().await;

        let mut peer = next_peer(&mut peers).await;
        peer.accept().await;
        wait_for(&group, ConnectionState::Connected).await;
        let _ = peer.push.send(Ok("BOGUS\nfoo:bar\n\n\0".to_string()));
        wait_for(&group, ConnectionState::Error).await;

        let rejected = group.last_error().unwrap();
        assert_eq!(rejected.message, "malformed frame");
        assert!(rejected.details.unwrap().contains("BOGUS"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_in_the_same_message_as_connected_is_not_lost() {
        let (transport, mut peers) = MockTransport::new();
        let group = ChannelGroup::new("chat", Arc::clone(&transport), fast_settings());
        group.connect().await;

        let mut peer = next_peer(&mut peers).await;
        peer.next_frame().await;
        let connected = Frame::new(Command::Connected).header("version", "1.2").header("heart-beat", "0,0");
        let error = Frame::new(Command::Error).header("message", "session revoked");
        let _ = peer.push.send(Ok(format!("{}{}", connected.encode(), error.encode())));

        wait_for(&group, ConnectionState::Error).await;
        assert_eq!(group.last_error().unwrap().message, "session revoked");
    }

    #[tokio::test]
    async fn silent_server_triggers_reconnect() {
        let (transport, mut peers) = MockTransport::new();
        let mut settings = fast_settings();
        settings.heartbeat_incoming = Duration::from_millis(50);
        settings.liveness_timeout = Duration::from_millis(100);
        let group = ChannelGroup::new("counts", Arc::clone(&transport), settings);
        let hits = Arc::new(AtomicUsize::new(0));
        group.subscribe("/topic/chat/room/1/count", TopicClass::CountDeltas, counting(&hits));
        group.connect().await;

        let mut first = next_peer(&mut peers).await;
        first.next_frame().await;
        first.send(Frame::new(Command::Connected).header("version", "1.2").header("heart-beat", "50,0"));
        assert_eq!(first.next_frame().await.command, Command::Subscribe);
        wait_for(&group, ConnectionState::Connected).await;

        // Nothing more from the server: the watchdog has to give up on it.
        let mut second = next_peer(&mut peers).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
        assert!(group.last_error().is_none());
        second.accept().await;
        let replayed = second.next_frame().await;
        assert_eq!(replayed.get("destination"), Some("/topic/chat/room/1/count"));
        group.disconnect().await;
    }

    #[tokio::test]
    async fn unanswered_connect_times_out_and_retries() {
        let (transport, mut peers) = MockTransport::new();
        let mut settings = fast_settings();
        settings.handshake_timeout = Duration::from_millis(80);
        let group = ChannelGroup::new("chat", Arc::clone(&transport), settings);
        group.connect().await;

        let mut mute = next_peer(&mut peers).await;
        assert_eq!(mute.next_frame().await.command, Command::Connect);
        let mut second = next_peer(&mut peers).await;
        assert_eq!(group.state(), ConnectionState::Connecting);
        assert!(group.last_error().is_none());

        second.accept().await;
        wait_for(&group, ConnectionState::Connected).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
        group.disconnect().await;
    }

    #[tokio::test]
    async fn refused_open_is_retried() {
        let (transport, mut peers) = MockTransport::new();
        transport.refuse_opens.store(2, Ordering::SeqCst);
        let group = ChannelGroup::new("chat", Arc::clone(&transport), fast_settings());
        group.connect().await;

        let mut peer = next_peer(&mut peers).await;
        peer.accept().await;
        wait_for(&group, ConnectionState::Connected).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);
        group.disconnect().await;
    }

    #[tokio::test]
    async fn callbacks_run_in_order_after_connect_even_if_one_fails() {
        let (transport, mut peers) = MockTransport::new();
        let group = ChannelGroup::new("counts", Arc::clone(&transport), fast_settings());
        let order = Arc::new(Mutex::new(Vec::new()));

        for (tag, fail) in [("first", true), ("second", false)] {
            let order = Arc::clone(&order);
            group.on_reconnect(Arc::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
                let order = Arc::clone(&order);
                Box::pin(async move {
                    order.lock().unwrap().push(tag);
                    if fail {
                        anyhow::bail!("boom");
                    }
                    Ok(())
                })
            }));
        }

        group.connect().await;
        let mut peer = next_peer(&mut peers).await;
        peer.accept().await;
        wait_for(&group, ConnectionState::Connected).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while order.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("callbacks did not run");
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        group.disconnect().await;
    }

    #[tokio::test]
    async fn second_connect_replaces_the_first_instance() {
        let (transport, mut peers) = MockTransport::new();
        let group = ChannelGroup::new("chat", Arc::clone(&transport), fast_settings());
        group.connect().await;
        let mut first = next_peer(&mut peers).await;
        first.accept().await;
        wait_for(&group, ConnectionState::Connected).await;

        group.connect().await;
        let disconnect = first.next_frame().await;
        assert_eq!(disconnect.command, Command::Disconnect);

        let mut second = next_peer(&mut peers).await;
        second.accept().await;
        wait_for(&group, ConnectionState::Connected).await;
        group.disconnect().await;
        group.disconnect().await;
        assert_eq!(group.state(), ConnectionState::Disconnected);
    }
}
