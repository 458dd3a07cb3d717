//! # Transport
//!
//! The connection manager only needs a duplex stream of text messages. This
//! module defines that seam and the WebSocket implementation behind it.

use std::future::Future;

use crate::error::TransportError;

/// Opens links to the pub/sub endpoint.
pub trait Transport: Send + Sync + 'static {
    type Link: Link;

    fn open(&self, url: &str) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;
}

/// One open connection carrying text messages.
pub trait Link: Send + 'static {
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next text message. `None` once the peer has closed. Must be cancel
    /// safe: a message is never lost if the future is dropped early.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String, TransportError>>> + Send;

    /// Best-effort close.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[cfg(feature = "ws")]
pub use ws::{WsLink, WsTransport};

#[cfg(feature = "ws")]
mod ws {
    use futures_util::sink::SinkExt;
    use futures_util::stream::StreamExt;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    use super::{Link, Transport};
    use crate::error::TransportError;

    /// WebSocket transport via `tokio-tungstenite`.
    #[derive(Debug, Default, Clone)]
    pub struct WsTransport;

    pub struct WsLink {
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    impl Transport for WsTransport {
        type Link = WsLink;

        async fn open(&self, url: &str) -> Result<WsLink, TransportError> {
            let (stream, _) = connect_async(url).await.map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            Ok(WsLink { stream })
        }
    }

    impl Link for WsLink {
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            self.stream
                .send(WsMessage::Text(text.into()))
                .await
                .map_err(|e| TransportError::Send(e.to_string()))
        }

        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            loop {
                match self.stream.next().await? {
                    Ok(WsMessage::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                    Ok(WsMessage::Binary(bytes)) => {
                        return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()));
                    }
                    Ok(WsMessage::Close(_)) => return None,
                    // Pings are answered by tungstenite itself.
                    Ok(_) => continue,
                    Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
                }
            }
        }

        async fn close(&mut self) {
            if let Err(e) = self.stream.close(None).await {
                tracing::debug!(error = %e, "WebSocket close failed");
            }
        }
    }
}

/// In-memory transport. The test plays the server through [`MockPeer`].
#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::{Link, Transport};
    use crate::core::stomp::{Command, Frame, Inbound, parse_stream};
    use crate::error::TransportError;

    pub(crate) struct MockTransport {
        peers: mpsc::UnboundedSender<MockPeer>,
        pub(crate) refuse_opens: AtomicUsize,
        pub(crate) fail_sends: Arc<AtomicBool>,
        pub(crate) opens: AtomicUsize,
    }

    pub(crate) struct MockLink {
        to_peer: mpsc::UnboundedSender<String>,
        from_peer: mpsc::UnboundedReceiver<Result<String, TransportError>>,
        fail_sends: Arc<AtomicBool>,
    }

    /// The server end of one mock connection.
    pub(crate) struct MockPeer {
        pub(crate) sent: mpsc::UnboundedReceiver<String>,
        pub(crate) push: mpsc::UnboundedSender<Result<String, TransportError>>,
    }

    impl MockTransport {
        pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
            let (peers, rx) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                peers,
                refuse_opens: AtomicUsize::new(0),
                fail_sends: Arc::new(AtomicBool::new(false)),
                opens: AtomicUsize::new(0),
            });
            (transport, rx)
        }
    }

    impl Transport for MockTransport {
        type Link = MockLink;

        async fn open(&self, url: &str) -> Result<MockLink, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .refuse_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(TransportError::Connect {
                    url: url.to_string(),
                    reason: "refused".into(),
                });
            }
            let (to_peer, sent) = mpsc::unbounded_channel();
            let (push, from_peer) = mpsc::unbounded_channel();
            let _ = self.peers.send(MockPeer { sent, push });
            Ok(MockLink {
                to_peer,
                from_peer,
                fail_sends: Arc::clone(&self.fail_sends),
            })
        }
    }

    impl Link for MockLink {
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::Send("mock send failure".into()));
            }
            self.to_peer.send(text).map_err(|_| TransportError::Closed)
        }

        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            self.from_peer.recv().await
        }

        async fn close(&mut self) {}
    }

    impl MockPeer {
        /// Next frame the client sent, skipping heart-beats.
        pub(crate) async fn next_frame(&mut self) -> Frame {
            loop {
                let text = tokio::time::timeout(Duration::from_secs(5), self.sent.recv())
                    .await
                    .expect("client sent nothing")
                    .expect("client link dropped");
                for item in parse_stream(&text) {
                    if let Ok(Inbound::Frame(frame)) = item {
                        return frame;
                    }
                }
            }
        }

        /// Waits for CONNECT and answers CONNECTED.
        pub(crate) async fn accept(&mut self) {
            let connect = self.next_frame().await;
            assert_eq!(connect.command, Command::Connect);
            self.send(Frame::new(Command::Connected).header("version", "1.2").header("heart-beat", "0,0"));
        }

        pub(crate) fn send(&self, frame: Frame) {
            let _ = self.push.send(Ok(frame.encode()));
        }

        pub(crate) fn message(&self, subscription: &str, destination: &str, body: &str) {
            self.send(
                Frame::new(Command::Message)
                    .header("subscription", subscription)
                    .header("destination", destination)
                    .header("message-id", "m")
                    .with_body(body),
            );
        }
    }
}
