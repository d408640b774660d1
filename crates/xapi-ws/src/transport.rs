//! Physical link layer
//!
//! A [`Transport`] opens one physical link and hands back its write half as a
//! [`FrameSink`] and its read half as a [`FrameStream`] of text frames. The
//! socket wrapper calls `connect` again for every reconnection, so a single
//! transport value serves the whole life of a connection.
//!
//! [`MockTransport`] replaces the network in tests: each successful connect
//! produces a [`MockPeer`] that plays the server side of the link.
//!
//! # Example
//!
//! ```no_run
//! use futures_util::{SinkExt, StreamExt};
//! use xapi_ws::transport::{Transport, TransportError, WsTransport};
//!
//! async fn example() -> Result<(), TransportError> {
//!     let transport = WsTransport::new("wss://ws.xtb.com/demo");
//!     let (mut sink, mut stream) = transport.connect().await?;
//!     sink.send(r#"{"command":"getVersion","customTag":"getVersion_1"}"#.to_string()).await?;
//!     if let Some(reply) = stream.next().await {
//!         println!("Received: {}", reply?);
//!     }
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, instrument};
use xapi_types::XapiError;

/// Failures of the physical link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Handshake or TCP failure
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer went away
    #[error("connection closed")]
    ConnectionClosed,

    /// Write to the link failed
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Read from the link failed
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Handshake did not finish in time
    #[error("connection timeout after {0:?}")]
    Timeout(Duration),

    /// WebSocket-level protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<TransportError> for XapiError {
    fn from(err: TransportError) -> Self {
        XapiError::Transport(err.to_string())
    }
}

/// Write half of an open link
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Read half of an open link; ends when the peer closes
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Opens physical links to one endpoint
///
/// Implementations must be reusable: `connect` may be called any number of
/// times, each call opening a fresh link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new link
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError>;

    /// URL this transport dials
    fn endpoint(&self) -> &str;
}

/// tokio-tungstenite backed transport
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    connect_timeout: Duration,
}

impl WsTransport {
    /// Transport for `url` with a 10 s handshake timeout
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set the handshake timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for WsTransport {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        debug!("Connecting to WebSocket");

        let (ws_stream, _response) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        debug!("WebSocket connected");
        let (write, read) = ws_stream.split();

        let sink: FrameSink = Box::pin(
            write
                .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
                .with(|text: String| futures::future::ready(Ok::<_, TransportError>(Message::Text(text)))),
        );

        let stream: FrameStream = Box::pin(read.filter_map(|message| {
            futures::future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => {
                    Some(String::from_utf8(data).map_err(|e| TransportError::Protocol(e.to_string())))
                }
                // Control frames are handled by tungstenite; a close frame is
                // followed by the end of the stream
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::ReceiveFailed(e.to_string()))),
            })
        }));

        Ok((sink, stream))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockPeer, MockServer, MockTransport};

#[cfg(any(test, feature = "test-utils"))]
mod mock {
    use super::*;
    use futures::channel::mpsc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-memory transport for tests
    ///
    /// Every successful `connect` yields a [`MockPeer`] from the paired
    /// [`MockServer`].
    #[derive(Debug, Clone)]
    pub struct MockTransport {
        url: String,
        peers: mpsc::UnboundedSender<MockPeer>,
        fail_connect: Arc<AtomicBool>,
        connects: Arc<AtomicUsize>,
    }

    /// Accepts the links opened through a [`MockTransport`]
    #[derive(Debug)]
    pub struct MockServer {
        peers: mpsc::UnboundedReceiver<MockPeer>,
    }

    /// Server side of one mock link
    #[derive(Debug)]
    pub struct MockPeer {
        frames: mpsc::UnboundedReceiver<String>,
        inbound: mpsc::UnboundedSender<Result<String, TransportError>>,
    }

    impl MockTransport {
        /// Create a transport and the server that receives its links
        pub fn new(url: impl Into<String>) -> (Self, MockServer) {
            let (tx, rx) = mpsc::unbounded();
            let transport = Self {
                url: url.into(),
                peers: tx,
                fail_connect: Arc::new(AtomicBool::new(false)),
                connects: Arc::new(AtomicUsize::new(0)),
            };
            (transport, MockServer { peers: rx })
        }

        /// Make subsequent connects fail (or succeed again)
        pub fn set_fail_connect(&self, fail: bool) {
            self.fail_connect.store(fail, Ordering::SeqCst);
        }

        /// Number of connect attempts so far
        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionFailed("mock connection failure".into()));
            }

            let (client_tx, server_rx) = mpsc::unbounded::<String>();
            let (server_tx, client_rx) = mpsc::unbounded::<Result<String, TransportError>>();

            self.peers
                .unbounded_send(MockPeer {
                    frames: server_rx,
                    inbound: server_tx,
                })
                .map_err(|_| TransportError::ConnectionFailed("mock server dropped".into()))?;

            let sink: FrameSink = Box::pin(client_tx.sink_map_err(|_| TransportError::ConnectionClosed));
            let stream: FrameStream = Box::pin(client_rx);
            Ok((sink, stream))
        }

        fn endpoint(&self) -> &str {
            &self.url
        }
    }

    impl MockServer {
        /// Wait for the next link
        pub async fn accept(&mut self) -> Option<MockPeer> {
            self.peers.next().await
        }

        /// Take a link if one is already open
        pub fn try_accept(&mut self) -> Option<MockPeer> {
            self.peers.try_next().ok().flatten()
        }
    }

    impl MockPeer {
        /// Wait for the next frame the client wrote; `None` once the client
        /// side is gone
        pub async fn recv_frame(&mut self) -> Option<String> {
            self.frames.next().await
        }

        /// Take a frame if one was already written
        pub fn try_recv_frame(&mut self) -> Option<String> {
            self.frames.try_next().ok().flatten()
        }

        /// Deliver a text frame to the client
        pub fn push(&self, text: impl Into<String>) -> bool {
            self.inbound.unbounded_send(Ok(text.into())).is_ok()
        }

        /// Deliver a receive error to the client
        pub fn push_error(&self, error: TransportError) -> bool {
            self.inbound.unbounded_send(Err(error)).is_ok()
        }

        /// End the client's read stream, as a server-side close would
        pub fn close(&self) {
            self.inbound.close_channel();
        }
    }
}
