//! High-level xAPI client
//!
//! A session is one logged-in Socket connection paired with one Stream
//! connection carrying that login's `streamSessionId`. The server ties the
//! two together, so the client treats them as a unit: when one side closes
//! for good the other is closed too, and when the Socket side comes back
//! after a dropped link the client logs in again and opens a fresh Stream
//! connection for it.

use crate::builder::{ClientConfig, XapiClientBuilder};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use xapi_types::{ChannelKind, ConnectionId, Response, XapiError, XapiResult};
use xapi_ws::{
    ConnectionPool, ListenerHandle, PoolConfig, ReconnectConfig, SendOptions, SocketChannel,
    StreamChannel, SubscriptionAck, Transport, WsTransport,
};

/// Socket command that authenticates a connection
pub const LOGIN_COMMAND: &str = "login";

/// One Socket login and its Stream partner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Logged-in Socket connection
    pub socket_id: ConnectionId,
    /// Paired Stream connection; `None` while the Socket side reconnects
    pub stream_id: Option<ConnectionId>,
    /// Session value returned by the login
    pub stream_session_id: String,
}

/// High-level client for the xAPI
///
/// # Example
///
/// ```no_run
/// use serde_json::json;
/// use xapi_sdk::XapiClient;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = XapiClient::builder()
///         .with_credentials_from_env()?
///         .with_app_name("candles")
///         .connect()
///         .await?;
///
///     client.on_stream("candle", |candle| println!("{}", candle));
///     client.subscribe("Candles", json!({"symbol": "EURUSD"})).await?;
///
///     let version = client.send("getVersion", None).await?;
///     println!("{}", version.return_data);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct XapiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    socket: SocketChannel,
    stream: StreamChannel,
    sessions: DashMap<ConnectionId, Session>,
}

impl XapiClient {
    /// Create a new client builder
    pub fn builder() -> XapiClientBuilder {
        XapiClientBuilder::new()
    }

    /// Create a client without opening any session
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        let socket_transport: Arc<dyn Transport> = match &config.socket_transport {
            Some(transport) => transport.clone(),
            None => Arc::new(WsTransport::new(config.endpoint.socket_url())),
        };
        let stream_transport: Arc<dyn Transport> = match &config.stream_transport {
            Some(transport) => transport.clone(),
            None => Arc::new(WsTransport::new(config.endpoint.stream_url())),
        };

        // A dropped Stream link is never revived; the session is rebuilt
        // from the Socket side instead
        let stream_config = PoolConfig {
            reconnect: ReconnectConfig::disabled(),
            ..config.pool.clone()
        };

        let (socket_pool, stream_pool) = match &config.id_generator {
            Some(ids) => (
                ConnectionPool::with_id_generator(
                    ChannelKind::Socket,
                    socket_transport,
                    config.pool.clone(),
                    ids.clone(),
                ),
                ConnectionPool::with_id_generator(
                    ChannelKind::Stream,
                    stream_transport,
                    stream_config,
                    ids.clone(),
                ),
            ),
            None => (
                ConnectionPool::new(ChannelKind::Socket, socket_transport, config.pool.clone()),
                ConnectionPool::new(ChannelKind::Stream, stream_transport, stream_config),
            ),
        };

        let inner = Arc::new(ClientInner {
            config,
            socket: SocketChannel::from_pool(socket_pool),
            stream: StreamChannel::from_pool(stream_pool),
            sessions: DashMap::new(),
        });
        wire_session_events(&inner);
        Self { inner }
    }

    /// Command channel
    pub fn socket(&self) -> &SocketChannel {
        &self.inner.socket
    }

    /// Streaming channel
    pub fn stream(&self) -> &StreamChannel {
        &self.inner.stream
    }

    /// Open one more Socket/Stream pair and log it in
    #[instrument(skip(self))]
    pub async fn open_session(&self) -> XapiResult<Session> {
        let inner = &self.inner;
        let socket_id = inner.socket.connect(inner.config.connect_timeout).await?;

        match inner.establish(&socket_id).await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!(connection_id = %socket_id, error = %e, "Session setup failed");
                if let Err(close_err) = inner.socket.close(Some(&socket_id)).await {
                    debug!(error = %close_err, "Close after failed login");
                }
                Err(e)
            }
        }
    }

    /// Current sessions
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.socket_id.cmp(&b.socket_id));
        sessions
    }

    /// Check if at least one Socket connection is up
    pub fn is_connected(&self) -> bool {
        self.inner.socket.pool().connection_count() > 0
    }

    /// Send a Socket command and wait for the reply
    pub async fn send(&self, command: &str, arguments: Option<Value>) -> XapiResult<Response> {
        self.inner
            .socket
            .send(command, arguments, SendOptions::new())
            .await
    }

    /// Send a Socket command with explicit options
    pub async fn send_with(
        &self,
        command: &str,
        arguments: Option<Value>,
        options: SendOptions,
    ) -> XapiResult<Response> {
        self.inner.socket.send(command, arguments, options).await
    }

    /// Subscribe to a stream command, e.g. `Candles`
    pub async fn subscribe(&self, command: &str, params: Value) -> XapiResult<SubscriptionAck> {
        self.inner.stream.subscribe(command, params, None).await
    }

    /// Stop a stream command everywhere
    pub async fn unsubscribe(&self, command: &str, params: Value) -> XapiResult<usize> {
        self.inner.stream.unsubscribe(command, params).await
    }

    /// Observe stream pushes, e.g. `candle`
    pub fn on_stream<F>(&self, command: &str, callback: F) -> ListenerHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner
            .stream
            .on_message(command, move |_, data| callback(data))
    }

    /// Observe every reply to a Socket command
    pub fn on_command<F>(&self, command: &str, callback: F) -> ListenerHandle
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.inner
            .socket
            .on_message(command, move |_, response| callback(response))
    }

    /// Close every session
    #[instrument(skip(self))]
    pub async fn close(&self) -> XapiResult<()> {
        self.inner.sessions.clear();
        let socket = self.inner.socket.close(None).await;
        let stream = self.inner.stream.close(None).await;
        info!("Client closed");
        socket.and(stream)
    }
}

impl std::fmt::Debug for XapiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XapiClient")
            .field("endpoint", &self.inner.config.endpoint)
            .field("sessions", &self.sessions())
            .finish()
    }
}

impl ClientInner {
    /// Log in `socket_id` and attach a fresh Stream connection to it
    async fn establish(&self, socket_id: &ConnectionId) -> XapiResult<Session> {
        let arguments = self
            .config
            .credentials
            .login_arguments(self.config.app_name.as_deref());
        let options = SendOptions::new().priority().on_connection(socket_id.clone());
        let response = self.socket.send(LOGIN_COMMAND, Some(arguments), options).await?;

        let stream_session_id = response
            .stream_session_id
            .ok_or_else(|| XapiError::protocol("login reply without streamSessionId", None))?;
        self.socket.mark_logged_in(socket_id, stream_session_id.as_str())?;
        info!(connection_id = %socket_id, user_id = self.config.credentials.user_id(), "Logged in");

        let stream_id = self.stream.connect(self.config.connect_timeout).await?;
        if let Err(e) = self.stream.attach_session(&stream_id, stream_session_id.as_str()) {
            let _ = self.stream.close(Some(&stream_id)).await;
            return Err(e);
        }

        if let Some(connection) = self.socket.pool().connection(socket_id) {
            connection.link_peer(Some(stream_id.clone()));
        }
        if let Some(connection) = self.stream.pool().connection(&stream_id) {
            connection.link_peer(Some(socket_id.clone()));
        }

        let session = Session {
            socket_id: socket_id.clone(),
            stream_id: Some(stream_id),
            stream_session_id,
        };
        self.sessions.insert(socket_id.clone(), session.clone());
        Ok(session)
    }

    /// Log in again after the Socket side reconnected
    async fn restore(&self, socket_id: ConnectionId) {
        match self.establish(&socket_id).await {
            Ok(session) => {
                info!(connection_id = %socket_id, stream_id = ?session.stream_id, "Session restored");
            }
            Err(e) => {
                warn!(connection_id = %socket_id, error = %e, "Session restore failed");
                self.sessions.remove(&socket_id);
                let _ = self.socket.close(Some(&socket_id)).await;
            }
        }
    }
}

/// Install the cascade close and re-login listeners
fn wire_session_events(inner: &Arc<ClientInner>) {
    // Socket left: its Stream partner is useless now
    let weak = Arc::downgrade(inner);
    inner.socket.on_close(move |connection, will_reconnect| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let socket_id = connection.id().clone();
        if will_reconnect {
            if let Some(mut session) = inner.sessions.get_mut(&socket_id) {
                session.stream_id = None;
            }
        } else {
            inner.sessions.remove(&socket_id);
        }
        if let Some(stream_id) = connection.linked_peer() {
            close_peer(inner.stream.pool(), stream_id);
        }
    });

    // Stream left: the login it belonged to is no longer usable
    let weak = Arc::downgrade(inner);
    inner.stream.on_close(move |connection, _| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if let Some(socket_id) = connection.linked_peer() {
            let stale = inner
                .sessions
                .get(&socket_id)
                .is_some_and(|s| s.stream_id.as_ref() == Some(connection.id()));
            if stale {
                close_peer(inner.socket.pool(), socket_id);
            }
        }
    });

    // Socket back after a dropped link: log in again
    let weak = Arc::downgrade(inner);
    inner.socket.on_open(move |connection| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.sessions.contains_key(connection.id()) {
            return;
        }
        let socket_id = connection.id().clone();
        info!(connection_id = %socket_id, "Socket reopened, logging in again");
        tokio::spawn(async move { inner.restore(socket_id).await });
    });
}

/// Close the paired connection if it is still up
fn close_peer(pool: &Arc<ConnectionPool>, peer: ConnectionId) {
    let pool = pool.clone();
    let Some(connection) = pool.connection(&peer) else {
        return;
    };
    if !connection.is_connected() {
        return;
    }
    debug!(connection_id = %peer, kind = %pool.kind(), "Closing paired connection");
    tokio::spawn(async move {
        if let Err(e) = pool.close(Some(&peer)).await {
            warn!(connection_id = %peer, error = %e, "Paired close failed");
        }
    });
}
