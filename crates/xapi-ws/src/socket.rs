//! Command channel facade
//!
//! [`SocketChannel`] is the request/response side of the API: every call is
//! answered by exactly one frame carrying the same `customTag`.

use crate::connection::Connection;
use crate::events::PoolEvent;
use crate::listeners::ListenerHandle;
use crate::pool::{CommandRequest, ConnectionPool, PoolConfig};
use crate::transport::{Transport, WsTransport};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};
use xapi_types::{ChannelKind, ConnectionId, Response, TransactionId, XapiError, XapiResult};

/// Per-call options for [`SocketChannel::send`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Jump ahead of queued non-priority calls
    pub priority: bool,
    /// Send on this connection instead of the least loaded one
    pub connection_id: Option<ConnectionId>,
    /// Use this transaction id instead of a generated one
    pub transaction_id: Option<TransactionId>,
    /// Reply deadline; the pool default when `None`
    pub timeout: Option<Duration>,
}

impl SendOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the call as priority
    pub fn priority(mut self) -> Self {
        self.priority = true;
        self
    }

    /// Target a connection
    pub fn on_connection(mut self, id: ConnectionId) -> Self {
        self.connection_id = Some(id);
        self
    }

    /// Supply the transaction id
    pub fn with_transaction_id(mut self, id: impl Into<TransactionId>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    /// Override the reply deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Request/response channel over a pool of connections
#[derive(Debug, Clone)]
pub struct SocketChannel {
    pool: Arc<ConnectionPool>,
}

impl SocketChannel {
    /// Create a channel on an arbitrary transport
    pub fn new(transport: Arc<dyn Transport>, config: PoolConfig) -> Self {
        Self::from_pool(ConnectionPool::new(ChannelKind::Socket, transport, config))
    }

    /// Create a channel talking to `url`
    pub fn with_url(url: impl Into<String>, config: PoolConfig) -> Self {
        Self::new(Arc::new(WsTransport::new(url)), config)
    }

    /// Wrap an existing Socket pool
    pub fn from_pool(pool: Arc<ConnectionPool>) -> Self {
        debug_assert_eq!(pool.kind(), ChannelKind::Socket);
        Self { pool }
    }

    /// The underlying pool
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Open one more connection
    pub async fn connect(&self, timeout: Duration) -> XapiResult<ConnectionId> {
        self.pool.connect(timeout).await
    }

    /// Close one connection, or all when `id` is `None`
    pub async fn close(&self, id: Option<&ConnectionId>) -> XapiResult<()> {
        self.pool.close(id).await
    }

    /// Send a command and wait for its reply
    #[instrument(skip(self, arguments, options), fields(priority = options.priority))]
    pub async fn send(
        &self,
        command: &str,
        arguments: Option<Value>,
        options: SendOptions,
    ) -> XapiResult<Response> {
        let timeout = options
            .timeout
            .unwrap_or(self.pool.config().request_timeout);
        let mut request = CommandRequest::new(command)
            .with_arguments(arguments)
            .with_priority(options.priority);
        request.transaction_id = options.transaction_id;
        request.connection_id = options.connection_id;

        self.pool.request(request, timeout).await
    }

    /// Mark a connection as logged in, which starts its keepalive
    pub fn mark_logged_in(&self, id: &ConnectionId, session: impl Into<String>) -> XapiResult<()> {
        let connection = self
            .pool
            .connection(id)
            .ok_or(XapiError::ConnectionUnavailable)?;
        connection.set_session(Some(session.into()));
        info!(connection_id = %id, "Socket session established");
        Ok(())
    }

    /// Observe every reply to `command`, including calls made by others
    pub fn on_message<F>(&self, command: &str, callback: F) -> ListenerHandle
    where
        F: Fn(&ConnectionId, &Response) + Send + Sync + 'static,
    {
        self.pool.on_command(command, move |event| {
            if let PoolEvent::Command {
                connection_id,
                response,
                ..
            } = event
            {
                callback(connection_id, response);
            }
        })
    }

    /// Observe connections opening
    pub fn on_open<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.pool.on_open(callback)
    }

    /// Observe connections closing
    pub fn on_close<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&Arc<Connection>, bool) + Send + Sync + 'static,
    {
        self.pool.on_close(callback)
    }

    /// Observe undecodable frames
    pub fn on_protocol_error<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.pool.on_protocol_error(callback)
    }
}
