//! Streaming channel facade
//!
//! The Stream channel carries subscriptions and server pushes. Outbound
//! frames get no reply, so a call is complete once it is transmitted, and
//! every frame embeds the `streamSessionId` obtained from the Socket login.

use crate::connection::Connection;
use crate::events::PoolEvent;
use crate::listeners::ListenerHandle;
use crate::pool::{CommandRequest, ConnectionPool, PoolConfig, SubscriptionAck};
use crate::transport::{Transport, WsTransport};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use xapi_types::{ChannelKind, ConnectionId, XapiError, XapiResult};

/// Confirmation that a stream frame was transmitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAck {
    /// Connection the frame went out on
    pub connection_id: ConnectionId,
    /// Transmit time
    pub sent_at: Instant,
}

/// Subscription channel over a pool of connections
#[derive(Debug, Clone)]
pub struct StreamChannel {
    pool: Arc<ConnectionPool>,
}

impl StreamChannel {
    /// Create a channel on an arbitrary transport
    pub fn new(transport: Arc<dyn Transport>, config: PoolConfig) -> Self {
        Self::from_pool(ConnectionPool::new(ChannelKind::Stream, transport, config))
    }

    /// Create a channel talking to `url`
    pub fn with_url(url: impl Into<String>, config: PoolConfig) -> Self {
        Self::new(Arc::new(WsTransport::new(url)), config)
    }

    /// Wrap an existing Stream pool
    pub fn from_pool(pool: Arc<ConnectionPool>) -> Self {
        debug_assert_eq!(pool.kind(), ChannelKind::Stream);
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

    /// Bind a connection to a login session
    pub fn attach_session(&self, id: &ConnectionId, session: impl Into<String>) -> XapiResult<()> {
        let connection = self
            .pool
            .connection(id)
            .ok_or(XapiError::ConnectionUnavailable)?;
        connection.set_session(Some(session.into()));
        info!(connection_id = %id, "Stream session attached");
        Ok(())
    }

    /// Subscribe to `command` (e.g. `Candles`), reusing an existing
    /// subscription when one matches
    pub async fn subscribe(
        &self,
        command: &str,
        params: Value,
        target: Option<&ConnectionId>,
    ) -> XapiResult<SubscriptionAck> {
        self.pool.subscribe(command, params, target).await
    }

    /// Stop `command` for `params` everywhere it is subscribed
    pub async fn unsubscribe(&self, command: &str, params: Value) -> XapiResult<usize> {
        self.pool.unsubscribe(command, params).await
    }

    /// Transmit a raw stream command
    pub async fn send(
        &self,
        command: &str,
        arguments: Option<Value>,
        target: Option<&ConnectionId>,
    ) -> XapiResult<StreamAck> {
        let mut request = CommandRequest::new(command).with_arguments(arguments);
        request.connection_id = target.cloned();
        let pending = self.pool.send_command(request).await?;
        Ok(StreamAck {
            connection_id: pending.connection_id,
            sent_at: pending.sent_at,
        })
    }

    /// Observe pushes for `command` (e.g. `candle`, `tickPrices`)
    pub fn on_message<F>(&self, command: &str, callback: F) -> ListenerHandle
    where
        F: Fn(&ConnectionId, &Value) + Send + Sync + 'static,
    {
        self.pool.on_command(command, move |event| {
            if let PoolEvent::Stream {
                connection_id,
                data,
                ..
            } = event
            {
                callback(connection_id, data);
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use parking_lot::Mutex;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_pushes_reach_listeners() {
        let (transport, mut server) = MockTransport::new("wss://mock.test");
        let channel = StreamChannel::new(Arc::new(transport), PoolConfig::default());
        let candles = Arc::new(Mutex::new(Vec::new()));
        let sink = candles.clone();
        channel.on_message("candle", move |_, data| sink.lock().push(data.clone()));

        channel.connect(Duration::from_secs(5)).await.unwrap();
        let peer = server.accept().await.unwrap();

        peer.push(json!({"command": "candle", "data": {"symbol": "EURUSD", "close": 1.0842}}).to_string());
        peer.push(json!({"command": "tickPrices", "data": {"symbol": "EURUSD"}}).to_string());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let seen = candles.lock().clone();
        assert_eq!(seen, vec![json!({"symbol": "EURUSD", "close": 1.0842})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_embedded_in_frames() {
        let (transport, mut server) = MockTransport::new("wss://mock.test");
        let channel = StreamChannel::new(Arc::new(transport), PoolConfig::default());
        let id = channel.connect(Duration::from_secs(5)).await.unwrap();
        let mut peer = server.accept().await.unwrap();
        channel.attach_session(&id, "8469308861804289383").unwrap();

        let ack = channel
            .subscribe("Balance", Value::Null, None)
            .await
            .unwrap();
        assert_eq!(ack.connection_id, id);

        let frame: Value = serde_json::from_str(&peer.recv_frame().await.unwrap()).unwrap();
        assert_eq!(frame["command"], "getBalance");
        assert_eq!(frame["streamSessionId"], "8469308861804289383");
        assert!(frame.get("arguments").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_send_acks_on_transmit() {
        let (transport, mut server) = MockTransport::new("wss://mock.test");
        let channel = StreamChannel::new(Arc::new(transport), PoolConfig::default());
        let id = channel.connect(Duration::from_secs(5)).await.unwrap();
        let _peer = server.accept().await.unwrap();

        let ack = channel.send("ping", None, Some(&id)).await.unwrap();
        assert_eq!(ack.connection_id, id);
        assert_eq!(channel.pool().pending_count(), 0);
    }
}
