//! Connection pool and correlation dispatch
//!
//! A [`ConnectionPool`] owns every connection of one channel kind. It opens
//! connections, routes each outbound call to the least loaded one, keeps the
//! table of pending transactions, and matches inbound frames to them by the
//! `customTag` echoed in every reply.
//!
//! All inbound traffic of a pool is handled by one dispatcher task, so frames
//! from one connection are processed in arrival order and every change to the
//! pending table driven by the network happens on that task.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use xapi_types::ChannelKind;
//! use xapi_ws::pool::{CommandRequest, ConnectionPool, PoolConfig};
//! use xapi_ws::transport::WsTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(WsTransport::new("wss://ws.xtb.com/demo"));
//!     let pool = ConnectionPool::new(ChannelKind::Socket, transport, PoolConfig::default());
//!
//!     pool.connect(Duration::from_secs(10)).await?;
//!     let response = pool
//!         .request(CommandRequest::new("getVersion"), Duration::from_secs(5))
//!         .await?;
//!     println!("{}", response.return_data);
//!     Ok(())
//! }
//! ```

use crate::connection::{Connection, ConnectionConfig, ConnectionSignal, DEFAULT_CLOSE_TIMEOUT};
use crate::events::PoolEvent;
use crate::ids::{IdGenerator, TimestampIdGenerator};
use crate::listeners::{command_key, ListenerHandle, Listeners, CLOSE_EVENT, OPEN_EVENT, PROTOCOL_ERROR_EVENT};
use crate::reconnect::ReconnectConfig;
use crate::subscription::{RegistryMatch, SubscriptionRegistry};
use crate::transaction::{Transaction, TransactionHandle};
use crate::transport::Transport;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};
use xapi_types::{
    canonical_params, ChannelKind, ConnectionId, CustomTag, InboundFrame, RequestFrame, Response,
    TransactionId, TransportLimits, XapiError, XapiResult,
};

/// Command sent by the keepalive
pub const PING_COMMAND: &str = "ping";

/// Default deadline for a reply on the Socket channel
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool-wide settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server-imposed limits applied to every connection
    pub limits: TransportLimits,
    /// Socket reconnection policy
    pub reconnect: ReconnectConfig,
    /// Deadline for a graceful close
    pub close_timeout: Duration,
    /// Deadline for a reply after transmission
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            limits: TransportLimits::default(),
            reconnect: ReconnectConfig::default(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transport limits
    pub fn with_limits(mut self, limits: TransportLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the reconnection policy
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the close deadline
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the default reply deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new()
            .with_limits(self.limits)
            .with_reconnect(self.reconnect.clone())
            .with_close_timeout(self.close_timeout)
    }
}

/// One outbound call
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Wire command name
    pub command: String,
    /// Command arguments
    pub arguments: Option<Value>,
    /// Caller-chosen transaction id; generated when absent
    pub transaction_id: Option<TransactionId>,
    /// Jump ahead of non-priority queued sends
    pub priority: bool,
    /// Force a connection instead of load-based routing
    pub connection_id: Option<ConnectionId>,
}

impl CommandRequest {
    /// Request without arguments
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            arguments: None,
            transaction_id: None,
            priority: false,
            connection_id: None,
        }
    }

    /// Set the arguments
    pub fn with_arguments(mut self, arguments: Option<Value>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Use a specific transaction id
    pub fn with_transaction_id(mut self, id: TransactionId) -> Self {
        self.transaction_id = Some(id);
        self
    }

    /// Mark as priority
    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// Send on a specific connection
    pub fn on_connection(mut self, id: ConnectionId) -> Self {
        self.connection_id = Some(id);
        self
    }
}

/// A call that has been handed to the socket
#[derive(Debug)]
pub struct PendingCommand {
    /// Resolves with the reply (immediately on the Stream channel)
    pub handle: TransactionHandle,
    /// Connection the call went out on
    pub connection_id: ConnectionId,
    /// Transmit time
    pub sent_at: Instant,
}

/// Outcome of a stream subscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionAck {
    /// Connection carrying the subscription
    pub connection_id: ConnectionId,
    /// An existing subscription was reused; nothing was sent
    pub reused: bool,
    /// Transmit time of the subscribe frame
    pub sent_at: Option<Instant>,
}

/// Wire name of a stream subscribe, e.g. `Candles` -> `getCandles`
pub fn subscribe_command(command: &str) -> String {
    format!("get{command}")
}

/// Wire name of a stream unsubscribe, e.g. `Candles` -> `stopCandles`
pub fn unsubscribe_command(command: &str) -> String {
    format!("stop{command}")
}

/// All connections of one channel kind
pub struct ConnectionPool {
    kind: ChannelKind,
    transport: Arc<dyn Transport>,
    config: PoolConfig,
    ids: Arc<dyn IdGenerator>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    open: RwLock<Vec<Arc<Connection>>>,
    /// Left CONNECTED, socket still trying to re-open
    reopening: DashMap<ConnectionId, Arc<Connection>>,
    pending: DashMap<TransactionId, Arc<Transaction>>,
    listeners: Listeners<PoolEvent>,
    registry: Mutex<SubscriptionRegistry>,
    signals: mpsc::UnboundedSender<ConnectionSignal>,
}

impl ConnectionPool {
    /// Create an empty pool; must be called inside a Tokio runtime
    pub fn new(kind: ChannelKind, transport: Arc<dyn Transport>, config: PoolConfig) -> Arc<Self> {
        Self::with_id_generator(kind, transport, config, Arc::new(TimestampIdGenerator::new()))
    }

    /// Create an empty pool drawing connection and transaction ids from `ids`
    pub fn with_id_generator(
        kind: ChannelKind,
        transport: Arc<dyn Transport>,
        config: PoolConfig,
        ids: Arc<dyn IdGenerator>,
    ) -> Arc<Self> {
        let (signals, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            kind,
            transport,
            config,
            ids,
            connections: DashMap::new(),
            open: RwLock::new(Vec::new()),
            reopening: DashMap::new(),
            pending: DashMap::new(),
            listeners: Listeners::new(),
            registry: Mutex::new(SubscriptionRegistry::new()),
            signals,
        });
        tokio::spawn(dispatch_loop(Arc::downgrade(&pool), rx));
        pool
    }

    /// Channel kind of every connection in the pool
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Pool settings
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Listener registry for all pool events
    pub fn listeners(&self) -> &Listeners<PoolEvent> {
        &self.listeners
    }

    /// Observe connections entering the pool
    pub fn on_open<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.listeners.on(OPEN_EVENT, move |event| {
            if let PoolEvent::Open { connection } = event {
                callback(connection);
            }
        })
    }

    /// Observe connections leaving the pool; the flag tells whether the
    /// socket will try to re-open it
    pub fn on_close<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&Arc<Connection>, bool) + Send + Sync + 'static,
    {
        self.listeners.on(CLOSE_EVENT, move |event| {
            if let PoolEvent::Close {
                connection,
                will_reconnect,
            } = event
            {
                callback(connection, *will_reconnect);
            }
        })
    }

    /// Observe replies and pushes for one command
    pub fn on_command<F>(&self, command: &str, callback: F) -> ListenerHandle
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.listeners.on(command_key(command), callback)
    }

    /// Observe frames that could not be decoded or correlated
    pub fn on_protocol_error<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.listeners.on(PROTOCOL_ERROR_EVENT, callback)
    }

    // === Lifecycle ===

    /// Open a new connection and admit it to the pool
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn connect(&self, timeout: Duration) -> XapiResult<ConnectionId> {
        let id = ConnectionId::from(self.ids.next());
        let connection = Connection::new(
            id.clone(),
            self.kind,
            self.transport.clone(),
            self.config.connection_config(),
            self.signals.clone(),
        );
        self.connections.insert(id.clone(), connection.clone());

        if let Err(e) = connection.connect(timeout).await {
            warn!(connection_id = %id, error = %e, "Connect failed");
            self.connections.remove(&id);
            return Err(e);
        }
        self.admit(&connection);
        Ok(id)
    }

    /// Close one connection, or every connection when `id` is `None`
    ///
    /// Closing an unknown or already closed connection succeeds. Every
    /// transaction bound to a closed connection is rejected.
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn close(&self, id: Option<&ConnectionId>) -> XapiResult<()> {
        let targets: Vec<Arc<Connection>> = match id {
            Some(id) => self
                .connections
                .get(id)
                .map(|entry| entry.value().clone())
                .into_iter()
                .collect(),
            None => self
                .connections
                .iter()
                .map(|entry| entry.value().clone())
                .collect(),
        };

        let results = futures::future::join_all(targets.iter().map(|c| c.close())).await;
        for connection in &targets {
            self.retire(connection.id(), false);
        }
        results.into_iter().collect()
    }

    fn admit(&self, connection: &Arc<Connection>) {
        if !connection.is_connected() {
            return;
        }
        {
            let mut open = self.open.write();
            if open.iter().any(|c| c.id() == connection.id()) {
                return;
            }
            open.push(connection.clone());
        }
        self.reopening.remove(connection.id());
        info!(connection_id = %connection.id(), kind = %self.kind, "Connection admitted");
        self.listeners.emit(
            OPEN_EVENT,
            &PoolEvent::Open {
                connection: connection.clone(),
            },
        );
    }

    /// Idempotent removal after a connection left CONNECTED
    fn retire(&self, id: &ConnectionId, will_reconnect: bool) {
        let removed = {
            let mut open = self.open.write();
            open.iter()
                .position(|c| c.id() == id)
                .map(|index| open.remove(index))
        };

        let mut bound = Vec::new();
        self.pending.retain(|_, transaction| {
            if transaction.connection_id() == id {
                bound.push(transaction.clone());
                false
            } else {
                true
            }
        });
        for transaction in &bound {
            transaction.reject(XapiError::connection_closed(id.as_str()));
        }

        let purged = self.registry.lock().purge_connection(id);
        let removed = if will_reconnect {
            if let Some(connection) = &removed {
                self.reopening.insert(id.clone(), connection.clone());
            }
            removed
        } else {
            self.connections.remove(id);
            // A link that gave up re-opening reports its final close here
            removed.or_else(|| self.reopening.remove(id).map(|(_, connection)| connection))
        };

        if let Some(connection) = removed {
            info!(
                connection_id = %id,
                rejected = bound.len(),
                purged,
                will_reconnect,
                "Connection retired"
            );
            self.listeners.emit(
                CLOSE_EVENT,
                &PoolEvent::Close {
                    connection,
                    will_reconnect,
                },
            );
        }
    }

    // === Routing ===

    /// Least loaded CONNECTED connection; ties go to the earliest admitted
    pub fn select_connection(&self) -> Option<Arc<Connection>> {
        self.open
            .read()
            .iter()
            .filter(|c| c.is_connected())
            .min_by_key(|c| c.load_score())
            .cloned()
    }

    /// CONNECTED connection with the given id
    fn open_connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.open
            .read()
            .iter()
            .find(|c| c.id() == id && c.is_connected())
            .cloned()
    }

    // === Calls ===

    /// Register a transaction and hand its frame to a connection
    ///
    /// Fails before any transaction exists when no connection is available
    /// or the frame is too large. On the Stream channel the handle resolves
    /// as soon as the frame is transmitted.
    pub async fn send_command(&self, request: CommandRequest) -> XapiResult<PendingCommand> {
        let connection = match &request.connection_id {
            Some(id) => self.open_connection(id),
            None => self.select_connection(),
        }
        .ok_or(XapiError::ConnectionUnavailable)?;

        let transaction_id = request
            .transaction_id
            .unwrap_or_else(|| TransactionId::from(self.ids.next()));
        let tag = CustomTag::new(request.command.as_str(), transaction_id.clone());
        let session = match self.kind {
            ChannelKind::Stream => connection.session(),
            ChannelKind::Socket => None,
        };
        let json = RequestFrame::new(request.command.as_str(), tag.encode())
            .with_arguments(request.arguments)
            .with_stream_session(session)
            .to_json()?;
        self.config.limits.check_payload(&json)?;

        let (transaction, handle) = Transaction::new(
            transaction_id.clone(),
            request.command,
            json,
            connection.id().clone(),
        );
        match self.pending.entry(transaction_id.clone()) {
            Entry::Occupied(_) => {
                return Err(XapiError::DuplicateTransaction {
                    transaction_id: transaction_id.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(transaction.clone());
            }
        }

        let mut guard = PendingGuard {
            pending: &self.pending,
            transaction: &transaction,
            armed: true,
        };
        let sent = connection.send(&transaction, request.priority).await;
        guard.armed = false;

        match sent {
            Ok(sent_at) => {
                if !self.kind.expects_response() {
                    self.remove_pending(&transaction);
                    transaction.resolve(Response::new(Value::Null));
                }
                Ok(PendingCommand {
                    handle,
                    connection_id: connection.id().clone(),
                    sent_at,
                })
            }
            Err(e) => {
                self.remove_pending(&transaction);
                transaction.reject(e.clone());
                Err(e)
            }
        }
    }

    /// Send and wait for the reply, giving up after `timeout`
    pub async fn request(&self, request: CommandRequest, timeout: Duration) -> XapiResult<Response> {
        let pending = self.send_command(request).await?;
        let id = pending.handle.id().clone();
        match tokio::time::timeout(timeout, pending.handle).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let error = XapiError::RequestTimeout {
                    transaction_id: id.to_string(),
                    timeout,
                };
                self.abandon(&id, error.clone());
                Err(error)
            }
        }
    }

    /// Drop a pending transaction, rejecting it with `error`
    pub fn abandon(&self, id: &TransactionId, error: XapiError) -> bool {
        match self.pending.remove(id) {
            Some((_, transaction)) => transaction.reject(error),
            None => false,
        }
    }

    fn remove_pending(&self, transaction: &Arc<Transaction>) {
        self.pending
            .remove_if(transaction.id(), |_, t| Arc::ptr_eq(t, transaction));
    }

    // === Subscriptions ===

    /// Subscribe to a stream command, reusing an existing subscription
    ///
    /// Without a target, a connection already subscribed to the exact
    /// `(command, params)` key is reused and nothing is sent. Otherwise the
    /// subscribe goes to a connection subscribed to the same command with
    /// empty params, then to any connection subscribed to the command, then
    /// to the least loaded connection.
    #[instrument(skip(self, params), fields(kind = %self.kind))]
    pub async fn subscribe(
        &self,
        command: &str,
        params: Value,
        target: Option<&ConnectionId>,
    ) -> XapiResult<SubscriptionAck> {
        if self.kind != ChannelKind::Stream {
            return Err(XapiError::InvalidState {
                expected: ChannelKind::Stream.to_string(),
                actual: self.kind.to_string(),
            });
        }
        let key = canonical_params(&params);

        let connection = {
            let mut registry = self.registry.lock();
            let connection = match target {
                Some(id) => self.open_connection(id),
                None => match registry.lookup(command, &key, |id| self.open_connection(id).is_some()) {
                    Some(RegistryMatch {
                        connection_id,
                        exact: true,
                    }) => {
                        debug!(%connection_id, command, "Reusing subscription");
                        return Ok(SubscriptionAck {
                            connection_id,
                            reused: true,
                            sent_at: None,
                        });
                    }
                    Some(found) => self.open_connection(&found.connection_id),
                    None => self.select_connection(),
                },
            }
            .ok_or(XapiError::ConnectionUnavailable)?;

            if registry.contains(command, &key, connection.id()) {
                return Ok(SubscriptionAck {
                    connection_id: connection.id().clone(),
                    reused: true,
                    sent_at: None,
                });
            }
            registry.record(command, &key, connection.id().clone(), Instant::now());
            connection
        };

        let mut reservation = Reservation {
            registry: &self.registry,
            command,
            key: &key,
            connection_id: connection.id(),
            armed: true,
        };
        let request = CommandRequest::new(subscribe_command(command))
            .with_arguments(Some(params))
            .on_connection(connection.id().clone());
        let pending = self.send_command(request).await?;
        reservation.armed = false;

        Ok(SubscriptionAck {
            connection_id: pending.connection_id,
            reused: false,
            sent_at: Some(pending.sent_at),
        })
    }

    /// Stop a stream subscription on every connection carrying it
    ///
    /// Returns how many connections were sent a stop frame.
    #[instrument(skip(self, params), fields(kind = %self.kind))]
    pub async fn unsubscribe(&self, command: &str, params: Value) -> XapiResult<usize> {
        let key = canonical_params(&params);
        let ids = self.registry.lock().remove_key(command, &key);

        let mut stopped = 0;
        let mut first_error = None;
        for id in ids {
            if self.open_connection(&id).is_none() {
                continue;
            }
            let request = CommandRequest::new(unsubscribe_command(command))
                .with_arguments(Some(params.clone()))
                .on_connection(id);
            match self.send_command(request).await {
                Ok(_) => stopped += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(stopped),
        }
    }

    // === Introspection ===

    /// Connection by id, including ones waiting to reconnect
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Ids of the admitted connections, in admission order
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.open.read().iter().map(|c| c.id().clone()).collect()
    }

    /// Number of admitted connections
    pub fn connection_count(&self) -> usize {
        self.open.read().len()
    }

    /// Number of transactions waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of active stream subscriptions
    pub fn subscription_count(&self) -> usize {
        self.registry.lock().len()
    }

    // === Inbound ===

    fn handle_signal(self: &Arc<Self>, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::Opened(id) => {
                if let Some(connection) = self.connection(&id) {
                    self.admit(&connection);
                }
            }
            ConnectionSignal::Closed { id, will_reconnect } => self.retire(&id, will_reconnect),
            ConnectionSignal::Frame(id, text) => self.dispatch_frame(&id, &text),
            ConnectionSignal::KeepaliveDue(id) => self.ping(id),
        }
    }

    /// Route one inbound frame
    fn dispatch_frame(&self, connection_id: &ConnectionId, raw: &str) {
        let frame = match InboundFrame::parse(raw) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%connection_id, %error, "Discarding unparseable frame");
                self.protocol_error(connection_id, error.to_string(), raw);
                return;
            }
        };

        match frame {
            InboundFrame::StreamPush { command, data } => {
                trace!(%connection_id, command = %command, "Stream push");
                self.listeners.emit(
                    &command_key(&command),
                    &PoolEvent::Stream {
                        connection_id: connection_id.clone(),
                        command,
                        data,
                    },
                );
            }
            InboundFrame::Success {
                return_data,
                stream_session_id,
                custom_tag,
            } => {
                let Some(raw_tag) = custom_tag else {
                    debug!(%connection_id, "Success frame without customTag");
                    return;
                };
                let Some(tag) = CustomTag::parse(&raw_tag) else {
                    warn!(%connection_id, tag = %raw_tag, "Invalid customTag");
                    self.protocol_error(connection_id, format!("invalid customTag: {raw_tag}"), raw);
                    return;
                };
                let Some((_, transaction)) = self.pending.remove(&tag.transaction_id) else {
                    debug!(%connection_id, tag = %raw_tag, "No pending transaction for reply");
                    return;
                };

                let response = Response {
                    return_data,
                    stream_session_id,
                };
                transaction.resolve(response.clone());
                self.listeners.emit(
                    &command_key(&tag.command),
                    &PoolEvent::Command {
                        connection_id: connection_id.clone(),
                        command: tag.command,
                        response,
                    },
                );
            }
            InboundFrame::Error {
                code,
                description,
                custom_tag,
            } => {
                let matched = custom_tag
                    .as_deref()
                    .and_then(CustomTag::parse)
                    .and_then(|tag| self.pending.remove(&tag.transaction_id));
                match matched {
                    Some((_, transaction)) => {
                        debug!(%connection_id, transaction_id = %transaction.id(), code = %code, "Server rejected call");
                        transaction.reject(XapiError::server(code, description));
                    }
                    None => {
                        debug!(%connection_id, code = %code, ?custom_tag, "Discarding unmatched error frame");
                    }
                }
            }
        }
    }

    fn protocol_error(&self, connection_id: &ConnectionId, message: String, raw: &str) {
        self.listeners.emit(
            PROTOCOL_ERROR_EVENT,
            &PoolEvent::ProtocolError {
                connection_id: connection_id.clone(),
                message,
                raw: Some(raw.to_string()),
            },
        );
    }

    fn ping(self: &Arc<Self>, connection_id: ConnectionId) {
        let pool = self.clone();
        tokio::spawn(async move {
            let request = CommandRequest::new(PING_COMMAND).on_connection(connection_id.clone());
            let timeout = pool.config.request_timeout;
            match pool.request(request, timeout).await {
                Ok(_) => trace!(%connection_id, "Keepalive ping acknowledged"),
                Err(error) => debug!(%connection_id, %error, "Keepalive ping failed"),
            }
        });
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("kind", &self.kind)
            .field("endpoint", &self.transport.endpoint())
            .field("connections", &self.connection_ids())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Removes a registered transaction if the send future is dropped midway
struct PendingGuard<'a> {
    pending: &'a DashMap<TransactionId, Arc<Transaction>>,
    transaction: &'a Arc<Transaction>,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending
                .remove_if(self.transaction.id(), |_, t| Arc::ptr_eq(t, self.transaction));
        }
    }
}

/// Releases a registry entry unless the subscribe frame went out
struct Reservation<'a> {
    registry: &'a Mutex<SubscriptionRegistry>,
    command: &'a str,
    key: &'a str,
    connection_id: &'a ConnectionId,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry
                .lock()
                .remove_entry(self.command, self.key, self.connection_id);
        }
    }
}

async fn dispatch_loop(pool: Weak<ConnectionPool>, mut signals: mpsc::UnboundedReceiver<ConnectionSignal>) {
    while let Some(signal) = signals.recv().await {
        let Some(pool) = pool.upgrade() else {
            break;
        };
        pool.handle_signal(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIdGenerator;
    use crate::transport::{MockPeer, MockServer, MockTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    const CONNECT: Duration = Duration::from_secs(5);

    fn pool(kind: ChannelKind) -> (Arc<ConnectionPool>, MockServer) {
        let (transport, server) = MockTransport::new("wss://mock.test");
        let pool = ConnectionPool::with_id_generator(
            kind,
            Arc::new(transport),
            PoolConfig::default(),
            Arc::new(SequentialIdGenerator::new("id")),
        );
        (pool, server)
    }

    async fn open(pool: &ConnectionPool, server: &mut MockServer) -> (ConnectionId, MockPeer) {
        let id = pool.connect(CONNECT).await.unwrap();
        let peer = server.accept().await.unwrap();
        (id, peer)
    }

    fn frame_field(frame: &str, field: &str) -> Value {
        serde_json::from_str::<Value>(frame).unwrap()[field].clone()
    }

    fn tag_of(frame: &str) -> String {
        frame_field(frame, "customTag").as_str().unwrap().to_string()
    }

    fn reply(peer: &MockPeer, tag: &str, data: Value) {
        peer.push(json!({"status": true, "returnData": data, "customTag": tag}).to_string());
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_admits_connection() {
        let (pool, mut server) = pool(ChannelKind::Socket);
        let (opened, bump) = counter();
        pool.on_open(move |_| bump());

        let (id, _peer) = open(&pool, &mut server).await;
        sleep(Duration::from_millis(10)).await;

        assert_eq!(id, ConnectionId::from("id1"));
        assert_eq!(pool.connection_ids(), vec![id.clone()]);
        assert_eq!(pool.connection_count(), 1);
        // The dispatcher sees the same open; admission happens once
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert!(pool.connection(&id).unwrap().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_connection() {
        let (pool, _server) = pool(ChannelKind::Socket);
        let err = pool
            .send_command(CommandRequest::new("getVersion"))
            .await
            .unwrap_err();
        assert_eq!(err, XapiError::ConnectionUnavailable);
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_resolves_transaction() {
        let (pool, mut server) = pool(ChannelKind::Socket);
        let (_, mut peer) = open(&pool, &mut server).await;
        let (replies, bump) = counter();
        pool.on_command("getVersion", move |event| {
            assert!(matches!(event, PoolEvent::Command { .. }));
            bump();
        });

        let pending = pool
            .send_command(CommandRequest::new("getVersion"))
            .await
            .unwrap();
        assert_eq!(pool.pending_count(), 1);

        let frame = peer.recv_frame().await.unwrap();
        assert_eq!(frame_field(&frame, "command"), json!("getVersion"));
        let tag = tag_of(&frame);
        assert_eq!(tag, format!("getVersion_{}", pending.handle.id()));

        reply(&peer, &tag, json!({"version": "2.5.0"}));
        let response = pending.handle.await.unwrap();
        assert_eq!(response.return_data["version"], "2.5.0");
        assert_eq!(pool.pending_count(), 0);
        assert_eq!(replies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reply_rejects_transaction() {
        let (pool, mut server) = pool(ChannelKind::Socket);
        let (_, mut peer) = open(&pool, &mut server).await;

        let pending = pool
            .send_command(CommandRequest::new("login"))
            .await
            .unwrap();
        let tag = tag_of(&peer.recv_frame().await.unwrap());
        peer.push(
            json!({
                "status": false,
                "errorCode": "BE005",
                "errorDescr": "userPasswordCheck: Invalid login or password",
                "customTag": tag,
            })
            .to_string(),
        );

        let err = pending.handle.await.unwrap_err();
        assert_eq!(err.server_code(), Some("BE005"));
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_frames_are_reported_not_fatal() {
        let (pool, mut server) = pool(ChannelKind::Socket);
        let (_, mut peer) = open(&pool, &mut server).await;
        let (errors, bump) = counter();
        pool.on_protocol_error(move |_| bump());

        peer.push("not json at all");
        peer.push(json!({"status": true, "returnData": {}, "customTag": "notag"}).to_string());
        // Unknown transaction and missing tag are dropped quietly
        peer.push(json!({"status": true, "returnData": {}, "customTag": "ping_404"}).to_string());
        peer.push(json!({"status": true, "returnData": {}}).to_string());
        sleep(Duration::from_millis(10)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 2);

        let pending = pool
            .send_command(CommandRequest::new("getVersion"))
            .await
            .unwrap();
        let tag = tag_of(&peer.recv_frame().await.unwrap());
        reply(&peer, &tag, json!({"version": "2.5.0"}));
        assert!(pending.handle.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_transaction_id() {
        let (pool, mut server) = pool(ChannelKind::Socket);
        let _link = open(&pool, &mut server).await;

        let request = CommandRequest::new("getVersion").with_transaction_id(TransactionId::from("dup"));
        let _first = pool.send_command(request.clone()).await.unwrap();
        let err = pool.send_command(request).await.unwrap_err();

        assert_eq!(
            err,
            XapiError::DuplicateTransaction {
                transaction_id: "dup".into()
            }
        );
        assert_eq!(pool.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_call_never_registers() {
        let (pool, mut server) = pool(ChannelKind::Socket);
        let (_, mut peer) = open(&pool, &mut server).await;

        let request = CommandRequest::new("getVersion")
            .with_arguments(Some(json!({"blob": "x".repeat(1200)})));
        let err = pool.send_command(request).await.unwrap_err();

        assert!(matches!(err, XapiError::PayloadTooLarge { limit: 1000, .. }));
        assert_eq!(pool.pending_count(), 0);
        assert!(peer.try_recv_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_only_bound_transactions() {
        let (pool, mut server) = pool(ChannelKind::Socket);
        let (a, _peer_a) = open(&pool, &mut server).await;
        let (b, _peer_b) = open(&pool, &mut server).await;
        let (closed, bump) = counter();
        pool.on_close(move |_, will_reconnect| {
            assert!(!will_reconnect);
            bump();
        });

        let mut on_a = Vec::new();
        for _ in 0..3 {
            let request = CommandRequest::new("getVersion").on_connection(a.clone());
            on_a.push(pool.send_command(request).await.unwrap());
        }
        for _ in 0..2 {
            let request = CommandRequest::new("getVersion").on_connection(b.clone());
            pool.send_command(request).await.unwrap();
        }
        assert_eq!(pool.pending_count(), 5);

        pool.close(Some(&a)).await.unwrap();

        for pending in on_a {
            assert_eq!(
                pending.handle.await.unwrap_err(),
                XapiError::connection_closed("id1")
            );
        }
        assert_eq!(pool.pending_count(), 2);
        assert_eq!(pool.connection_ids(), vec![b]);
        assert!(pool.connection(&a).is_none());
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // Closing again is a no-op
        pool.close(Some(&a)).await.unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_to_least_loaded() {
        let (pool, mut server) = pool(ChannelKind::Socket);
        let (a, _peer_a) = open(&pool, &mut server).await;
        let (b, _peer_b) = open(&pool, &mut server).await;

        for _ in 0..5 {
            let request = CommandRequest::new("getVersion").on_connection(a.clone());
            pool.send_command(request).await.unwrap();
        }

        let routed = pool
            .send_command(CommandRequest::new("getVersion"))
            .await
            .unwrap();
        assert_eq!(routed.connection_id, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_link_reconnects_and_readmits() {
        let (pool, mut server) = pool(ChannelKind::Socket);
        let (id, peer) = open(&pool, &mut server).await;
        let (opened, bump_open) = counter();
        let (closed, bump_close) = counter();
        pool.on_open(move |_| bump_open());
        pool.on_close(move |_, will_reconnect| {
            assert!(will_reconnect);
            bump_close();
        });

        let pending = pool
            .send_command(CommandRequest::new("getVersion"))
            .await
            .unwrap();
        peer.close();

        assert_eq!(
            pending.handle.await.unwrap_err(),
            XapiError::connection_closed("id1")
        );
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.connection_count(), 0);
        assert!(pool.connection(&id).is_some());

        let _peer = server.accept().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.connection_ids(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnect_leaves_pool() {
        let (transport, mut server) = MockTransport::new("wss://mock.test");
        let pool = ConnectionPool::with_id_generator(
            ChannelKind::Socket,
            Arc::new(transport.clone()),
            PoolConfig::default().with_reconnect(ReconnectConfig::default().with_max_attempts(2)),
            Arc::new(SequentialIdGenerator::new("id")),
        );
        let (id, peer) = open(&pool, &mut server).await;
        let closes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = closes.clone();
        pool.on_close(move |connection, will_reconnect| {
            seen.lock().push((connection.id().clone(), will_reconnect));
        });

        transport.set_fail_connect(true);
        peer.close();
        sleep(Duration::from_secs(60)).await;

        // Two failed re-opens after the original link
        assert_eq!(transport.connect_count(), 3);
        assert!(pool.connection(&id).is_none());
        assert!(pool.connection_ids().is_empty());
        assert_eq!(*closes.lock(), vec![(id.clone(), true), (id, false)]);

        // Closing afterwards reports nothing new
        pool.close(None).await.unwrap();
        assert_eq!(closes.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_reopening_reports_final_close() {
        let (transport, mut server) = MockTransport::new("wss://mock.test");
        let pool = ConnectionPool::with_id_generator(
            ChannelKind::Socket,
            Arc::new(transport.clone()),
            PoolConfig::default(),
            Arc::new(SequentialIdGenerator::new("id")),
        );
        let (id, peer) = open(&pool, &mut server).await;
        let closes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = closes.clone();
        pool.on_close(move |_, will_reconnect| seen.lock().push(will_reconnect));

        peer.close();
        sleep(Duration::from_millis(100)).await;
        assert!(pool.connection(&id).is_some());

        pool.close(None).await.unwrap();
        sleep(Duration::from_millis(10)).await;

        assert!(pool.connection(&id).is_none());
        assert_eq!(*closes.lock(), vec![true, false]);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_reused() {
        let (pool, mut server) = pool(ChannelKind::Stream);
        let (id, mut peer) = open(&pool, &mut server).await;

        let first = pool
            .subscribe("Candles", json!({"symbol": "EURUSD"}), None)
            .await
            .unwrap();
        assert!(!first.reused);
        assert_eq!(first.connection_id, id);

        let frame = peer.recv_frame().await.unwrap();
        assert_eq!(frame_field(&frame, "command"), json!("getCandles"));
        assert_eq!(frame_field(&frame, "arguments"), json!({"symbol": "EURUSD"}));

        let second = pool
            .subscribe("Candles", json!({"symbol": "EURUSD"}), None)
            .await
            .unwrap();
        assert!(second.reused);
        assert_eq!(second.sent_at, None);
        assert_eq!(second.connection_id, id);
        assert!(peer.try_recv_frame().is_none());
        assert_eq!(pool.subscription_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_forgotten_after_close() {
        let (pool, mut server) = pool(ChannelKind::Stream);
        let (a, _peer_a) = open(&pool, &mut server).await;
        let (b, _peer_b) = open(&pool, &mut server).await;

        let ack = pool.subscribe("News", Value::Null, None).await.unwrap();
        assert_eq!(ack.connection_id, a);

        pool.close(Some(&a)).await.unwrap();
        assert_eq!(pool.subscription_count(), 0);

        let ack = pool.subscribe("News", json!({}), None).await.unwrap();
        assert!(!ack.reused);
        assert_eq!(ack.connection_id, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_sends_stop() {
        let (pool, mut server) = pool(ChannelKind::Stream);
        let (_, mut peer) = open(&pool, &mut server).await;

        pool.subscribe("TickPrices", json!({"symbol": "EURUSD"}), None)
            .await
            .unwrap();
        peer.recv_frame().await.unwrap();

        let stopped = pool
            .unsubscribe("TickPrices", json!({"symbol": "EURUSD"}))
            .await
            .unwrap();
        assert_eq!(stopped, 1);
        let frame = peer.recv_frame().await.unwrap();
        assert_eq!(frame_field(&frame, "command"), json!("stopTickPrices"));
        assert_eq!(pool.subscription_count(), 0);

        // Nothing left to stop
        let stopped = pool
            .unsubscribe("TickPrices", json!({"symbol": "EURUSD"}))
            .await
            .unwrap();
        assert_eq!(stopped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_requires_stream_pool() {
        let (pool, mut server) = pool(ChannelKind::Socket);
        let _link = open(&pool, &mut server).await;
        let err = pool.subscribe("Candles", Value::Null, None).await.unwrap_err();
        assert!(matches!(err, XapiError::InvalidState { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_send_settles_on_transmit() {
        let (pool, mut server) = pool(ChannelKind::Stream);
        let (id, mut peer) = open(&pool, &mut server).await;
        pool.connection(&id)
            .unwrap()
            .set_session(Some("8469308861804289383".into()));

        let pending = pool
            .send_command(CommandRequest::new("getKeepAlive"))
            .await
            .unwrap();
        assert_eq!(pool.pending_count(), 0);
        assert_eq!(pending.handle.await.unwrap().return_data, Value::Null);

        let frame = peer.recv_frame().await.unwrap();
        assert_eq!(
            frame_field(&frame, "streamSessionId"),
            json!("8469308861804289383")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_abandons_transaction() {
        let (pool, mut server) = pool(ChannelKind::Socket);
        let _link = open(&pool, &mut server).await;

        let err = pool
            .request(CommandRequest::new("getVersion"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, XapiError::RequestTimeout { .. }));
        assert!(err.is_timeout());
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_keepalive_pings() {
        let (pool, mut server) = pool(ChannelKind::Stream);
        let (_, mut peer) = open(&pool, &mut server).await;

        sleep(Duration::from_millis(14_400)).await;
        assert!(peer.try_recv_frame().is_none());

        let frame = peer.recv_frame().await.unwrap();
        assert_eq!(frame_field(&frame, "command"), json!(PING_COMMAND));
    }
}
