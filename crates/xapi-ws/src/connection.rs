//! One logical link: admission control, pacing, keepalive, lifecycle
//!
//! A [`Connection`] wraps one [`SocketWrapper`] and decides when each frame
//! may leave. The broker allows `sends_per_window` frames per `window`; a
//! send that would exceed it, or that arrives while older sends are still
//! queued, waits in a priority-partitioned queue that a drain task empties
//! at the rate the window allows, spacing consecutive frames by
//! `drain_spacing`. Items that sit in the queue past `queue_timeout` are
//! rejected instead of sent.
//!
//! The status is read from the socket, never stored. Entering CONNECTED
//! starts the keepalive; leaving it cancels every timer and rejects every
//! queued send.

use crate::clock::Timer;
use crate::reconnect::ReconnectConfig;
use crate::transaction::Transaction;
use crate::transport::Transport;
use crate::wrapper::{SocketEvent, SocketEvents, SocketStatus, SocketWrapper};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use xapi_types::{
    CapacityWindow, ChannelKind, ConnectionId, ConnectionStatus, TransportLimits, XapiError,
    XapiResult,
};

/// Default deadline for a graceful close
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server-imposed limits
    pub limits: TransportLimits,
    /// Socket reconnection policy
    pub reconnect: ReconnectConfig,
    /// Deadline for a graceful close
    pub close_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            limits: TransportLimits::default(),
            reconnect: ReconnectConfig::default(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
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

    /// Disable automatic reconnection
    pub fn without_reconnect(mut self) -> Self {
        self.reconnect = ReconnectConfig::disabled();
        self
    }

    /// Set the close deadline
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

/// Notifications from a connection to its pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectionSignal {
    /// Entered CONNECTED
    Opened(ConnectionId),
    /// Left CONNECTED
    Closed {
        id: ConnectionId,
        will_reconnect: bool,
    },
    /// Inbound text frame
    Frame(ConnectionId, String),
    /// Keepalive ping should be sent
    KeepaliveDue(ConnectionId),
}

pub(crate) type SignalSender = mpsc::UnboundedSender<ConnectionSignal>;

struct QueuedSend {
    transaction: Arc<Transaction>,
    priority: bool,
    done: oneshot::Sender<XapiResult<Instant>>,
}

struct ConnectionInner {
    capacity: CapacityWindow,
    queue: VecDeque<QueuedSend>,
    connected: bool,
    closing: bool,
    drain: Option<Timer>,
    keepalive: Option<Timer>,
    connect_timer: Option<Timer>,
    connect_waiters: Vec<oneshot::Sender<XapiResult<()>>>,
    close_waiters: Vec<oneshot::Sender<XapiResult<()>>>,
}

impl ConnectionInner {
    /// Clear the drain timer from inside its own task
    fn release_drain(&mut self) {
        if let Some(timer) = self.drain.take() {
            timer.release();
        }
    }
}

/// One rate-limited link of a pool
pub struct Connection {
    id: ConnectionId,
    kind: ChannelKind,
    limits: TransportLimits,
    close_timeout: Duration,
    socket: SocketWrapper,
    inner: Mutex<ConnectionInner>,
    session: RwLock<Option<String>>,
    linked_peer: RwLock<Option<ConnectionId>>,
    reconnecting: AtomicBool,
    /// Pool was told a re-open is coming
    reopen_announced: AtomicBool,
    signals: SignalSender,
}

impl Connection {
    /// Create an idle connection; must be called inside a Tokio runtime
    pub(crate) fn new(
        id: ConnectionId,
        kind: ChannelKind,
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        signals: SignalSender,
    ) -> Arc<Self> {
        let (socket, events) = SocketWrapper::new(transport, config.reconnect);
        let connection = Arc::new(Self {
            id,
            kind,
            limits: config.limits,
            close_timeout: config.close_timeout,
            socket,
            inner: Mutex::new(ConnectionInner {
                capacity: CapacityWindow::new(config.limits),
                queue: VecDeque::new(),
                connected: false,
                closing: false,
                drain: None,
                keepalive: None,
                connect_timer: None,
                connect_waiters: Vec::new(),
                close_waiters: Vec::new(),
            }),
            session: RwLock::new(None),
            linked_peer: RwLock::new(None),
            reconnecting: AtomicBool::new(false),
            reopen_announced: AtomicBool::new(false),
            signals,
        });
        tokio::spawn(watch_socket(Arc::downgrade(&connection), events));
        connection
    }

    /// Connection id
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Channel this connection carries
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Server endpoint
    pub fn endpoint(&self) -> &str {
        self.socket.endpoint()
    }

    /// Lifecycle state, derived from the socket
    pub fn status(&self) -> ConnectionStatus {
        match self.socket.status() {
            SocketStatus::Connecting => ConnectionStatus::Connecting,
            SocketStatus::Open => ConnectionStatus::Connected,
            SocketStatus::Closed => ConnectionStatus::Disconnected,
        }
    }

    /// Whether the connection is CONNECTED
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Session value: login session on Socket, `streamSessionId` on Stream
    pub fn session(&self) -> Option<String> {
        self.session.read().clone()
    }

    /// Set or clear the session value
    pub fn set_session(&self, session: Option<String>) {
        *self.session.write() = session;
    }

    /// Whether a session is attached
    pub fn is_logged_in(&self) -> bool {
        self.session.read().is_some()
    }

    /// Record the paired connection on the other channel
    pub fn link_peer(&self, peer: Option<ConnectionId>) {
        *self.linked_peer.write() = peer;
    }

    /// Paired connection on the other channel
    pub fn linked_peer(&self) -> Option<ConnectionId> {
        self.linked_peer.read().clone()
    }

    /// Routing score; lower is less loaded
    pub fn load_score(&self) -> u64 {
        self.inner
            .lock()
            .capacity
            .load_score(Instant::now().into_std())
    }

    /// Number of sends waiting for capacity
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether keepalive pings are due on this connection
    pub fn keepalive_enabled(&self) -> bool {
        self.is_connected() && (self.kind == ChannelKind::Stream || self.is_logged_in())
    }

    /// Open the socket
    ///
    /// Resolves once CONNECTED. Concurrent calls share one attempt and its
    /// outcome; calling on a CONNECTED connection resolves immediately. On
    /// expiry of `timeout` every waiter fails with `ConnectTimeout` and the
    /// socket is closed.
    pub async fn connect(self: &Arc<Self>, timeout: Duration) -> XapiResult<()> {
        let rx = {
            let mut inner = self.inner.lock();
            if self.socket.is_open() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            inner.connect_waiters.push(tx);
            if inner.connect_timer.is_none() {
                debug!(connection_id = %self.id, endpoint = self.endpoint(), ?timeout, "Connecting");
                inner.connect_timer = Some(self.start_connect_timeout(timeout));
                self.socket.connect();
            }
            rx
        };
        rx.await.map_err(|_| XapiError::ChannelClosed)?
    }

    /// Close the socket without reconnecting
    ///
    /// Resolves immediately when already closed; concurrent calls share the
    /// in-flight close and its outcome.
    pub async fn close(self: &Arc<Self>) -> XapiResult<()> {
        let rx = {
            let mut inner = self.inner.lock();
            if !inner.closing && !inner.connected && !self.socket.is_active() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            inner.close_waiters.push(tx);
            if !inner.closing {
                inner.closing = true;
                self.reconnecting.store(false, Ordering::SeqCst);
                tokio::spawn(self.clone().run_close());
            }
            rx
        };
        rx.await.map_err(|_| XapiError::ChannelClosed)?
    }

    /// Transmit now or queue until the window has room
    ///
    /// Resolves with the transmit time. Fails with `PayloadTooLarge` before
    /// anything else happens, with `QueueOverloaded` if the item waits past
    /// the queue ceiling, and with `ConnectionClosed` if the connection goes
    /// down first.
    pub async fn send(
        self: &Arc<Self>,
        transaction: &Arc<Transaction>,
        priority: bool,
    ) -> XapiResult<Instant> {
        self.limits.check_payload(transaction.request_json())?;
        if !self.socket.is_open() {
            return Err(XapiError::connection_closed(self.id.as_str()));
        }

        let rx = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            if inner.queue.is_empty() && !inner.capacity.is_saturated(now.into_std()) {
                self.transmit(&mut inner, transaction, now)?;
                return Ok(now);
            }

            let (done, rx) = oneshot::channel();
            let position = if priority {
                inner
                    .queue
                    .iter()
                    .position(|queued| !queued.priority)
                    .unwrap_or(inner.queue.len())
            } else {
                inner.queue.len()
            };
            inner.queue.insert(
                position,
                QueuedSend {
                    transaction: transaction.clone(),
                    priority,
                    done,
                },
            );
            debug!(
                connection_id = %self.id,
                transaction_id = %transaction.id(),
                queued = inner.queue.len(),
                priority,
                "Send queued"
            );

            if inner.drain.is_none() {
                let wait = inner
                    .capacity
                    .saturation_wait(now.into_std())
                    .unwrap_or(Duration::ZERO)
                    .min(self.limits.queue_timeout);
                inner.drain = Some(self.start_drain(wait));
            }
            rx
        };
        rx.await.map_err(|_| XapiError::ChannelClosed)?
    }

    fn transmit(
        &self,
        inner: &mut ConnectionInner,
        transaction: &Transaction,
        now: Instant,
    ) -> XapiResult<()> {
        // The link may have dropped since admission was decided
        self.socket
            .send(transaction.request_json().to_string())
            .map_err(|_| XapiError::connection_closed(self.id.as_str()))?;
        inner.capacity.record(now.into_std());
        transaction.mark_sent(now);
        trace!(
            connection_id = %self.id,
            transaction_id = %transaction.id(),
            command = transaction.command(),
            "Frame transmitted"
        );
        Ok(())
    }

    fn start_drain(self: &Arc<Self>, first_wait: Duration) -> Timer {
        let weak = Arc::downgrade(self);
        Timer::spawn(async move {
            let mut wait = first_wait;
            loop {
                tokio::time::sleep(wait).await;
                let Some(connection) = weak.upgrade() else {
                    return;
                };
                match connection.drain_step() {
                    Some(next) => wait = next,
                    None => return,
                }
            }
        })
    }

    /// Pop what can go now; returns the delay before the next step, or
    /// `None` once the queue is empty
    fn drain_step(&self) -> Option<Duration> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        loop {
            let Some(front) = inner.queue.front() else {
                inner.release_drain();
                return None;
            };
            let abandoned = front.done.is_closed();
            let age = front.transaction.age(now);

            if abandoned {
                inner.queue.pop_front();
                continue;
            }

            if age >= self.limits.queue_timeout {
                if let Some(item) = inner.queue.pop_front() {
                    warn!(
                        connection_id = %self.id,
                        transaction_id = %item.transaction.id(),
                        waited = ?age,
                        "Queued send expired"
                    );
                    let _ = item.done.send(Err(XapiError::QueueOverloaded { waited: age }));
                }
                continue;
            }

            if let Some(wait) = inner.capacity.saturation_wait(now.into_std()) {
                return Some(wait.min(self.limits.queue_timeout - age));
            }

            let item = inner.queue.pop_front()?;
            let outcome = self.transmit(&mut inner, &item.transaction, now).map(|()| now);
            let _ = item.done.send(outcome);

            if inner.queue.is_empty() {
                inner.release_drain();
                return None;
            }
            return Some(self.limits.drain_spacing);
        }
    }

    fn start_connect_timeout(self: &Arc<Self>, timeout: Duration) -> Timer {
        let weak = Arc::downgrade(self);
        Timer::after(timeout, async move {
            let Some(connection) = weak.upgrade() else {
                return;
            };
            let waiters = {
                let mut inner = connection.inner.lock();
                match inner.connect_timer.take() {
                    Some(timer) => timer.release(),
                    // Opened in the meantime
                    None => return,
                }
                std::mem::take(&mut inner.connect_waiters)
            };

            warn!(connection_id = %connection.id, ?timeout, "Connect timed out");
            connection.reconnecting.store(false, Ordering::SeqCst);
            for waiter in waiters {
                let _ = waiter.send(Err(XapiError::ConnectTimeout { timeout }));
            }
            let socket = connection.socket.clone();
            tokio::spawn(async move {
                let _ = socket.close().await;
            });
        })
    }

    fn start_keepalive(self: &Arc<Self>) -> Timer {
        let weak = Arc::downgrade(self);
        Timer::every(self.limits.keepalive_interval, move || {
            let Some(connection) = weak.upgrade() else {
                return;
            };
            if connection.keepalive_enabled() {
                let _ = connection
                    .signals
                    .send(ConnectionSignal::KeepaliveDue(connection.id.clone()));
            }
        })
    }

    async fn run_close(self: Arc<Self>) {
        let timeout = self.close_timeout;
        let result = match tokio::time::timeout(timeout, self.socket.close()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(connection_id = %self.id, ?timeout, "Close timed out, aborting socket");
                self.socket.abort();
                Err(XapiError::CloseTimeout { timeout })
            }
        };

        self.handle_disconnect();
        let waiters = {
            let mut inner = self.inner.lock();
            inner.closing = false;
            std::mem::take(&mut inner.close_waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn handle_socket_event(self: &Arc<Self>, event: SocketEvent) {
        match event {
            SocketEvent::Message(text) => {
                let _ = self
                    .signals
                    .send(ConnectionSignal::Frame(self.id.clone(), text));
            }
            SocketEvent::StatusChange(true) => self.handle_open(),
            SocketEvent::StatusChange(false) => self.handle_disconnect(),
            SocketEvent::Close { will_reconnect } => {
                self.reconnecting.store(will_reconnect, Ordering::SeqCst);
                if !will_reconnect {
                    self.fail_connect_waiters(XapiError::Transport(
                        "socket closed before opening".into(),
                    ));
                    if self.reopen_announced.swap(false, Ordering::SeqCst) {
                        info!(connection_id = %self.id, "Reconnect abandoned");
                        let _ = self.signals.send(ConnectionSignal::Closed {
                            id: self.id.clone(),
                            will_reconnect: false,
                        });
                    }
                }
            }
            SocketEvent::Error(error) => {
                warn!(connection_id = %self.id, %error, "Socket error");
            }
            SocketEvent::Open => {}
        }
    }

    fn handle_open(self: &Arc<Self>) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.connected = true;
            inner.connect_timer = None;
            self.reopen_announced.store(false, Ordering::SeqCst);
            inner.keepalive = Some(self.start_keepalive());
            std::mem::take(&mut inner.connect_waiters)
        };

        info!(connection_id = %self.id, kind = %self.kind, "Connection open");
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        let _ = self.signals.send(ConnectionSignal::Opened(self.id.clone()));
    }

    /// Idempotent transition into DISCONNECTED
    fn handle_disconnect(&self) {
        let (queued, connect_waiters, was_connected) = {
            let mut inner = self.inner.lock();
            inner.drain = None;
            inner.keepalive = None;
            inner.connect_timer = None;
            (
                std::mem::take(&mut inner.queue),
                std::mem::take(&mut inner.connect_waiters),
                std::mem::replace(&mut inner.connected, false),
            )
        };
        self.set_session(None);

        for item in queued {
            let _ = item
                .done
                .send(Err(XapiError::connection_closed(self.id.as_str())));
        }
        for waiter in connect_waiters {
            let _ = waiter.send(Err(XapiError::connection_closed(self.id.as_str())));
        }

        if was_connected {
            let will_reconnect = self.reconnecting.load(Ordering::SeqCst);
            self.reopen_announced.store(will_reconnect, Ordering::SeqCst);
            info!(connection_id = %self.id, will_reconnect, "Connection closed");
            let _ = self.signals.send(ConnectionSignal::Closed {
                id: self.id.clone(),
                will_reconnect,
            });
        }
    }

    fn fail_connect_waiters(&self, error: XapiError) {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.connect_waiters.is_empty() {
                return;
            }
            inner.connect_timer = None;
            std::mem::take(&mut inner.connect_waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.socket.abort();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .field("linked_peer", &self.linked_peer())
            .field("logged_in", &self.is_logged_in())
            .finish()
    }
}

/// Forward socket events to the connection for as long as it exists
async fn watch_socket(connection: Weak<Connection>, mut events: SocketEvents) {
    while let Some(event) = events.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        connection.handle_socket_event(event);
    }
}
