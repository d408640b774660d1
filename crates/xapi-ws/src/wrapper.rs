//! Physical socket with automatic reconnection
//!
//! [`SocketWrapper`] owns one link at a time. A driver task opens the link
//! through the [`Transport`], pumps frames both ways and, when the link drops
//! without the owner asking for it, waits the configured delay and opens a
//! new one. An explicit [`SocketWrapper::close`] shuts the link and cancels
//! any pending reconnection.
//!
//! The owner observes everything through a channel of [`SocketEvent`]s.
//! `StatusChange` is only emitted when the open/closed state actually flips.

use crate::reconnect::ReconnectConfig;
use crate::transport::{FrameSink, FrameStream, Transport};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xapi_types::{XapiError, XapiResult};

/// State of the physical link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    /// Opening a link
    Connecting,
    /// Link open
    Open,
    /// No link (idle, closed, or waiting to reconnect)
    Closed,
}

impl fmt::Display for SocketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Events emitted by the socket wrapper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A link opened
    Open,
    /// A link (or a connect attempt) ended
    Close {
        /// A reconnection is scheduled
        will_reconnect: bool,
    },
    /// Text frame received
    Message(String),
    /// Transport failure
    Error(String),
    /// First transition into (`true`) or out of (`false`) the open state
    StatusChange(bool),
}

/// Receiver half of the wrapper's event channel
pub type SocketEvents = mpsc::UnboundedReceiver<SocketEvent>;

enum DriverCommand {
    Send(String),
    Close(oneshot::Sender<()>),
}

struct DriverHandle {
    commands: mpsc::UnboundedSender<DriverCommand>,
    task: JoinHandle<()>,
}

/// One physical WebSocket with fixed-delay auto-reconnect
#[derive(Clone)]
pub struct SocketWrapper {
    transport: Arc<dyn Transport>,
    reconnect: ReconnectConfig,
    status: Arc<RwLock<SocketStatus>>,
    events: mpsc::UnboundedSender<SocketEvent>,
    driver: Arc<Mutex<Option<DriverHandle>>>,
}

impl SocketWrapper {
    /// Create a closed wrapper and the receiver for its events
    pub fn new(transport: Arc<dyn Transport>, reconnect: ReconnectConfig) -> (Self, SocketEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let wrapper = Self {
            transport,
            reconnect,
            status: Arc::new(RwLock::new(SocketStatus::Closed)),
            events,
            driver: Arc::new(Mutex::new(None)),
        };
        (wrapper, rx)
    }

    /// Current link state
    pub fn status(&self) -> SocketStatus {
        *self.status.read()
    }

    /// Whether a link is open
    pub fn is_open(&self) -> bool {
        self.status() == SocketStatus::Open
    }

    /// Whether the driver is running (open, connecting, or waiting to reconnect)
    pub fn is_active(&self) -> bool {
        self.driver
            .lock()
            .as_ref()
            .is_some_and(|d| !d.task.is_finished())
    }

    /// Endpoint of the underlying transport
    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    /// Start opening the link; no-op if the driver is already running
    pub fn connect(&self) {
        let mut driver = self.driver.lock();
        if driver.as_ref().is_some_and(|d| !d.task.is_finished()) {
            return;
        }

        *self.status.write() = SocketStatus::Connecting;
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_driver(
            self.transport.clone(),
            self.reconnect.clone(),
            self.status.clone(),
            self.events.clone(),
            rx,
        ));
        *driver = Some(DriverHandle { commands, task });
    }

    /// Queue a frame for transmission; fails unless the link is open
    pub fn send(&self, frame: String) -> XapiResult<()> {
        let status = self.status();
        if status != SocketStatus::Open {
            return Err(XapiError::InvalidState {
                expected: SocketStatus::Open.to_string(),
                actual: status.to_string(),
            });
        }

        let driver = self.driver.lock();
        let handle = driver.as_ref().ok_or(XapiError::ChannelClosed)?;
        handle
            .commands
            .send(DriverCommand::Send(frame))
            .map_err(|_| XapiError::ChannelClosed)
    }

    /// Close the link gracefully and disable reconnection
    ///
    /// Resolves once the driver has shut down. Closing an idle wrapper
    /// resolves immediately.
    pub async fn close(&self) -> XapiResult<()> {
        let handle = self.driver.lock().take();
        let Some(handle) = handle else {
            *self.status.write() = SocketStatus::Closed;
            return Ok(());
        };

        let (reply, done) = oneshot::channel();
        if handle.commands.send(DriverCommand::Close(reply)).is_err() {
            *self.status.write() = SocketStatus::Closed;
            return Ok(());
        }
        // The driver drops the reply sender if it exits on its own
        let _ = done.await;
        Ok(())
    }

    /// Stop the driver immediately without a closing handshake
    pub fn abort(&self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.task.abort();
        }
        *self.status.write() = SocketStatus::Closed;
    }
}

impl fmt::Debug for SocketWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketWrapper")
            .field("endpoint", &self.transport.endpoint())
            .field("status", &self.status())
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

/// Why the I/O loop stopped
enum Exit {
    /// Link dropped or failed
    Lost,
    /// Owner asked to close
    Closed(Option<oneshot::Sender<()>>),
}

struct Driver {
    status: Arc<RwLock<SocketStatus>>,
    events: mpsc::UnboundedSender<SocketEvent>,
    was_open: bool,
}

impl Driver {
    fn emit(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&mut self, status: SocketStatus) {
        *self.status.write() = status;
        let open = status == SocketStatus::Open;
        if open != self.was_open {
            self.was_open = open;
            self.emit(SocketEvent::StatusChange(open));
        }
    }

    /// Final transition after an owner-requested close
    fn finish(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.set_status(SocketStatus::Closed);
        self.emit(SocketEvent::Close {
            will_reconnect: false,
        });
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }
}

async fn run_driver(
    transport: Arc<dyn Transport>,
    reconnect: ReconnectConfig,
    status: Arc<RwLock<SocketStatus>>,
    events: mpsc::UnboundedSender<SocketEvent>,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
) {
    let mut driver = Driver {
        status,
        events,
        was_open: false,
    };
    let mut attempt: u32 = 0;

    loop {
        *driver.status.write() = SocketStatus::Connecting;
        debug!(endpoint = transport.endpoint(), attempt, "Opening socket");

        let connect = transport.connect();
        tokio::pin!(connect);
        let connected = loop {
            tokio::select! {
                result = &mut connect => break Some(result),
                command = commands.recv() => match command {
                    // Nothing can be written before the link is open
                    Some(DriverCommand::Send(_)) => continue,
                    Some(DriverCommand::Close(reply)) => {
                        driver.finish(Some(reply));
                        return;
                    }
                    None => break None,
                },
            }
        };

        match connected {
            None => {
                driver.finish(None);
                return;
            }
            Some(Ok((sink, stream))) => {
                attempt = 0;
                info!(endpoint = transport.endpoint(), "Socket open");
                driver.emit(SocketEvent::Open);
                driver.set_status(SocketStatus::Open);

                match pump(&mut driver, &mut commands, sink, stream).await {
                    Exit::Closed(reply) => {
                        info!(endpoint = transport.endpoint(), "Socket closed by owner");
                        driver.finish(reply);
                        return;
                    }
                    Exit::Lost => {
                        warn!(endpoint = transport.endpoint(), "Socket closed unexpectedly");
                    }
                }
            }
            Some(Err(e)) => {
                warn!(endpoint = transport.endpoint(), error = %e, "Socket connect failed");
                driver.emit(SocketEvent::Error(e.to_string()));
            }
        }

        let will_reconnect = reconnect.allows(attempt);
        driver.emit(SocketEvent::Close { will_reconnect });
        driver.set_status(SocketStatus::Closed);
        if !will_reconnect {
            return;
        }

        attempt += 1;
        let delay = reconnect.next_delay();
        debug!(endpoint = transport.endpoint(), attempt, ?delay, "Scheduling reconnect");

        let wait = tokio::time::sleep(delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                command = commands.recv() => match command {
                    // Frames written for the dead link are dropped
                    Some(DriverCommand::Send(_)) => continue,
                    Some(DriverCommand::Close(reply)) => {
                        driver.finish(Some(reply));
                        return;
                    }
                    None => return,
                },
            }
        }
    }
}

/// Move frames until the link drops or the owner closes it
async fn pump(
    driver: &mut Driver,
    commands: &mut mpsc::UnboundedReceiver<DriverCommand>,
    mut sink: FrameSink,
    mut stream: FrameStream,
) -> Exit {
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(text)) => driver.emit(SocketEvent::Message(text)),
                Some(Err(e)) => {
                    driver.emit(SocketEvent::Error(e.to_string()));
                    return Exit::Lost;
                }
                None => return Exit::Lost,
            },
            command = commands.recv() => match command {
                Some(DriverCommand::Send(text)) => {
                    if let Err(e) = sink.send(text).await {
                        driver.emit(SocketEvent::Error(e.to_string()));
                        return Exit::Lost;
                    }
                }
                Some(DriverCommand::Close(reply)) => {
                    let _ = sink.close().await;
                    return Exit::Closed(Some(reply));
                }
                None => {
                    let _ = sink.close().await;
                    return Exit::Closed(None);
                }
            },
        }
    }
}
