//! Rate-limited WebSocket transport for the xStation xAPI
//!
//! This crate implements the transport under the broker's two channels:
//! the request/response **Socket** channel and the server-push **Stream**
//! channel. Calls are spread over a pool of connections, paced to the
//! broker's send limit, and correlated with their replies through the
//! `customTag` embedded in every frame.
//!
//! # Features
//!
//! - Per-connection admission control: 5 sends per second, a paced queue
//!   with priority sends, and a 9 second overload ceiling
//! - Least-loaded routing across any number of connections
//! - Exactly-once settlement of every call, including when its connection
//!   drops mid-flight
//! - Stream subscription reuse keyed by command and canonical parameters
//! - Keepalive pings and automatic reconnection with a fixed delay
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use xapi_ws::{Endpoint, PoolConfig, SendOptions, SocketChannel};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = Endpoint::Demo;
//!     let socket = SocketChannel::with_url(endpoint.socket_url(), PoolConfig::default());
//!
//!     socket.connect(Duration::from_secs(10)).await?;
//!     let version = socket.send("getVersion", None, SendOptions::new()).await?;
//!     println!("Server version: {}", version.return_data["version"]);
//!
//!     socket.close(None).await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod connection;
pub mod endpoint;
pub mod events;
pub mod ids;
pub mod listeners;
pub mod pool;
pub mod reconnect;
pub mod socket;
pub mod stream;
pub mod subscription;
pub mod transaction;
pub mod transport;
pub mod wrapper;

// Re-export main types
pub use clock::Timer;
pub use connection::{Connection, ConnectionConfig};
pub use endpoint::Endpoint;
pub use events::PoolEvent;
pub use ids::{IdGenerator, SequentialIdGenerator, TimestampIdGenerator};
pub use listeners::{ListenerHandle, Listeners};
pub use pool::{CommandRequest, ConnectionPool, PendingCommand, PoolConfig, SubscriptionAck};
pub use reconnect::ReconnectConfig;
pub use socket::{SendOptions, SocketChannel};
pub use stream::{StreamAck, StreamChannel};
pub use subscription::SubscriptionRegistry;
pub use transaction::{Resolution, Transaction, TransactionHandle};
pub use transport::{Transport, TransportError, WsTransport};
pub use wrapper::{SocketEvent, SocketStatus, SocketWrapper};

#[cfg(any(test, feature = "test-utils"))]
pub use transport::{MockPeer, MockServer, MockTransport};
