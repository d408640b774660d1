//! Re-exports for convenience
//!
//! Import everything you need with:
//! ```
//! use xapi_sdk::prelude::*;
//! ```

// Client
pub use crate::builder::{ClientConfig, ConfigError, XapiClientBuilder};
pub use crate::client::{Session, XapiClient};
pub use crate::credentials::Credentials;

// Types from xapi-types
pub use xapi_types::{
    AccountType, ChannelKind, ConnectionId, ConnectionStatus, Response, TransactionId,
    TransportLimits, XapiError, XapiResult,
};

// Transport types
pub use xapi_ws::{
    Endpoint, ListenerHandle, PoolConfig, ReconnectConfig, SendOptions, SocketChannel,
    StreamAck, StreamChannel, SubscriptionAck,
};
