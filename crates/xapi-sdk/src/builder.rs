//! Client Builder Pattern
//!
//! Fluent configuration for [`XapiClient`](crate::XapiClient) with
//! validation before anything touches the network.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use xapi_sdk::builder::XapiClientBuilder;
//! use xapi_types::AccountType;
//!
//! let config = XapiClientBuilder::new()
//!     .with_credentials("1234567", "password")
//!     .with_account(AccountType::Demo)
//!     .with_app_name("my-app")
//!     .with_request_timeout(Duration::from_secs(10))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.endpoint.socket_url(), "wss://ws.xtb.com/demo");
//! ```

use crate::client::XapiClient;
use crate::credentials::Credentials;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use xapi_types::{AccountType, TransportLimits, XapiError, XapiResult};
use xapi_ws::{Endpoint, IdGenerator, PoolConfig, ReconnectConfig, Transport};

/// Longest `appName` the broker accepts
pub const MAX_APP_NAME_LEN: usize = 32;

/// Configuration validation error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// No credentials were given
    #[error("credentials are required (use with_credentials or with_credentials_from_env)")]
    MissingCredentials,

    /// Environment variable missing
    #[error("environment variable {0} is not set")]
    EnvVarNotSet(String),

    /// Account number is empty
    #[error("user id must not be empty")]
    EmptyUserId,

    /// Password is empty
    #[error("password must not be empty")]
    EmptyPassword,

    /// `appName` too long
    #[error("app name is {len} characters long (max 32)")]
    AppNameTooLong { len: usize },

    /// Timeout too short
    #[error("{which} timeout must be at least 100 ms")]
    TimeoutTooShort { which: &'static str },
}

impl From<ConfigError> for XapiError {
    fn from(err: ConfigError) -> Self {
        XapiError::Configuration(err.to_string())
    }
}

/// Shortest connect or request timeout accepted
const MIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Default deadline for opening a connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Validated client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Login credentials
    pub credentials: Credentials,
    /// `appName` sent with the login
    pub app_name: Option<String>,
    /// Server URLs
    pub endpoint: Endpoint,
    /// Deadline for opening each connection
    pub connect_timeout: Duration,
    /// Settings shared by both pools
    pub pool: PoolConfig,
    /// Transport override for the Socket channel
    pub socket_transport: Option<Arc<dyn Transport>>,
    /// Transport override for the Stream channel
    pub stream_transport: Option<Arc<dyn Transport>>,
    /// Id source override
    pub id_generator: Option<Arc<dyn IdGenerator>>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("credentials", &self.credentials)
            .field("app_name", &self.app_name)
            .field("endpoint", &self.endpoint)
            .field("connect_timeout", &self.connect_timeout)
            .field("pool", &self.pool)
            .field("custom_transports", &self.socket_transport.is_some())
            .finish()
    }
}

/// Builder for configuring an xAPI client
///
/// Covers:
/// - Credentials (explicit or from the environment)
/// - Account type or explicit endpoint URLs
/// - Connect and request deadlines
/// - Transport limits and socket reconnection
#[derive(Clone, Default)]
pub struct XapiClientBuilder {
    credentials: Option<Credentials>,
    app_name: Option<String>,
    endpoint: Endpoint,
    connect_timeout: Option<Duration>,
    pool: PoolConfig,
    socket_transport: Option<Arc<dyn Transport>>,
    stream_transport: Option<Arc<dyn Transport>>,
    id_generator: Option<Arc<dyn IdGenerator>>,
}

impl fmt::Debug for XapiClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XapiClientBuilder")
            .field("credentials", &self.credentials)
            .field("app_name", &self.app_name)
            .field("endpoint", &self.endpoint)
            .field("connect_timeout", &self.connect_timeout)
            .field("pool", &self.pool)
            .finish()
    }
}

impl XapiClientBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the account number and password
    pub fn with_credentials(mut self, user_id: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(user_id, password));
        self
    }

    /// Read credentials from `XAPI_USER_ID` / `XAPI_PASSWORD`
    pub fn with_credentials_from_env(mut self) -> Result<Self, ConfigError> {
        self.credentials = Some(Credentials::from_env()?);
        Ok(self)
    }

    /// Set the `appName` reported at login
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Use the broker servers for an account type
    pub fn with_account(mut self, account: AccountType) -> Self {
        self.endpoint = Endpoint::for_account(account);
        self
    }

    /// Use explicit endpoint URLs
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Set the connect deadline
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the default reply deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.pool.request_timeout = timeout;
        self
    }

    /// Override the broker's rate limits
    pub fn with_limits(mut self, limits: TransportLimits) -> Self {
        self.pool.limits = limits;
        self
    }

    /// Set the Socket reconnection policy
    pub fn with_reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.pool.reconnect = config;
        self
    }

    /// Disable Socket reconnection
    pub fn without_reconnect(mut self) -> Self {
        self.pool.reconnect = ReconnectConfig::disabled();
        self
    }

    /// Replace the WebSocket transports, e.g. with in-memory ones
    pub fn with_transports(mut self, socket: Arc<dyn Transport>, stream: Arc<dyn Transport>) -> Self {
        self.socket_transport = Some(socket);
        self.stream_transport = Some(stream);
        self
    }

    /// Replace the id generator
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(ids);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(ConfigError::MissingCredentials)?;
        if credentials.user_id().trim().is_empty() {
            return Err(ConfigError::EmptyUserId);
        }
        if !credentials.has_password() {
            return Err(ConfigError::EmptyPassword);
        }
        if let Some(name) = &self.app_name {
            let len = name.chars().count();
            if len > MAX_APP_NAME_LEN {
                return Err(ConfigError::AppNameTooLong { len });
            }
        }
        if self.connect_timeout.is_some_and(|t| t < MIN_TIMEOUT) {
            return Err(ConfigError::TimeoutTooShort { which: "connect" });
        }
        if self.pool.request_timeout < MIN_TIMEOUT {
            return Err(ConfigError::TimeoutTooShort { which: "request" });
        }
        Ok(())
    }

    /// Validate and produce the client configuration
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        self.validate()?;
        let credentials = self.credentials.ok_or(ConfigError::MissingCredentials)?;
        Ok(ClientConfig {
            credentials,
            app_name: self.app_name,
            endpoint: self.endpoint,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            pool: self.pool,
            socket_transport: self.socket_transport,
            stream_transport: self.stream_transport,
            id_generator: self.id_generator,
        })
    }

    /// Build the client and open the first session
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn connect(self) -> XapiResult<XapiClient> {
        let client = XapiClient::new(self.build()?);
        client.open_session().await?;
        Ok(client)
    }
}
