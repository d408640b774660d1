//! xAPI endpoint definitions

use std::fmt;
use xapi_types::{AccountType, ChannelKind};

/// Server address pair for one account
///
/// Every account has a command channel and a streaming channel on separate
/// URLs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Endpoint {
    /// Demo account servers (default)
    #[default]
    Demo,
    /// Real account servers
    Real,
    /// Explicit URLs, e.g. a local test server
    Custom {
        /// Command channel URL
        socket: String,
        /// Streaming channel URL
        stream: String,
    },
}

impl Endpoint {
    /// Endpoint for an account type
    pub fn for_account(account: AccountType) -> Self {
        match account {
            AccountType::Demo => Self::Demo,
            AccountType::Real => Self::Real,
        }
    }

    /// Endpoint with explicit URLs
    pub fn custom(socket: impl Into<String>, stream: impl Into<String>) -> Self {
        Self::Custom {
            socket: socket.into(),
            stream: stream.into(),
        }
    }

    /// Command channel URL
    pub fn socket_url(&self) -> &str {
        match self {
            Self::Demo => "wss://ws.xtb.com/demo",
            Self::Real => "wss://ws.xtb.com/real",
            Self::Custom { socket, .. } => socket,
        }
    }

    /// Streaming channel URL
    pub fn stream_url(&self) -> &str {
        match self {
            Self::Demo => "wss://ws.xtb.com/demoStream",
            Self::Real => "wss://ws.xtb.com/realStream",
            Self::Custom { stream, .. } => stream,
        }
    }

    /// URL for a channel kind
    pub fn url(&self, kind: ChannelKind) -> &str {
        match kind {
            ChannelKind::Socket => self.socket_url(),
            ChannelKind::Stream => self.stream_url(),
        }
    }

    /// Account type, unless the URLs are custom
    pub fn account_type(&self) -> Option<AccountType> {
        match self {
            Self::Demo => Some(AccountType::Demo),
            Self::Real => Some(AccountType::Real),
            Self::Custom { .. } => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_url())
    }
}
