//! Channel and lifecycle enums

use std::fmt;

/// Which of the two broker channels a connection carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Command/response channel; every request is answered by the server
    Socket,
    /// Server-push channel; requests are acknowledged on transmit
    Stream,
}

impl ChannelKind {
    /// Whether the server answers requests on this channel
    pub fn expects_response(&self) -> bool {
        matches!(self, Self::Socket)
    }

    /// Short name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical connection state
///
/// Derived from the physical socket's own flags; never set directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Socket open in progress (or waiting to reconnect)
    Connecting,
    /// Socket open and usable
    Connected,
    /// Socket closed
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Broker account type, selects the server endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccountType {
    /// Demo account (default)
    #[default]
    Demo,
    /// Real-money account
    Real,
}

impl AccountType {
    /// Path segment used by the broker for this account type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Demo => "demo",
            Self::Real => "real",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_kind() {
        assert!(ChannelKind::Socket.expects_response());
        assert!(!ChannelKind::Stream.expects_response());
        assert_eq!(ChannelKind::Stream.to_string(), "stream");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Connected.to_string(), "CONNECTED");
        assert_eq!(AccountType::default(), AccountType::Demo);
    }
}
