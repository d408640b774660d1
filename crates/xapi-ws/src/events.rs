//! Events delivered to pool listeners

use crate::connection::Connection;
use serde_json::Value;
use std::sync::Arc;
use xapi_types::{ConnectionId, Response};

/// Payload passed to every [`crate::listeners::Listeners`] callback of a pool
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// Connection admitted to the pool (first open or re-open after reconnect)
    Open {
        /// The connection
        connection: Arc<Connection>,
    },
    /// Connection left the pool
    Close {
        /// The connection
        connection: Arc<Connection>,
        /// The socket will try to re-open it
        will_reconnect: bool,
    },
    /// A correlated reply resolved a pending call
    Command {
        /// Connection the reply arrived on
        connection_id: ConnectionId,
        /// Logical command name from the tag
        command: String,
        /// Reply payload
        response: Response,
    },
    /// Server push on the Stream channel
    Stream {
        /// Connection the push arrived on
        connection_id: ConnectionId,
        /// Push command name
        command: String,
        /// Push payload
        data: Value,
    },
    /// Inbound frame that could not be decoded or correlated
    ProtocolError {
        /// Connection the frame arrived on
        connection_id: ConnectionId,
        /// What was wrong with it
        message: String,
        /// Raw frame text
        raw: Option<String>,
    },
}

impl PoolEvent {
    /// Connection the event concerns
    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            Self::Open { connection } | Self::Close { connection, .. } => connection.id(),
            Self::Command { connection_id, .. }
            | Self::Stream { connection_id, .. }
            | Self::ProtocolError { connection_id, .. } => connection_id,
        }
    }

    /// Data carried by a command reply or stream push
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Command { response, .. } => Some(&response.return_data),
            Self::Stream { data, .. } => Some(data),
            _ => None,
        }
    }
}
