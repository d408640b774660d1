//! Shared types for the xAPI transport
//!
//! This crate provides the core type definitions used across the workspace.
//! It has minimal dependencies and no async runtime, so everything in it can
//! be unit tested without a reactor.
//!
//! # Key Types
//!
//! - [`XapiError`] - Error taxonomy surfaced by every transport call
//! - [`RequestFrame`], [`InboundFrame`] - Wire frames for both channels
//! - [`CustomTag`] - `{command}_{transactionId}` correlation codec
//! - [`ConnectionId`], [`TransactionId`] - Identifier newtypes
//! - [`TransportLimits`], [`CapacityWindow`] - Client-side rate limiting
//! - [`ChannelKind`], [`ConnectionStatus`] - Lifecycle enums

pub mod enums;
pub mod error;
pub mod ids;
pub mod messages;
pub mod rate_limit;
pub mod tag;

// Re-export commonly used types
pub use enums::*;
pub use error::*;
pub use ids::*;
pub use messages::*;
pub use rate_limit::*;
pub use tag::*;
