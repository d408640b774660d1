//! # xapi-sdk
//!
//! Session-level client for the xStation xAPI.
//!
//! The transport crate (`xapi-ws`) moves frames; this crate turns them into
//! logged-in sessions. Each session pairs a Socket connection, which carries
//! commands and the `login`, with a Stream connection bound to that login's
//! `streamSessionId`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use serde_json::json;
//! use xapi_sdk::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = XapiClient::builder()
//!         .with_credentials("1234567", "password")
//!         .with_account(AccountType::Demo)
//!         .connect()
//!         .await?;
//!
//!     let symbol = client
//!         .send("getSymbol", Some(json!({"symbol": "EURUSD"})))
//!         .await?;
//!     println!("{}", symbol.return_data);
//!
//!     client.on_stream("tickPrices", |tick| println!("{}", tick));
//!     client
//!         .subscribe("TickPrices", json!({"symbol": "EURUSD"}))
//!         .await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Sessions
//!
//! - Closing either side of a session closes the other
//! - A Socket link that drops unexpectedly is re-opened after 3 seconds,
//!   logged in again and given a new Stream connection
//! - [`XapiClient::open_session`] adds more pairs for more throughput; calls
//!   are routed to the least loaded connection
//!
//! ## Configuration
//!
//! Credentials can come from `XAPI_USER_ID` and `XAPI_PASSWORD` via
//! [`XapiClientBuilder::with_credentials_from_env`]. The password is kept
//! in a zeroizing secret and never logged.

pub mod builder;
pub mod client;
pub mod credentials;
pub mod prelude;

pub use builder::{ClientConfig, ConfigError, XapiClientBuilder};
pub use client::{Session, XapiClient};
pub use credentials::Credentials;

// Re-export the lower layers
pub use xapi_types;
pub use xapi_ws;
