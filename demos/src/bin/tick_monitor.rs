//! Demo 2: Tick Monitor
//!
//! Showcases: stream subscriptions, passive listeners, session recovery
//!
//! Subscribes to tick prices for a few symbols and prints every push.
//! Stop with Ctrl+C.
//!
//! Run: XAPI_USER_ID=... XAPI_PASSWORD=... cargo run --bin tick_monitor

use colored::*;
use serde_json::json;
use xapi_sdk::prelude::*;

const SYMBOLS: [&str; 3] = ["EURUSD", "GBPUSD", "US500"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let client = XapiClient::builder()
        .with_credentials_from_env()?
        .with_app_name("tick-monitor")
        .connect()
        .await?;

    let session = client.sessions().remove(0);
    println!(
        "{} Session {} (socket {})",
        "✓".green(),
        session.stream_session_id.dimmed(),
        session.socket_id
    );

    client.on_stream("tickPrices", |tick| {
        println!(
            "  {:>8}  bid {:>10}  ask {:>10}",
            tick["symbol"].as_str().unwrap_or("?").bold(),
            tick["bid"],
            tick["ask"]
        );
    });
    client.socket().on_close(|connection, will_reconnect| {
        let note = if will_reconnect { "reconnecting" } else { "closed" };
        println!("{} Socket {} {}", "!".yellow(), connection.id(), note);
    });

    for symbol in SYMBOLS {
        let ack = client
            .subscribe("TickPrices", json!({"symbol": symbol, "minArrivalTime": 1000}))
            .await?;
        println!("{} {} on {}", "✓".green(), symbol, ack.connection_id);
    }

    tokio::signal::ctrl_c().await?;

    for symbol in SYMBOLS {
        client
            .unsubscribe("TickPrices", json!({"symbol": symbol, "minArrivalTime": 1000}))
            .await?;
    }
    client.close().await?;
    Ok(())
}
