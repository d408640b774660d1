//! Demo 1: Pacing Probe
//!
//! Showcases: client-side rate limiting, least-loaded routing
//!
//! Fires a burst of `getVersion` calls and prints when each one left the
//! client. The first five go out at once; the rest follow as the send
//! window frees up.
//!
//! Run: XAPI_USER_ID=... XAPI_PASSWORD=... cargo run --bin pacing_probe

use colored::*;
use std::time::Instant;
use xapi_sdk::prelude::*;
use xapi_sdk::xapi_ws::CommandRequest;

const BURST: usize = 12;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("{}", "═".repeat(50).cyan());
    println!("{}", "  PACING PROBE".cyan().bold());
    println!("{}", "═".repeat(50).cyan());

    let client = XapiClient::builder()
        .with_credentials_from_env()?
        .with_account(AccountType::Demo)
        .with_app_name("pacing-probe")
        .connect()
        .await?;
    println!("{} Logged in", "✓".green());

    let pool = client.socket().pool().clone();
    let start = Instant::now();
    let mut calls = Vec::new();
    for _ in 0..BURST {
        let pool = pool.clone();
        calls.push(tokio::spawn(async move {
            let pending = pool.send_command(CommandRequest::new("getVersion")).await?;
            let sent = pending.sent_at;
            let id = pending.handle.id().clone();
            let response = pending.handle.await?;
            Ok::<_, XapiError>((id, sent, response))
        }));
    }

    println!("\n  {:>22}  {:>10}  {:>8}", "TRANSACTION".bold(), "SENT (ms)".bold(), "VERSION".bold());
    for call in calls {
        match call.await? {
            Ok((id, sent, response)) => {
                let offset = sent.into_std().saturating_duration_since(start).as_millis();
                println!(
                    "  {:>22}  {:>10}  {:>8}",
                    id.to_string(),
                    offset,
                    response.return_data["version"].as_str().unwrap_or("?").green()
                );
            }
            Err(e) => println!("  {} {}", "✗".red(), e),
        }
    }

    client.close().await?;
    println!("\n{} Closed", "✓".green());
    Ok(())
}
