//! `netx send` and `netx send-await`.

use anyhow::{Context, Result};
use netx_client::ClientConfig;
use std::time::Duration;

/// Send one text message.
pub async fn run_send(config: ClientConfig, text: &str) -> Result<()> {
    let client = super::connect(config).await?;
    client
        .send(&text.to_string())
        .await
        .context("failed to send message")?;
    client.close().await;
    Ok(())
}

/// Send one text message and print the next message the server sends back.
pub async fn run_send_await(config: ClientConfig, text: &str, timeout_ms: Option<u64>) -> Result<()> {
    let client = super::connect(config).await?;
    let reply = client
        .send_and_await(&text.to_string(), timeout_ms.map(Duration::from_millis))
        .await
        .context("failed to send message")?;
    client.close().await;

    match reply {
        Some(reply) => {
            println!("{reply}");
            Ok(())
        }
        None => anyhow::bail!("no reply before timeout"),
    }
}
