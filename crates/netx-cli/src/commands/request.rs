//! `netx request <kind-id> <body>`: one correlated request.

use anyhow::{Context, Result};
use netx_client::ClientConfig;
use netx_core::Request;
use std::time::Duration;
use tracing::info;

/// Issue a request and print the response body as text.
pub async fn run(config: ClientConfig, kind_id: u32, body: &str, timeout_ms: Option<u64>) -> Result<()> {
    let client = super::connect(config).await?;
    let request = Request::new(kind_id, body.as_bytes().to_vec());
    info!(kind_id, correlation_id = %request.correlation_id(), "sending request");

    let response = client
        .request(&request, timeout_ms.map(Duration::from_millis))
        .await;
    client.close().await;

    let Some(response) = response.context("request failed")? else {
        anyhow::bail!("no response before timeout (kind {kind_id} may have no handler)");
    };
    if let Some(message) = response.error_message() {
        anyhow::bail!("request failed: {message}");
    }
    println!("{}", String::from_utf8_lossy(response.body()));
    Ok(())
}
