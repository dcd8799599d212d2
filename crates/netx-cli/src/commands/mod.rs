//! CLI subcommand implementations.

pub mod listen;
pub mod request;
pub mod send;

use anyhow::{Context, Result};
use netx_client::{Client, ClientConfig};
use netx_core::TextCodec;
use tracing::debug;

/// Connect a text session with the resolved settings.
pub async fn connect(config: ClientConfig) -> Result<Client<TextCodec>> {
    let target = format!("{}:{}", config.host, config.port);
    let client = Client::connect(config, TextCodec)
        .await
        .with_context(|| format!("failed to connect to {target}"))?;
    debug!(session_id = %client.session_id(), "session established");
    Ok(client)
}
