//! netx-server: runnable netx server.
//!
//! Serves text sessions: logs traffic, answers echo and uppercase requests
//! and relays every received message to all connected sessions.

use clap::Parser;
use netx_core::{handler_fn, Response, TextCodec, Uuid};
use netx_server::{Server, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Request kind answered with the request body unchanged.
const ECHO_KIND: u32 = 1;
/// Request kind answered with the body upper-cased.
const UPPERCASE_KIND: u32 = 2;

/// netx-server: encrypted message server
#[derive(Parser, Debug)]
#[command(name = "netx-server", version, about = "Encrypted message server")]
struct Cli {
    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port (1024-65535)
    #[arg(short, long)]
    port: Option<u16>,

    /// Cipher algorithm (aes-128-gcm, aes-256-gcm, chacha20-poly1305)
    #[arg(long)]
    algorithm: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.netx/server.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.host.as_deref(),
        cli.port,
        cli.algorithm.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = server_config.port,
        "starting netx-server"
    );

    let server = Arc::new(Server::new(server_config, TextCodec));
    server
        .register_handler(handler_fn(ECHO_KIND, |req| {
            Response::new(req, req.body().to_vec())
        }))
        .await;
    server
        .register_handler(handler_fn(UPPERCASE_KIND, |req| {
            match std::str::from_utf8(req.body()) {
                Ok(text) => Response::new(req, text.to_uppercase().into_bytes()),
                Err(e) => Response::error(req, format!("body is not UTF-8: {e}")),
            }
        }))
        .await;

    server.on_client_connect(|id| info!(session_id = %id, "session opened"));
    server.on_client_disconnect(|id| info!(session_id = %id, "session closed"));

    // Observers run on dispatch tasks; relaying happens on its own task.
    let (relay_tx, relay_rx) = mpsc::unbounded_channel::<(String, Uuid)>();
    server.on_packet_received(move |text, sender| {
        info!(session_id = %sender, text = %text, "message received");
        let _ = relay_tx.send((text.clone(), sender));
    });
    let relay = tokio::spawn(relay_messages(server.clone(), relay_rx));

    if let Err(e) = server.open().await {
        error!(error = %e, "failed to start server");
        std::process::exit(1);
    }

    shutdown_signal().await;
    info!("received shutdown signal");

    server.close().await;
    relay.abort();
    info!("netx-server stopped");
}

async fn relay_messages(server: Arc<Server<TextCodec>>, mut rx: mpsc::UnboundedReceiver<(String, Uuid)>) {
    while let Some((text, sender)) = rx.recv().await {
        match server.broadcast(&text).await {
            Ok(report) if !report.is_complete() => {
                warn!(session_id = %sender, failed = report.failed.len(), "relay partially failed");
            }
            Ok(_) => {}
            Err(e) => warn!(session_id = %sender, error = %e, "relay failed"),
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
