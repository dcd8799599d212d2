//! netx: command-line client for netx servers.
//!
//! Sends text messages, waits for replies and issues correlated requests
//! over an encrypted netx session.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

/// netx: encrypted message client
#[derive(Parser)]
#[command(name = "netx", version, about = "netx client: send messages and requests to a netx server")]
struct Cli {
    /// Server host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Server port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Cipher algorithm (aes-128-gcm, aes-256-gcm, chacha20-poly1305)
    #[arg(short, long, global = true)]
    algorithm: Option<String>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one text message
    Send {
        text: String,
    },

    /// Send one text message and print the reply
    SendAwait {
        text: String,
        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Send a request and print the response body
    Request {
        /// Handler kind id on the server
        kind_id: u32,
        /// Request body (sent as UTF-8)
        body: String,
        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print inbound messages until Ctrl+C
    Listen,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Load config file.
    let config_path = cli.config.clone().map(PathBuf::from).unwrap_or_else(|| {
        let home = dirs::home_dir().unwrap_or_default();
        home.join(".netx").join("config.toml")
    });
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("netx: {e:#}");
            std::process::exit(1);
        }
    };

    let client_config = match cfg.client_config(
        cli.host.as_deref(),
        cli.port,
        cli.algorithm.as_deref(),
    ) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("netx: {e:#}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Send { text } => commands::send::run_send(client_config, &text).await,
        Command::SendAwait { text, timeout_ms } => {
            commands::send::run_send_await(client_config, &text, timeout_ms).await
        }
        Command::Request {
            kind_id,
            body,
            timeout_ms,
        } => commands::request::run(client_config, kind_id, &body, timeout_ms).await,
        Command::Listen => commands::listen::run(client_config).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("netx: {e:#}");
        std::process::exit(1);
    }
}
