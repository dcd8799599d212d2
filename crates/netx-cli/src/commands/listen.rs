//! `netx listen`: print inbound messages until interrupted.

use anyhow::{Context, Result};
use netx_client::ClientConfig;
use tokio::sync::mpsc;

pub async fn run(config: ClientConfig) -> Result<()> {
    let client = super::connect(config).await?;
    eprintln!("listening as session {} (Ctrl+C to stop)", client.session_id());

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    client.on_packet_received(move |text, _| {
        let _ = tx.send(text.clone());
    });

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(250));
    loop {
        tokio::select! {
            Some(text) = rx.recv() => println!("{text}"),
            _ = ticker.tick() => {
                if !client.is_open() {
                    eprintln!("session closed by server");
                    break;
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                break;
            }
        }
    }

    client.close().await;
    Ok(())
}
