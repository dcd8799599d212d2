//! netx-client: Rust client library for netx.
//!
//! Connects to a netx server over TCP, performs the session-key handshake
//! and exposes typed sends, awaits and correlated requests.
//!
//! # Quick Start
//!
//! ```no_run
//! use netx_client::{Client, ClientConfig};
//! use netx_core::{Request, TextCodec};
//!
//! # async fn example() -> netx_core::NetxResult<()> {
//! let client = Client::connect(ClientConfig::new("127.0.0.1", 4590), TextCodec).await?;
//!
//! client.send(&"hello".to_string()).await?;
//! let reply = client.send_and_await(&"ping".to_string(), None).await?;
//! println!("{reply:?}");
//!
//! let response = client.request(&Request::new(1, b"echo".to_vec()), None).await?;
//! println!("{response:?}");
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;

pub use client::{handshake_connect, Client, ClientConfig};

// Re-export netx-core error types for convenience.
pub use netx_core::{NetxError, NetxResult};
