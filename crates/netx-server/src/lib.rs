//! netx-server: session-hosting server for the netx protocol.
//!
//! Accepts TCP connections, runs the accept side of the handshake, keeps a
//! registry of open sessions and serves each one with its own dispatch task.

pub mod config;
pub mod handshake;
pub mod registry;
pub mod server;

pub use config::ServerConfig;
pub use registry::{BroadcastReport, SessionRegistry};
pub use server::Server;
