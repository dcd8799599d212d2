//! netx-core: Shared protocol library for netx.
//!
//! Provides the wire framing, per-session AEAD cipher, connection state
//! machine, handshake primitives, request/response model, payload codecs,
//! observer and handler registries, and the dispatch loop used by both the
//! client and the server.

pub mod cipher;
pub mod codec;
pub mod connection;
pub mod correlation;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod handlers;
pub mod handshake;
pub mod message;
pub mod observers;
pub mod signal;

// Re-export commonly used items at crate root.
pub use cipher::{CipherAlgorithm, SessionCipher};
pub use codec::{BytesCodec, CborCodec, JsonCodec, PayloadCodec, TextCodec};
pub use connection::{ConnectionHandler, ConnectionOptions, ConnectionState};
pub use endpoint::{DispatchExit, Endpoint, SessionRole, DEFAULT_TIMEOUT_MS};
pub use error::{NetxError, NetxResult};
pub use frame::{Frame, FrameReader, FrameWriter};
pub use handlers::{handler_async, handler_fn, HandlerRegistry, RequestHandler};
pub use handshake::PROTOCOL_VERSION;
pub use message::{Request, Response};
pub use observers::{ListenerKey, Observers};
pub use signal::SignalKind;
pub use uuid::Uuid;
