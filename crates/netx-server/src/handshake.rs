//! Accept side of the session handshake.
//!
//! ```text
//! server                          client
//!   | -- Type(session id text) -->  |   plain
//!   |    both derive key, open      |
//!   | <-- Type(version u32 BE) ---  |   encrypted
//! ```

use netx_core::handshake::{decode_version, derive_key, session_id_text};
use netx_core::{CipherAlgorithm, ConnectionHandler, NetxError, NetxResult, SignalKind, Uuid};
use tracing::debug;

/// Run the handshake on a freshly accepted connection.
///
/// On success the connection is open under `session_id`. Any error leaves
/// it for the caller to close; nothing is registered here.
pub async fn accept_handshake<T>(
    conn: &ConnectionHandler<T>,
    session_id: Uuid,
    algorithm: CipherAlgorithm,
    expected_version: u32,
) -> NetxResult<()> {
    conn.open_raw()?;
    conn.set_session_id(session_id);

    let text = session_id_text(&session_id);
    conn.protocol_write(SignalKind::Type, text.as_bytes()).await?;

    let key = derive_key(&text, algorithm)?;
    conn.open(&key)?;

    let frame = conn.read().await?;
    if frame.signal()? != SignalKind::Type {
        return Err(NetxError::Protocol(format!(
            "expected protocol version frame, got kind {:#04x}",
            frame.kind
        )));
    }
    let version = decode_version(&frame.payload)?;
    if version != expected_version {
        return Err(NetxError::Protocol(format!(
            "protocol version mismatch: expected {expected_version}, got {version}"
        )));
    }

    debug!(session_id = %session_id, version, "handshake complete");
    Ok(())
}
