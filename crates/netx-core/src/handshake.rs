//! Handshake primitives shared by the accept and connect sides.
//!
//! The server sends the session id as plain text, both sides derive the
//! session key from that text, and the client answers with its protocol
//! version under encryption.
//!
//! The key seed travels in the clear, so this bootstraps a cipher without
//! an extra round trip but gives no confidentiality against anyone who saw
//! the first frame.

use crate::cipher::CipherAlgorithm;
use crate::error::{NetxError, NetxResult};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Protocol version exchanged after the cipher is active.
pub const PROTOCOL_VERSION: u32 = 1;

/// Number of leading session-id characters left out of the key seed.
pub const KEY_SEED_PREFIX_LEN: usize = 4;

/// Generate a random 128-bit session id.
pub fn generate_session_id() -> Uuid {
    uuid::Builder::from_random_bytes(rand::random()).into_uuid()
}

/// Canonical text form sent in the first handshake frame.
pub fn session_id_text(id: &Uuid) -> String {
    id.hyphenated().to_string()
}

/// Parse the first handshake frame back into a session id.
pub fn parse_session_id(payload: &[u8]) -> NetxResult<Uuid> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| NetxError::Protocol("session id is not valid UTF-8".into()))?;
    Uuid::parse_str(text)
        .map_err(|e| NetxError::Protocol(format!("malformed session id {text:?}: {e}")))
}

/// Derive the session key from the session-id text and the algorithm name.
///
/// `SHA-256(name || 0x00 || text[4..])`, truncated to the algorithm's key length.
pub fn derive_key(session_text: &str, algorithm: CipherAlgorithm) -> NetxResult<Vec<u8>> {
    let seed = session_text
        .get(KEY_SEED_PREFIX_LEN..)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| NetxError::Crypto("session id too short to seed a key".into()))?;

    let mut hasher = Sha256::new();
    hasher.update(algorithm.name().as_bytes());
    hasher.update([0u8]);
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();

    Ok(digest[..algorithm.key_len()].to_vec())
}

pub fn encode_version(version: u32) -> [u8; 4] {
    version.to_be_bytes()
}

pub fn decode_version(payload: &[u8]) -> NetxResult<u32> {
    let bytes: [u8; 4] = payload.try_into().map_err(|_| {
        NetxError::Protocol(format!(
            "protocol version must be 4 bytes, got {}",
            payload.len()
        ))
    })?;
    Ok(u32::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_text_round_trips() {
        let id = generate_session_id();
        let text = session_id_text(&id);
        assert_eq!(text.len(), 36);
        assert_eq!(parse_session_id(text.as_bytes()).unwrap(), id);
    }

    #[test]
    fn session_ids_are_distinct() {
        assert_ne!(generate_session_id(), generate_session_id());
    }

    #[test]
    fn malformed_session_id_is_protocol_error() {
        assert!(matches!(
            parse_session_id(b"not-a-uuid"),
            Err(NetxError::Protocol(_))
        ));
        assert!(parse_session_id(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        let text = session_id_text(&generate_session_id());
        let server = derive_key(&text, CipherAlgorithm::Aes256Gcm).unwrap();
        let client = derive_key(&text, CipherAlgorithm::Aes256Gcm).unwrap();
        assert_eq!(server, client);
        assert_eq!(server.len(), 32);
    }

    #[test]
    fn key_ignores_the_prefix() {
        let a = derive_key("aaaa-rest-of-id", CipherAlgorithm::Aes128Gcm).unwrap();
        let b = derive_key("bbbb-rest-of-id", CipherAlgorithm::Aes128Gcm).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn key_depends_on_algorithm() {
        let text = session_id_text(&generate_session_id());
        let gcm = derive_key(&text, CipherAlgorithm::Aes256Gcm).unwrap();
        let chacha = derive_key(&text, CipherAlgorithm::ChaCha20Poly1305).unwrap();
        assert_ne!(gcm, chacha);
    }

    #[test]
    fn short_seed_is_rejected() {
        assert!(matches!(
            derive_key("abcd", CipherAlgorithm::Aes256Gcm),
            Err(NetxError::Crypto(_))
        ));
    }

    #[test]
    fn version_encoding() {
        assert_eq!(encode_version(PROTOCOL_VERSION), [0, 0, 0, 1]);
        assert_eq!(decode_version(&[0, 0, 1, 0]).unwrap(), 256);
        assert!(decode_version(&[1, 2, 3]).is_err());
    }
}
