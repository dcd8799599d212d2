//! Per-session symmetric cipher.
//!
//! A `SessionCipher` starts unopened and is keyed exactly once during the
//! handshake. Every sealed payload carries its own random nonce:
//! `[12-byte nonce][ciphertext][16-byte tag]`. A failed tag check is the
//! protocol's only integrity signal.

use crate::error::{NetxError, NetxResult};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Supported AEAD algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    /// Canonical configuration name, also mixed into key derivation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes128Gcm => "aes-128-gcm",
            Self::Aes256Gcm => "aes-256-gcm",
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    /// Required key length in bytes.
    pub fn key_len(&self) -> usize {
        self.aead().key_len()
    }

    /// Bytes a sealed payload adds to its plaintext (nonce and tag).
    pub fn sealed_overhead(&self) -> usize {
        NONCE_LEN + self.aead().tag_len()
    }

    fn aead(&self) -> &'static aead::Algorithm {
        match self {
            Self::Aes128Gcm => &aead::AES_128_GCM,
            Self::Aes256Gcm => &aead::AES_256_GCM,
            Self::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = NetxError;

    fn from_str(s: &str) -> NetxResult<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "aes-128-gcm" | "aes128gcm" => Ok(Self::Aes128Gcm),
            "aes-256-gcm" | "aes256gcm" | "aes" => Ok(Self::Aes256Gcm),
            "chacha20-poly1305" | "chacha20poly1305" | "chacha20" => Ok(Self::ChaCha20Poly1305),
            _ => Err(NetxError::Crypto(format!("unsupported cipher algorithm: {s}"))),
        }
    }
}

/// Independent sealing and opening contexts built from one key.
struct CipherContexts {
    sealing: LessSafeKey,
    opening: LessSafeKey,
}

/// Symmetric cipher for one session. Unopened until `open` succeeds.
pub struct SessionCipher {
    algorithm: CipherAlgorithm,
    contexts: OnceLock<CipherContexts>,
    rng: SystemRandom,
}

impl SessionCipher {
    pub fn new(algorithm: CipherAlgorithm) -> Self {
        Self {
            algorithm,
            contexts: OnceLock::new(),
            rng: SystemRandom::new(),
        }
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    pub fn is_open(&self) -> bool {
        self.contexts.get().is_some()
    }

    /// Key the cipher. Opening twice keeps the first key.
    pub fn open(&self, key: &[u8]) -> NetxResult<()> {
        if self.is_open() {
            return Ok(());
        }

        let contexts = CipherContexts {
            sealing: self.bind_key(key)?,
            opening: self.bind_key(key)?,
        };
        // A concurrent open that won the race already holds an equivalent key.
        let _ = self.contexts.set(contexts);
        Ok(())
    }

    fn bind_key(&self, key: &[u8]) -> NetxResult<LessSafeKey> {
        let unbound = UnboundKey::new(self.algorithm.aead(), key).map_err(|_| {
            NetxError::Crypto(format!(
                "invalid key for {}: expected {} bytes, got {}",
                self.algorithm,
                self.algorithm.key_len(),
                key.len()
            ))
        })?;
        Ok(LessSafeKey::new(unbound))
    }

    fn contexts(&self) -> NetxResult<&CipherContexts> {
        self.contexts
            .get()
            .ok_or_else(|| NetxError::Crypto("cipher not opened".into()))
    }

    /// Seal a plaintext buffer.
    pub fn encode(&self, plaintext: &[u8]) -> NetxResult<Vec<u8>> {
        let contexts = self.contexts()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| NetxError::Crypto("nonce generation failed".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        contexts
            .sealing
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| NetxError::Crypto("seal failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend(in_out);
        Ok(sealed)
    }

    /// Open a sealed buffer, failing on truncation or a bad tag.
    pub fn decode(&self, sealed: &[u8]) -> NetxResult<Vec<u8>> {
        let contexts = self.contexts()?;

        let tag_len = contexts.opening.algorithm().tag_len();
        if sealed.len() < NONCE_LEN + tag_len {
            return Err(NetxError::Crypto(format!(
                "ciphertext too short: {} bytes",
                sealed.len()
            )));
        }

        let (nonce_bytes, body) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| NetxError::Crypto("malformed nonce".into()))?;

        let mut in_out = body.to_vec();
        let plain_len = contexts
            .opening
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| NetxError::Crypto("integrity check failed".into()))?
            .len();
        in_out.truncate(plain_len);
        Ok(in_out)
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher")
            .field("algorithm", &self.algorithm)
            .field("open", &self.is_open())
            .finish()
    }
}
