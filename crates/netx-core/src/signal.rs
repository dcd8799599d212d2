//! Signal kinds carried in the one-byte tag of every frame.

use crate::error::{NetxError, NetxResult};

/// Numeric signal tags. Values are powers of two on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignalKind {
    Type = 0x01,
    Request = 0x02,
    Response = 0x04,
    Close = 0x08,
}

impl SignalKind {
    /// Parse a wire tag, failing with a protocol error on unknown values.
    pub fn from_wire(tag: u8) -> NetxResult<Self> {
        Self::try_from(tag)
            .map_err(|tag| NetxError::Protocol(format!("unrecognized signal kind 0x{tag:02x}")))
    }
}

impl From<SignalKind> for u8 {
    fn from(kind: SignalKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for SignalKind {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0x01 => Ok(Self::Type),
            0x02 => Ok(Self::Request),
            0x04 => Ok(Self::Response),
            0x08 => Ok(Self::Close),
            other => Err(other),
        }
    }
}
