//! Pluggable application payload codecs for `Type` frames.

use crate::error::{NetxError, NetxResult};
use crate::message::{cbor_decode, cbor_encode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Converts between wire bytes and application values.
pub trait PayloadCodec: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Bytes to value.
    fn compile(&self, buffer: &[u8]) -> NetxResult<Self::Item>;

    /// Value to bytes.
    fn decompile(&self, item: &Self::Item) -> NetxResult<Vec<u8>>;
}

/// Passes bytes through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl PayloadCodec for BytesCodec {
    type Item = Vec<u8>;

    fn compile(&self, buffer: &[u8]) -> NetxResult<Vec<u8>> {
        Ok(buffer.to_vec())
    }

    fn decompile(&self, item: &Vec<u8>) -> NetxResult<Vec<u8>> {
        Ok(item.clone())
    }
}

/// UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl PayloadCodec for TextCodec {
    type Item = String;

    fn compile(&self, buffer: &[u8]) -> NetxResult<String> {
        String::from_utf8(buffer.to_vec())
            .map_err(|e| NetxError::Compilation(format!("payload is not UTF-8: {e}")))
    }

    fn decompile(&self, item: &String) -> NetxResult<Vec<u8>> {
        Ok(item.as_bytes().to_vec())
    }
}

/// Structured payloads encoded as CBOR.
pub struct CborCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> CborCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for CborCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PayloadCodec for CborCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Item = T;

    fn compile(&self, buffer: &[u8]) -> NetxResult<T> {
        cbor_decode(buffer)
    }

    fn decompile(&self, item: &T) -> NetxResult<Vec<u8>> {
        cbor_encode(item)
    }
}

/// Structured payloads encoded as JSON, for peers that prefer a text format.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PayloadCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Item = T;

    fn compile(&self, buffer: &[u8]) -> NetxResult<T> {
        Ok(serde_json::from_slice(buffer)?)
    }

    fn decompile(&self, item: &T) -> NetxResult<Vec<u8>> {
        Ok(serde_json::to_vec(item)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Position {
        x: i32,
        y: i32,
        label: String,
    }

    #[test]
    fn bytes_are_identity() {
        let codec = BytesCodec;
        let data = vec![0u8, 1, 2, 255];
        assert_eq!(codec.compile(&codec.decompile(&data).unwrap()).unwrap(), data);
    }

    #[test]
    fn text_rejects_invalid_utf8() {
        let codec = TextCodec;
        assert_eq!(codec.compile("héllo".as_bytes()).unwrap(), "héllo");
        assert!(matches!(
            codec.compile(&[0xc3, 0x28]),
            Err(NetxError::Compilation(_))
        ));
    }

    #[test]
    fn structured_codecs_preserve_values() {
        let value = Position {
            x: -4,
            y: 12,
            label: "spawn".into(),
        };

        let cbor = CborCodec::<Position>::new();
        assert_eq!(cbor.compile(&cbor.decompile(&value).unwrap()).unwrap(), value);

        let json = JsonCodec::<Position>::new();
        let wire = json.decompile(&value).unwrap();
        assert!(std::str::from_utf8(&wire).unwrap().contains("\"spawn\""));
        assert_eq!(json.compile(&wire).unwrap(), value);
    }

    #[test]
    fn structured_codec_reports_shape_mismatch() {
        let json = JsonCodec::<Position>::new();
        assert!(matches!(
            json.compile(br#"{"x":1}"#),
            Err(NetxError::Compilation(_))
        ));
    }
}
