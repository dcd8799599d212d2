//! Correlated request/response messages.
//!
//! Both travel CBOR-encoded inside encrypted `Request`/`Response` frames.
//! A response always carries the correlation id of the request it answers.

use crate::error::NetxResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use uuid::Uuid;

/// Serialize a value into a CBOR buffer.
pub fn cbor_encode<T: Serialize>(value: &T) -> NetxResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer)?;
    Ok(buffer)
}

/// Decode a CBOR buffer into a typed value.
pub fn cbor_decode<T: DeserializeOwned>(data: &[u8]) -> NetxResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

/// A request routed to a handler by `kind_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    correlation_id: Uuid,
    kind_id: u32,
    /// Never encoded; the receiving session stamps it.
    #[serde(skip)]
    sender: Option<Uuid>,
    body: Vec<u8>,
}

impl Request {
    /// Create a request with a fresh correlation id.
    pub fn new(kind_id: u32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            kind_id,
            sender: None,
            body: body.into(),
        }
    }

    /// Create a request whose body is a CBOR-encoded value.
    pub fn with_body<T: Serialize>(kind_id: u32, body: &T) -> NetxResult<Self> {
        Ok(Self::new(kind_id, cbor_encode(body)?))
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn kind_id(&self) -> u32 {
        self.kind_id
    }

    /// Session id of the peer that sent this request, as stamped by the receiver.
    pub fn sender(&self) -> Option<Uuid> {
        self.sender
    }

    /// Stamp the sender. Only the first call has any effect.
    pub fn set_sender(&mut self, sender: Uuid) {
        if self.sender.is_none() {
            self.sender = Some(sender);
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the body as a CBOR value.
    pub fn body_as<T: DeserializeOwned>(&self) -> NetxResult<T> {
        cbor_decode(&self.body)
    }
}

/// The answer to a `Request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    correlation_id: Uuid,
    sender: Option<Uuid>,
    kind_id: u32,
    body: Vec<u8>,
    error: Option<String>,
}

impl Response {
    /// Answer `request` with a body.
    pub fn new(request: &Request, body: impl Into<Vec<u8>>) -> Self {
        Self {
            correlation_id: request.correlation_id,
            sender: request.sender,
            kind_id: request.kind_id,
            body: body.into(),
            error: None,
        }
    }

    /// Answer `request` with a CBOR-encoded value.
    pub fn with_body<T: Serialize>(request: &Request, body: &T) -> NetxResult<Self> {
        Ok(Self::new(request, cbor_encode(body)?))
    }

    /// Synthetic error response for a request that could not complete.
    pub fn error(request: &Request, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(request, Vec::new())
        }
    }

    /// Turn this response into an error reply, dropping its body.
    pub fn into_error(self, message: impl Into<String>) -> Self {
        Self {
            body: Vec::new(),
            error: Some(message.into()),
            ..self
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn sender(&self) -> Option<Uuid> {
        self.sender
    }

    pub fn kind_id(&self) -> u32 {
        self.kind_id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> NetxResult<T> {
        cbor_decode(&self.body)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

pub fn encode_request(request: &Request) -> NetxResult<Vec<u8>> {
    cbor_encode(request)
}

pub fn decode_request(data: &[u8]) -> NetxResult<Request> {
    cbor_decode(data)
}

pub fn encode_response(response: &Response) -> NetxResult<Vec<u8>> {
    cbor_encode(response)
}

pub fn decode_response(data: &[u8]) -> NetxResult<Response> {
    cbor_decode(data)
}
