//! Envelope codec for requests and responses crossing the broker.
//!
//! Envelopes are JSON with camelCase keys. UTF-8 bodies travel as plain
//! strings; anything else is base64 encoded and tagged with
//! `bodyEncoding`, so bodies round-trip byte-for-byte.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::{RelayRequest, read_body};

/// A header value: single or repeated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    One(String),
    Many(Vec<String>),
}

impl HeaderValue {
    /// Append another value for the same header name.
    pub fn push(&mut self, value: String) {
        match self {
            Self::One(first) => {
                let first = std::mem::take(first);
                *self = Self::Many(vec![first, value]);
            }
            Self::Many(values) => values.push(value),
        }
    }

    /// All values in arrival order.
    #[must_use]
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::One(v) => vec![v.as_str()],
            Self::Many(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    /// First value, if any.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::One(v) => Some(v),
            Self::Many(vs) => vs.first().map(String::as_str),
        }
    }
}

/// Request headers keyed by lower-cased name.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Envelope codec error.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid body encoding: {0}")]
    Body(#[from] base64::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BodyEncoding {
    Base64,
}

fn encode_body(body: &[u8]) -> (String, Option<BodyEncoding>) {
    match std::str::from_utf8(body) {
        Ok(text) => (text.to_owned(), None),
        Err(_) => (BASE64.encode(body), Some(BodyEncoding::Base64)),
    }
}

fn decode_body(body: String, encoding: Option<BodyEncoding>) -> Result<Bytes, EnvelopeError> {
    match encoding {
        None => Ok(Bytes::from(body)),
        Some(BodyEncoding::Base64) => Ok(Bytes::from(BASE64.decode(body)?)),
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestWire {
    request_id: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body_encoding: Option<BodyEncoding>,
    #[serde(default)]
    headers: Headers,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseWire {
    status: u16,
    #[serde(default)]
    body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body_encoding: Option<BodyEncoding>,
}

/// Snapshot of a follow-up HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Fresh id correlating this request with its response channel.
    pub request_id: String,
    /// Path and query of the original request.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Raw body.
    pub body: Bytes,
    /// Original headers.
    pub headers: Headers,
}

impl RequestEnvelope {
    /// Snapshot a live request, draining its body.
    ///
    /// # Errors
    /// Returns error if the body stream fails.
    pub async fn capture(
        request_id: impl Into<String>,
        request: &mut dyn RelayRequest,
    ) -> Result<Self, std::io::Error> {
        let body = read_body(request).await?;
        Ok(Self {
            request_id: request_id.into(),
            url: request.url().to_string(),
            method: request.method().to_string(),
            body,
            headers: request.headers().clone(),
        })
    }

    /// Serialize for publishing.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        let (body, body_encoding) = encode_body(&self.body);
        let wire = RequestWire {
            request_id: self.request_id.clone(),
            url: self.url.clone(),
            method: self.method.clone(),
            body,
            body_encoding,
            headers: self.headers.clone(),
        };
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    /// Parse a published payload.
    ///
    /// # Errors
    /// Returns error if the payload is not a valid request envelope.
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let wire: RequestWire = serde_json::from_slice(payload)?;
        Ok(Self {
            request_id: wire.request_id,
            url: wire.url,
            method: wire.method,
            body: decode_body(wire.body, wire.body_encoding)?,
            headers: wire.headers,
        })
    }
}

/// Outcome of a follow-up request, produced by the session owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    /// HTTP status code.
    pub status: u16,
    /// Raw body.
    pub body: Bytes,
}

impl ResponseEnvelope {
    /// Create a response envelope.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Serialize for publishing.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        let (body, body_encoding) = encode_body(&self.body);
        let wire = ResponseWire {
            status: self.status,
            body,
            body_encoding,
        };
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    /// Parse a published payload.
    ///
    /// # Errors
    /// Returns error if the payload is not a valid response envelope.
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let wire: ResponseWire = serde_json::from_slice(payload)?;
        Ok(Self {
            status: wire.status,
            body: decode_body(wire.body, wire.body_encoding)?,
        })
    }
}
