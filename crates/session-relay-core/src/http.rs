//! Request/response interfaces seen by the protocol engine.
//!
//! The engine reads requests through [`RelayRequest`] and answers through
//! [`ResponseSink`], so it never learns whether a message came from a
//! live socket or from a broker envelope. This module holds the
//! envelope-backed implementations; live ones belong to the transport.

use bytes::{Bytes, BytesMut};
use futures::{StreamExt, future, stream::BoxStream};

use crate::envelope::{HeaderValue, Headers, RequestEnvelope, ResponseEnvelope};

/// Request body as a stream of chunks.
pub type BodyStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Read side of an incoming request.
pub trait RelayRequest: Send {
    /// HTTP method.
    fn method(&self) -> &str;

    /// Path and query.
    fn url(&self) -> &str;

    /// Headers keyed by lower-cased name.
    fn headers(&self) -> &Headers;

    /// Take the body stream. Later calls yield an empty stream.
    fn take_body(&mut self) -> BodyStream;

    /// First value of a header, case-insensitive.
    fn header(&self, name: &str) -> Option<&str> {
        self.headers()
            .get(&name.to_ascii_lowercase())
            .and_then(HeaderValue::first)
    }
}

/// Write side of a response.
pub trait ResponseSink: Send {
    /// Complete the response with a status and body.
    fn write(&mut self, status: u16, body: Bytes);
}

/// Drain a request body into memory.
///
/// # Errors
/// Returns error if the body stream yields one.
pub async fn read_body(request: &mut dyn RelayRequest) -> Result<Bytes, std::io::Error> {
    let mut stream = request.take_body();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Request reconstructed from a [`RequestEnvelope`].
///
/// The body stream yields the envelope body once, then ends.
#[derive(Debug)]
pub struct EnvelopeRequest {
    request_id: String,
    method: String,
    url: String,
    headers: Headers,
    body: Option<Bytes>,
}

impl EnvelopeRequest {
    /// Rebuild a request from an envelope.
    #[must_use]
    pub fn new(envelope: RequestEnvelope) -> Self {
        Self {
            request_id: envelope.request_id,
            method: envelope.method,
            url: envelope.url,
            headers: envelope.headers,
            body: Some(envelope.body),
        }
    }

    /// Correlation id of the originating envelope.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl RelayRequest for EnvelopeRequest {
    fn method(&self) -> &str {
        &self.method
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn take_body(&mut self) -> BodyStream {
        match self.body.take() {
            Some(body) if !body.is_empty() => {
                futures::stream::once(future::ready(Ok(body))).boxed()
            }
            _ => futures::stream::empty().boxed(),
        }
    }
}

/// Response that records its outcome in memory instead of a socket.
#[derive(Debug, Default)]
pub struct CapturedResponse {
    status: Option<u16>,
    body: Bytes,
}

impl CapturedResponse {
    /// Create an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Captured status, if anything was written.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    /// Captured body.
    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    /// Convert into a response envelope, if anything was written.
    #[must_use]
    pub fn into_envelope(self) -> Option<ResponseEnvelope> {
        self.status.map(|status| ResponseEnvelope::new(status, self.body))
    }
}

impl ResponseSink for CapturedResponse {
    fn write(&mut self, status: u16, body: Bytes) {
        if self.status.is_some() {
            tracing::debug!(status, "response already written, ignoring");
            return;
        }
        self.status = Some(status);
        self.body = body;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(body: &'static [u8]) -> RequestEnvelope {
        let mut headers = Headers::new();
        headers.insert(
            "content-type".into(),
            HeaderValue::One("application/json".into()),
        );
        RequestEnvelope {
            request_id: "r-1".into(),
            url: "/message?sessionId=s-1".into(),
            method: "POST".into(),
            body: Bytes::from_static(body),
            headers,
        }
    }

    #[tokio::test]
    async fn test_envelope_request_reads_like_a_live_request() {
        let mut request = EnvelopeRequest::new(envelope(b"{\"id\":1}"));
        assert_eq!(request.method(), "POST");
        assert_eq!(request.url(), "/message?sessionId=s-1");
        assert_eq!(request.header("Content-Type"), Some("application/json"));
        assert_eq!(request.request_id(), "r-1");

        let body = read_body(&mut request).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"{\"id\":1}"));

        // Body is consumed after the first read.
        let again = read_body(&mut request).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_empty_body_ends_immediately() {
        let mut request = EnvelopeRequest::new(envelope(b""));
        let mut stream = request.take_body();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_capture_from_request_interface() {
        let mut request = EnvelopeRequest::new(envelope(b"payload"));
        let snapshot = RequestEnvelope::capture("r-9", &mut request).await.unwrap();
        assert_eq!(snapshot.request_id, "r-9");
        assert_eq!(snapshot.body, Bytes::from_static(b"payload"));
        assert_eq!(snapshot.method, "POST");
    }

    #[test]
    fn test_captured_response_keeps_first_write() {
        let mut response = CapturedResponse::new();
        assert!(response.status().is_none());

        response.write(202, Bytes::from_static(b"Accepted"));
        response.write(500, Bytes::from_static(b"late"));

        assert_eq!(response.status(), Some(202));
        assert_eq!(
            response.into_envelope(),
            Some(ResponseEnvelope::new(202, "Accepted"))
        );
    }

    #[test]
    fn test_unwritten_response_has_no_envelope() {
        assert!(CapturedResponse::new().into_envelope().is_none());
    }
}
