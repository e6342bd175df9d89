//! Live, socket-backed implementation of the engine request interface.

use axum::{body::Body, extract::Request, http::HeaderMap};
use futures::{StreamExt, TryStreamExt};
use session_relay_core::{HeaderValue, Headers, RelayRequest, http::BodyStream};

/// An incoming axum request seen through [`RelayRequest`].
pub struct HttpRequest {
    method: String,
    url: String,
    headers: Headers,
    body: Option<Body>,
}

impl HttpRequest {
    /// Wrap an axum request. The body is streamed, not buffered.
    #[must_use]
    pub fn new(request: Request) -> Self {
        let (parts, body) = request.into_parts();
        let url = parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);
        Self {
            method: parts.method.as_str().to_string(),
            url,
            headers: collect_headers(&parts.headers),
            body: Some(body),
        }
    }
}

/// Lower-cased names; repeated headers become arrays.
fn collect_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match headers.get_mut(name.as_str()) {
            Some(existing) => existing.push(value),
            None => {
                headers.insert(name.as_str().to_string(), HeaderValue::One(value));
            }
        }
    }
    headers
}

impl RelayRequest for HttpRequest {
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
            Some(body) => body.into_data_stream().map_err(std::io::Error::other).boxed(),
            None => futures::stream::empty().boxed(),
        }
    }
}
