//! The response model (spec §4.5).

use std::pin::Pin;
use bytes::Bytes;
use futures_util::Stream;
use hyper::{HeaderMap, Method, StatusCode};
use hyper::header::{HeaderName, HeaderValue};
use crate::error::WebError;
use crate::registry::{BodyValue, ContentType, Registry};
use crate::request::Request;
use crate::utils::http::{format_http_date, EtagsIter};

/// Hop-by-hop headers HTTP/2 forbids (spec §4.5, point 4).
const HOP_BY_HOP: &[&str] = &[
    "connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade",
];

/// A response under construction: status, headers, and a body that's
/// either already bytes or still a domain value waiting on the registry
/// to serialize it.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Response {
    /// `(status, body?, headers?)`. The body is classified per spec §4.5:
    /// absent → empty; bytes → `application/octet-stream`; anything else
    /// is run through `registry` with the caller's or a default content
    /// type, which may itself rewrite the content type (e.g. multipart
    /// regenerating its boundary).
    pub fn new(
        status: StatusCode,
        body: Option<BodyValue>,
        headers: HeaderMap,
        content_type: Option<ContentType>,
        registry: &Registry,
    ) -> Result<Self, WebError> {
        let mut headers = headers;
        let body = match body {
            None => None,
            Some(BodyValue::Bytes(bytes)) => {
                set_default_content_type(&mut headers, "application/octet-stream");
                Some(bytes)
            }
            Some(BodyValue::Text(text)) => {
                set_default_content_type(&mut headers, "text/plain");
                Some(Bytes::from(text))
            }
            Some(other) => {
                let (bytes, negotiated) = registry.serialize(&other, content_type)?;
                headers.insert(
                    hyper::header::CONTENT_TYPE,
                    HeaderValue::from_str(&negotiated.to_string()).map_err(|_| {
                        WebError::internal_server_error("invalid negotiated content type")
                    })?,
                );
                Some(bytes)
            }
        };

        if let Some(bytes) = &body {
            headers.insert(
                hyper::header::CONTENT_LENGTH,
                HeaderValue::from_str(&bytes.len().to_string()).unwrap(),
            );
        }

        Ok(Response { status, headers, body })
    }

    pub fn empty(status: StatusCode) -> Self {
        Response { status, headers: HeaderMap::new(), body: None }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    /// The single pass spec §4.5 runs "just before writing to the wire":
    /// conditional-304, HEAD-stripping, request-id echo, hop-by-hop
    /// stripping for HTTP/2.
    pub fn finalize_for_wire(
        mut self,
        method: &Method,
        request: &Request,
        return_request_id: Option<&str>,
        is_http2: bool,
    ) -> Self {
        if matches!(*method, Method::GET | Method::HEAD)
            && self.status == StatusCode::OK
            && self.is_not_modified(request)
        {
            self.status = StatusCode::NOT_MODIFIED;
            self.body = None;
            self.headers.remove(hyper::header::CONTENT_LENGTH);
        }

        if *method == Method::HEAD {
            self.body = None;
        }

        if let Some(header_name) = return_request_id {
            if !self.headers.contains_key(header_name) {
                if let Ok(name) = HeaderName::from_bytes(header_name.as_bytes()) {
                    if let Ok(value) = HeaderValue::from_str(request.id()) {
                        self.headers.insert(name, value);
                    }
                }
            }
        }

        if is_http2 {
            for name in HOP_BY_HOP {
                self.headers.remove(*name);
            }
        }

        self
    }

    /// Grounded directly in the teacher's `targets::http::SourceData`
    /// conditional-GET check: compares `etag` against every tag in
    /// `if-none-match`, falling back to `if-modified-since` against
    /// `last-modified`.
    fn is_not_modified(&self, request: &Request) -> bool {
        let etag = match self.headers.get(hyper::header::ETAG).and_then(|v| v.to_str().ok()) {
            Some(etag) => etag,
            None => return false,
        };

        if let Ok(if_none_match) = request.header("if-none-match", None, true) {
            if if_none_match.trim() == "*" {
                return true
            }
            return EtagsIter::new(&if_none_match).any(|candidate| candidate == etag)
        }

        if let (Ok(if_modified_since), Some(last_modified)) = (
            request.header("if-modified-since", None, true),
            self.headers.get(hyper::header::LAST_MODIFIED).and_then(|v| v.to_str().ok()),
        ) {
            if let (Some(requested), Some(actual)) = (
                crate::utils::http::parse_http_date(&if_modified_since),
                crate::utils::http::parse_http_date(last_modified),
            ) {
                return actual <= requested
            }
        }

        false
    }
}

//------------ ResponseStream ----------------------------------------------------

/// A response whose body is a live byte stream rather than an already-
/// buffered `Bytes`, independent of [`crate::eventstream::EventStream`]'s
/// SSE-specific framing (spec §4.5: "a response body is bytes or stream").
///
/// There is no wire-level convention for signalling a mid-stream failure
/// outside of SSE's `event: error` record, so a stream item of `Err`
/// simply ends the response at that point (see
/// `server::wire_byte_stream_response`) rather than trying to recover.
pub struct ResponseStream {
    status: StatusCode,
    headers: HeaderMap,
    body: Pin<Box<dyn Stream<Item = Result<Bytes, WebError>> + Send>>,
}

impl ResponseStream {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: impl Stream<Item = Result<Bytes, WebError>> + Send + 'static,
    ) -> Self {
        ResponseStream { status, headers, body: Box::pin(body) }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = Result<Bytes, WebError>> + Send>> {
        self.body
    }
}

fn set_default_content_type(headers: &mut HeaderMap, value: &str) {
    if !headers.contains_key(hyper::header::CONTENT_TYPE) {
        headers.insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static_safe(value));
    }
}

trait HeaderValueExt {
    fn from_static_safe(value: &str) -> HeaderValue;
}

impl HeaderValueExt for HeaderValue {
    fn from_static_safe(value: &str) -> HeaderValue {
        HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static("text/plain"))
    }
}

/// Timestamp formatting for an `etag`/`last-modified` pair, used by
/// callers that build responses from something with a modification time.
pub fn format_last_modified(date: chrono::DateTime<chrono::Utc>) -> String {
    format_http_date(date)
}
