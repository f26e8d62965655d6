//! The error taxonomy (spec §7).
//!
//! Every fallible operation in this crate returns a [`WebError`]. Rather
//! than a hierarchy of trait objects, the taxonomy is a single enum with a
//! status code, a message, and an optional set of response headers — the
//! same flat-enum-over-trait-object preference the teacher shows for
//! `comms::Terminated`.

use std::fmt;
use std::io;
use hyper::StatusCode;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};

//------------ WebError -------------------------------------------------------

/// A deliberate HTTP-level outcome, or a lower-level failure mapped to one.
#[derive(Debug, Clone)]
pub struct WebError {
    status: StatusCode,
    message: String,
    headers: HeaderMap,
    kind: ErrorKind,
}

/// Which taxonomy bucket produced this error.
///
/// Kept distinct from `status` because a handler's `catch` or the
/// service-wide error handler may want to branch on *why* a request failed,
/// not just what code came out the other end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Web,
    AuthScheme,
    Parser,
    Io,
    NotFound,
    PayloadTooLarge,
    MethodNotAllowed,
}

impl WebError {
    /// Builds a plain `web-error` with the given status and message.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        WebError {
            status,
            message: message.into(),
            headers: HeaderMap::new(),
            kind: ErrorKind::Web,
        }
    }

    fn kinded(
        status: StatusCode, kind: ErrorKind, message: impl Into<String>,
    ) -> Self {
        WebError { status, message: message.into(), headers: HeaderMap::new(), kind }
    }

    pub fn not_found() -> Self {
        Self::kinded(StatusCode::NOT_FOUND, ErrorKind::NotFound, "Not Found")
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::kinded(StatusCode::BAD_REQUEST, ErrorKind::Web, message)
    }

    pub fn unprocessable_entity(message: impl Into<String>) -> Self {
        Self::kinded(
            StatusCode::UNPROCESSABLE_ENTITY, ErrorKind::Web, message
        )
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::kinded(
            StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Web, message
        )
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Self::kinded(
            StatusCode::UNSUPPORTED_MEDIA_TYPE, ErrorKind::Parser, message
        )
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::kinded(
            StatusCode::UNSUPPORTED_MEDIA_TYPE, ErrorKind::Parser, message
        )
    }

    pub fn payload_too_large(max: u64) -> Self {
        Self::kinded(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::PayloadTooLarge,
            format!("Maximum payload size is {} bytes", max),
        )
    }

    /// A `405 Method Not Allowed` with the mandatory `Allow` header.
    pub fn method_not_allowed(allow: &str) -> Self {
        Self::kinded(
            StatusCode::METHOD_NOT_ALLOWED,
            ErrorKind::MethodNotAllowed,
            "Method Not Allowed",
        ).with_header(hyper::header::ALLOW, allow)
    }

    /// A `401` carrying the scheme's `WWW-Authenticate` challenge.
    pub fn auth_scheme_error(
        message: impl Into<String>, challenge: Option<String>,
    ) -> Self {
        let mut err = Self::kinded(
            StatusCode::UNAUTHORIZED, ErrorKind::AuthScheme, message
        );
        if let Some(challenge) = challenge {
            err = err.with_header(hyper::header::WWW_AUTHENTICATE, challenge);
        }
        err
    }

    pub fn io_error(err: io::Error) -> Self {
        Self::kinded(
            StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Io, err.to_string()
        )
    }

    /// Attaches (or overwrites) a response header on this error.
    pub fn with_header(
        mut self, name: HeaderName, value: impl TryInto<HeaderValue>,
    ) -> Self {
        if let Ok(value) = value.try_into() {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn challenge(&self) -> Option<&str> {
        self.headers.get(hyper::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
    }
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for WebError {}

impl From<io::Error> for WebError {
    fn from(err: io::Error) -> Self {
        WebError::io_error(err)
    }
}
