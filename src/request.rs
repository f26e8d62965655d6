//! The request model (spec §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use bytes::Bytes;
use hyper::{HeaderMap, Method, Uri};
use hyper::header::{HeaderName, HeaderValue};
use rand::RngCore;
use tokio::sync::OnceCell;
use crate::blob::BlobStore;
use crate::config::Config;
use crate::error::WebError;
use crate::registry::{ContentType, ParsedBody, Registry};

//------------ Lifecycle --------------------------------------------------------

/// The shared closing/aborted signal a request was constructed with.
///
/// `closing` mirrors the server's own shutdown flag (spec §4.7: in-flight
/// requests can see the server is draining); `aborted` is flipped by the
/// connection layer when the peer goes away mid-request (a transport error
/// while reading the body, or the connection future itself erroring out).
/// Both are `Arc<AtomicBool>` so one flag can be shared across every
/// request a connection (or the whole server) carries, rather than each
/// `Request` owning an inert flag nothing outside it ever touches.
#[derive(Clone)]
pub struct Lifecycle {
    closing: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
}

impl Lifecycle {
    /// A fresh, unshared handle — used by default construction and tests
    /// that don't need to observe a real server's shutdown signal.
    pub fn new() -> Self {
        Lifecycle {
            closing: Arc::new(AtomicBool::new(false)),
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builds a handle over flags owned elsewhere, so a server can share
    /// its own `closing` signal and a connection's `aborted` signal across
    /// every request built on top of them.
    pub(crate) fn shared(closing: Arc<AtomicBool>, aborted: Arc<AtomicBool>) -> Self {
        Lifecycle { closing, aborted }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// An inbound request, reconstructed from trusted-proxy headers if the
/// embedder's [`Config`] says to, and carrying the machinery `body()` and
/// `Arguments` need: the media-type registry, the blob store, and a
/// memoization cell for the parsed body.
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    raw_body: Bytes,

    params: Mutex<HashMap<String, String>>,
    parsed_body: OnceCell<ParsedBody>,

    registry: Registry,
    blobs: Arc<dyn BlobStore>,

    id: String,
    lifecycle: Lifecycle,

    remote_addr: Option<String>,

    /// `config.max_content_length`, captured at construction as `body()`'s
    /// fallback when a caller doesn't pass its own limit.
    default_max_content_length: u64,
}

impl Request {
    /// Builds a request, applying the trust-flag reconstructions from
    /// `config` (`x-forwarded-*`, method override, request id adoption)
    /// before anything else sees it.
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        raw_body: Bytes,
        remote_addr: Option<String>,
        registry: Registry,
        blobs: Arc<dyn BlobStore>,
        config: &Config,
    ) -> Self {
        Self::with_lifecycle(
            method, uri, headers, raw_body, remote_addr, registry, blobs, config, Lifecycle::new(),
        )
    }

    /// Builds a request sharing the connection/server's own
    /// [`Lifecycle`] handle, rather than a fresh, always-false one (spec
    /// §4.3's `closing`/`aborted` flags). Used by [`crate::server::Server`]
    /// so a live request can observe a `stop()` in progress.
    pub(crate) fn with_lifecycle(
        method: Method,
        uri: Uri,
        mut headers: HeaderMap,
        raw_body: Bytes,
        remote_addr: Option<String>,
        registry: Registry,
        blobs: Arc<dyn BlobStore>,
        config: &Config,
        lifecycle: Lifecycle,
    ) -> Self {
        let method = if config.trust_method_override {
            method_override(&headers).unwrap_or(method)
        } else {
            method
        };

        let uri = if config.trust_forwarded_proto || config.trust_forwarded_host {
            rebuild_uri(&uri, &headers, config)
        } else {
            uri
        };

        let remote_addr = if config.trust_forwarded_for {
            forwarded_for(&headers).or(remote_addr)
        } else {
            remote_addr
        };

        let id = config.trust_request_id.as_deref()
            .and_then(|name| headers.get(name))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(generate_request_id);

        // Canonicalize header names to lower case ASCII; `HeaderMap` already
        // compares case-insensitively, but callers that format headers back
        // out (logging, `header()` concatenation) want a stable case.
        headers = canonicalize_headers(headers);

        Request {
            method,
            uri,
            headers,
            raw_body,
            params: Mutex::new(HashMap::new()),
            parsed_body: OnceCell::new(),
            registry,
            blobs,
            id,
            lifecycle,
            remote_addr,
            default_max_content_length: config.max_content_length,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn raw_headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The media-type registry this request was parsed through, for
    /// callers (the router's error/response finalization) that need to
    /// serialize a value without going through `body()`.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// `header(name, default?, concatenate?=true)`: multi-value headers
    /// are joined with `, ` unless `concatenate` is false, in which case
    /// the first value wins. Missing without a default is `bad-request`.
    pub fn header(
        &self, name: &str, default: Option<&str>, concatenate: bool,
    ) -> Result<String, WebError> {
        let mut values = self.headers.get_all(name).iter();
        let first = match values.next() {
            Some(value) => value,
            None => return default.map(str::to_string).ok_or_else(|| {
                WebError::bad_request(format!("missing header: {}", name))
            }),
        };
        let first = first.to_str().unwrap_or_default();
        if !concatenate {
            return Ok(first.to_string())
        }
        let mut joined = first.to_string();
        for value in values {
            joined.push_str(", ");
            joined.push_str(value.to_str().unwrap_or_default());
        }
        Ok(joined)
    }

    /// `param(name, default?)`: custom per-request parameters set by
    /// filters or the embedding application. Missing without a default is
    /// `internal-server-error` (spec §4.3: these are the framework's own
    /// bookkeeping, not client input, so a miss means a programming
    /// error).
    pub fn param(&self, name: &str, default: Option<&str>) -> Result<String, WebError> {
        self.params.lock().unwrap().get(name).cloned()
            .or_else(|| default.map(str::to_string))
            .ok_or_else(|| WebError::internal_server_error(format!(
                "missing request param: {}", name
            )))
    }

    pub fn set_param(&self, name: impl Into<String>, value: impl Into<String>) {
        self.params.lock().unwrap().insert(name.into(), value.into());
    }

    /// `body(content-type?, max-content-length?)`: enforces the size
    /// limit against the already-buffered body, then parses it through
    /// the registry, memoizing the result. Concurrent callers converge on
    /// the same `OnceCell`.
    pub async fn body(
        &self, content_type: Option<&str>, max_content_length: Option<u64>,
    ) -> Result<&ParsedBody, WebError> {
        self.parsed_body.get_or_try_init(|| async {
            let max = max_content_length.unwrap_or(self.default_max_content_length);
            if self.raw_body.len() as u64 > max {
                return Err(WebError::payload_too_large(max))
            }

            let content_type = match content_type {
                Some(value) => ContentType::parse(value),
                None => {
                    let header = self.header("content-type", Some("application/octet-stream"), false)?;
                    ContentType::parse(&header)
                }
            };

            self.registry.parse(self.raw_body.clone(), &content_type, self.blobs.as_ref())
        }).await
    }

    /// Peeks at the memoized parsed body without parsing it, for
    /// `Arguments`' `.name` lookups (spec §4.4: only meaningful "after
    /// `body()` is called").
    pub fn parsed_body_peek(&self) -> Option<&ParsedBody> {
        self.parsed_body.get()
    }

    /// Runs all finalizers registered by a prior `body()` parse,
    /// concurrently, propagating only the first error.
    pub async fn close(&self) -> Result<(), WebError> {
        let finalizers = match self.parsed_body.get() {
            Some(parsed) => parsed.finalizers.clone(),
            None => return Ok(()),
        };
        let results = futures_util::future::join_all(
            finalizers.iter().map(|finalizer| finalizer.finalize())
        ).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Whether the server this request arrived through has started
    /// draining (spec §4.3: visible to a handler mid-request as a hint to
    /// wrap up).
    pub fn closing(&self) -> bool {
        self.lifecycle.closing.load(Ordering::Relaxed)
    }

    pub fn mark_closing(&self) {
        self.lifecycle.closing.store(true, Ordering::Relaxed);
    }

    /// Whether the peer connection ended before this request finished
    /// (a transport error while reading the body, or the connection
    /// future itself erroring out).
    pub fn aborted(&self) -> bool {
        self.lifecycle.aborted.load(Ordering::Relaxed)
    }

    pub fn mark_aborted(&self) {
        self.lifecycle.aborted.store(true, Ordering::Relaxed);
    }
}

fn method_override(headers: &HeaderMap) -> Option<Method> {
    headers.get("x-http-method-override")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Method::from_bytes(v.as_bytes()).ok())
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers.get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
}

fn rebuild_uri(uri: &Uri, headers: &HeaderMap, config: &Config) -> Uri {
    let scheme = if config.trust_forwarded_proto {
        headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok())
    } else {
        None
    }.or_else(|| uri.scheme_str());

    let authority = if config.trust_forwarded_host {
        headers.get("x-forwarded-host").and_then(|v| v.to_str().ok())
    } else {
        None
    }.or_else(|| uri.authority().map(|a| a.as_str()));

    match (scheme, authority) {
        (Some(scheme), Some(authority)) => {
            let path_and_query = uri.path_and_query()
                .map(|p| p.as_str())
                .unwrap_or("/");
            format!("{}://{}{}", scheme, authority, path_and_query)
                .parse()
                .unwrap_or_else(|_| uri.clone())
        }
        _ => uri.clone(),
    }
}

fn canonicalize_headers(headers: HeaderMap) -> HeaderMap {
    let mut canonical = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if let Ok(lower) = HeaderName::from_bytes(name.as_str().to_ascii_lowercase().as_bytes()) {
            canonical.append(lower, value.clone());
        }
    }
    canonical
}

fn generate_request_id() -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    fn request(method: Method, uri: &str, headers: Vec<(&str, &str)>, body: &[u8]) -> Request {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        Request::new(
            method,
            uri.parse().unwrap(),
            map,
            Bytes::copy_from_slice(body),
            Some("127.0.0.1".to_string()),
            crate::registry::register_builtins(),
            Arc::new(MemoryBlobStore::new()),
            &Config::default(),
        )
    }

    #[test]
    fn header_concatenates_multi_value_by_default() {
        let mut map = HeaderMap::new();
        map.append("x-a", HeaderValue::from_static("1"));
        map.append("x-a", HeaderValue::from_static("2"));
        let req = Request::new(
            Method::GET, "/".parse().unwrap(), map, Bytes::new(), None,
            crate::registry::register_builtins(), Arc::new(MemoryBlobStore::new()),
            &Config::default(),
        );
        assert_eq!(req.header("x-a", None, true).unwrap(), "1, 2");
        assert_eq!(req.header("x-a", None, false).unwrap(), "1");
    }

    #[test]
    fn missing_header_without_default_is_bad_request() {
        let req = request(Method::GET, "/", vec![], b"");
        let err = req.header("x-missing", None, true).unwrap_err();
        assert_eq!(err.status(), hyper::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_param_without_default_is_internal_server_error() {
        let req = request(Method::GET, "/", vec![], b"");
        let err = req.param("missing", None).unwrap_err();
        assert_eq!(err.status(), hyper::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn body_is_memoized() {
        let req = request(
            Method::POST, "/", vec![("content-type", "application/json")], b"{\"a\":1}",
        );
        let first = req.body(None, None).await.unwrap().value.as_json().cloned();
        let second = req.body(None, None).await.unwrap().value.as_json().cloned();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn oversized_body_fails_before_parsing() {
        let req = request(
            Method::POST, "/", vec![("content-type", "application/json")], b"{\"a\":1}",
        );
        let err = req.body(None, Some(2)).await.unwrap_err();
        assert_eq!(err.status(), hyper::StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn method_override_is_only_honoured_when_trusted() {
        let mut map = HeaderMap::new();
        map.insert("x-http-method-override", HeaderValue::from_static("DELETE"));
        let mut config = Config::default();
        config.trust_method_override = true;
        let req = Request::new(
            Method::POST, "/".parse().unwrap(), map, Bytes::new(), None,
            crate::registry::register_builtins(), Arc::new(MemoryBlobStore::new()),
            &config,
        );
        assert_eq!(req.method(), Method::DELETE);
    }
}
