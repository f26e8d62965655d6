//! The server (spec §4.7).
//!
//! Grounded in the teacher's `http::Server`/`http::Resources`: bind
//! synchronously before the runtime is driven, spawn one task per
//! listener, one task per accepted connection. Where the teacher has a
//! single fixed resource collection, this owns a mutable set of mounted
//! [`Service`]s selected by a merged prefix regex built the same
//! double-checked, build-once way [`Service`] itself compiles its routes.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::{SocketAddr, TcpListener as StdListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, Empty, Full, Limited, LengthLimitError, StreamBody};
use http_body_util::combinators::BoxBody;
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use regex::Regex;
use tokio::net::TcpListener;
use tokio::sync::{Notify, OnceCell};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::blob::{BlobStore, MemoryBlobStore};
use crate::error::WebError;
use crate::eventstream::EventStream;
use crate::registry::{self, Registry};
use crate::request::{Lifecycle, Request as WebRequest};
use crate::response::{Response as WebResponse, ResponseStream};
use crate::service::{Outcome, Service};

type WireRequest = hyper::Request<Incoming>;
type WireResponse = hyper::Response<BoxBody<Bytes, Infallible>>;

//------------ TlsConfig -------------------------------------------------------

/// A server certificate and key, loaded once and shared by every
/// connection a TLS listener accepts.
pub struct TlsConfig {
    inner: Arc<tokio_rustls::rustls::ServerConfig>,
}

impl TlsConfig {
    /// Builds a config from a PEM certificate chain and PEM private key,
    /// the same pairing a reverse proxy or load balancer would be handed.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> io::Result<Self> {
        let cert_chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<_, _>>()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))?;

        let mut config = tokio_rustls::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(TlsConfig { inner: Arc::new(config) })
    }
}

//------------ ListenerConfig --------------------------------------------------

/// One `(host, port, protocol)` triple (spec §4.7). HTTP version is
/// negotiated automatically per connection by [`hyper_util`]'s `auto`
/// builder; `tls` is the only axis that actually needs a distinct
/// acceptor.
pub struct ListenerConfig {
    pub addr: SocketAddr,
    pub tls: Option<TlsConfig>,
}

impl ListenerConfig {
    pub fn plain(addr: SocketAddr) -> Self {
        ListenerConfig { addr, tls: None }
    }

    pub fn tls(addr: SocketAddr, tls: TlsConfig) -> Self {
        ListenerConfig { addr, tls: Some(tls) }
    }
}

//------------ MountedService --------------------------------------------------

struct MountedService {
    prefix: String,
    service: Arc<Service>,
}

struct MountTable {
    merged: Regex,
    /// Index into `services` for each capture group, parallel to
    /// [`Service::compile`]'s `offsets`: group `i + 1` belongs to
    /// `services[i]`.
    order: Vec<usize>,
}

//------------ Server -----------------------------------------------------------

/// Owns listeners and the set of mounted services, per spec §4.7.
///
/// Mounting happens before `run`; the merged selection regex is compiled
/// at most once, at first dispatch, mirroring [`Service`]'s own
/// build-once route compiler.
pub struct Server {
    services: ArcSwap<Vec<MountedService>>,
    mount_table: OnceCell<MountTable>,
    default: Arc<Mutex<Option<Arc<Service>>>>,
    blobs: Arc<dyn BlobStore>,
    registry: Registry,
    return_request_id: Option<String>,

    closing: Arc<AtomicBool>,
    next_connection_id: AtomicU64,
    connections: Arc<Mutex<HashMap<u64, ConnectionHandle>>>,
    shutdown: Notify,
}

/// Per-connection bookkeeping: the request counter spec §4.7 describes
/// ("incremented when the request begins, decremented after the response
/// is fully written"). The "ask this channel to end" half of step 2 is
/// carried by the shared `shutdown` notify plus each connection's own
/// `graceful_shutdown()` call, rather than a per-entry flag here.
struct ConnectionHandle {
    in_flight: Arc<AtomicU64>,
}

impl Default for Server {
    fn default() -> Self {
        Server {
            services: ArcSwap::new(Arc::new(Vec::new())),
            mount_table: OnceCell::new(),
            default: Arc::new(Mutex::new(None)),
            blobs: Arc::new(MemoryBlobStore::new()),
            registry: registry::register_builtins(),
            return_request_id: None,
            closing: Arc::new(AtomicBool::new(false)),
            next_connection_id: AtomicU64::new(0),
            connections: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Notify::new(),
        }
    }
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Echoes the request id under this response header (spec §6
    /// `returnRequestID`).
    pub fn return_request_id(mut self, header: impl Into<String>) -> Self {
        self.return_request_id = Some(header.into());
        self
    }

    /// Mounts `service` at its own `mount_point()`. A mount point of `/`
    /// becomes the fall-through default (spec §4.7).
    pub fn mount(&self, service: Service) {
        let service = Arc::new(service);
        if service.mount_point() == "/" {
            *self.default.lock().unwrap() = Some(service.clone());
        }
        let mut next = (**self.services.load()).clone();
        next.push(MountedService { prefix: service.mount_point().to_string(), service });
        self.services.store(Arc::new(next));
    }

    async fn mount_table(&self) -> &MountTable {
        self.mount_table.get_or_init(|| async {
            let services = self.services.load();
            let mut pattern = String::from("^(?:");
            let mut order = Vec::new();
            for (i, mounted) in services.iter().enumerate() {
                if i > 0 {
                    pattern.push('|');
                }
                pattern.push('(');
                pattern.push_str(&regex::escape(&mounted.prefix));
                pattern.push(')');
                order.push(i);
            }
            pattern.push(')');
            // An empty table still needs to compile to something that
            // never matches, so `dispatch` falls straight through to the
            // default service.
            if services.is_empty() {
                pattern = "^(?!)".to_string();
            }
            MountTable {
                merged: Regex::new(&pattern).expect("mount prefixes form a valid regex"),
                order,
            }
        }).await
    }

    /// Selects the service mounted at the longest matching prefix, or the
    /// default `/` service.
    async fn select_service(&self, path: &str) -> Option<Arc<Service>> {
        let table = self.mount_table().await;
        let services = self.services.load();
        if let Some(captures) = table.merged.captures(path) {
            if let Some(&index) = table.order.iter().find(|&&i| captures.get(i + 1).is_some()) {
                return services.get(index).map(|m| m.service.clone())
            }
        }
        self.default.lock().unwrap().clone()
    }

    /// Binds every listener synchronously (so failures surface before the
    /// runtime starts serving traffic), then spawns one accept loop per
    /// listener. Mirrors the teacher's `Server::run`.
    /// Binds every listener synchronously and returns the address each one
    /// actually bound to (port `0` resolves to whatever the OS assigned),
    /// then spawns one accept loop per listener.
    pub fn run(self: &Arc<Self>, listeners: Vec<ListenerConfig>) -> io::Result<Vec<SocketAddr>> {
        let mut bound = Vec::with_capacity(listeners.len());
        for config in listeners {
            let listener = StdListener::bind(config.addr)?;
            listener.set_nonblocking(true)?;
            let local_addr = listener.local_addr()?;
            bound.push((listener, local_addr, config.tls));
        }
        let addrs = bound.iter().map(|(_, addr, _)| *addr).collect();
        for (listener, addr, tls) in bound {
            let server = self.clone();
            tokio::spawn(async move {
                server.accept_loop(listener, addr, tls).await;
            });
        }
        Ok(addrs)
    }

    async fn accept_loop(
        self: Arc<Self>, listener: StdListener, addr: SocketAddr, tls: Option<TlsConfig>,
    ) {
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(err) => {
                log::error!("error on listener {}: {}", addr, err);
                return
            }
        };
        let acceptor = tls.map(|tls| TlsAcceptor::from(tls.inner));

        loop {
            if self.closing.load(Ordering::Acquire) {
                break
            }
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    log::error!("fatal error accepting on {}: {}", addr, err);
                    break
                }
            };

            let server = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => server.serve_connection(tls_stream, peer).await,
                        Err(err) => log::debug!("TLS handshake with {} failed: {}", peer, err),
                    },
                    None => server.serve_connection(stream, peer).await,
                }
            });
        }
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer: SocketAddr)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let in_flight = Arc::new(AtomicU64::new(0));
        self.connections.lock().unwrap().insert(connection_id, ConnectionHandle {
            in_flight: in_flight.clone(),
        });

        // Shared across every request this connection carries, so a
        // transport error observed by one request (or by the connection
        // future below, after the last request on it) is visible to a
        // `Request` still holding a reference to it (spec §4.3's
        // `aborted`).
        let aborted = Arc::new(AtomicBool::new(false));
        let connection_aborted = aborted.clone();

        let server = self.clone();
        let service = service_fn(move |req: WireRequest| {
            let server = server.clone();
            let peer = peer.to_string();
            let in_flight = in_flight.clone();
            let aborted = aborted.clone();
            async move {
                in_flight.fetch_add(1, Ordering::Relaxed);
                let response = server.handle_request(req, &peer, aborted).await;
                in_flight.fetch_sub(1, Ordering::Relaxed);
                response
            }
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        let conn = builder.serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    log::debug!("connection with {} ended with an error: {}", peer, err);
                    connection_aborted.store(true, Ordering::Relaxed);
                }
            }
            _ = self.shutdown.notified() => {
                conn.as_mut().graceful_shutdown();
                if let Err(err) = conn.as_mut().await {
                    log::debug!("connection with {} ended with an error: {}", peer, err);
                    connection_aborted.store(true, Ordering::Relaxed);
                }
            }
        }

        self.connections.lock().unwrap().remove(&connection_id);
    }

    /// Builds a [`crate::request::Request`], dispatches it through the
    /// selected service, and converts the [`Outcome`] into a wire
    /// response.
    ///
    /// The service is selected before the body is read, so the incoming
    /// body can be collected under that service's own
    /// `max_content_length` (spec §4.3) rather than buffering an
    /// unbounded body first and only checking its size afterwards.
    async fn handle_request(
        &self, req: WireRequest, peer: &str, aborted: Arc<AtomicBool>,
    ) -> Result<WireResponse, Infallible> {
        let (parts, body) = req.into_parts();

        let is_http2 = parts.version == hyper::Version::HTTP_2;
        let method = parts.method.clone();

        let service = self.select_service(parts.uri.path()).await;
        let default_config = crate::config::Config::default();
        let config = service.as_deref().map(Service::config).unwrap_or(&default_config);
        let max_content_length = config.max_content_length;

        let raw_body = match Limited::new(body, max_content_length as usize).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                if err.downcast_ref::<LengthLimitError>().is_some() {
                    return Ok(payload_too_large_response(max_content_length))
                }
                // A transport-level read error (reset stream, truncated
                // connection): there's no body left to serve, but the
                // request still needs to run its course so `catch`
                // handlers and finalizers see a `Request` whose
                // `aborted()` reports what happened.
                aborted.store(true, Ordering::Relaxed);
                Bytes::new()
            }
        };

        let lifecycle = Lifecycle::shared(self.closing.clone(), aborted);

        let web_request = WebRequest::with_lifecycle(
            parts.method,
            parts.uri.clone(),
            parts.headers,
            raw_body,
            Some(peer.to_string()),
            self.registry.clone(),
            self.blobs.clone(),
            config,
            lifecycle,
        );

        let outcome = match service {
            Some(service) => service.dispatch(&web_request).await,
            None => Outcome::Response(WebResponse::empty(hyper::StatusCode::NOT_FOUND)),
        };

        if let Err(err) = web_request.close().await {
            log::warn!("finalizer error on request close: {}", err);
        }

        Ok(self.finalize(outcome, &method, &web_request, is_http2))
    }

    fn finalize(
        &self, outcome: Outcome, method: &hyper::Method, request: &WebRequest, is_http2: bool,
    ) -> WireResponse {
        match outcome {
            Outcome::Response(response) => {
                let response = response.finalize_for_wire(
                    method, request, self.return_request_id.as_deref(), is_http2,
                );
                wire_response(response)
            }
            Outcome::Stream(stream) => wire_stream_response(stream),
            Outcome::ByteStream(stream) => wire_byte_stream_response(stream),
        }
    }

    /// `stop(timeout)` (spec §4.7): mark closing, stop accepting, ask
    /// every open connection to end gracefully, then force-destroy
    /// whatever hasn't drained once `timeout` elapses.
    pub async fn stop(&self, timeout: Duration) {
        self.closing.store(true, Ordering::Release);
        self.shutdown.notify_waiters();

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = {
                let connections = self.connections.lock().unwrap();
                connections.len()
            };
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                break
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Whatever's still open past the deadline is abandoned; its
        // sockets are dropped along with the connection tasks when this
        // server (and the `Arc` it's held through) goes away.
    }

    /// Installs signal handlers for the requested subset and blocks until
    /// one fires `stop` (spec §4.7's `start()`). Unix-only: `SIGBREAK` is
    /// a Windows-only signal this crate does not target.
    #[cfg(unix)]
    pub async fn start(self: Arc<Self>, listeners: Vec<ListenerConfig>, timeout: Duration) -> io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        self.run(listeners)?;

        let mut hangup = signal(SignalKind::hangup())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = hangup.recv() => {}
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        self.stop(timeout).await;
        Ok(())
    }
}

fn wire_response(response: WebResponse) -> WireResponse {
    let mut builder = hyper::Response::builder().status(response.status());
    for (name, value) in response.headers().iter() {
        builder = builder.header(name, value);
    }
    match response.body() {
        Some(bytes) => builder.body(Full::new(bytes.clone()).boxed()),
        None => builder.body(Empty::new().boxed()),
    }.unwrap_or_else(|_| fallback_response())
}

fn wire_stream_response(stream: EventStream) -> WireResponse {
    let mut builder = hyper::Response::builder().status(hyper::StatusCode::OK);
    for (name, value) in stream.headers().iter() {
        builder = builder.header(name, value);
    }
    let body = StreamBody::new(
        stream.into_byte_stream().map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)))
    );
    builder.body(body.boxed()).unwrap_or_else(|_| fallback_response())
}

/// Unlike [`wire_stream_response`]'s SSE framing, a generic byte stream
/// has no wire-level convention for signalling a mid-stream failure: the
/// first `Err` item simply ends the body there, same as the connection
/// dropping.
fn wire_byte_stream_response(stream: ResponseStream) -> WireResponse {
    let mut builder = hyper::Response::builder().status(stream.status());
    for (name, value) in stream.headers().iter() {
        builder = builder.header(name, value);
    }
    let body = StreamBody::new(
        stream.into_stream()
            .take_while(|item| futures_util::future::ready(item.is_ok()))
            .filter_map(|item| futures_util::future::ready(item.ok()))
            .map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)))
    );
    builder.body(body.boxed()).unwrap_or_else(|_| fallback_response())
}

/// A `413` for a body that exceeded the selected service's
/// `max_content_length` before any `Request` could be built (spec §4.3).
fn payload_too_large_response(max: u64) -> WireResponse {
    let err = WebError::payload_too_large(max);
    let payload = serde_json::json!({ "message": err.message() }).to_string();
    let mut builder = hyper::Response::builder().status(err.status());
    for (name, value) in err.headers().iter() {
        builder = builder.header(name, value);
    }
    builder = builder.header(hyper::header::CONTENT_TYPE, "application/json");
    builder.body(Full::new(Bytes::from(payload)).boxed()).unwrap_or_else(|_| fallback_response())
}

fn fallback_response() -> WireResponse {
    hyper::Response::builder()
        .status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
        .body(Empty::new().boxed())
        .expect("a minimal response always builds")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hyper::Method;
    use crate::args::Arguments;
    use crate::config::Config;
    use crate::error::WebError;
    use crate::service::Resource;

    struct Ping;

    #[async_trait]
    impl Resource for Ping {
        fn methods(&self) -> &'static [Method] {
            &[Method::GET]
        }

        async fn get(
            &self, _request: &WebRequest, _args: &Arguments<'_>,
        ) -> Result<crate::service::ReturnValue, WebError> {
            Ok(crate::service::ReturnValue::Value(serde_json::json!({"ok": true})))
        }
    }

    fn server_with_ping() -> Server {
        let mut service = Service::new("/", Config::default());
        service.add_resource("ping", || Arc::new(Ping));
        let server = Server::new();
        server.mount(service);
        server
    }

    #[tokio::test]
    async fn selects_the_default_service_for_an_unmounted_root() {
        let server = server_with_ping();
        let selected = server.select_service("/ping").await;
        assert!(selected.is_some());
    }

    #[tokio::test]
    async fn stop_resolves_immediately_with_no_open_connections() {
        let server = server_with_ping();
        server.stop(Duration::from_millis(50)).await;
        assert!(server.closing.load(Ordering::Acquire));
    }
}
