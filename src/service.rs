//! The router (spec §4.6).
//!
//! A service owns a set of resources and filters registered against regex
//! paths, lazily compiled into one merged regex on first dispatch — the
//! same double-checked, build-at-most-once shape as the registries in
//! [`crate::registry`], but scoped to one service instance rather than
//! shared process-wide.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use async_trait::async_trait;
use hyper::{HeaderMap, Method, StatusCode, Uri};
use hyper::header::HeaderValue;
use regex::Regex;
use tokio::sync::OnceCell;
use crate::args::Arguments;
use crate::config::Config;
use crate::error::WebError;
use crate::eventstream::EventStream;
use crate::registry::{BodyValue, ContentType};
use crate::request::Request;
use crate::response::{Response, ResponseStream};

//------------ ReturnValue ------------------------------------------------------

/// What a verb method, `default`, or a filter may hand back (spec §4.6
/// step 6).
pub enum ReturnValue {
    /// Used as the response as-is.
    Response(Response),
    /// Wrapped in an event-stream response.
    Stream(EventStream),
    /// Used as-is: a live byte stream, independent of the SSE framing
    /// `Stream` carries (spec §4.5: a response body is "bytes or
    /// stream").
    ByteStream(ResponseStream),
    /// Wrapped in a `200`, or `204` if `Value::Null`.
    Value(serde_json::Value),
    /// Equivalent to `Value(Value::Null)`, for handlers with nothing to
    /// serialize at all.
    None,
}

/// What a dispatch produced, already run through error/return-value
/// normalization: either a buffered response or a streaming one. The
/// server chooses the hyper body type from this.
pub enum Outcome {
    Response(Response),
    Stream(EventStream),
    ByteStream(ResponseStream),
}

//------------ Resource ----------------------------------------------------------

/// A routed endpoint. `path` and the verb methods are supplied by
/// `addResource`'s instances; Rust has no runtime reflection over which
/// methods an implementor overrides, so [`methods`](Resource::methods) and
/// [`has_default`](Resource::has_default) stand in for the "subset of
/// `{HEAD, GET, PUT, POST, PATCH, DELETE, OPTIONS, default, init, close,
/// catch}`" the original duck-typed resource determines by inspection.
#[async_trait]
pub trait Resource: Send + Sync {
    /// The HTTP verbs this resource implements (excluding `OPTIONS`, which
    /// the router always answers itself, and `default`, tracked separately
    /// by [`has_default`](Resource::has_default)).
    fn methods(&self) -> &'static [Method];

    /// Whether this resource overrides `default`, the catch-all verb
    /// handler consulted after an exact/`HEAD`-as-`GET` match fails.
    fn has_default(&self) -> bool {
        false
    }

    async fn init(&self) -> Result<(), WebError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), WebError> {
        Ok(())
    }

    async fn head(&self, request: &Request, args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
        let _ = (request, args);
        Err(unimplemented_verb("HEAD"))
    }

    async fn get(&self, request: &Request, args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
        let _ = (request, args);
        Err(unimplemented_verb("GET"))
    }

    async fn put(&self, request: &Request, args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
        let _ = (request, args);
        Err(unimplemented_verb("PUT"))
    }

    async fn post(&self, request: &Request, args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
        let _ = (request, args);
        Err(unimplemented_verb("POST"))
    }

    async fn patch(&self, request: &Request, args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
        let _ = (request, args);
        Err(unimplemented_verb("PATCH"))
    }

    async fn delete(&self, request: &Request, args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
        let _ = (request, args);
        Err(unimplemented_verb("DELETE"))
    }

    async fn default(&self, request: &Request, args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
        let _ = (request, args);
        Err(unimplemented_verb("default"))
    }

    /// The resource's own error hook, tried before the service-wide
    /// handler. `None` means "didn't handle it, keep propagating".
    async fn catch(
        &self, err: WebError, request: &Request,
    ) -> Option<Result<ReturnValue, WebError>> {
        let _ = (err, request);
        None
    }
}

fn unimplemented_verb(verb: &str) -> WebError {
    WebError::internal_server_error(format!("resource does not implement {}", verb))
}

/// Constructs a fresh resource instance, invoked at most once per service
/// (spec: "resource is a lazy factory; calling it for the first time
/// constructs the resource instance").
pub type ResourceFactory = Arc<dyn Fn() -> Arc<dyn Resource> + Send + Sync>;

//------------ Filter -------------------------------------------------------------

/// A piece of request-chain middleware registered against its own path.
#[async_trait]
pub trait Filter: Send + Sync {
    async fn filter(
        &self, next: Next<'_>, args: &Arguments<'_>, request: &Request,
    ) -> Result<ReturnValue, WebError>;
}

/// The rest of the chain, from a filter's point of view: the remaining
/// filters in registration order, then the matched resource's verb
/// method. Calling it runs exactly one more step.
pub struct Next<'a> {
    filters: &'a [Arc<dyn Filter>],
    idx: usize,
    resource: &'a Arc<dyn Resource>,
    selection: &'a Selection,
    request: &'a Request,
    args: &'a Arguments<'a>,
}

impl<'a> Next<'a> {
    pub async fn call(self) -> Result<ReturnValue, WebError> {
        run_chain(self.filters, self.idx, self.resource, self.selection, self.request, self.args).await
    }
}

fn run_chain<'a>(
    filters: &'a [Arc<dyn Filter>],
    idx: usize,
    resource: &'a Arc<dyn Resource>,
    selection: &'a Selection,
    request: &'a Request,
    args: &'a Arguments<'a>,
) -> Pin<Box<dyn Future<Output = Result<ReturnValue, WebError>> + Send + 'a>> {
    Box::pin(async move {
        if idx < filters.len() {
            let filter = filters[idx].clone();
            let next = Next { filters, idx: idx + 1, resource, selection, request, args };
            filter.filter(next, args, request).await
        } else {
            dispatch_terminal(resource, selection, request, args).await
        }
    })
}

//------------ Selection ----------------------------------------------------------

/// The outcome of spec §4.6 step 5's method-selection rule.
enum Selection {
    Verb(Method),
    Default,
    Options(String),
    NotAllowed(String),
}

fn select_verb(resource: &dyn Resource, requested: &Method) -> Selection {
    let methods = resource.methods();
    if methods.contains(requested) {
        return Selection::Verb(requested.clone())
    }
    if *requested == Method::HEAD && methods.contains(&Method::GET) {
        return Selection::Verb(Method::GET)
    }
    if resource.has_default() {
        return Selection::Default
    }
    let allow = allow_header(methods);
    if *requested == Method::OPTIONS {
        Selection::Options(allow)
    } else {
        Selection::NotAllowed(allow)
    }
}

fn allow_header(methods: &[Method]) -> String {
    let mut names: Vec<String> = methods.iter().map(|m| m.to_string()).collect();
    if !names.iter().any(|n| n == "OPTIONS") {
        names.push("OPTIONS".to_string());
    }
    names.join(", ")
}

async fn dispatch_terminal(
    resource: &Arc<dyn Resource>, selection: &Selection, request: &Request, args: &Arguments<'_>,
) -> Result<ReturnValue, WebError> {
    match selection {
        Selection::Verb(Method::HEAD) => resource.head(request, args).await,
        Selection::Verb(Method::GET) => resource.get(request, args).await,
        Selection::Verb(Method::PUT) => resource.put(request, args).await,
        Selection::Verb(Method::POST) => resource.post(request, args).await,
        Selection::Verb(Method::PATCH) => resource.patch(request, args).await,
        Selection::Verb(Method::DELETE) => resource.delete(request, args).await,
        Selection::Verb(_) => resource.default(request, args).await,
        Selection::Default => resource.default(request, args).await,
        Selection::Options(allow) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                hyper::header::ALLOW,
                HeaderValue::from_str(allow).unwrap_or_else(|_| HeaderValue::from_static("")),
            );
            Ok(ReturnValue::Response(Response::new(
                StatusCode::OK, None, headers, None, request.registry(),
            )?))
        }
        Selection::NotAllowed(allow) => Err(WebError::method_not_allowed(allow)),
    }
}

//------------ ErrorHandler -------------------------------------------------------

/// The service-wide `setErrorHandler` hook: given the normalized error and
/// the request, builds the final response. Synchronous, since this is
/// meant for formatting a body, not further I/O.
pub type ErrorHandler = Arc<dyn Fn(&WebError, &Request) -> Response + Send + Sync>;

fn default_error_response(err: &WebError, request: &Request, config: &Config) -> Response {
    let mut body = serde_json::Map::new();
    body.insert(
        config.error_message_property.clone(),
        serde_json::Value::String(err.message().to_string()),
    );
    Response::new(
        err.status(),
        Some(BodyValue::Json(serde_json::Value::Object(body))),
        err.headers().clone(),
        Some(ContentType::new("application/json")),
        request.registry(),
    ).unwrap_or_else(|_| Response::empty(err.status()))
}

//------------ Service --------------------------------------------------------------

struct ResourceEntry {
    path: String,
    factory: ResourceFactory,
    instance: OnceCell<Arc<dyn Resource>>,
}

struct FilterEntry {
    path: String,
    filter: Arc<dyn Filter>,
}

struct Compiled {
    merged: Regex,
    offsets: Vec<usize>,
    group_counts: Vec<usize>,
    filters: Vec<(Regex, usize)>,
}

/// A routed collection of resources and filters mounted at one path
/// prefix. Registration (`add_resource`/`add_filter`/`set_error_handler`)
/// happens through `&mut self` before the service is shared; dispatch
/// takes `&self` and is safe to call concurrently from many connections.
pub struct Service {
    mount_point: String,
    config: Config,
    resources: Vec<ResourceEntry>,
    filters: Vec<FilterEntry>,
    error_handler: Option<ErrorHandler>,
    compiled: OnceCell<Compiled>,
}

impl Service {
    pub fn new(mount_point: impl Into<String>, config: Config) -> Self {
        Service {
            mount_point: mount_point.into(),
            config,
            resources: Vec::new(),
            filters: Vec::new(),
            error_handler: None,
            compiled: OnceCell::new(),
        }
    }

    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    /// The config this service was built with, for callers (the server)
    /// that need it before `dispatch` — building the [`Request`] itself.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `addResource(resource-class)`. `path` is a regex source without a
    /// leading `^`/`$` or escaped slash (spec §4.6); `factory` builds one
    /// instance, constructed and `init`ialized at most once.
    pub fn add_resource(
        &mut self,
        path: impl Into<String>,
        factory: impl Fn() -> Arc<dyn Resource> + Send + Sync + 'static,
    ) -> &mut Self {
        self.resources.push(ResourceEntry {
            path: path.into(),
            factory: Arc::new(factory),
            instance: OnceCell::new(),
        });
        self
    }

    /// `addFilter(filter-class)`.
    pub fn add_filter(&mut self, path: impl Into<String>, filter: Arc<dyn Filter>) -> &mut Self {
        self.filters.push(FilterEntry { path: path.into(), filter });
        self
    }

    pub fn set_error_handler(&mut self, handler: ErrorHandler) -> &mut Self {
        self.error_handler = Some(handler);
        self
    }

    /// Dispatches one request, with begin/end observability logging (spec
    /// §4.6's final paragraph): `remote-user-agent@address`, duration, and
    /// a warning if the request ran past `slow_request_threshold_millis`.
    pub async fn dispatch(&self, request: &Request) -> Outcome {
        let start = Instant::now();
        let user_agent = request.header("user-agent", Some("-"), true).unwrap_or_default();
        let remote = request.remote_addr().unwrap_or("-");
        self.config.console.info(&format!(
            "begin {} {} {}@{}", request.method(), request.uri(), user_agent, remote,
        ));

        let outcome = self.dispatch_inner(request).await;

        let elapsed = start.elapsed();
        let status = match &outcome {
            Outcome::Response(r) => r.status(),
            Outcome::Stream(_) => StatusCode::OK,
            Outcome::ByteStream(s) => s.status(),
        };
        let message = format!(
            "end {} {} {} {}ms", request.method(), request.uri(), status, elapsed.as_millis(),
        );
        if elapsed.as_millis() as u64 > self.config.slow_request_threshold_millis {
            self.config.console.warn(&message);
        } else {
            self.config.console.info(&message);
        }

        outcome
    }

    async fn dispatch_inner(&self, request: &Request) -> Outcome {
        let compiled = match self.ensure_compiled().await {
            Ok(c) => c,
            Err(err) => return self.finalize_error(err, request, None).await,
        };

        let path = request.uri().path();
        let captures = match compiled.merged.captures(path) {
            Some(c) => c,
            None => return self.finalize_error(WebError::not_found(), request, None).await,
        };

        let resource_index = match compiled.offsets.iter()
            .position(|&offset| captures.get(offset).is_some())
        {
            Some(i) => i,
            None => return self.finalize_error(WebError::not_found(), request, None).await,
        };

        let offset = compiled.offsets[resource_index];
        let group_count = compiled.group_counts[resource_index];
        let param_map = extract_captures(&compiled.merged, &captures, offset, group_count);
        let query = parse_query(request.uri());
        let args = Arguments::new(request, &param_map, &query);

        let entry = &self.resources[resource_index];
        let resource = match self.ensure_resource(entry).await {
            Ok(r) => r,
            Err(err) => return self.finalize_error(err, request, None).await,
        };

        let matched_filters: Vec<Arc<dyn Filter>> = compiled.filters.iter()
            .filter(|(re, _)| re.is_match(path))
            .map(|(_, idx)| self.filters[*idx].filter.clone())
            .collect();

        let selection = select_verb(resource.as_ref(), request.method());
        let outcome = run_chain(&matched_filters, 0, &resource, &selection, request, &args).await;

        match outcome {
            Ok(rv) => self.finalize_value(rv, request).await,
            Err(err) => self.finalize_error(err, request, Some(resource.as_ref())).await,
        }
    }

    async fn ensure_compiled(&self) -> Result<&Compiled, WebError> {
        self.compiled.get_or_try_init(|| async { self.compile() }).await
    }

    fn compile(&self) -> Result<Compiled, WebError> {
        let mut offsets = Vec::with_capacity(self.resources.len());
        let mut group_counts = Vec::with_capacity(self.resources.len());
        let mut alternatives = Vec::with_capacity(self.resources.len());
        let mut running = 1usize;

        for entry in &self.resources {
            let group_count = count_captures(&entry.path)?;
            offsets.push(running);
            group_counts.push(group_count);
            let rewritten = rename_named_captures(&entry.path, running);
            alternatives.push(format!("({})", rewritten));
            running += 1 + group_count;
        }

        let pattern = format!("^{}(?:{})$", self.mount_point, alternatives.join("|"));
        let merged = Regex::new(&pattern).map_err(|e| {
            WebError::internal_server_error(format!("invalid route pattern: {}", e))
        })?;

        let mut filters = Vec::with_capacity(self.filters.len());
        for (idx, entry) in self.filters.iter().enumerate() {
            let pattern = format!("^{}{}", self.mount_point, entry.path);
            let compiled = Regex::new(&pattern).map_err(|e| {
                WebError::internal_server_error(format!("invalid filter pattern: {}", e))
            })?;
            filters.push((compiled, idx));
        }

        Ok(Compiled { merged, offsets, group_counts, filters })
    }

    async fn ensure_resource(&self, entry: &ResourceEntry) -> Result<Arc<dyn Resource>, WebError> {
        entry.instance.get_or_try_init(|| async {
            let resource = (entry.factory)();
            resource.init().await?;
            Ok(resource)
        }).await.map(Arc::clone)
    }

    async fn finalize_value(&self, rv: ReturnValue, request: &Request) -> Outcome {
        match rv {
            ReturnValue::Response(response) => Outcome::Response(response),
            ReturnValue::Stream(stream) => Outcome::Stream(stream),
            ReturnValue::ByteStream(stream) => Outcome::ByteStream(stream),
            ReturnValue::Value(serde_json::Value::Null) | ReturnValue::None => {
                Outcome::Response(Response::empty(StatusCode::NO_CONTENT))
            }
            ReturnValue::Value(value) => {
                let response = Response::new(
                    StatusCode::OK, Some(BodyValue::Json(value)), HeaderMap::new(), None,
                    request.registry(),
                ).unwrap_or_else(|_| Response::empty(StatusCode::INTERNAL_SERVER_ERROR));
                Outcome::Response(response)
            }
        }
    }

    /// Error normalization (spec §7): the resource's own `catch`, then the
    /// service-wide handler, then the default JSON mapping.
    async fn finalize_error(
        &self, err: WebError, request: &Request, resource: Option<&Arc<dyn Resource>>,
    ) -> Outcome {
        if let Some(resource) = resource {
            if let Some(result) = resource.catch(err.clone(), request).await {
                return match result {
                    Ok(rv) => self.finalize_value(rv, request).await,
                    Err(next) => self.run_service_handler(next, request).await,
                }
            }
        }
        self.run_service_handler(err, request).await
    }

    async fn run_service_handler(&self, err: WebError, request: &Request) -> Outcome {
        match &self.error_handler {
            Some(handler) => Outcome::Response((handler)(&err, request)),
            None => Outcome::Response(default_error_response(&err, request, &self.config)),
        }
    }
}

fn count_captures(path: &str) -> Result<usize, WebError> {
    let re = Regex::new(path).map_err(|e| {
        WebError::internal_server_error(format!("invalid resource path {}: {}", path, e))
    })?;
    Ok(re.captures_len() - 1)
}

/// Renames `(?P<name>…)` to `(?P<_{offset}_name>…)` so every resource's
/// named captures stay unique once concatenated into the merged regex
/// (spec §4.6 step 2).
fn rename_named_captures(path: &str, offset: usize) -> String {
    let group = Regex::new(r"\(\?P<([A-Za-z_][A-Za-z0-9_]*)>").unwrap();
    group.replace_all(path, |caps: &regex::Captures| {
        format!("(?P<_{}_{}>", offset, &caps[1])
    }).into_owned()
}

fn extract_captures(
    merged: &Regex, captures: &regex::Captures, offset: usize, group_count: usize,
) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for k in 1..=group_count {
        if let Some(m) = captures.get(offset + k) {
            map.insert(k.to_string(), m.as_str().to_string());
        }
    }
    let prefix = format!("_{}_", offset);
    for name in merged.capture_names().flatten() {
        if let Some(stripped) = name.strip_prefix(prefix.as_str()) {
            if let Some(m) = captures.name(name) {
                map.insert(stripped.to_string(), m.as_str().to_string());
            }
        }
    }
    map
}

fn parse_query(uri: &Uri) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(query) = uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            map.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }
    }
    map
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use bytes::Bytes;
    use crate::blob::MemoryBlobStore;

    fn request(method: Method, uri: &str) -> Request {
        Request::new(
            method, uri.parse().unwrap(), HeaderMap::new(), Bytes::new(), None,
            crate::registry::register_builtins(), Arc::new(MemoryBlobStore::new()),
            &Config::default(),
        )
    }

    struct Echo;

    #[async_trait]
    impl Resource for Echo {
        fn methods(&self) -> &'static [Method] {
            &[Method::GET]
        }

        async fn get(&self, _request: &Request, args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
            Ok(ReturnValue::Value(serde_json::json!({"id": args.string("$id", None)?})))
        }
    }

    fn echo_service() -> Service {
        let mut service = Service::new("/", Config::default());
        service.add_resource(r"items/(?P<id>[^/]+)", || Arc::new(Echo));
        service
    }

    #[tokio::test]
    async fn routes_by_path_and_exposes_capture() {
        let service = echo_service();
        let req = request(Method::GET, "/items/42");
        match service.dispatch(&req).await {
            Outcome::Response(response) => {
                assert_eq!(response.status(), StatusCode::OK);
                let body = response.body().unwrap();
                assert_eq!(
                    serde_json::from_slice::<serde_json::Value>(body).unwrap(),
                    serde_json::json!({"id": "42"}),
                );
            }
            _ => panic!("expected buffered response"),
        }
    }

    #[tokio::test]
    async fn unmatched_path_is_not_found() {
        let service = echo_service();
        let req = request(Method::GET, "/nope");
        match service.dispatch(&req).await {
            Outcome::Response(response) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
            _ => panic!("expected buffered response"),
        }
    }

    #[tokio::test]
    async fn unsupported_verb_yields_405_with_allow() {
        let service = echo_service();
        let req = request(Method::POST, "/items/42");
        match service.dispatch(&req).await {
            Outcome::Response(response) => {
                assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
                let allow = response.headers().get(hyper::header::ALLOW).unwrap().to_str().unwrap();
                assert!(allow.contains("GET"));
                assert!(allow.contains("OPTIONS"));
            }
            _ => panic!("expected buffered response"),
        }
    }

    #[tokio::test]
    async fn options_is_synthesized() {
        let service = echo_service();
        let req = request(Method::OPTIONS, "/items/42");
        match service.dispatch(&req).await {
            Outcome::Response(response) => {
                assert_eq!(response.status(), StatusCode::OK);
                assert!(response.headers().get(hyper::header::ALLOW).is_some());
            }
            _ => panic!("expected buffered response"),
        }
    }

    struct CountingFilter(Arc<AtomicUsize>);

    #[async_trait]
    impl Filter for CountingFilter {
        async fn filter(
            &self, next: Next<'_>, _args: &Arguments<'_>, _request: &Request,
        ) -> Result<ReturnValue, WebError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.call().await
        }
    }

    #[tokio::test]
    async fn filters_run_before_the_resource() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut service = echo_service();
        service.add_filter("items/.*", Arc::new(CountingFilter(counter.clone())));
        let req = request(Method::GET, "/items/1");
        service.dispatch(&req).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    struct Faulty;

    #[async_trait]
    impl Resource for Faulty {
        fn methods(&self) -> &'static [Method] {
            &[Method::GET]
        }

        async fn get(&self, _request: &Request, _args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
            Err(WebError::bad_request("nope"))
        }

        async fn catch(
            &self, _err: WebError, _request: &Request,
        ) -> Option<Result<ReturnValue, WebError>> {
            Some(Ok(ReturnValue::Value(serde_json::json!({"recovered": true}))))
        }
    }

    #[tokio::test]
    async fn resource_catch_recovers_from_its_own_error() {
        let mut service = Service::new("/", Config::default());
        service.add_resource("faulty", || Arc::new(Faulty));
        let req = request(Method::GET, "/faulty");
        match service.dispatch(&req).await {
            Outcome::Response(response) => assert_eq!(response.status(), StatusCode::OK),
            _ => panic!("expected buffered response"),
        }
    }
}
