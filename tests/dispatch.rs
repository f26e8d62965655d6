//! End-to-end dispatch scenarios (spec §8): path routing, method
//! selection, the error taxonomy's mapped status codes, multipart upload
//! with blob finalize-on-close, and graceful shutdown — driven through
//! [`webframe::Service`]/[`webframe::server::Server`] exactly as an
//! embedding application would use them, rather than through any
//! lower-level plumbing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{HeaderMap, Method, StatusCode};
use webframe::args::Arguments;
use webframe::blob::MemoryBlobStore;
use webframe::config::Config;
use webframe::error::WebError;
use webframe::registry;
use webframe::request::Request;
use webframe::response::Response;
use webframe::server::{ListenerConfig, Server};
use webframe::service::{Filter, Next, Outcome, ReturnValue, Service};
use webframe::{Resource, WebError as TopWebError};

fn request(method: Method, uri: &str, headers: Vec<(&str, &str)>, body: &[u8]) -> Request {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            hyper::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            hyper::header::HeaderValue::from_str(value).unwrap(),
        );
    }
    Request::new(
        method,
        uri.parse().unwrap(),
        map,
        Bytes::copy_from_slice(body),
        Some("127.0.0.1".to_string()),
        registry::register_builtins(),
        Arc::new(MemoryBlobStore::new()),
        &Config::default(),
    )
}

fn response_body_json(response: &Response) -> serde_json::Value {
    let bytes = response.body().expect("response has a body");
    serde_json::from_slice(bytes).expect("body is valid json")
}

//------------ a small item resource, used across several scenarios ------------

struct Item;

#[async_trait]
impl Resource for Item {
    fn methods(&self) -> &'static [Method] {
        &[Method::GET, Method::PUT]
    }

    async fn get(&self, _request: &Request, args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
        let id = args.string("$id", None)?;
        Ok(ReturnValue::Value(serde_json::json!({"id": id})))
    }

    async fn put(&self, _request: &Request, args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
        let id = args.string("$id", None)?;
        Ok(ReturnValue::Value(serde_json::json!({"id": id, "updated": true})))
    }
}

fn items_service() -> Service {
    let mut service = Service::new("/", Config::default());
    service.add_resource(r"items/(?P<id>[^/]+)", || Arc::new(Item));
    service
}

#[tokio::test]
async fn routes_by_path_and_resolves_a_named_capture() {
    let service = items_service();
    let req = request(Method::GET, "/items/42", vec![], b"");
    match service.dispatch(&req).await {
        Outcome::Response(response) => {
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response_body_json(&response), serde_json::json!({"id": "42"}));
        }
        Outcome::Stream(_) => panic!("expected a buffered response"),
    }
}

#[tokio::test]
async fn unsupported_verb_yields_405_with_allow_header() {
    let service = items_service();
    let req = request(Method::DELETE, "/items/42", vec![], b"");
    match service.dispatch(&req).await {
        Outcome::Response(response) => {
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
            let allow = response.headers().get(hyper::header::ALLOW).unwrap().to_str().unwrap();
            assert!(allow.contains("GET"));
            assert!(allow.contains("PUT"));
        }
        Outcome::Stream(_) => panic!("expected a buffered response"),
    }
}

#[tokio::test]
async fn options_is_synthesized_with_allow_header() {
    let service = items_service();
    let req = request(Method::OPTIONS, "/items/42", vec![], b"");
    match service.dispatch(&req).await {
        Outcome::Response(response) => {
            assert_eq!(response.status(), StatusCode::OK);
            let allow = response.headers().get(hyper::header::ALLOW).unwrap().to_str().unwrap();
            assert!(allow.contains("GET"));
        }
        Outcome::Stream(_) => panic!("expected a buffered response"),
    }
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let service = items_service();
    let req = request(Method::GET, "/nowhere", vec![], b"");
    match service.dispatch(&req).await {
        Outcome::Response(response) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
        Outcome::Stream(_) => panic!("expected a buffered response"),
    }
}

//------------ query argument resolution ------------

struct Search;

#[async_trait]
impl Resource for Search {
    fn methods(&self) -> &'static [Method] {
        &[Method::GET]
    }

    async fn get(&self, _request: &Request, args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
        let term = args.string("?q", Some(""))?;
        Ok(ReturnValue::Value(serde_json::json!({"term": term})))
    }
}

#[tokio::test]
async fn query_parameter_reaches_the_resource() {
    let mut service = Service::new("/", Config::default());
    service.add_resource("search", || Arc::new(Search));
    let req = request(Method::GET, "/search?q=rust", vec![], b"");
    match service.dispatch(&req).await {
        Outcome::Response(response) => {
            assert_eq!(response_body_json(&response), serde_json::json!({"term": "rust"}));
        }
        Outcome::Stream(_) => panic!("expected a buffered response"),
    }
}

//------------ payload too large ------------

struct Upload;

#[async_trait]
impl Resource for Upload {
    fn methods(&self) -> &'static [Method] {
        &[Method::POST]
    }

    async fn post(&self, request: &Request, _args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
        request.body(None, Some(8)).await?;
        Ok(ReturnValue::None)
    }
}

#[tokio::test]
async fn oversized_body_maps_to_413() {
    let mut service = Service::new("/", Config::default());
    service.add_resource("upload", || Arc::new(Upload));
    let req = request(
        Method::POST, "/upload", vec![("content-type", "application/json")],
        b"{\"a\": \"this is definitely more than eight bytes\"}",
    );
    match service.dispatch(&req).await {
        Outcome::Response(response) => assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE),
        Outcome::Stream(_) => panic!("expected a buffered response"),
    }
}

//------------ multipart upload with finalize-on-close ------------

struct Attachments {
    blobs: Arc<MemoryBlobStore>,
}

#[async_trait]
impl Resource for Attachments {
    fn methods(&self) -> &'static [Method] {
        &[Method::POST]
    }

    async fn post(&self, request: &Request, _args: &Arguments<'_>) -> Result<ReturnValue, WebError> {
        let parsed = request.body(None, None).await?;
        let fields = parsed.fields.clone().unwrap_or_default();
        let uri = fields.iter()
            .find_map(|(_, value)| match value {
                webframe::registry::FieldValue::Blob(uri) => Some(uri.clone()),
                _ => None,
            })
            .ok_or_else(|| TopWebError::bad_request("no attachment in request"))?;
        assert!(self.blobs.contains(&uri));
        Ok(ReturnValue::Value(serde_json::json!({"uri": uri})))
    }
}

#[tokio::test]
async fn multipart_blob_is_removed_once_the_request_closes() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let mut service = Service::new("/", Config::default());
    let resource_blobs = blobs.clone();
    service.add_resource("attachments", move || {
        Arc::new(Attachments { blobs: resource_blobs.clone() })
    });

    let body = Bytes::from(
        "--X\r\ncontent-disposition: form-data; name=\"f\"; filename=\"a.bin\"\r\n\
         content-type: application/octet-stream\r\n\r\n\
         \x00\x01\x02\r\n--X--\r\n".as_bytes().to_vec()
    );
    let mut headers = HeaderMap::new();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("multipart/form-data; boundary=X"),
    );
    let req = Request::new(
        Method::POST, "/attachments".parse().unwrap(), headers, body,
        Some("127.0.0.1".to_string()), registry::register_builtins(),
        blobs.clone(), &Config::default(),
    );

    match service.dispatch(&req).await {
        Outcome::Response(response) => assert_eq!(response.status(), StatusCode::OK),
        Outcome::Stream(_) => panic!("expected a buffered response"),
    }
    assert!(!blobs.is_empty(), "the attachment should have been spilled to a blob");

    // The server runs this after every dispatch (spec §4.3); a bare
    // `Service::dispatch` call in a test has to do it explicitly.
    req.close().await.unwrap();
    assert!(blobs.is_empty(), "close() should have run the multipart finalizer");
}

//------------ filters run before the resource, in registration order ------------

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
async fn filters_run_ahead_of_the_matched_resource() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut service = items_service();
    service.add_filter("items/.*", Arc::new(CountingFilter(calls.clone())));

    let req = request(Method::GET, "/items/7", vec![], b"");
    service.dispatch(&req).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

//------------ graceful shutdown over a real socket ------------

#[tokio::test(flavor = "multi_thread")]
async fn stop_drains_an_in_flight_connection_before_the_timeout() {
    let server = Arc::new(Server::new());
    server.mount(items_service());

    let addrs = server.run(vec![ListenerConfig::plain("127.0.0.1:0".parse().unwrap())]).unwrap();
    let addr = addrs[0];

    let response = reqwest::Client::new()
        .get(format!("http://{}/items/1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    server.stop(Duration::from_secs(1)).await;
}
