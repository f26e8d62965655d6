//! The polymorphic parsed-body value (spec §3) and its attachments.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use bytes::Bytes;
use crate::error::WebError;

//------------ BodyValue -------------------------------------------------------

/// The result of running a request or response body through a parser.
///
/// Never a bare primitive: scalars are wrapped here so callers can still
/// attach `fields`/`finalize` metadata regardless of which media type
/// produced them (spec §4.1: "primitives are wrapped as boxed objects").
#[derive(Clone, Debug, PartialEq)]
pub enum BodyValue {
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
    Toml(toml::Value),
    Yaml(serde_yaml::Value),
    Csv(CsvBody),
    Form(Vec<(String, String)>),
    Multipart(Vec<(String, FieldValue)>),
    Message(MimeMessage),
    Events(Vec<Event>),
}

impl BodyValue {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            BodyValue::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            BodyValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            BodyValue::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

//------------ CsvBody ---------------------------------------------------------

/// `text/csv` parsed form: optional header row plus data rows, per the
/// `header` content-type parameter (spec §4.1 table).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CsvBody {
    pub header: Option<Vec<String>>,
    pub rows: Vec<Vec<String>>,
}

impl CsvBody {
    /// Renders a row as a `name -> value` map when a header is present.
    pub fn row_as_map(&self, row: &[String]) -> Option<Vec<(String, String)>> {
        let header = self.header.as_ref()?;
        Some(
            header.iter().cloned()
                .zip(row.iter().cloned())
                .collect()
        )
    }
}

//------------ FieldValue -------------------------------------------------------

/// A single field of a form-like body: a plain string (urlencoded forms
/// have no per-field content type to parse against), an inline multipart
/// part run through the registry per its declared content type, or the
/// URI of a blob a part was spilled to (spec §4.1.1).
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Text(String),
    Value(BodyValue),
    Blob(String),
}

//------------ MimeMessage ------------------------------------------------------

/// `message/*`: headers plus a nested body, parsed as "multipart with one
/// part and a wrapping boundary" (spec §4.1 table).
#[derive(Clone, Debug, PartialEq)]
pub struct MimeMessage {
    pub headers: Vec<(String, String)>,
    pub body: Box<BodyValue>,
}

//------------ Event -------------------------------------------------------------

/// One Server-Sent-Events record (spec §4.1.2).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Event {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl Event {
    pub fn data(data: impl Into<String>) -> Self {
        Event { data: data.into(), ..Default::default() }
    }
}

//------------ ParsedBody -------------------------------------------------------

/// The memoized result of `Request::body()` (or the input to
/// `Response::new`): a value plus whatever metadata the parser attached.
#[derive(Clone)]
pub struct ParsedBody {
    pub value: BodyValue,

    /// Ordered `fields` list for form-like bodies, preserving duplicate
    /// keys (spec §3, §9 "load-bearing").
    pub fields: Option<Vec<(String, FieldValue)>>,

    /// Finalizers registered by the parser (e.g. one per spilled blob).
    pub finalizers: Vec<Arc<dyn Finalize>>,
}

impl ParsedBody {
    pub fn new(value: BodyValue) -> Self {
        ParsedBody { value, fields: None, finalizers: Vec::new() }
    }

    pub fn with_fields(mut self, fields: Vec<(String, FieldValue)>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_finalizers(mut self, finalizers: Vec<Arc<dyn Finalize>>) -> Self {
        self.finalizers = finalizers;
        self
    }
}

//------------ Finalize ---------------------------------------------------------

pub type FinalizeFuture = Pin<Box<dyn Future<Output = Result<(), WebError>> + Send>>;

/// A per-request cleanup callable, registered by a parser (spec glossary:
/// "Finalize").
pub trait Finalize: Send + Sync {
    fn finalize(&self) -> FinalizeFuture;
}

impl<F, Fut> Finalize for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), WebError>> + Send + 'static,
{
    fn finalize(&self) -> FinalizeFuture {
        Box::pin((self)())
    }
}
