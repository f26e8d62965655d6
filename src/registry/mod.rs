//! The parser/encoder registry (spec C1, §4.1).
//!
//! Two parallel, write-once-at-startup registries keyed by media type
//! (exact string, or a regex fallback tried in registration order) and by
//! encoding name. Reads never take a lock: this is the same `ArcSwap`-backed
//! "published snapshot" shape the teacher uses for its metrics and HTTP
//! resource collections (`metrics::Collection`, `http::Resources`).

mod content_type;
mod body_value;
mod buffer;
mod text;
mod json;
mod toml_fmt;
mod yaml;
mod csv_fmt;
mod urlform;
mod multipart;
mod message;
pub mod eventstream;
mod encoding;

pub use content_type::ContentType;
pub use body_value::{
    BodyValue, CsvBody, Event, FieldValue, Finalize, FinalizeFuture,
    MimeMessage, ParsedBody,
};
pub use encoding::Encoding;
pub use eventstream::encode_event;

use std::collections::HashMap;
use std::sync::Arc;
use arc_swap::ArcSwap;
use bytes::Bytes;
use regex::Regex;
use crate::blob::BlobStore;
use crate::error::WebError;

//------------ ParseContext ----------------------------------------------------

/// Collaborators a parser may need beyond the raw bytes and content type.
pub struct ParseContext<'a> {
    pub blobs: &'a dyn BlobStore,

    /// A back-reference to the owning registry, so a composite parser
    /// (multipart, message) can recurse into `decode`/`parse` for nested
    /// parts without every `MediaType` impl needing its own copy.
    pub registry: &'a Registry,
}

//------------ SerializeContext -------------------------------------------------

/// The serializing counterpart to [`ParseContext`]: lets a composite
/// encoder (message, multipart) recurse into the owning registry for a
/// nested value instead of falling back to a debug rendering.
pub struct SerializeContext<'a> {
    pub registry: &'a Registry,
}

//------------ MediaType --------------------------------------------------------

/// A stateless parser/encoder pair bound to one media type family.
///
/// "Stateless" in the sense the spec uses it: one instance is shared across
/// all requests; any per-call configuration (charset, boundary, ...) comes
/// in through `content_type`'s parameters, not through `&mut self`.
pub trait MediaType: Send + Sync {
    fn parse(
        &self,
        body: Bytes,
        content_type: &ContentType,
        ctx: &ParseContext,
    ) -> Result<ParsedBody, WebError>;

    fn serialize(
        &self,
        value: &BodyValue,
        content_type: &ContentType,
        ctx: &SerializeContext,
    ) -> Result<(Bytes, ContentType), WebError>;

    /// The content type used when serializing without an explicit one.
    fn default_content_type(&self) -> ContentType;
}

//------------ Registry ---------------------------------------------------------

/// The combined parser and encoding registry.
///
/// Registration happens once, during `register_builtins` or an embedding
/// application's own setup; dispatch only ever reads the published
/// snapshots.
#[derive(Clone)]
pub struct Registry {
    exact: Arc<ArcSwap<HashMap<String, Arc<dyn MediaType>>>>,
    patterns: Arc<ArcSwap<Vec<(Regex, Arc<dyn MediaType>)>>>,
    encodings: Arc<ArcSwap<HashMap<String, Arc<dyn Encoding>>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            exact: Arc::new(ArcSwap::new(Arc::new(HashMap::new()))),
            patterns: Arc::new(ArcSwap::new(Arc::new(Vec::new()))),
            encodings: Arc::new(ArcSwap::new(Arc::new(HashMap::new()))),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a parser/encoder for an exact media-type essence, e.g.
    /// `"application/json"`.
    pub fn register(&self, essence: &str, codec: Arc<dyn MediaType>) {
        let mut next = (**self.exact.load()).clone();
        next.insert(essence.to_ascii_lowercase(), codec);
        self.exact.store(Arc::new(next));
    }

    /// Registers a parser/encoder for any essence matching `pattern`,
    /// consulted in registration order after all exact matches fail.
    pub fn register_pattern(&self, pattern: Regex, codec: Arc<dyn MediaType>) {
        let mut next = (**self.patterns.load()).clone();
        next.push((pattern, codec));
        self.patterns.store(Arc::new(next));
    }

    pub fn register_encoding(&self, name: &str, encoding: Arc<dyn Encoding>) {
        let mut next = (**self.encodings.load()).clone();
        next.insert(name.to_ascii_lowercase(), encoding);
        self.encodings.store(Arc::new(next));
    }

    fn lookup(&self, content_type: &ContentType) -> Option<Arc<dyn MediaType>> {
        if let Some(codec) = self.exact.load().get(content_type.essence()) {
            return Some(codec.clone())
        }
        for (pattern, codec) in self.patterns.load().iter() {
            if pattern.is_match(content_type.essence()) {
                return Some(codec.clone())
            }
        }
        None
    }

    /// Parses `body` per `content_type`.
    ///
    /// Fails with `unsupported-media-type` if nothing is registered for it,
    /// or with whatever error the parser itself raises.
    pub fn parse(
        &self,
        body: Bytes,
        content_type: &ContentType,
        blobs: &dyn BlobStore,
    ) -> Result<ParsedBody, WebError> {
        let ctx = ParseContext { blobs, registry: self };
        match self.lookup(content_type) {
            Some(codec) => codec.parse(body, content_type, &ctx),
            None => Err(WebError::unsupported_media_type(format!(
                "no parser registered for {}", content_type.essence()
            ))),
        }
    }

    /// Serializes `value`, choosing a default content type per spec §4.1
    /// when `content_type` is `None`.
    pub fn serialize(
        &self,
        value: &BodyValue,
        content_type: Option<ContentType>,
    ) -> Result<(Bytes, ContentType), WebError> {
        let content_type = content_type.unwrap_or_else(|| default_content_type(value));
        let ctx = SerializeContext { registry: self };
        match self.lookup(&content_type) {
            Some(codec) => codec.serialize(value, &content_type, &ctx),
            None => Err(WebError::unsupported_media_type(format!(
                "no encoder registered for {}", content_type.essence()
            ))),
        }
    }

    pub fn encode(
        &self, mut data: Vec<u8>, encodings: &[String],
    ) -> Result<Vec<u8>, WebError> {
        for name in encodings {
            let encoding = self.lookup_encoding(name)?;
            data = encoding.encode(&data)?;
        }
        Ok(data)
    }

    pub fn decode(
        &self, mut data: Vec<u8>, encodings: &[String],
    ) -> Result<Vec<u8>, WebError> {
        for name in encodings.iter().rev() {
            let encoding = self.lookup_encoding(name)?;
            data = encoding.decode(&data)?;
        }
        Ok(data)
    }

    fn lookup_encoding(&self, name: &str) -> Result<Arc<dyn Encoding>, WebError> {
        self.encodings.load().get(&name.to_ascii_lowercase()).cloned().ok_or_else(|| {
            WebError::unsupported_media_type(format!("unknown encoding {}", name))
        })
    }
}

/// The default serialization content type for a value with none requested.
fn default_content_type(value: &BodyValue) -> ContentType {
    match value {
        BodyValue::Bytes(_) => ContentType::new("application/octet-stream"),
        BodyValue::Json(_) | BodyValue::Form(_) | BodyValue::Multipart(_) => {
            ContentType::new("application/json")
        }
        BodyValue::Text(_) => ContentType::new("text/plain"),
        BodyValue::Toml(_) => ContentType::new("application/toml"),
        BodyValue::Yaml(_) => ContentType::new("application/yaml"),
        BodyValue::Csv(_) => ContentType::new("text/csv"),
        BodyValue::Message(_) => ContentType::new("message/rfc822"),
        BodyValue::Events(_) => ContentType::new("text/event-stream"),
    }
}

/// Registers all built-in parsers and encodings.
///
/// Mirrors the teacher's own convention of an explicit, deterministic
/// startup step (`Manager::load`, `LogConfig::init_logging`) rather than
/// relying on `ctor`-style implicit registration (spec §9).
pub fn register_builtins() -> Registry {
    let registry = Registry::new();

    registry.register("application/octet-stream", Arc::new(buffer::BufferCodec));
    registry.register(
        "application/vnd.esxx.octet-stream", Arc::new(buffer::StreamPassthroughCodec)
    );
    registry.register("text/plain", Arc::new(text::TextCodec));
    registry.register("application/json", Arc::new(json::JsonCodec));
    registry.register_pattern(
        Regex::new(r"^application/.+\+json$").unwrap(), Arc::new(json::JsonCodec)
    );
    registry.register("application/toml", Arc::new(toml_fmt::TomlCodec));
    registry.register("application/yaml", Arc::new(yaml::YamlCodec));
    registry.register("application/x-yaml", Arc::new(yaml::YamlCodec));
    registry.register("text/yaml", Arc::new(yaml::YamlCodec));
    registry.register("text/csv", Arc::new(csv_fmt::CsvCodec));
    registry.register("text/tab-separated-values", Arc::new(csv_fmt::CsvCodec));
    registry.register("text/tsv", Arc::new(csv_fmt::CsvCodec));
    registry.register(
        "application/x-www-form-urlencoded", Arc::new(urlform::UrlFormCodec)
    );
    registry.register_pattern(
        Regex::new(r"^multipart/.+$").unwrap(), Arc::new(multipart::MultipartCodec)
    );
    registry.register_pattern(
        Regex::new(r"^message/.+$").unwrap(), Arc::new(message::MessageCodec)
    );
    registry.register("text/event-stream", Arc::new(eventstream::EventStreamCodec));

    registry.register_encoding("identity", Arc::new(encoding::Identity));
    registry.register_encoding("gzip", Arc::new(encoding::Gzip));
    registry.register_encoding("deflate", Arc::new(encoding::Deflate));
    registry.register_encoding("br", Arc::new(encoding::Brotli));
    registry.register_encoding("base64", Arc::new(encoding::Base64));
    registry.register_encoding("quoted-printable", Arc::new(encoding::QuotedPrintable));

    registry
}
