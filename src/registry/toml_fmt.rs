//! `application/toml`.

use bytes::Bytes;
use crate::error::WebError;
use super::{BodyValue, ContentType, MediaType, ParseContext, ParsedBody, SerializeContext};

pub struct TomlCodec;

impl MediaType for TomlCodec {
    fn parse(
        &self, body: Bytes, _content_type: &ContentType, _ctx: &ParseContext,
    ) -> Result<ParsedBody, WebError> {
        let text = std::str::from_utf8(&body).map_err(|err| {
            WebError::parse_error(format!("invalid UTF-8 in TOML body: {}", err))
        })?;
        let value: toml::Value = text.parse().map_err(|err| {
            WebError::parse_error(format!("invalid TOML: {}", err))
        })?;
        Ok(ParsedBody::new(BodyValue::Toml(value)))
    }

    fn serialize(
        &self, value: &BodyValue, content_type: &ContentType, _ctx: &SerializeContext,
    ) -> Result<(Bytes, ContentType), WebError> {
        let toml_value = match value {
            BodyValue::Toml(v) => v.clone(),
            _ => return Err(WebError::internal_server_error(
                "only map-shaped values serialize to TOML"
            )),
        };
        let text = toml::to_string(&toml_value).map_err(|err| {
            WebError::internal_server_error(format!("failed to serialize TOML: {}", err))
        })?;
        Ok((Bytes::from(text), content_type.clone()))
    }

    fn default_content_type(&self) -> ContentType {
        ContentType::new("application/toml")
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    #[test]
    fn parses_map() {
        let blobs = MemoryBlobStore::new();
        let registry = crate::registry::Registry::new();
        let ctx = ParseContext { blobs: &blobs, registry: &registry };
        let codec = TomlCodec;
        let parsed = codec.parse(
            Bytes::from_static(b"name = \"rtrtr\"\n"),
            &ContentType::new("application/toml"),
            &ctx,
        ).unwrap();
        match parsed.value {
            BodyValue::Toml(toml::Value::Table(t)) => {
                assert_eq!(t["name"].as_str(), Some("rtrtr"));
            }
            _ => panic!("expected a table"),
        }
    }
}
