//! `application/yaml`, `application/x-yaml`, `text/yaml`.

use bytes::Bytes;
use crate::error::WebError;
use super::{BodyValue, ContentType, MediaType, ParseContext, ParsedBody, SerializeContext};

pub struct YamlCodec;

impl MediaType for YamlCodec {
    fn parse(
        &self, body: Bytes, _content_type: &ContentType, _ctx: &ParseContext,
    ) -> Result<ParsedBody, WebError> {
        let value: serde_yaml::Value = serde_yaml::from_slice(&body).map_err(|err| {
            WebError::parse_error(format!("invalid YAML: {}", err))
        })?;
        Ok(ParsedBody::new(BodyValue::Yaml(value)))
    }

    fn serialize(
        &self, value: &BodyValue, content_type: &ContentType, _ctx: &SerializeContext,
    ) -> Result<(Bytes, ContentType), WebError> {
        let yaml_value = match value {
            BodyValue::Yaml(v) => v.clone(),
            BodyValue::Json(v) => json_to_yaml(v),
            _ => return Err(WebError::internal_server_error(
                "value cannot be serialized as YAML"
            )),
        };
        let text = serde_yaml::to_string(&yaml_value).map_err(|err| {
            WebError::internal_server_error(format!("failed to serialize YAML: {}", err))
        })?;
        Ok((Bytes::from(text), content_type.clone()))
    }

    fn default_content_type(&self) -> ContentType {
        ContentType::new("application/yaml")
    }
}

fn json_to_yaml(value: &serde_json::Value) -> serde_yaml::Value {
    serde_yaml::to_value(value).unwrap_or(serde_yaml::Value::Null)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    #[test]
    fn parses_sequence() {
        let blobs = MemoryBlobStore::new();
        let registry = crate::registry::Registry::new();
        let ctx = ParseContext { blobs: &blobs, registry: &registry };
        let codec = YamlCodec;
        let parsed = codec.parse(
            Bytes::from_static(b"- one\n- two\n"),
            &ContentType::new("application/yaml"),
            &ctx,
        ).unwrap();
        match parsed.value {
            BodyValue::Yaml(serde_yaml::Value::Sequence(seq)) => {
                assert_eq!(seq.len(), 2);
            }
            _ => panic!("expected a sequence"),
        }
    }
}
