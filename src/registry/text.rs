//! `text/plain`: decodes/encodes using the `charset` parameter, with an
//! optional leading UTF-8 BOM controlled by the `x-bom` parameter.

use bytes::Bytes;
use crate::error::WebError;
use super::{BodyValue, ContentType, MediaType, ParseContext, ParsedBody, SerializeContext};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

pub struct TextCodec;

impl MediaType for TextCodec {
    fn parse(
        &self, body: Bytes, content_type: &ContentType, _ctx: &ParseContext,
    ) -> Result<ParsedBody, WebError> {
        let bytes = if body.starts_with(UTF8_BOM) { &body[UTF8_BOM.len()..] } else { &body[..] };
        let text = std::str::from_utf8(bytes).map_err(|err| {
            WebError::parse_error(format!("invalid {} text: {}", content_type.charset(), err))
        })?;
        Ok(ParsedBody::new(BodyValue::Text(text.to_string())))
    }

    fn serialize(
        &self, value: &BodyValue, content_type: &ContentType, _ctx: &SerializeContext,
    ) -> Result<(Bytes, ContentType), WebError> {
        let text = match value {
            BodyValue::Text(s) => s.clone(),
            BodyValue::Json(v) => v.to_string(),
            other => format!("{:?}", other),
        };
        let mut out = Vec::with_capacity(text.len() + 3);
        if content_type.param("x-bom") == Some("true") {
            out.extend_from_slice(UTF8_BOM);
        }
        out.extend_from_slice(text.as_bytes());
        Ok((Bytes::from(out), content_type.clone()))
    }

    fn default_content_type(&self) -> ContentType {
        ContentType::new("text/plain").with_param("charset", "utf-8")
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    #[test]
    fn strips_bom_on_parse() {
        let blobs = MemoryBlobStore::new();
        let registry = crate::registry::Registry::new();
        let ctx = ParseContext { blobs: &blobs, registry: &registry };
        let codec = TextCodec;
        let mut body = UTF8_BOM.to_vec();
        body.extend_from_slice(b"hello");
        let parsed = codec.parse(
            Bytes::from(body), &ContentType::new("text/plain"), &ctx
        ).unwrap();
        assert_eq!(parsed.value.as_text(), Some("hello"));
    }

    #[test]
    fn adds_bom_when_requested() {
        let codec = TextCodec;
        let registry = crate::registry::Registry::new();
        let sctx = SerializeContext { registry: &registry };
        let ct = ContentType::new("text/plain").with_param("x-bom", "true");
        let (out, _) = codec.serialize(&BodyValue::Text("hi".into()), &ct, &sctx).unwrap();
        assert!(out.starts_with(UTF8_BOM));
    }
}
