//! `application/octet-stream` and `application/vnd.esxx.octet-stream`.

use bytes::Bytes;
use crate::error::WebError;
use super::{BodyValue, ContentType, MediaType, ParseContext, ParsedBody, SerializeContext};

/// The concatenating buffer parser: the body is already fully buffered by
/// the time it reaches a `MediaType`, so this is just a wrap/unwrap.
pub struct BufferCodec;

impl MediaType for BufferCodec {
    fn parse(
        &self, body: Bytes, _content_type: &ContentType, _ctx: &ParseContext,
    ) -> Result<ParsedBody, WebError> {
        Ok(ParsedBody::new(BodyValue::Bytes(body)))
    }

    fn serialize(
        &self, value: &BodyValue, content_type: &ContentType, _ctx: &SerializeContext,
    ) -> Result<(Bytes, ContentType), WebError> {
        let bytes = match value {
            BodyValue::Bytes(b) => b.clone(),
            BodyValue::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
            other => return Err(WebError::internal_server_error(format!(
                "cannot serialize {:?} as a byte buffer", std::mem::discriminant(other)
            ))),
        };
        Ok((bytes, content_type.clone()))
    }

    fn default_content_type(&self) -> ContentType {
        ContentType::new("application/octet-stream")
    }
}

/// The pass-through codec used for `application/vnd.esxx.octet-stream`.
///
/// Spec §4.1 calls this "stream" both ways; since the rest of this crate
/// buffers bodies ahead of the registry (see `request::Request::body`),
/// pass-through degenerates to an identity transform here too.
pub struct StreamPassthroughCodec;

impl MediaType for StreamPassthroughCodec {
    fn parse(
        &self, body: Bytes, _content_type: &ContentType, _ctx: &ParseContext,
    ) -> Result<ParsedBody, WebError> {
        Ok(ParsedBody::new(BodyValue::Bytes(body)))
    }

    fn serialize(
        &self, value: &BodyValue, content_type: &ContentType, _ctx: &SerializeContext,
    ) -> Result<(Bytes, ContentType), WebError> {
        match value {
            BodyValue::Bytes(b) => Ok((b.clone(), content_type.clone())),
            _ => Err(WebError::internal_server_error(
                "vnd.esxx.octet-stream only carries raw bytes"
            )),
        }
    }

    fn default_content_type(&self) -> ContentType {
        ContentType::new("application/vnd.esxx.octet-stream")
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    #[test]
    fn round_trips_bytes() {
        let blobs = MemoryBlobStore::new();
        let registry = crate::registry::Registry::new();
        let ctx = ParseContext { blobs: &blobs, registry: &registry };
        let codec = BufferCodec;
        let ct = ContentType::new("application/octet-stream");
        let parsed = codec.parse(Bytes::from_static(b"\x00\x01\xff"), &ct, &ctx).unwrap();
        let sctx = SerializeContext { registry: &registry };
        let (out, _) = codec.serialize(&parsed.value, &ct, &sctx).unwrap();
        assert_eq!(out, Bytes::from_static(b"\x00\x01\xff"));
    }
}
