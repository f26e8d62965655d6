//! `message/*`.
//!
//! Spec §4.1 table: "implemented as multipart with one part and wrapping
//! boundary" — headers go on the wrapper, and the body is parsed by
//! whatever codec the nested `content-type` header names.

use bytes::Bytes;
use crate::error::WebError;
use super::{
    BodyValue, ContentType, MediaType, MimeMessage, ParseContext, ParsedBody, SerializeContext,
};

pub struct MessageCodec;

impl MediaType for MessageCodec {
    fn parse(
        &self, body: Bytes, _content_type: &ContentType, ctx: &ParseContext,
    ) -> Result<ParsedBody, WebError> {
        let separator = find(&body, b"\r\n\r\n").ok_or_else(|| {
            WebError::parse_error("message body is missing headers")
        })?;
        let header_text = String::from_utf8_lossy(&body[..separator]);
        let headers: Vec<(String, String)> = header_text.split("\r\n")
            .filter(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();

        let nested_content_type = headers.iter()
            .find(|(k, _)| k == "content-type")
            .map(|(_, v)| ContentType::parse(v))
            .unwrap_or_else(|| ContentType::new("text/plain"));

        let nested_body = Bytes::copy_from_slice(&body[separator + 4..]);
        let parsed = ctx.registry.parse(nested_body, &nested_content_type, ctx.blobs)?;

        Ok(ParsedBody::new(BodyValue::Message(MimeMessage {
            headers,
            body: Box::new(parsed.value),
        })).with_finalizers(parsed.finalizers))
    }

    fn serialize(
        &self, value: &BodyValue, content_type: &ContentType, ctx: &SerializeContext,
    ) -> Result<(Bytes, ContentType), WebError> {
        let message = match value {
            BodyValue::Message(m) => m,
            _ => return Err(WebError::internal_server_error(
                "value is not message-shaped"
            )),
        };

        let mut out = Vec::new();
        for (name, value) in &message.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");

        // The nested body's own content type decides how it serializes;
        // recurse through the owning registry the same way `parse` does,
        // rather than special-casing a couple of shapes here.
        let nested_content_type = message.headers.iter()
            .find(|(k, _)| k == "content-type")
            .map(|(_, v)| ContentType::parse(v))
            .unwrap_or_else(|| ContentType::new("text/plain"));
        let (body, _) = ctx.registry.serialize(
            message.body.as_ref(), Some(nested_content_type)
        )?;
        out.extend_from_slice(&body);

        Ok((Bytes::from(out), content_type.clone()))
    }

    fn default_content_type(&self) -> ContentType {
        ContentType::new("message/rfc822")
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    #[test]
    fn parses_headers_and_nested_text_body() {
        let blobs = MemoryBlobStore::new();
        let registry = crate::registry::register_builtins();
        let ctx = ParseContext { blobs: &blobs, registry: &registry };
        let codec = MessageCodec;
        let body = Bytes::from(
            "Subject: hi\r\nContent-Type: text/plain\r\n\r\nhello there".to_string()
        );
        let parsed = codec.parse(
            body, &ContentType::new("message/rfc822"), &ctx
        ).unwrap();
        match parsed.value {
            BodyValue::Message(message) => {
                assert_eq!(
                    message.headers,
                    vec![
                        ("subject".to_string(), "hi".to_string()),
                        ("content-type".to_string(), "text/plain".to_string()),
                    ]
                );
                assert_eq!(message.body.as_text(), Some("hello there"));
            }
            _ => panic!("expected a message"),
        }
    }
}
