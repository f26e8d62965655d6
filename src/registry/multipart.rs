//! `multipart/*`.
//!
//! Since a request body is fully buffered into `Bytes` before it reaches
//! any `MediaType` (`request::Request::body`), the `AWAIT-BOUNDARY →
//! HEADERS → BODY → END-OF-PART` state machine is implemented as a
//! buffer-splitting pass over the already-complete body rather than an
//! incremental byte-at-a-time reader. The part boundaries and disposition
//! rules still follow spec §4.1.1 exactly.

use bytes::Bytes;
use rand::RngCore;
use base64::Engine;
use crate::error::WebError;
use super::{
    BodyValue, ContentType, FieldValue, Finalize, FinalizeFuture, MediaType, ParseContext,
    ParsedBody, SerializeContext,
};

/// Maximum inline part size before it is spilled to a blob, matching the
/// disposition rule's "oversized" clause (spec §4.1.1).
const INLINE_LIMIT: usize = 64 * 1024;

pub struct MultipartCodec;

impl MediaType for MultipartCodec {
    fn parse(
        &self, body: Bytes, content_type: &ContentType, ctx: &ParseContext,
    ) -> Result<ParsedBody, WebError> {
        let boundary = content_type.param("boundary").ok_or_else(|| {
            WebError::parse_error("multipart body is missing a boundary parameter")
        })?;
        let parts = split_parts(&body, boundary);

        let mut fields = Vec::new();
        let mut finalizers: Vec<std::sync::Arc<dyn Finalize>> = Vec::new();

        for raw_part in parts {
            let (headers, part_body) = match split_headers(raw_part) {
                Some(split) => split,
                None => {
                    // A part with no headers block yields a synthetic error
                    // entry without aborting the other parts (spec §4.1.1).
                    fields.push((
                        String::new(),
                        FieldValue::Text("Missing headers".to_string()),
                    ));
                    continue
                }
            };

            let disposition = parse_disposition(&headers);
            let name = disposition.as_ref()
                .and_then(|d| d.name.clone())
                .unwrap_or_default();
            let filename = disposition.as_ref().and_then(|d| d.filename.clone());

            let part_content_type = header_value(&headers, "content-type")
                .map(ContentType::parse)
                .unwrap_or_else(|| ContentType::new("text/plain"));

            let transfer_encoding = header_value(&headers, "content-transfer-encoding");
            let decoded = match &transfer_encoding {
                Some(encoding) => decode_transfer_encoding(part_body, encoding)?,
                None => Bytes::copy_from_slice(part_body),
            };

            // Oversized or non-inline (attachment) parts are spilled to a
            // blob; everything else is run through the registry per its
            // declared content type rather than kept as raw text (spec
            // §4.1.1: "oversized/binary parts spilled").
            let inline = filename.is_none() || is_inline_type(&part_content_type);

            if inline && decoded.len() <= INLINE_LIMIT {
                let parsed = ctx.registry.parse(decoded, &part_content_type, ctx.blobs)?;
                finalizers.extend(parsed.finalizers);
                fields.push((name, FieldValue::Value(parsed.value)));
            } else {
                let blob = ctx.blobs.create(&part_content_type)?;
                blob.save(decoded)?;
                let uri = blob.uri().to_string();
                fields.push((name, FieldValue::Blob(uri)));
                let remove_blob = blob.clone();
                finalizers.push(std::sync::Arc::new(move || {
                    let blob = remove_blob.clone();
                    Box::pin(async move { blob.remove() })
                        as FinalizeFuture
                }));
            }
        }

        Ok(
            ParsedBody::new(BodyValue::Multipart(fields.clone()))
                .with_fields(fields)
                .with_finalizers(finalizers)
        )
    }

    fn serialize(
        &self, value: &BodyValue, content_type: &ContentType, ctx: &SerializeContext,
    ) -> Result<(Bytes, ContentType), WebError> {
        let fields = match value {
            BodyValue::Multipart(f) => f,
            _ => return Err(WebError::internal_server_error(
                "value is not multipart-shaped"
            )),
        };
        let boundary = content_type.param("boundary")
            .map(str::to_string)
            .unwrap_or_else(generate_boundary);

        let mut out = Vec::new();
        for (name, field) in fields {
            out.extend_from_slice(b"\r\n--");
            out.extend_from_slice(boundary.as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(
                format!("content-disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes()
            );
            match field {
                FieldValue::Text(text) => out.extend_from_slice(text.as_bytes()),
                FieldValue::Blob(uri) => out.extend_from_slice(uri.as_bytes()),
                FieldValue::Value(nested) => {
                    let (bytes, _) = ctx.registry.serialize(nested, None)?;
                    out.extend_from_slice(&bytes);
                }
            }
        }
        out.extend_from_slice(b"\r\n--");
        out.extend_from_slice(boundary.as_bytes());
        out.extend_from_slice(b"--\r\n");

        let content_type = content_type.clone().with_param("boundary", boundary);
        Ok((Bytes::from(out), content_type))
    }

    fn default_content_type(&self) -> ContentType {
        ContentType::new("multipart/form-data").with_param("boundary", generate_boundary())
    }
}

/// 48 random bytes, Base64-encoded, prefixed `---=__` (spec §9).
fn generate_boundary() -> String {
    let mut bytes = [0u8; 48];
    rand::rng().fill_bytes(&mut bytes);
    format!("---=__{}", base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn is_inline_type(content_type: &ContentType) -> bool {
    matches!(content_type.essence(), "text/plain")
        || content_type.essence().starts_with("multipart/")
        || content_type.essence().starts_with("message/")
}

/// Splits `body` on `--boundary` delimiters, dropping the preamble and
/// epilogue, per RFC 2046.
fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();
    let mut parts = Vec::new();
    let mut rest = body;

    // Skip the preamble up to the first delimiter.
    let first = match find(rest, delimiter) {
        Some(index) => index,
        None => return parts,
    };
    rest = &rest[first + delimiter.len()..];

    loop {
        let next = match find(rest, delimiter) {
            Some(index) => index,
            None => break,
        };
        let mut part = &rest[..next];
        part = part.strip_prefix(b"\r\n").unwrap_or(part);
        part = part.strip_suffix(b"\r\n").unwrap_or(part);
        if !part.is_empty() {
            parts.push(part);
        }
        rest = &rest[next + delimiter.len()..];
        if rest.starts_with(b"--") {
            break
        }
    }
    parts
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Splits a part into its header block and body at the first blank line.
/// Returns `None` if no blank-line separator is present (spec: "a part
/// with no headers block yields a synthetic error").
fn split_headers(part: &[u8]) -> Option<(Vec<(String, String)>, &[u8])> {
    let separator = find(part, b"\r\n\r\n")?;
    let header_block = &part[..separator];
    let body = &part[separator + 4..];
    let header_text = String::from_utf8_lossy(header_block);
    Some((parse_header_lines(&header_text), body))
}

fn parse_header_lines(text: &str) -> Vec<(String, String)> {
    text.split("\r\n")
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect()
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
}

struct Disposition {
    name: Option<String>,
    filename: Option<String>,
}

fn parse_disposition(headers: &[(String, String)]) -> Option<Disposition> {
    let value = header_value(headers, "content-disposition")?;
    let mut name = None;
    let mut filename = None;
    for segment in value.split(';').skip(1) {
        let segment = segment.trim();
        if let Some(raw) = segment.strip_prefix("name=") {
            name = Some(raw.trim_matches('"').to_string());
        } else if let Some(raw) = segment.strip_prefix("filename=") {
            filename = Some(raw.trim_matches('"').to_string());
        }
    }
    Some(Disposition { name, filename })
}

fn decode_transfer_encoding(data: &[u8], encoding: &str) -> Result<Bytes, WebError> {
    match encoding.to_ascii_lowercase().as_str() {
        "7bit" | "8bit" | "binary" => Ok(Bytes::copy_from_slice(data)),
        "base64" => super::encoding::Base64.decode(data).map(Bytes::from),
        "quoted-printable" => super::encoding::QuotedPrintable.decode(data).map(Bytes::from),
        other => Err(WebError::parse_error(format!(
            "unsupported content-transfer-encoding: {}", other
        ))),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    fn body_with_one_field(name: &str, value: &str, boundary: &str) -> Bytes {
        Bytes::from(format!(
            "--{b}\r\ncontent-disposition: form-data; name=\"{n}\"\r\n\r\n{v}\r\n--{b}--\r\n",
            b = boundary, n = name, v = value,
        ))
    }

    #[test]
    fn parses_simple_text_field() {
        let blobs = MemoryBlobStore::new();
        let registry = crate::registry::register_builtins();
        let ctx = ParseContext { blobs: &blobs, registry: &registry };
        let codec = MultipartCodec;
        let ct = ContentType::new("multipart/form-data").with_param("boundary", "X");
        let body = body_with_one_field("f", "hello", "X");
        let parsed = codec.parse(body, &ct, &ctx).unwrap();
        let fields = parsed.fields.unwrap();
        assert_eq!(
            fields,
            vec![("f".to_string(), FieldValue::Value(BodyValue::Text("hello".to_string())))]
        );
        assert!(parsed.finalizers.is_empty());
    }

    #[tokio::test]
    async fn spills_binary_attachment_and_finalizes() {
        let blobs = MemoryBlobStore::new();
        let registry = crate::registry::register_builtins();
        let ctx = ParseContext { blobs: &blobs, registry: &registry };
        let codec = MultipartCodec;
        let ct = ContentType::new("multipart/form-data").with_param("boundary", "X");
        let body = Bytes::from(
            "--X\r\ncontent-disposition: form-data; name=\"f\"; filename=\"a.bin\"\r\n\
             content-type: application/octet-stream\r\n\r\n\
             \x00\x01\x02\r\n--X--\r\n".as_bytes().to_vec()
        );
        let parsed = codec.parse(body, &ct, &ctx).unwrap();
        let fields = parsed.fields.unwrap();
        let uri = match &fields[0].1 {
            FieldValue::Blob(uri) => uri.clone(),
            _ => panic!("expected a blob"),
        };
        assert!(blobs.contains(&uri));
        assert_eq!(parsed.finalizers.len(), 1);
        for finalizer in &parsed.finalizers {
            finalizer.finalize().await.unwrap();
        }
        assert!(!blobs.contains(&uri));
    }

    #[test]
    fn missing_header_block_is_a_synthetic_error_entry() {
        let blobs = MemoryBlobStore::new();
        let registry = crate::registry::Registry::new();
        let ctx = ParseContext { blobs: &blobs, registry: &registry };
        let codec = MultipartCodec;
        let ct = ContentType::new("multipart/form-data").with_param("boundary", "X");
        let body = Bytes::from("--X\r\nno headers here just body\r\n--X--\r\n".to_string());
        let parsed = codec.parse(body, &ct, &ctx).unwrap();
        let fields = parsed.fields.unwrap();
        assert_eq!(fields.len(), 1);
        assert!(matches!(&fields[0].1, FieldValue::Text(t) if t == "Missing headers"));
    }
}
