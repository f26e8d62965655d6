//! `text/csv`, `text/tab-separated-values`, `text/tsv`.
//!
//! Parameters per spec §4.1: `header` (`present`/`absent`), `x-eol`,
//! `x-separator`, `x-quote`, `x-escape`, `x-bom`.

use bytes::Bytes;
use crate::error::WebError;
use super::{BodyValue, ContentType, CsvBody, MediaType, ParseContext, ParsedBody, SerializeContext};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

fn separator(content_type: &ContentType) -> u8 {
    if let Some(value) = content_type.param("x-separator") {
        if let Some(byte) = value.as_bytes().first() {
            return *byte
        }
    }
    match content_type.essence() {
        "text/tab-separated-values" | "text/tsv" => b'\t',
        _ => b',',
    }
}

fn quote(content_type: &ContentType) -> u8 {
    content_type.param("x-quote")
        .and_then(|v| v.as_bytes().first().copied())
        .unwrap_or(b'"')
}

fn header_present(content_type: &ContentType) -> bool {
    content_type.param("header") != Some("absent")
}

pub struct CsvCodec;

impl MediaType for CsvCodec {
    fn parse(
        &self, body: Bytes, content_type: &ContentType, _ctx: &ParseContext,
    ) -> Result<ParsedBody, WebError> {
        let bytes = if body.starts_with(UTF8_BOM) { &body[UTF8_BOM.len()..] } else { &body[..] };
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(separator(content_type))
            .quote(quote(content_type))
            .has_headers(header_present(content_type))
            .from_reader(bytes);

        let header = if header_present(content_type) {
            Some(
                reader.headers()
                    .map_err(|err| WebError::parse_error(format!("invalid CSV header: {}", err)))?
                    .iter().map(str::to_string).collect()
            )
        } else {
            None
        };

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| {
                WebError::parse_error(format!("invalid CSV row: {}", err))
            })?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(ParsedBody::new(BodyValue::Csv(CsvBody { header, rows })))
    }

    fn serialize(
        &self, value: &BodyValue, content_type: &ContentType, _ctx: &SerializeContext,
    ) -> Result<(Bytes, ContentType), WebError> {
        let csv_body = match value {
            BodyValue::Csv(c) => c.clone(),
            _ => return Err(WebError::internal_server_error(
                "value is not CSV-shaped"
            )),
        };

        let mut writer = csv::WriterBuilder::new()
            .delimiter(separator(content_type))
            .quote(quote(content_type))
            .has_headers(false)
            .from_writer(Vec::new());

        if let Some(header) = &csv_body.header {
            writer.write_record(header).map_err(|err| {
                WebError::internal_server_error(format!("failed to write CSV header: {}", err))
            })?;
        }
        for row in &csv_body.rows {
            writer.write_record(row).map_err(|err| {
                WebError::internal_server_error(format!("failed to write CSV row: {}", err))
            })?;
        }
        let mut out = writer.into_inner().map_err(|err| {
            WebError::internal_server_error(format!("failed to flush CSV writer: {}", err))
        })?;
        if content_type.param("x-bom") == Some("true") {
            let mut prefixed = UTF8_BOM.to_vec();
            prefixed.append(&mut out);
            out = prefixed;
        }
        Ok((Bytes::from(out), content_type.clone()))
    }

    fn default_content_type(&self) -> ContentType {
        ContentType::new("text/csv").with_param("charset", "utf-8").with_param("header", "present")
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    fn ctx() -> (MemoryBlobStore, crate::registry::Registry) {
        (MemoryBlobStore::new(), crate::registry::Registry::new())
    }

    #[test]
    fn round_trips_with_header() {
        let (blobs, registry) = ctx();
        let ctx = ParseContext { blobs: &blobs, registry: &registry };
        let codec = CsvCodec;
        let ct = ContentType::new("text/csv").with_param("header", "present");
        let input = Bytes::from_static(b"name,age\nalice,30\nbob,25\n");
        let parsed = codec.parse(input.clone(), &ct, &ctx).unwrap();
        let csv = match &parsed.value {
            BodyValue::Csv(c) => c,
            _ => panic!("expected csv"),
        };
        assert_eq!(csv.header.as_deref(), Some(&["name".to_string(), "age".to_string()][..]));
        assert_eq!(csv.rows.len(), 2);
        assert_eq!(
            csv.row_as_map(&csv.rows[0]),
            Some(vec![("name".into(), "alice".into()), ("age".into(), "30".into())])
        );

        let sctx = SerializeContext { registry: &registry };
        let (out, _) = codec.serialize(&parsed.value, &ct, &sctx).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn without_header_parses_all_rows() {
        let (blobs, registry) = ctx();
        let ctx = ParseContext { blobs: &blobs, registry: &registry };
        let codec = CsvCodec;
        let ct = ContentType::new("text/csv").with_param("header", "absent");
        let parsed = codec.parse(Bytes::from_static(b"a,b\nc,d\n"), &ct, &ctx).unwrap();
        match parsed.value {
            BodyValue::Csv(c) => {
                assert!(c.header.is_none());
                assert_eq!(c.rows.len(), 2);
            }
            _ => panic!("expected csv"),
        }
    }
}
