//! `application/x-www-form-urlencoded`.
//!
//! Duplicate keys keep their first-occurrence value in the map view (via
//! `Request`/`Arguments`) but every occurrence survives in the ordered
//! `fields` list — spec §9 calls this load-bearing.

use bytes::Bytes;
use url::form_urlencoded;
use crate::error::WebError;
use super::{BodyValue, ContentType, FieldValue, MediaType, ParseContext, ParsedBody, SerializeContext};

pub struct UrlFormCodec;

impl MediaType for UrlFormCodec {
    fn parse(
        &self, body: Bytes, _content_type: &ContentType, _ctx: &ParseContext,
    ) -> Result<ParsedBody, WebError> {
        let fields: Vec<(String, String)> = form_urlencoded::parse(&body)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let field_values = fields.iter().cloned()
            .map(|(k, v)| (k, FieldValue::Text(v)))
            .collect();

        Ok(
            ParsedBody::new(BodyValue::Form(fields))
                .with_fields(field_values)
        )
    }

    fn serialize(
        &self, value: &BodyValue, content_type: &ContentType, _ctx: &SerializeContext,
    ) -> Result<(Bytes, ContentType), WebError> {
        let fields = match value {
            BodyValue::Form(f) => f.clone(),
            BodyValue::Json(serde_json::Value::Object(map)) => {
                map.iter()
                    .map(|(k, v)| (k.clone(), json_scalar(v)))
                    .collect()
            }
            _ => return Err(WebError::internal_server_error(
                "value is not form-shaped"
            )),
        };
        let encoded: String = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        Ok((Bytes::from(encoded), content_type.clone()))
    }

    fn default_content_type(&self) -> ContentType {
        ContentType::new("application/x-www-form-urlencoded")
    }
}

fn json_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
