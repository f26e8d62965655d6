//! `application/json` and `application/*+json`.

use bytes::Bytes;
use crate::error::WebError;
use super::{BodyValue, ContentType, MediaType, ParseContext, ParsedBody, SerializeContext};

pub struct JsonCodec;

impl MediaType for JsonCodec {
    fn parse(
        &self, body: Bytes, _content_type: &ContentType, _ctx: &ParseContext,
    ) -> Result<ParsedBody, WebError> {
        let value: serde_json::Value = serde_json::from_slice(&body).map_err(|err| {
            WebError::parse_error(format!("invalid JSON: {}", err))
        })?;
        Ok(ParsedBody::new(BodyValue::Json(value)))
    }

    fn serialize(
        &self, value: &BodyValue, content_type: &ContentType, _ctx: &SerializeContext,
    ) -> Result<(Bytes, ContentType), WebError> {
        let json = match value {
            BodyValue::Json(v) => v.clone(),
            BodyValue::Form(fields) => {
                serde_json::Value::Object(
                    fields.iter().cloned()
                        .map(|(k, v)| (k, serde_json::Value::String(v)))
                        .collect()
                )
            }
            BodyValue::Text(s) => serde_json::Value::String(s.clone()),
            other => return Err(WebError::internal_server_error(format!(
                "cannot serialize {:?} as JSON", std::mem::discriminant(other)
            ))),
        };
        let text = serde_json::to_string(&json).map_err(|err| {
            WebError::internal_server_error(format!("failed to serialize JSON: {}", err))
        })?;
        Ok((Bytes::from(text), content_type.clone()))
    }

    fn default_content_type(&self) -> ContentType {
        ContentType::new("application/json")
    }
}
