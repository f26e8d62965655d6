//! Arguments coercion (spec §4.4).
//!
//! Builds a single string-indexed view over five sources — regex
//! captures, query parameters, request headers, request params, and (once
//! `body()` has run) top-level parsed-body fields — and offers typed
//! getters that enforce a shape instead of handing back raw strings.

use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde_json::Value;
use crate::error::WebError;
use crate::registry::{BodyValue, FieldValue};
use crate::request::Request;

/// Which source a lookup resolved to, and so which error kind a miss
/// produces (spec §4.4: "`bad-request` for `$/?/@`, `unprocessable-entity`
/// for `.`, `internal-server-error` for `~`").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Source {
    Capture,
    Query,
    Header,
    Param,
    Field,
}

impl Source {
    fn missing_error(self, name: &str) -> WebError {
        match self {
            Source::Capture | Source::Query | Source::Header => {
                WebError::bad_request(format!("missing argument: {}", name))
            }
            Source::Field => {
                WebError::unprocessable_entity(format!("missing field: {}", name))
            }
            Source::Param => {
                WebError::internal_server_error(format!("missing param: {}", name))
            }
        }
    }
}

pub struct Arguments<'a> {
    request: &'a Request,
    captures: &'a HashMap<String, String>,
    query: &'a HashMap<String, String>,
}

impl<'a> Arguments<'a> {
    pub fn new(
        request: &'a Request,
        captures: &'a HashMap<String, String>,
        query: &'a HashMap<String, String>,
    ) -> Self {
        Arguments { request, captures, query }
    }

    /// Splits off the one-character prefix and resolves the remaining
    /// name against the source it names.
    fn resolve(&self, key: &str) -> Result<(Source, Option<Value>), WebError> {
        let mut chars = key.chars();
        let prefix = chars.next().ok_or_else(|| {
            WebError::bad_request("empty argument name")
        })?;
        let name = chars.as_str();

        Ok(match prefix {
            '$' => {
                let value = if let Ok(index) = name.parse::<usize>() {
                    self.captures.get(&index.to_string())
                } else {
                    self.captures.get(name)
                };
                (Source::Capture, value.map(|v| Value::String(v.clone())))
            }
            '?' => (Source::Query, self.query.get(name).map(|v| Value::String(v.clone()))),
            '@' => {
                let value = self.request.header(name, None, true).ok();
                (Source::Header, value.map(Value::String))
            }
            '~' => {
                let value = self.request.param(name, None).ok();
                (Source::Param, value.map(Value::String))
            }
            '.' => {
                let value = self.request.parsed_body_peek()
                    .and_then(|parsed| field_from_body(&parsed.value, name));
                (Source::Field, value)
            }
            _ => return Err(WebError::bad_request(format!(
                "unrecognized argument prefix: {}", prefix
            ))),
        })
    }

    pub fn string(&self, key: &str, default: Option<&str>) -> Result<String, WebError> {
        let (source, value) = self.resolve(key)?;
        match value {
            Some(value) => Ok(value_to_string(&value)),
            None => default.map(str::to_string).ok_or_else(|| source.missing_error(key)),
        }
    }

    pub fn boolean(&self, key: &str, default: Option<bool>) -> Result<bool, WebError> {
        let (source, value) = self.resolve(key)?;
        match value {
            Some(Value::Bool(b)) => Ok(b),
            Some(value) => parse_bool(&value_to_string(&value)).ok_or_else(|| {
                WebError::bad_request(format!("argument {} is not a boolean", key))
            }),
            None => default.ok_or_else(|| source.missing_error(key)),
        }
    }

    pub fn number(&self, key: &str, default: Option<f64>) -> Result<f64, WebError> {
        let (source, value) = self.resolve(key)?;
        match value {
            Some(Value::Number(n)) => n.as_f64().ok_or_else(|| {
                WebError::bad_request(format!("argument {} is not a number", key))
            }),
            Some(value) => parse_number(&value_to_string(&value)).ok_or_else(|| {
                WebError::bad_request(format!("argument {} is not a number", key))
            }),
            None => default.ok_or_else(|| source.missing_error(key)),
        }
    }

    pub fn date(&self, key: &str, default: Option<DateTime<Utc>>) -> Result<DateTime<Utc>, WebError> {
        let (source, value) = self.resolve(key)?;
        match value {
            Some(value) => parse_date(&value_to_string(&value)).ok_or_else(|| {
                WebError::bad_request(format!("argument {} is not an ISO date", key))
            }),
            None => default.ok_or_else(|| source.missing_error(key)),
        }
    }

    pub fn object(&self, key: &str, default: Option<Value>) -> Result<Value, WebError> {
        let (source, value) = self.resolve(key)?;
        match value.or(default) {
            Some(value) => Ok(value),
            None => Err(source.missing_error(key)),
        }
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Boolean accepts `{true, t, false, f}`, case-insensitive (spec §4.4).
fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "t" => Some(true),
        "false" | "f" => Some(false),
        _ => None,
    }
}

/// "The host's canonical decimal/hex/bin/oct numeric parser" (spec §4.4).
fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(rest, 16).ok().map(|v| v as f64)
    }
    if let Some(rest) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        return i64::from_str_radix(rest, 2).ok().map(|v| v as f64)
    }
    if let Some(rest) = text.strip_prefix("0o").or_else(|| text.strip_prefix("0O")) {
        return i64::from_str_radix(rest, 8).ok().map(|v| v as f64)
    }
    text.parse::<f64>().ok()
}

/// "An ISO-prefixed parser (`^[0-9]{4}`)" (spec §4.4): anything not
/// starting with a four-digit year is rejected outright.
fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.len() < 4 || !text.as_bytes()[..4].iter().all(u8::is_ascii_digit) {
        return None
    }
    DateTime::parse_from_rfc3339(text).map(|dt| dt.with_timezone(&Utc)).ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
        })
}

/// The top-level field lookup behind the `.name` prefix: supported for
/// every object-shaped `BodyValue` (spec §4.1's map/object-producing
/// parsers), converted to a `serde_json::Value` for a uniform typed
/// getter surface.
fn field_from_body(body: &BodyValue, name: &str) -> Option<Value> {
    match body {
        BodyValue::Json(Value::Object(map)) => map.get(name).cloned(),
        BodyValue::Form(fields) => {
            fields.iter().find(|(k, _)| k == name).map(|(_, v)| Value::String(v.clone()))
        }
        BodyValue::Multipart(fields) => {
            fields.iter().find(|(k, _)| k == name).and_then(|(_, v)| match v {
                FieldValue::Text(text) => Some(Value::String(text.clone())),
                FieldValue::Blob(uri) => Some(Value::String(uri.clone())),
                FieldValue::Value(nested) => field_value_to_json(nested),
            })
        }
        BodyValue::Toml(toml::Value::Table(table)) => {
            table.get(name).and_then(|v| serde_json::to_value(v).ok())
        }
        BodyValue::Yaml(serde_yaml::Value::Mapping(map)) => {
            map.get(serde_yaml::Value::String(name.to_string()))
                .and_then(|v| serde_json::to_value(v).ok())
        }
        _ => None,
    }
}

/// Converts a nested multipart field's registry-parsed value to JSON for
/// the typed getters above. Only the shapes a form field realistically
/// takes are handled; anything else (a nested multipart part, an event
/// sequence) has no sensible scalar/object rendering here.
fn field_value_to_json(value: &BodyValue) -> Option<Value> {
    match value {
        BodyValue::Text(s) => Some(Value::String(s.clone())),
        BodyValue::Bytes(b) => Some(Value::String(String::from_utf8_lossy(b).into_owned())),
        BodyValue::Json(v) => Some(v.clone()),
        BodyValue::Form(fields) => {
            Some(Value::Object(
                fields.iter().cloned()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect()
            ))
        }
        BodyValue::Toml(v) => serde_json::to_value(v).ok(),
        BodyValue::Yaml(v) => serde_json::to_value(v).ok(),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use hyper::{HeaderMap, Method};
    use crate::blob::MemoryBlobStore;
    use crate::config::Config;

    fn request() -> Request {
        let mut headers = HeaderMap::new();
        headers.insert("x-custom", "hi".parse().unwrap());
        Request::new(
            Method::GET, "/?q=rust".parse().unwrap(), headers, bytes::Bytes::new(),
            None, crate::registry::register_builtins(), Arc::new(MemoryBlobStore::new()),
            &Config::default(),
        )
    }

    #[test]
    fn capture_and_query_resolve() {
        let req = request();
        let mut captures = HashMap::new();
        captures.insert("id".to_string(), "42".to_string());
        let mut query = HashMap::new();
        query.insert("q".to_string(), "rust".to_string());
        let args = Arguments::new(&req, &captures, &query);

        assert_eq!(args.string("$id", None).unwrap(), "42");
        assert_eq!(args.number("$id", None).unwrap(), 42.0);
        assert_eq!(args.string("?q", None).unwrap(), "rust");
    }

    #[test]
    fn missing_capture_is_bad_request() {
        let req = request();
        let captures = HashMap::new();
        let query = HashMap::new();
        let args = Arguments::new(&req, &captures, &query);
        let err = args.string("$missing", None).unwrap_err();
        assert_eq!(err.status(), hyper::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_param_is_internal_server_error() {
        let req = request();
        let captures = HashMap::new();
        let query = HashMap::new();
        let args = Arguments::new(&req, &captures, &query);
        let err = args.string("~missing", None).unwrap_err();
        assert_eq!(err.status(), hyper::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn header_prefix_reads_request_headers() {
        let req = request();
        let captures = HashMap::new();
        let query = HashMap::new();
        let args = Arguments::new(&req, &captures, &query);
        assert_eq!(args.string("@x-custom", None).unwrap(), "hi");
    }

    #[test]
    fn boolean_accepts_short_forms() {
        assert_eq!(parse_bool("t"), Some(true));
        assert_eq!(parse_bool("F"), Some(false));
        assert_eq!(parse_bool("nope"), None);
    }

    #[test]
    fn number_parses_hex_and_decimal() {
        assert_eq!(parse_number("0x1F"), Some(31.0));
        assert_eq!(parse_number("3.5"), Some(3.5));
    }

    #[test]
    fn date_requires_leading_four_digit_year() {
        assert!(parse_date("not-a-date").is_none());
        assert!(parse_date("2024-01-02T03:04:05Z").is_some());
    }
}
