//! `text/event-stream` framer (spec §4.1.2).
//!
//! The parser state is `{ extra-line-buffer, current-event }`; `decode`
//! and `encode` operate on a fully-buffered body rather than incrementally,
//! same simplification as the multipart parser.

use bytes::Bytes;
use crate::error::WebError;
use super::{BodyValue, ContentType, Event, MediaType, ParseContext, ParsedBody, SerializeContext};

pub struct EventStreamCodec;

impl MediaType for EventStreamCodec {
    fn parse(
        &self, body: Bytes, _content_type: &ContentType, _ctx: &ParseContext,
    ) -> Result<ParsedBody, WebError> {
        let text = String::from_utf8_lossy(&body);
        Ok(ParsedBody::new(BodyValue::Events(decode(&text))))
    }

    fn serialize(
        &self, value: &BodyValue, content_type: &ContentType, _ctx: &SerializeContext,
    ) -> Result<(Bytes, ContentType), WebError> {
        let events = match value {
            BodyValue::Events(events) => events.clone(),
            _ => return Err(WebError::internal_server_error(
                "value is not an event sequence"
            )),
        };
        Ok((Bytes::from(encode(&events)), content_type.clone()))
    }

    fn default_content_type(&self) -> ContentType {
        ContentType::new("text/event-stream")
    }
}

/// Decodes a full SSE stream into its events.
///
/// A blank line flushes the event under construction (if `data` isn't
/// empty); lines starting with `:` are comments; any other line splits on
/// the first `:` (and one optional leading space) into a field/value pair.
pub fn decode(text: &str) -> Vec<Event> {
    let mut events = Vec::new();
    let mut current = Event::default();
    let mut has_data = false;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if has_data {
                if let Some(stripped) = current.data.strip_suffix('\n') {
                    current.data = stripped.to_string();
                }
                events.push(std::mem::take(&mut current));
                has_data = false;
            }
            continue
        }
        if line.starts_with(':') {
            continue
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => current.event = Some(value.to_string()),
            "data" => {
                current.data.push_str(value);
                current.data.push('\n');
                has_data = true;
            }
            "id" => current.id = Some(value.to_string()),
            "retry" => {
                if value.bytes().all(|b| b.is_ascii_digit()) && !value.is_empty() {
                    current.retry = value.parse().ok();
                }
            }
            _ => {}
        }
    }
    // A trailing, unterminated event is dropped: spec §4.1.2 only flushes
    // on blank lines.
    events
}

/// Encodes events as `text/event-stream` wire format.
pub fn encode(events: &[Event]) -> Vec<u8> {
    let mut out = Vec::new();
    for event in events {
        out.extend(encode_event(event));
    }
    out
}

/// Encodes a single event, for callers streaming events one at a time
/// (the top-level `eventstream` response wrapper) rather than serializing
/// a whole buffered sequence at once.
pub fn encode_event(event: &Event) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(name) = &event.event {
        out.extend_from_slice(format!("event: {}\n", name).as_bytes());
    }
    for line in event.data.split('\n') {
        out.extend_from_slice(format!("data: {}\n", line).as_bytes());
    }
    if let Some(id) = &event.id {
        out.extend_from_slice(format!("id: {}\n", id).as_bytes());
    }
    if let Some(retry) = event.retry {
        out.extend_from_slice(format!("retry: {}\n", retry).as_bytes());
    }
    out.push(b'\n');
    out
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_event() {
        let events = decode("event: greeting\ndata: hello\ndata: world\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("greeting"));
        assert_eq!(events[0].data, "hello\nworld");
    }

    #[test]
    fn ignores_comments_and_blank_only_flush() {
        let events = decode(": this is a comment\ndata: x\n\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn retry_requires_all_digits() {
        let events = decode("data: x\nretry: 12a\n\n");
        assert_eq!(events[0].retry, None);
        let events = decode("data: x\nretry: 3000\n\n");
        assert_eq!(events[0].retry, Some(3000));
    }

    #[test]
    fn round_trips_through_encode() {
        let events = vec![Event { event: Some("a".into()), data: "1\n2".into(), id: Some("7".into()), retry: Some(100) }];
        let encoded = String::from_utf8(encode(&events)).unwrap();
        let decoded = decode(&encoded);
        assert_eq!(decoded, events);
    }
}
