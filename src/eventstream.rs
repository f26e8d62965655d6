//! The event-stream response wrapper (spec §4.8).
//!
//! Distinct from [`crate::registry::eventstream`], which only knows the
//! wire-format framing. This module turns a lazy source sequence into the
//! headers and byte stream a server response body needs: fixed
//! `content-type`/`connection`/`cache-control`/`transfer-encoding` headers,
//! per-element framing, keep-alive heartbeats on a quiet source, and a
//! terminal `event: error` record if the source itself fails.

use std::pin::Pin;
use std::time::Duration;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use hyper::HeaderMap;
use hyper::header::HeaderValue;
use tokio::time::timeout;
use crate::error::WebError;
use crate::registry::{encode_event, Event};

/// A streaming response body built from a source sequence of events.
///
/// Dropping the byte stream this produces (e.g. because the client
/// disconnected) drops the underlying `events` stream with it, which is
/// how cancellation reaches the source: there is no separate cancel
/// signal to wire up, Rust's own `Drop` does it.
pub struct EventStream {
    headers: HeaderMap,
    keepalive: Option<Duration>,
    events: Pin<Box<dyn Stream<Item = Result<Event, WebError>> + Send>>,
}

impl EventStream {
    /// `(source-sequence, extra-headers?, keepalive-millis?)`. The
    /// `data-content-type` parameter from spec §4.8 only matters to
    /// callers building `Event`s from arbitrary values; a source already
    /// yielding `Event`s needs no further negotiation, so it is handled by
    /// the [`from_values`](Self::from_values) convenience constructor
    /// instead of living here.
    pub fn new(
        events: impl Stream<Item = Result<Event, WebError>> + Send + 'static,
        extra_headers: Option<HeaderMap>,
        keepalive_millis: Option<u64>,
    ) -> Self {
        let mut headers = extra_headers.unwrap_or_default();
        headers.insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("close"));
        headers.insert(hyper::header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(hyper::header::TRANSFER_ENCODING, HeaderValue::from_static("identity"));
        EventStream { headers, keepalive: keepalive_millis.map(Duration::from_millis), events: Box::pin(events) }
    }

    /// Wraps a sequence of JSON-serializable values, each becoming one
    /// event's `data` field (spec §4.8's `data-content-type` defaults to
    /// JSON, the same default the registry uses for any structured body).
    pub fn from_values<T, S>(
        values: S, extra_headers: Option<HeaderMap>, keepalive_millis: Option<u64>,
    ) -> Self
    where
        T: serde::Serialize,
        S: Stream<Item = Result<T, WebError>> + Send + 'static,
    {
        let events = values.map(|item| {
            item.map(|value| Event::data(
                serde_json::to_string(&value).unwrap_or_default()
            ))
        });
        Self::new(events, extra_headers, keepalive_millis)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Consumes the wrapper, producing the raw wire-format byte stream a
    /// server response body writes out.
    pub fn into_byte_stream(self) -> Pin<Box<dyn Stream<Item = Bytes> + Send>> {
        let keepalive = self.keepalive;
        Box::pin(stream::unfold(Some(self.events), move |state| async move {
            let mut events = state?;
            match keepalive {
                Some(duration) => match timeout(duration, events.next()).await {
                    Ok(Some(Ok(event))) => Some((Bytes::from(encode_event(&event)), Some(events))),
                    Ok(Some(Err(err))) => Some((error_frame(&err), None)),
                    Ok(None) => None,
                    Err(_elapsed) => Some((Bytes::from_static(b":\n\n"), Some(events))),
                },
                None => match events.next().await {
                    Some(Ok(event)) => Some((Bytes::from(encode_event(&event)), Some(events))),
                    Some(Err(err)) => Some((error_frame(&err), None)),
                    None => None,
                },
            }
        }))
    }
}

fn error_frame(err: &WebError) -> Bytes {
    let event = Event {
        event: Some("error".to_string()),
        data: serde_json::json!({
            "status": err.status().as_u16(),
            "message": err.message(),
        }).to_string(),
        id: None,
        retry: None,
    };
    Bytes::from(encode_event(&event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sets_fixed_headers() {
        let events = stream::iter(vec![Ok(Event::data("hi"))]);
        let wrapper = EventStream::new(events, None, None);
        assert_eq!(wrapper.headers().get(hyper::header::CONTENT_TYPE).unwrap(), "text/event-stream");
        assert_eq!(wrapper.headers().get(hyper::header::CONNECTION).unwrap(), "close");
        assert_eq!(wrapper.headers().get(hyper::header::CACHE_CONTROL).unwrap(), "no-store");
    }

    #[tokio::test]
    async fn frames_each_event() {
        let events = stream::iter(vec![
            Ok(Event::data("one")),
            Ok(Event::data("two")),
        ]);
        let wrapper = EventStream::new(events, None, None);
        let frames: Vec<Bytes> = wrapper.into_byte_stream().collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], b"data: one\n\n");
    }

    #[tokio::test]
    async fn error_becomes_final_event_and_ends_stream() {
        let events = stream::iter(vec![
            Ok(Event::data("one")),
            Err(WebError::internal_server_error("boom")),
        ]);
        let wrapper = EventStream::new(events, None, None);
        let frames: Vec<Bytes> = wrapper.into_byte_stream().collect().await;
        assert_eq!(frames.len(), 2);
        let last = String::from_utf8(frames[1].to_vec()).unwrap();
        assert!(last.starts_with("event: error\n"));
        assert!(last.contains("\"status\":500"));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_source_emits_keepalive_comment() {
        let events = stream::unfold(0u8, |n| async move {
            if n == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Some((Ok(Event::data("late")), 1))
            } else {
                None
            }
        });
        let wrapper = EventStream::new(events, None, Some(10));
        let mut stream = wrapper.into_byte_stream();
        let first = stream.next().await.unwrap();
        assert_eq!(&first[..], b":\n\n");
    }
}
