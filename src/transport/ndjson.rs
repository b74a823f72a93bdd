//! Newline-delimited JSON framing for agent streams

use super::{FrameStream, TransportError};
use bytes::{Bytes, BytesMut};
use futures::{stream, Stream, StreamExt};
use serde_json::Value;
use std::fmt::Display;

/// Longest frame line accepted from an agent
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Split a byte stream into one JSON value per non-blank line
///
/// A body error ends the stream after yielding `TransportError::Connect`; a
/// trailing line without a newline is still decoded at end of body. A line
/// longer than [`MAX_FRAME_BYTES`] ends the stream with `TransportError::Decode`.
pub fn ndjson_frames<S, E>(body: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    ndjson_frames_with_limit(body, MAX_FRAME_BYTES)
}

pub(crate) fn ndjson_frames_with_limit<S, E>(body: S, max_line: usize) -> FrameStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = (Box::pin(body), BytesMut::new(), false);

    Box::pin(stream::unfold(
        state,
        move |(mut body, mut buffer, mut done)| async move {
            loop {
                match buffer.iter().position(|b| *b == b'\n') {
                    Some(pos) if pos <= max_line => {
                        let line = buffer.split_to(pos + 1);
                        let line = &line[..pos];
                        if is_blank(line) {
                            continue;
                        }
                        return Some((decode_line(line), (body, buffer, done)));
                    }
                    Some(_) => return Some((oversized(max_line), (body, BytesMut::new(), true))),
                    None if buffer.len() > max_line => {
                        return Some((oversized(max_line), (body, BytesMut::new(), true)))
                    }
                    None => {}
                }

                if done {
                    if is_blank(&buffer) {
                        return None;
                    }
                    let line = buffer.split();
                    return Some((decode_line(&line), (body, buffer, done)));
                }

                match body.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        buffer.clear();
                        let err = TransportError::Connect(format!("stream interrupted: {e}"));
                        return Some((Err(err), (body, buffer, true)));
                    }
                    None => done = true,
                }
            }
        },
    ))
}

fn oversized(max_line: usize) -> Result<Value, TransportError> {
    Err(TransportError::Decode(format!(
        "frame exceeds {max_line} bytes without a newline"
    )))
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

fn decode_line(line: &[u8]) -> Result<Value, TransportError> {
    serde_json::from_slice(line).map_err(|e| TransportError::Decode(format!("invalid frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunks(parts: &[&'static str]) -> Vec<Result<Bytes, String>> {
        parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect()
    }

    #[tokio::test]
    async fn test_frames_split_across_chunks() {
        let body = stream::iter(chunks(&[
            "{\"kind\":\"PROG",
            "RESS\"}\n{\"kind\":\"DONE\"}\n",
        ]));
        let frames: Vec<_> = ndjson_frames(body).collect().await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap(), &json!({"kind": "PROGRESS"}));
        assert_eq!(frames[1].as_ref().unwrap(), &json!({"kind": "DONE"}));
    }

    #[tokio::test]
    async fn test_blank_lines_skipped_and_trailing_line_decoded() {
        let body = stream::iter(chunks(&["\n  \n{\"a\":1}\r\n\n{\"b\":2}"]));
        let frames: Vec<_> = ndjson_frames(body).collect().await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].as_ref().unwrap(), &json!({"b": 2}));
    }

    #[tokio::test]
    async fn test_invalid_line_yields_decode_error() {
        let body = stream::iter(chunks(&["not json\n"]));
        let frames: Vec<_> = ndjson_frames(body).collect().await;

        assert!(matches!(frames[0], Err(TransportError::Decode(_))));
    }

    #[tokio::test]
    async fn test_body_error_ends_stream() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"{\"a\":1}\n{\"partial\"")),
            Err("connection reset".to_string()),
            Ok(Bytes::from_static(b"{\"never\":true}\n")),
        ]);
        let frames: Vec<_> = ndjson_frames(body).collect().await;

        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        assert!(matches!(frames[1], Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_line_over_limit_ends_stream() {
        let body = stream::iter(chunks(&["{\"a\":1}\n", "{\"padding\":\"", "xxxxxxxx", "xxxxxxxx", "\"}\n"]));
        let frames: Vec<_> = ndjson_frames_with_limit(body, 16).collect().await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap(), &json!({"a": 1}));
        assert!(matches!(frames[1], Err(TransportError::Decode(_))));
    }

    #[tokio::test]
    async fn test_complete_long_line_over_limit_is_rejected() {
        let body = stream::iter(chunks(&["{\"padding\":\"xxxxxxxxxxxxxxxx\"}\n{\"b\":2}\n"]));
        let frames: Vec<_> = ndjson_frames_with_limit(body, 16).collect().await;

        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Err(TransportError::Decode(_))));
    }
}
