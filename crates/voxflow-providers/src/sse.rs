//! Generic SSE (Server-Sent Events) line parser.
//!
//! Converts a response body into a `Stream<Item = SseEvent>`.

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

use voxflow_core::error::{Result, VoxflowError};

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental decoder; partial lines are carried across chunks as raw
/// bytes, so a character split between chunks decodes intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw body bytes, returning every event completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&raw[..newline_pos]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                // Empty line = dispatch event
                events.extend(self.dispatch());
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            if let Some(value) = line.strip_prefix("event:") {
                self.current_event = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.current_data.push(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("id:") {
                self.current_id = Some(value.trim_start().to_string());
            }
            // Ignore unknown fields
        }

        events
    }

    /// Flush whatever is pending when the body ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let rest = String::from_utf8_lossy(&rest);
            if let Some(value) = rest.trim_end_matches('\r').strip_prefix("data:") {
                self.current_data.push(value.trim_start().to_string());
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
        };
        self.current_data.clear();
        Some(event)
    }
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(response: reqwest::Response) -> impl Stream<Item = Result<SseEvent>> {
    parse_sse_bytes(response.bytes_stream())
}

/// Parse any byte stream as SSE.
pub fn parse_sse_bytes<S, E>(byte_stream: S) -> impl Stream<Item = Result<SseEvent>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    futures::stream::unfold(
        SseState {
            byte_stream: Box::pin(byte_stream),
            decoder: SseDecoder::new(),
            pending: std::collections::VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.done {
                    return None;
                }

                // Need more data from the stream
                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        let events = state.decoder.push(&chunk);
                        state.pending.extend(events);
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((
                            Err(VoxflowError::Completion(format!("SSE stream error: {e}"))),
                            state,
                        ));
                    }
                    None => {
                        state.done = true;
                        state.pending.extend(state.decoder.finish());
                    }
                }
            }
        },
    )
}

struct SseState<S> {
    byte_stream: std::pin::Pin<Box<S>>,
    decoder: SseDecoder,
    pending: std::collections::VecDeque<SseEvent>,
    done: bool,
}
