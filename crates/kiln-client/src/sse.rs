use std::collections::VecDeque;

use futures_util::{Stream, StreamExt, stream};

use crate::error::ClientError;
use crate::remote::EventStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `message` when the server sent no `event:` field.
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; only complete lines
/// are decoded. Lines end in `\n`, `\r\n` or a bare `\r`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    // Last line ended in `\r`; a `\n` right after it belongs to that ending.
    after_cr: bool,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut out = Vec::new();
        for &b in chunk {
            if std::mem::take(&mut self.after_cr) && b == b'\n' {
                continue;
            }
            if b != b'\n' && b != b'\r' {
                self.buf.push(b);
                continue;
            }
            self.after_cr = b == b'\r';
            let line = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(ev) = self.feed_line(&line) {
                out.push(ev);
            }
        }
        out
    }

    /// End of stream: an event not terminated by a blank line is incomplete
    /// and dropped.
    pub fn finish(&mut self) {
        if !self.buf.is_empty() || !self.data.is_empty() || self.event.is_some() {
            tracing::debug!("discarding unterminated event at end of stream");
        }
        *self = Self::default();
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id/retry are not used by the panel API.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// Turns a byte stream (e.g. `reqwest::Response::bytes_stream`) into decoded
/// events. A body error is yielded once and ends the stream.
pub fn decode_stream<S, B, E>(body: S, action: &'static str) -> EventStream<SseEvent>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = (Box::pin(body), SseDecoder::default(), VecDeque::new(), false);
    stream::unfold(
        state,
        move |(mut body, mut dec, mut pending, mut done)| async move {
            loop {
                if let Some(ev) = pending.pop_front() {
                    return Some((Ok::<_, ClientError>(ev), (body, dec, pending, done)));
                }
                if done {
                    return None;
                }
                match body.next().await {
                    Some(Ok(chunk)) => pending.extend(dec.push(chunk.as_ref())),
                    Some(Err(e)) => {
                        return Some((
                            Err(ClientError::transport(action, e)),
                            (body, dec, pending, true),
                        ));
                    }
                    None => {
                        dec.finish();
                        done = true;
                    }
                }
            }
        },
    )
    .boxed()
}
