//! Streamed text fragments and server-sent-event decoding.
//!
//! A generated answer arrives as a [`TextStream`]: an ordered sequence of
//! text fragments that ends when the model signals completion, or with an
//! error item if anything upstream fails first. The stream is fed by a
//! spawned task over an `mpsc` channel; dropping the stream stops the task
//! at its next send.

use anyhow::{anyhow, Result};
use futures::stream::{Stream, StreamExt, TryStreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Incremental answer text.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

const FRAGMENT_BUFFER: usize = 64;

/// Drain a fragment stream into one string, failing on the first error.
pub async fn collect_fragments(stream: TextStream) -> Result<String> {
    stream
        .try_fold(String::new(), |mut acc, fragment| async move {
            acc.push_str(&fragment);
            Ok(acc)
        })
        .await
}

/// Wrap already-known fragments as a stream.
pub fn from_fragments<I>(fragments: I) -> TextStream
where
    I: IntoIterator<Item = String>,
    I::IntoIter: Send + 'static,
{
    Box::pin(futures::stream::iter(fragments.into_iter().map(Ok)))
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Line-oriented SSE decoder that tolerates events split across reads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed raw bytes; returns every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(&['\n', '\r'][..]);
            if let Some(event) = self.feed_line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush an event left unterminated at end of input.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            self.feed_line(&line);
        }
        self.dispatch()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(event)
    }
}

/// Marker the OpenAI-style APIs send as the final `data:` payload.
pub const DONE_MARKER: &str = "[DONE]";

/// Spawn a task that decodes an SSE byte stream into text fragments.
///
/// `parse` maps each event payload to an optional fragment. The stream ends
/// cleanly at [`DONE_MARKER`]; a closed connection without it, a read error,
/// or `idle_timeout` without new bytes ends it with an error item.
pub(crate) fn spawn_sse_pump<S, B, E, P>(bytes: S, idle_timeout: Duration, parse: P) -> TextStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    P: Fn(&str) -> Result<Option<String>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);

    tokio::spawn(async move {
        let mut bytes = Box::pin(bytes);
        let mut decoder = SseDecoder::default();

        loop {
            let chunk = match tokio::time::timeout(idle_timeout, bytes.next()).await {
                Err(_) => {
                    let _ = tx
                        .send(Err(anyhow!("stream idle for more than {:?}", idle_timeout)))
                        .await;
                    return;
                }
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    let _ = tx.send(Err(anyhow!("stream read failed: {}", e))).await;
                    return;
                }
                Ok(None) => {
                    if let Some(event) = decoder.finish() {
                        if event.data == DONE_MARKER {
                            return;
                        }
                    }
                    let _ = tx
                        .send(Err(anyhow!("stream closed before completion")))
                        .await;
                    return;
                }
            };

            for event in decoder.push(chunk.as_ref()) {
                if event.data == DONE_MARKER {
                    return;
                }
                match parse(&event.data) {
                    Ok(Some(fragment)) => {
                        if tx.send(Ok(fragment)).await.is_err() {
                            tracing::debug!("fragment receiver dropped, stopping stream");
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}
