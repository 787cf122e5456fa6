use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;

/// Upper bound for the capture buffer; streams larger than this are
/// delivered but not cached.
pub const MAX_CAPTURE_BYTES: usize = 10 * 1024 * 1024;

/// How the stream finished, as seen by the finalizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Error,
    Aborted,
}

/// Handed to the finalizer once the client has the last byte.
#[derive(Debug)]
pub struct StreamOutcome {
    pub end: StreamEnd,
    /// The full SSE text, absent when truncated by the capture cap.
    pub captured: Option<String>,
    pub total_bytes: u64,
}

type Finalizer = Box<dyn FnOnce(StreamOutcome) + Send>;

/// Tees an upstream byte stream to the client while buffering a bounded
/// copy for the cache. The finalizer fires exactly once: on completion, on
/// stream error, or on drop (client disconnect), so billing and cache
/// writes happen after the last byte is delivered.
pub struct CaptureStream<S> {
    upstream: S,
    buffer: Vec<u8>,
    truncated: bool,
    total_bytes: u64,
    finalizer: Option<Finalizer>,
}

impl<S> CaptureStream<S> {
    pub fn new(upstream: S, finalizer: impl FnOnce(StreamOutcome) + Send + 'static) -> Self {
        Self {
            upstream,
            buffer: Vec::new(),
            truncated: false,
            total_bytes: 0,
            finalizer: Some(Box::new(finalizer)),
        }
    }

    fn finalize(&mut self, end: StreamEnd) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        let captured = if self.truncated {
            None
        } else {
            String::from_utf8(std::mem::take(&mut self.buffer)).ok()
        };
        finalizer(StreamOutcome {
            end,
            captured,
            total_bytes: self.total_bytes,
        });
    }
}

impl<S, E> Stream for CaptureStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.upstream).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.finalize(StreamEnd::Completed);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(chunk))) => {
                this.total_bytes = this.total_bytes.saturating_add(chunk.len() as u64);
                if !this.truncated {
                    if this.buffer.len().saturating_add(chunk.len()) <= MAX_CAPTURE_BYTES {
                        this.buffer.extend_from_slice(&chunk);
                    } else {
                        this.truncated = true;
                        this.buffer.clear();
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finalize(StreamEnd::Error);
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl<S> Drop for CaptureStream<S> {
    fn drop(&mut self) {
        if self.finalizer.is_some() {
            self.finalize(StreamEnd::Aborted);
        }
    }
}

/// Yields a cached SSE blob back to a client line by line.
pub fn replay_frames(blob: &str) -> Vec<Bytes> {
    blob.split_inclusive('\n')
        .map(|line| Bytes::copy_from_slice(line.as_bytes()))
        .collect()
}

fn data_payloads(blob: &str) -> impl Iterator<Item = &str> {
    blob.lines().filter_map(|line| {
        let rest = line.strip_prefix("data:")?.trim_start();
        if rest.is_empty() || rest == "[DONE]" {
            return None;
        }
        Some(rest)
    })
}

/// Pulls `usage.total_tokens` out of a captured stream, if the provider
/// reported one.
pub fn extract_usage_total_tokens(blob: &str) -> Option<u64> {
    let mut total = None;
    for payload in data_payloads(blob) {
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        if let Some(tokens) = value
            .get("usage")
            .and_then(|usage| usage.get("total_tokens"))
            .and_then(Value::as_u64)
        {
            total = Some(tokens);
        }
    }
    total
}

/// Fallback estimate when no usage frame arrived: whitespace words / 2.
pub fn approximate_tokens(blob: &str) -> u64 {
    (blob.split_whitespace().count() / 2) as u64
}

/// Concatenates the assistant deltas of a captured stream.
pub fn extract_assistant_content(blob: &str) -> String {
    let mut out = String::new();
    for payload in data_payloads(blob) {
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        let Some(choices) = value.get("choices").and_then(Value::as_array) else {
            continue;
        };
        let Some(first) = choices.first() else {
            continue;
        };
        if let Some(content) = first
            .get("delta")
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str)
        {
            out.push_str(content);
            continue;
        }
        // Non-stream bodies cached as single frames carry message.content.
        if let Some(content) = first
            .get("message")
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
        {
            out.push_str(content);
        }
    }
    out
}

/// Builds the SSE representation of a complete assistant message, used to
/// cache non-streaming responses in the same shape as captured streams.
pub fn synthesize_sse_blob(model: &str, content: &str, total_tokens: u64) -> String {
    let delta = serde_json::json!({
        "id": "chatcmpl-cached",
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{
            "index": 0,
            "delta": {"role": "assistant", "content": content},
            "finish_reason": null,
        }],
    });
    let done = serde_json::json!({
        "id": "chatcmpl-cached",
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{
            "index": 0,
            "delta": {},
            "finish_reason": "stop",
        }],
        "usage": {"total_tokens": total_tokens},
    });
    format!("data: {delta}\n\ndata: {done}\n\ndata: [DONE]\n\n")
}

/// JSON completion envelope for serving a cached response to a
/// non-streaming client.
pub fn synthesize_completion(model: &str, content: &str, created_at: u64) -> Value {
    serde_json::json!({
        "id": "chatcmpl-cached",
        "object": "chat.completion",
        "created": created_at,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
    })
}
