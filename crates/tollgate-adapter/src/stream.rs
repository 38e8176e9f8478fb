//! Streamed-response plumbing.
//!
//! Upstream SSE bytes are forwarded to the client verbatim as they arrive;
//! a parser taps the same bytes to extract usage. Because forwarding starts
//! only after a 2xx status line, everything that flows here is past the
//! retry window, and a failure mid-stream is terminal by construction.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use tollgate_protocol::gemini::GenerateContentResponse;
use tollgate_protocol::openai::{ChatCompletionChunk, Usage};
use tollgate_protocol::sse::{SseEvent, SseParser};

use crate::count::count_text_tokens;
use crate::upstream::Headers;

/// What the relay hands back to the HTTP layer for one request.
#[derive(Debug)]
pub enum RelayPayload {
    Buffered {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    Stream {
        status: u16,
        headers: Headers,
        content_type: &'static str,
        body: mpsc::Receiver<Bytes>,
    },
}

/// Canonical usage for settlement, plus whether the stream ran to its end.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub usage: Usage,
    pub completed: bool,
}

/// How the pipeline learns the usage of a response.
#[derive(Debug)]
pub enum UsageHandle {
    Immediate(Usage),
    /// Resolved by the stream forwarder after the last frame. A dropped
    /// sender means the forwarder died without reporting; treat as aborted.
    Deferred(oneshot::Receiver<StreamOutcome>),
}

#[derive(Debug)]
pub struct AdapterResponse {
    pub payload: RelayPayload,
    pub usage: UsageHandle,
}

/// Dialect-specific tap on the event stream.
pub trait StreamUsageProbe: Send {
    fn observe(&mut self, event: &SseEvent);
    /// Final usage; estimates the completion side from accumulated text when
    /// the upstream never reported explicit numbers.
    fn finalize(&mut self, prompt_tokens: i64) -> Usage;
}

fn estimate_tokens(text: &str) -> i64 {
    count_text_tokens(text).unwrap_or_else(|_| (text.len() / 4) as i64)
}

/// OpenAI chat SSE: usage rides on the final chunk when the caller asked for
/// it; otherwise completion text is re-counted.
#[derive(Debug, Default)]
pub struct OpenAiStreamProbe {
    reported: Option<Usage>,
    text: String,
}

impl StreamUsageProbe for OpenAiStreamProbe {
    fn observe(&mut self, event: &SseEvent) {
        if event.is_done() {
            return;
        }
        let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(&event.data) else {
            return;
        };
        if let Some(usage) = chunk.usage {
            if usage.total_tokens > 0 || usage.completion_tokens > 0 {
                self.reported = Some(usage);
            }
        }
        for choice in &chunk.choices {
            if let Some(delta) = choice.delta_text() {
                self.text.push_str(delta);
            }
        }
    }

    fn finalize(&mut self, prompt_tokens: i64) -> Usage {
        match self.reported.take() {
            Some(usage) => usage,
            None => Usage::new(prompt_tokens, estimate_tokens(&self.text)),
        }
    }
}

/// Claude messages SSE: input tokens on `message_start`, output tokens on
/// `message_delta`, text on `content_block_delta`.
#[derive(Debug, Default)]
pub struct ClaudeStreamProbe {
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    text: String,
}

impl StreamUsageProbe for ClaudeStreamProbe {
    fn observe(&mut self, event: &SseEvent) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&event.data) else {
            return;
        };
        match event.event.as_deref() {
            Some("message_start") => {
                if let Some(tokens) = value
                    .pointer("/message/usage/input_tokens")
                    .and_then(serde_json::Value::as_i64)
                {
                    self.input_tokens = Some(tokens);
                }
            }
            Some("message_delta") => {
                if let Some(tokens) = value
                    .pointer("/usage/output_tokens")
                    .and_then(serde_json::Value::as_i64)
                {
                    self.output_tokens = Some(tokens);
                }
            }
            Some("content_block_delta") => {
                if let Some(delta) = value
                    .pointer("/delta/text")
                    .and_then(serde_json::Value::as_str)
                {
                    self.text.push_str(delta);
                }
            }
            _ => {}
        }
    }

    fn finalize(&mut self, prompt_tokens: i64) -> Usage {
        let prompt = self.input_tokens.unwrap_or(prompt_tokens);
        let completion = self
            .output_tokens
            .unwrap_or_else(|| estimate_tokens(&self.text));
        Usage::new(prompt, completion)
    }
}

/// Gemini streaming: every frame may carry `usageMetadata`; the last one wins.
#[derive(Debug, Default)]
pub struct GeminiStreamProbe {
    reported: Option<Usage>,
}

impl StreamUsageProbe for GeminiStreamProbe {
    fn observe(&mut self, event: &SseEvent) {
        let Ok(frame) = serde_json::from_str::<GenerateContentResponse>(&event.data) else {
            return;
        };
        if let Some(meta) = frame.usage_metadata {
            self.reported = Some(Usage::new(
                meta.prompt_token_count,
                meta.candidates_token_count,
            ));
        }
    }

    fn finalize(&mut self, prompt_tokens: i64) -> Usage {
        self.reported
            .take()
            .unwrap_or_else(|| Usage::new(prompt_tokens, 0))
    }
}

/// Rewrites upstream events into the caller's stream dialect. Returning an
/// empty vec drops the event.
pub type EventMapper = Box<dyn FnMut(&SseEvent) -> Vec<Bytes> + Send>;

/// Forward upstream bytes to the client while tapping them for usage.
///
/// Without a mapper the raw chunks pass through untouched. With one, each
/// parsed event is re-framed before forwarding. Returns the client-side byte
/// stream and the settlement handle; the forwarder owns copies of everything
/// it needs, keeps running after the request handler returns, and reports
/// exactly once.
pub fn relay_sse_stream(
    mut upstream: mpsc::Receiver<Bytes>,
    mut probe: Box<dyn StreamUsageProbe>,
    prompt_tokens: i64,
    mut mapper: Option<EventMapper>,
) -> (mpsc::Receiver<Bytes>, oneshot::Receiver<StreamOutcome>) {
    let (tx_out, rx_out) = mpsc::channel::<Bytes>(16);
    let (tx_done, rx_done) = oneshot::channel::<StreamOutcome>();

    tokio::spawn(async move {
        let mut parser = SseParser::new();
        let mut completed = true;
        'pump: while let Some(chunk) = upstream.recv().await {
            let events = parser.push_bytes(&chunk);
            for event in &events {
                probe.observe(event);
            }
            match mapper.as_mut() {
                Some(map) => {
                    for event in &events {
                        for frame in map(event) {
                            if tx_out.send(frame).await.is_err() {
                                completed = false;
                                break 'pump;
                            }
                        }
                    }
                }
                None => {
                    if tx_out.send(chunk).await.is_err() {
                        // Client went away; stop reading so the upstream
                        // transfer is cancelled at the next suspension point.
                        completed = false;
                        break;
                    }
                }
            }
        }
        for event in parser.finish() {
            probe.observe(&event);
            if completed {
                if let Some(map) = mapper.as_mut() {
                    for frame in map(&event) {
                        if tx_out.send(frame).await.is_err() {
                            completed = false;
                            break;
                        }
                    }
                }
            }
        }
        let usage = probe.finalize(prompt_tokens);
        let _ = tx_done.send(StreamOutcome { usage, completed });
    });

    (rx_out, rx_done)
}
