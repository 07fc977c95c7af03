//! Streaming completion client.
//!
//! Both wire protocols are line oriented: the response body is split into
//! lines (across chunk boundaries), each line is parsed into a token, a skip,
//! or an end marker, and tokens are yielded lazily as they arrive.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionProvider, LlmBackend, LlmConfig, TokenStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Streams chat completions from an Ollama or OpenAI-compatible backend.
pub struct CompletionClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl CompletionClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| config.unavailable(format!("Failed to build HTTP client: {e}")))?;
        info!(
            provider = %config.provider,
            model = %config.model,
            base_url = %config.base_url,
            "Completion client ready"
        );
        Ok(Self { http, config })
    }

    fn request(&self, messages: &[ChatMessage]) -> reqwest::RequestBuilder {
        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
        });
        match self.config.backend {
            LlmBackend::Ollama => self
                .http
                .post(format!("{}/api/chat", self.config.base_url))
                .json(&body),
            LlmBackend::OpenAiCompatible => {
                let mut req = self
                    .http
                    .post(format!("{}/v1/chat/completions", self.config.base_url))
                    .json(&body);
                if let Some(key) = &self.config.api_key
                    && !key.expose_secret().is_empty()
                {
                    req = req.bearer_auth(key.expose_secret());
                }
                req
            }
        }
    }
}

#[async_trait]
impl CompletionProvider for CompletionClient {
    fn provider_name(&self) -> &str {
        &self.config.provider
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, LlmError> {
        let resp = self.request(messages).send().await.map_err(|e| {
            self.config
                .unavailable(format!("Cannot reach {}: {e}", self.config.base_url))
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(self.config.unavailable(format!("returned {status}: {body}")));
        }

        let parse: fn(&str) -> LineEvent = match self.config.backend {
            LlmBackend::Ollama => parse_ndjson_line,
            LlmBackend::OpenAiCompatible => parse_sse_line,
        };
        let body = resp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed();
        Ok(token_stream(body, parse, self.config.provider.clone()))
    }
}

// ── Line protocol ───────────────────────────────────────────────────

/// Meaning of one protocol line.
#[derive(Debug, PartialEq)]
pub(crate) enum LineEvent {
    Token(String),
    Skip,
    Done,
}

/// Ollama NDJSON: `{"message": {"content": "..."}, "done": false}`.
pub(crate) fn parse_ndjson_line(line: &str) -> LineEvent {
    let line = line.trim();
    if line.is_empty() {
        return LineEvent::Skip;
    }
    let Ok(data) = serde_json::from_str::<Value>(line) else {
        debug!(line, "Dropping malformed NDJSON line");
        return LineEvent::Skip;
    };
    if data.get("done").and_then(Value::as_bool).unwrap_or(false) {
        return LineEvent::Done;
    }
    match data.pointer("/message/content").and_then(Value::as_str) {
        Some(token) if !token.is_empty() => LineEvent::Token(token.to_string()),
        _ => LineEvent::Skip,
    }
}

/// OpenAI SSE: `data: {"choices": [{"delta": {"content": "..."}}]}`, ending with `data: [DONE]`.
pub(crate) fn parse_sse_line(line: &str) -> LineEvent {
    let Some(payload) = line.strip_prefix("data:") else {
        return LineEvent::Skip;
    };
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload.trim() == "[DONE]" {
        return LineEvent::Done;
    }
    let Ok(data) = serde_json::from_str::<Value>(payload) else {
        debug!(line, "Dropping malformed SSE line");
        return LineEvent::Skip;
    };
    match data.pointer("/choices/0/delta/content").and_then(Value::as_str) {
        Some(token) if !token.is_empty() => LineEvent::Token(token.to_string()),
        _ => LineEvent::Skip,
    }
}

/// Reassembles lines from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and drain every complete line (without `\n` / `\r\n`).
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left once the body has ended.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

type ByteStream = BoxStream<'static, Result<Vec<u8>, reqwest::Error>>;

struct StreamState {
    body: ByteStream,
    lines: LineBuffer,
    pending: VecDeque<String>,
    parse: fn(&str) -> LineEvent,
    provider: String,
    eof: bool,
    finished: bool,
}

/// Turn a raw response body into a lazy token stream.
fn token_stream(body: ByteStream, parse: fn(&str) -> LineEvent, provider: String) -> TokenStream {
    let state = StreamState {
        body,
        lines: LineBuffer::default(),
        pending: VecDeque::new(),
        parse,
        provider,
        eof: false,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }
            if let Some(line) = st.pending.pop_front() {
                match (st.parse)(&line) {
                    LineEvent::Token(token) => return Some((Ok(token), st)),
                    LineEvent::Skip => continue,
                    LineEvent::Done => return None,
                }
            }
            if st.eof {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    let lines = st.lines.push(&chunk);
                    st.pending.extend(lines);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    let err = LlmError::Unavailable {
                        provider: st.provider.clone(),
                        reason: format!("stream interrupted: {e}"),
                    };
                    return Some((Err(err), st));
                }
                None => {
                    st.eof = true;
                    if let Some(rest) = st.lines.finish() {
                        st.pending.push_back(rest);
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: &[&str]) -> ByteStream {
        let chunks: Vec<Result<Vec<u8>, reqwest::Error>> =
            chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        stream::iter(chunks).boxed()
    }

    async fn collect(stream: TokenStream) -> Vec<String> {
        stream.map(|t| t.unwrap()).collect().await
    }

    #[test]
    fn ndjson_lines() {
        assert_eq!(
            parse_ndjson_line(r#"{"message":{"content":"Hi"},"done":false}"#),
            LineEvent::Token("Hi".into())
        );
        assert_eq!(
            parse_ndjson_line(r#"{"message":{"content":""},"done":false}"#),
            LineEvent::Skip
        );
        assert_eq!(parse_ndjson_line(r#"{"done":true}"#), LineEvent::Done);
        assert_eq!(parse_ndjson_line("not json"), LineEvent::Skip);
        assert_eq!(parse_ndjson_line(""), LineEvent::Skip);
    }

    #[test]
    fn sse_lines() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#),
            LineEvent::Token("Hel".into())
        );
        assert_eq!(
            parse_sse_line(r#"data:{"choices":[{"delta":{"content":"lo"}}]}"#),
            LineEvent::Token("lo".into())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), LineEvent::Done);
        assert_eq!(parse_sse_line(": keep-alive"), LineEvent::Skip);
        assert_eq!(parse_sse_line(r#"data: {"choices":[]}"#), LineEvent::Skip);
        assert_eq!(parse_sse_line(r#"data: {"choices":[{"delta":{}}]}"#), LineEvent::Skip);
        assert_eq!(parse_sse_line("data: {broken"), LineEvent::Skip);
    }

    #[test]
    fn line_buffer_joins_split_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        let lines = buf.push(b":1}\r\ndata: [DO");
        assert_eq!(lines, vec!["data: {\"a\":1}".to_string()]);
        assert!(buf.push(b"NE]").is_empty());
        assert_eq!(buf.finish().as_deref(), Some("data: [DONE]"));
        assert_eq!(buf.finish(), None);
    }

    #[tokio::test]
    async fn ndjson_stream_stops_at_done() {
        let stream = token_stream(
            body(&[
                "{\"message\":{\"content\":\"Hel\"},\"done\":false}\n{\"message\":{\"con",
                "tent\":\"lo\"},\"done\":false}\ngarbage\n",
                "{\"message\":{\"content\":\"\"},\"done\":true}\n",
                "{\"message\":{\"content\":\"never\"},\"done\":false}\n",
            ]),
            parse_ndjson_line,
            "ollama".into(),
        );
        assert_eq!(collect(stream).await, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn sse_stream_stops_at_done_marker() {
        let stream = token_stream(
            body(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
                "event: ping\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\ndata: [DONE]\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
            ]),
            parse_sse_line,
            "openai".into(),
        );
        assert_eq!(collect(stream).await, vec!["Hi", " there"]);
    }

    #[tokio::test]
    async fn stream_ends_on_close_without_marker() {
        let stream = token_stream(
            body(&["{\"message\":{\"content\":\"tail\"},\"done\":false}"]),
            parse_ndjson_line,
            "ollama".into(),
        );
        assert_eq!(collect(stream).await, vec!["tail"]);
    }
}
