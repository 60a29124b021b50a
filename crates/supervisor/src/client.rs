//! HTTP proxy client for a runner process.
//!
//! The supervisor talks to its runner over loopback: streamed
//! newline-delimited JSON for completions, single exchanges for embeddings
//! and health. Malformed lines are protocol errors; transport failures
//! before the runner listens are process errors the readiness loop retries
//! through.

use futures::StreamExt;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use tokenloom_common::{LoomError, Result};
use tokenloom_wire::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, HealthResponse,
};

/// Client bound to one runner's loopback port.
#[derive(Debug, Clone)]
pub struct RunnerClient {
    http: reqwest::Client,
    base: String,
}

impl RunnerClient {
    pub fn new(port: u16) -> Self {
        // Loopback traffic must never route through a proxy.
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base: format!("http://127.0.0.1:{}", port),
        }
    }

    /// One health probe.
    pub async fn health(&self) -> Result<HealthResponse> {
        let resp = self
            .http
            .get(format!("{}/health", self.base))
            .send()
            .await
            .map_err(|e| LoomError::process(format!("health request failed: {}", e)))?;

        resp.json()
            .await
            .map_err(|e| LoomError::protocol(format!("malformed health response: {}", e)))
    }

    /// Stream a completion, forwarding each content line to `tx`. Returns
    /// the final line carrying the stop flag and timings.
    pub async fn completion(
        &self,
        req: &CompletionRequest,
        tx: mpsc::Sender<CompletionResponse>,
    ) -> Result<CompletionResponse> {
        let request_id = Uuid::new_v4();
        debug!(%request_id, prompt_len = req.prompt.len(), "proxying completion");

        let resp = self
            .http
            .post(format!("{}/completion", self.base))
            .json(req)
            .send()
            .await
            .map_err(|e| LoomError::process(format!("completion request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(error_for_status(resp.status(), resp.text().await.ok()));
        }

        let mut stream = resp.bytes_stream();
        let mut buffer = LineBuffer::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| LoomError::protocol(format!("completion stream failed: {}", e)))?;

            for line in buffer.push(&chunk) {
                let parsed: CompletionResponse = serde_json::from_slice(&line).map_err(|e| {
                    LoomError::protocol(format!("malformed runner response: {}", e))
                })?;

                if parsed.stop {
                    debug!(%request_id, "completion finished");
                    return Ok(parsed);
                }

                if tx.send(parsed).await.is_err() {
                    return Err(LoomError::cancelled("completion consumer went away"));
                }
            }
        }

        Err(LoomError::protocol(
            "completion stream ended without a final line",
        ))
    }

    /// One embedding exchange.
    pub async fn embedding(&self, content: &str, cache_prompt: bool) -> Result<Vec<f32>> {
        let resp = self
            .http
            .post(format!("{}/embedding", self.base))
            .json(&EmbeddingRequest {
                content: content.to_string(),
                cache_prompt,
            })
            .send()
            .await
            .map_err(|e| LoomError::process(format!("embedding request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(error_for_status(resp.status(), resp.text().await.ok()));
        }

        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| LoomError::protocol(format!("malformed embedding response: {}", e)))?;
        Ok(parsed.embedding)
    }
}

/// Map a runner HTTP error onto the taxonomy. The body, when present, is
/// the runner's one-line error string.
fn error_for_status(status: StatusCode, body: Option<String>) -> LoomError {
    let detail = body
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| status.to_string());
    match status {
        StatusCode::SERVICE_UNAVAILABLE => LoomError::capacity(detail),
        StatusCode::BAD_REQUEST => LoomError::config(detail),
        _ => LoomError::runtime(detail),
    }
}

/// Splits a byte stream into newline-delimited frames, holding partial
/// lines across chunks.
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed a chunk, returning every completed line. Empty lines are
    /// skipped.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(at) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=at).collect();
            line.pop();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_chunks() {
        let mut buffer = LineBuffer::new();

        assert!(buffer.push(b"{\"content\":").is_empty());
        let lines = buffer.push(b"\"a\"}\n{\"content\":\"b\"}\n{\"st");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], br#"{"content":"a"}"#);
        assert_eq!(lines[1], br#"{"content":"b"}"#);

        let lines = buffer.push(b"op\":true}\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], br#"{"stop":true}"#);
    }

    #[test]
    fn empty_lines_are_skipped() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"\n\n{\"content\":\"x\"}\n\n");
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn completion_lines_decode() {
        let line = br#"{"content":"hi","stop":false}"#;
        let parsed: CompletionResponse = serde_json::from_slice(line).unwrap();
        assert_eq!(parsed.content, "hi");
        assert!(!parsed.stop);
    }

    #[test]
    fn malformed_line_is_a_protocol_error() {
        let err = serde_json::from_slice::<CompletionResponse>(b"{nope")
            .map_err(|e| LoomError::protocol(format!("malformed runner response: {}", e)))
            .unwrap_err();
        assert!(matches!(err, LoomError::Protocol(_)));
    }

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert!(matches!(
            error_for_status(StatusCode::SERVICE_UNAVAILABLE, None),
            LoomError::Capacity(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::BAD_REQUEST, Some("bad n_keep".into())),
            LoomError::Config(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::INTERNAL_SERVER_ERROR, None),
            LoomError::Runtime(_)
        ));
    }
}
