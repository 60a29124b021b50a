//! Wire types for the loopback transport between the supervisor and the
//! model-runner process.
//!
//! The transport is plain JSON over loopback HTTP: `POST /completion`
//! streams newline-delimited `CompletionResponse` lines, `POST /embedding`
//! is a single request/response pair, and `GET /health` reports runner
//! status and load progress. Field names here are the transport contract;
//! both sides of the proxy depend on this crate and nothing else shared.

use serde::{Deserialize, Serialize};

/// An image referenced from the prompt by an `[img-<id>]` marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    /// Raw image bytes, already decoded from whatever the outer API used.
    pub data: Vec<u8>,

    /// Marker id the prompt refers to.
    pub id: i32,

    /// Aspect-ratio bucket chosen by the projector preprocessing.
    #[serde(default)]
    pub aspect_ratio_id: i32,
}

/// Sampling options carried on a completion request.
///
/// Defaults match the runner's behavior when a field is omitted: negative
/// `n_predict` means no generation limit, negative `n_keep` means keep the
/// whole prompt when the context window shifts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingOptions {
    #[serde(default = "default_n_predict")]
    pub n_predict: i32,

    #[serde(default = "default_n_keep")]
    pub n_keep: i32,

    #[serde(default)]
    pub seed: u32,

    #[serde(default = "default_top_k")]
    pub top_k: i32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default)]
    pub min_p: f32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: i32,

    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    #[serde(default)]
    pub presence_penalty: f32,

    #[serde(default)]
    pub frequency_penalty: f32,

    /// Stop strings. Generation ends the moment one appears in the output;
    /// the stop string itself is never delivered.
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            n_predict: default_n_predict(),
            n_keep: default_n_keep(),
            seed: 0,
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: 0.0,
            temperature: default_temperature(),
            repeat_last_n: default_repeat_last_n(),
            repeat_penalty: default_repeat_penalty(),
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            stop: Vec::new(),
        }
    }
}

/// Body of `POST /completion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,

    #[serde(default, rename = "image_data")]
    pub images: Vec<ImageData>,

    /// Reuse a cache slot whose resident history shares a prefix with this
    /// prompt instead of recomputing it.
    #[serde(default)]
    pub cache_prompt: bool,

    #[serde(flatten)]
    pub options: SamplingOptions,
}

/// Prompt and generation timing, reported on the final streamed line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub prompt_n: usize,
    pub prompt_ms: f64,
    pub predicted_n: usize,
    pub predicted_ms: f64,
}

/// One newline-delimited line of a streamed completion.
///
/// Intermediate lines carry `content`; the final line has `stop: true`,
/// whether the generation limit ended the sequence, and timing totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub stop: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub stopped_limit: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<Timings>,
}

/// Body of `POST /embedding`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub content: String,

    #[serde(default)]
    pub cache_prompt: bool,
}

/// Response of `POST /embedding`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
}

/// Response of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub progress: f32,
}

/// Externally visible runner states, as reported on `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    LoadingModel,
    Ready,
    NoSlotsAvailable,
    Error,
}

impl RunnerStatus {
    /// The status string carried on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Ready => "ok",
            RunnerStatus::LoadingModel => "loading model",
            RunnerStatus::NoSlotsAvailable => "no slot available",
            RunnerStatus::Error => "server error",
        }
    }

    /// Parse a health status string. Anything unrecognized is an error
    /// report from the runner and maps to `Error`.
    pub fn parse(status: &str) -> Self {
        match status {
            "ok" => RunnerStatus::Ready,
            "loading model" => RunnerStatus::LoadingModel,
            "no slot available" => RunnerStatus::NoSlotsAvailable,
            _ => RunnerStatus::Error,
        }
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn default_n_predict() -> i32 {
    -1
}

fn default_n_keep() -> i32 {
    -1
}

fn default_top_k() -> i32 {
    40
}

fn default_top_p() -> f32 {
    0.9
}

fn default_temperature() -> f32 {
    0.8
}

fn default_repeat_last_n() -> i32 {
    64
}

fn default_repeat_penalty() -> f32 {
    1.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_request_defaults() {
        let req: CompletionRequest =
            serde_json::from_str(r#"{"prompt": "hello"}"#).unwrap();

        assert_eq!(req.prompt, "hello");
        assert!(!req.cache_prompt);
        assert!(req.images.is_empty());
        assert_eq!(req.options.n_predict, -1);
        assert_eq!(req.options.n_keep, -1);
        assert!(req.options.stop.is_empty());
    }

    #[test]
    fn completion_request_flattens_options() {
        let req: CompletionRequest = serde_json::from_str(
            r####"{"prompt": "hi", "n_predict": 5, "stop": ["###"], "cache_prompt": true}"####,
        )
        .unwrap();

        assert_eq!(req.options.n_predict, 5);
        assert_eq!(req.options.stop, vec!["###".to_string()]);
        assert!(req.cache_prompt);
    }

    #[test]
    fn streamed_line_shape() {
        let line = serde_json::to_string(&CompletionResponse {
            content: "abc".to_string(),
            ..Default::default()
        })
        .unwrap();

        // Intermediate lines must not carry final-line fields.
        assert_eq!(line, r#"{"content":"abc","stop":false}"#);
    }

    #[test]
    fn final_line_shape() {
        let line = serde_json::to_string(&CompletionResponse {
            stop: true,
            stopped_limit: true,
            timings: Some(Timings {
                prompt_n: 3,
                prompt_ms: 12.0,
                predicted_n: 5,
                predicted_ms: 40.0,
            }),
            ..Default::default()
        })
        .unwrap();

        assert!(line.contains(r#""stop":true"#));
        assert!(line.contains(r#""stopped_limit":true"#));
        assert!(line.contains(r#""prompt_n":3"#));
        assert!(line.contains(r#""predicted_ms":40.0"#));
    }

    #[test]
    fn health_status_round_trip() {
        for status in [
            RunnerStatus::Ready,
            RunnerStatus::LoadingModel,
            RunnerStatus::NoSlotsAvailable,
            RunnerStatus::Error,
        ] {
            assert_eq!(RunnerStatus::parse(status.as_str()), status);
        }

        assert_eq!(
            RunnerStatus::parse("cuda error 700"),
            RunnerStatus::Error
        );
    }
}
