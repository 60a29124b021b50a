//! Loopback HTTP server for the runner process.
//!
//! Three routes make up the local transport: `POST /completion` streams
//! newline-delimited JSON, `POST /embedding` answers once, `GET /health`
//! reports status and load progress. Admission is a counting semaphore
//! sized to the configured parallelism; the permit rides inside the
//! sequence and frees itself on termination.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{debug, info, warn};

use tokenloom_common::LoomError;
use tokenloom_wire::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, HealthResponse,
    RunnerStatus,
};

use crate::backend::SamplingParams;
use crate::scheduler::Scheduler;
use crate::sequence::{DoneReason, SequenceHandle, SequenceParams};

/// Externally visible runner status plus load progress.
pub struct RunnerState {
    status: parking_lot::RwLock<RunnerStatus>,
    error: parking_lot::RwLock<Option<String>>,
    progress: AtomicU32,
}

impl RunnerState {
    pub fn new() -> Self {
        Self {
            status: parking_lot::RwLock::new(RunnerStatus::LoadingModel),
            error: parking_lot::RwLock::new(None),
            progress: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> RunnerStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: RunnerStatus) {
        *self.status.write() = status;
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *self.error.write() = Some(message.into());
        self.set_status(RunnerStatus::Error);
    }

    /// Load progress in `[0.0, 1.0]`.
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Relaxed))
    }

    pub fn set_progress(&self, progress: f32) {
        self.progress.store(progress.to_bits(), Ordering::Relaxed);
    }

    fn status_string(&self) -> String {
        match self.status() {
            RunnerStatus::Error => self
                .error
                .read()
                .clone()
                .unwrap_or_else(|| RunnerStatus::Error.as_str().to_string()),
            other => other.as_str().to_string(),
        }
    }
}

impl Default for RunnerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub admission: Arc<tokio::sync::Semaphore>,
    pub runner: Arc<RunnerState>,
}

/// Build the runner's route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/completion", post(completion))
        .route("/embedding", post(embedding))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut status = state.runner.status_string();
    if state.runner.status() == RunnerStatus::Ready && !state.scheduler.has_free_slot().await {
        status = RunnerStatus::NoSlotsAvailable.as_str().to_string();
    }

    Json(HealthResponse {
        status,
        progress: state.runner.progress(),
    })
}

async fn completion(
    State(state): State<AppState>,
    Json(req): Json<CompletionRequest>,
) -> Response {
    debug!(prompt_len = req.prompt.len(), images = req.images.len(), "completion request");

    if state.runner.status() != RunnerStatus::Ready {
        return error_response(&LoomError::capacity("model is still loading"));
    }

    let params = SequenceParams {
        num_predict: req.options.n_predict,
        stop: req.options.stop.clone(),
        num_keep: req.options.n_keep,
        sampling: SamplingParams::from(&req.options),
        embedding: false,
    };

    // Admission: wait for a free unit, cancellable by the caller dropping
    // the request.
    let permit = match state.admission.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return error_response(&LoomError::capacity("admission gate closed")),
    };

    let handle = match state
        .scheduler
        .submit(&req.prompt, &req.images, params, req.cache_prompt, Some(permit))
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            warn!(error = %e, "failed to start completion");
            return error_response(&e);
        }
    };

    let stream = async_stream::stream! {
        let SequenceHandle { mut content, done, .. } = handle;

        while let Some(text) = content.recv().await {
            let line = CompletionResponse {
                content: text,
                ..Default::default()
            };
            yield Ok::<Bytes, std::convert::Infallible>(json_line(&line));
        }

        // The content channel closed; the terminal report is already
        // waiting (or the sequence died without one).
        let (reason, timings) = match done.await {
            Ok(done) => (done.reason, Some(done.timings)),
            Err(_) => (DoneReason::Error, None),
        };

        let final_line = CompletionResponse {
            stop: true,
            stopped_limit: reason == DoneReason::Limit,
            timings,
            ..Default::default()
        };
        yield Ok(json_line(&final_line));
    };

    (
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn embedding(
    State(state): State<AppState>,
    Json(req): Json<EmbeddingRequest>,
) -> Response {
    debug!(content_len = req.content.len(), "embedding request");

    if state.runner.status() != RunnerStatus::Ready {
        return error_response(&LoomError::capacity("model is still loading"));
    }

    let params = SequenceParams {
        num_predict: -1,
        stop: Vec::new(),
        num_keep: -1,
        sampling: SamplingParams::default(),
        embedding: true,
    };

    let permit = match state.admission.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return error_response(&LoomError::capacity("admission gate closed")),
    };

    let handle = match state
        .scheduler
        .submit(&req.content, &[], params, req.cache_prompt, Some(permit))
        .await
    {
        Ok(handle) => handle,
        Err(e) => return error_response(&e),
    };

    match handle.embedding.await {
        Ok(embedding) => Json(EmbeddingResponse { embedding }).into_response(),
        Err(_) => error_response(&LoomError::runtime("sequence ended without an embedding")),
    }
}

/// Encode one NDJSON line.
fn json_line<T: serde::Serialize>(value: &T) -> Bytes {
    let mut line = serde_json::to_vec(value).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}

fn error_response(err: &LoomError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    info!(error = %err, status = %status, "request failed");
    (status, err.to_string()).into_response()
}
