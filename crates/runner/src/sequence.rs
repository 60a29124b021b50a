//! Per-request sequence state.
//!
//! A sequence is one in-flight generation or embedding request: the prompt
//! inputs still to be evaluated, the generated pieces not yet flushed, the
//! sampling state, the termination policy, and the channels results travel
//! back on. The scheduler owns sequences once they are seated; callers keep
//! the receiving half.

use std::time::Instant;

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use tracing::warn;

use tokenloom_common::{LoomError, Result};
use tokenloom_wire::{ImageData, Timings};

use crate::backend::{Input, SamplingParams, SamplingState, SlotId, TensorEngine, Token};

/// Buffered content lines per sequence before flushes start deferring.
pub const RESPONSE_CHANNEL_CAP: usize = 100;

/// Why a sequence ended. Every sequence reaches exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// Generation limit reached
    Limit,
    /// End-of-generation token or stop string
    Stop,
    /// Decode or sampling failure scoped to this sequence
    Error,
    /// The consumer went away
    Connection,
}

impl DoneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoneReason::Limit => "limit",
            DoneReason::Stop => "stop",
            DoneReason::Error => "error",
            DoneReason::Connection => "connection",
        }
    }
}

/// Terminal report delivered once per sequence.
#[derive(Debug, Clone, Copy)]
pub struct SequenceDone {
    pub reason: DoneReason,
    pub timings: Timings,
}

/// Parameters for creating a sequence.
pub struct SequenceParams {
    pub num_predict: i32,
    pub stop: Vec<String>,
    pub num_keep: i32,
    pub sampling: SamplingParams,
    pub embedding: bool,
}

/// Caller-side half of a sequence: incremental text, the terminal report,
/// and the embedding result for embedding-only requests.
#[derive(Debug)]
pub struct SequenceHandle {
    pub content: mpsc::Receiver<String>,
    pub done: oneshot::Receiver<SequenceDone>,
    pub embedding: oneshot::Receiver<Vec<f32>>,
}

/// Scheduler-side request state.
#[derive(Debug)]
pub struct Sequence {
    /// Cache slot bound at seat time.
    pub(crate) slot: SlotId,

    /// Prompt inputs left to evaluate, then the sampled token feeding the
    /// next cycle.
    pub(crate) inputs: Vec<Input>,

    /// Generated pieces withheld from the caller (possible stop-string
    /// prefixes, unfinished characters).
    pub(crate) pending: Vec<Vec<u8>>,

    /// Batch row holding this sequence's logits after the last decode.
    pub(crate) i_batch: usize,

    pub(crate) num_predicted: usize,
    pub(crate) num_predict: i32,
    pub(crate) stop: Vec<String>,
    pub(crate) sampling: SamplingState,

    /// Inputs preserved at the start of the window across context shifts.
    pub(crate) num_keep: usize,

    pub(crate) cross_attention: bool,
    pub(crate) embedding_only: bool,

    pub(crate) content_tx: mpsc::Sender<String>,
    pub(crate) done_tx: Option<oneshot::Sender<SequenceDone>>,
    pub(crate) embedding_tx: Option<oneshot::Sender<Vec<f32>>>,

    /// Admission unit, released when the sequence is dropped.
    pub(crate) _permit: Option<OwnedSemaphorePermit>,

    pub(crate) started_at: Instant,
    pub(crate) generation_started: Option<Instant>,
    pub(crate) num_decoded: usize,
    pub(crate) num_prompt_inputs: usize,

    pub(crate) last_token: Option<Token>,
    pub(crate) repeats: u32,
}

impl Sequence {
    /// Build a sequence from a prompt, tokenizing text and embedding any
    /// referenced images. Fails when the prompt produces no inputs.
    pub fn new(
        engine: &mut dyn TensorEngine,
        num_ctx: usize,
        prompt: &str,
        images: &[ImageData],
        params: SequenceParams,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<(Self, SequenceHandle)> {
        let started_at = Instant::now();

        let inputs = prompt_inputs(engine, prompt, images)?;
        if inputs.is_empty() {
            return Err(LoomError::runtime("no input provided"));
        }

        let mut num_keep = params.num_keep;
        if num_keep < 0 {
            num_keep = inputs.len() as i32;
        }
        if engine.adds_bos() {
            num_keep += 1;
        }
        // Leave room for at least one input to be discarded during a shift.
        let num_keep = (num_keep.max(0) as usize).min(num_ctx - 1);

        if inputs.len() > num_ctx {
            warn!(
                prompt = inputs.len(),
                limit = num_ctx,
                "input exceeds context length"
            );
        }

        let mut sampling = SamplingState::new(params.sampling);
        for input in &inputs {
            if let Input::Token(t) = input {
                sampling.accept(*t);
            }
        }

        let (content_tx, content_rx) = mpsc::channel(RESPONSE_CHANNEL_CAP);
        let (done_tx, done_rx) = oneshot::channel();
        let (embedding_tx, embedding_rx) = oneshot::channel();

        let num_prompt_inputs = inputs.len();

        Ok((
            Self {
                slot: -1,
                inputs,
                pending: Vec::new(),
                i_batch: 0,
                num_predicted: 0,
                num_predict: params.num_predict,
                stop: params.stop,
                sampling,
                num_keep,
                cross_attention: false,
                embedding_only: params.embedding,
                content_tx,
                done_tx: Some(done_tx),
                embedding_tx: Some(embedding_tx),
                _permit: permit,
                started_at,
                generation_started: None,
                num_decoded: 0,
                num_prompt_inputs,
                last_token: None,
                repeats: 0,
            },
            SequenceHandle {
                content: content_rx,
                done: done_rx,
                embedding: embedding_rx,
            },
        ))
    }

    /// Timing totals as of now.
    pub(crate) fn timings(&self) -> Timings {
        let generation_started = self.generation_started.unwrap_or_else(Instant::now);
        Timings {
            prompt_n: self.num_prompt_inputs,
            prompt_ms: generation_started
                .duration_since(self.started_at)
                .as_secs_f64()
                * 1000.0,
            predicted_n: self.num_decoded,
            predicted_ms: generation_started.elapsed().as_secs_f64() * 1000.0,
        }
    }
}

lazy_static! {
    static ref IMG_MARKER: Regex = Regex::new(r"\[img-(\d+)\]").unwrap();
}

/// Split the prompt on `[img-<n>]` markers, tokenizing the text between
/// them and embedding each referenced image in order.
fn prompt_inputs(
    engine: &mut dyn TensorEngine,
    prompt: &str,
    images: &[ImageData],
) -> Result<Vec<Input>> {
    let mut inputs = Vec::new();

    let ids: Vec<i32> = IMG_MARKER
        .captures_iter(prompt)
        .map(|c| c[1].parse().unwrap_or(-1))
        .collect();
    let parts: Vec<&str> = IMG_MARKER.split(prompt).collect();

    for (i, part) in parts.iter().enumerate() {
        let tokens = engine.tokenize(part, i == 0)?;
        inputs.extend(tokens.into_iter().map(Input::Token));

        if let Some(&id) = ids.get(i) {
            let image = images
                .iter()
                .find(|img| img.id == id)
                .ok_or_else(|| LoomError::runtime(format!("invalid image index: {}", id)))?;

            let embeds = engine.embed_image(&image.data, image.aspect_ratio_id)?;
            inputs.extend(embeds.into_iter().map(Input::Embedding));
        }
    }

    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dev::DevEngine;

    fn params() -> SequenceParams {
        SequenceParams {
            num_predict: -1,
            stop: Vec::new(),
            num_keep: -1,
            sampling: SamplingParams::default(),
            embedding: false,
        }
    }

    #[test]
    fn tokenizes_a_plain_prompt() {
        let mut engine = DevEngine::new();
        let (seq, _handle) =
            Sequence::new(&mut engine, 64, "hello there world", &[], params(), None).unwrap();

        assert_eq!(seq.inputs.len(), 3);
        assert_eq!(seq.num_prompt_inputs, 3);
        assert!(!seq.embedding_only);
    }

    #[test]
    fn rejects_an_empty_prompt() {
        let mut engine = DevEngine::new();
        let err = Sequence::new(&mut engine, 64, "", &[], params(), None).unwrap_err();
        assert!(matches!(err, LoomError::Runtime(_)));
    }

    #[test]
    fn negative_num_keep_keeps_whole_prompt() {
        let mut engine = DevEngine::new();
        let (seq, _handle) =
            Sequence::new(&mut engine, 64, "a b c d", &[], params(), None).unwrap();
        assert_eq!(seq.num_keep, 4);
    }

    #[test]
    fn num_keep_is_clamped_below_context() {
        let mut engine = DevEngine::new();
        let mut p = params();
        p.num_keep = 100;
        let (seq, _handle) = Sequence::new(&mut engine, 8, "a b c", &[], p, None).unwrap();
        assert_eq!(seq.num_keep, 7);
    }

    #[test]
    fn splits_prompt_on_image_markers() {
        let mut engine = DevEngine::new().with_cross_attention();
        let images = vec![ImageData {
            data: vec![1, 2, 3],
            id: 0,
            aspect_ratio_id: 0,
        }];

        let (seq, _handle) = Sequence::new(
            &mut engine,
            64,
            "describe [img-0] briefly",
            &images,
            params(),
            None,
        )
        .unwrap();

        let embeds = seq.inputs.iter().filter(|i| i.is_embedding()).count();
        assert_eq!(embeds, 1);
        // One token before the marker, one after, one embedding between.
        assert_eq!(seq.inputs.len(), 3);
        assert!(seq.inputs[1].is_embedding());
    }

    #[test]
    fn unknown_image_reference_fails() {
        let mut engine = DevEngine::new().with_cross_attention();
        let err = Sequence::new(&mut engine, 64, "see [img-7]", &[], params(), None).unwrap_err();
        assert!(matches!(err, LoomError::Runtime(_)));
    }
}
