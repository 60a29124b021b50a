//! The tensor-engine boundary.
//!
//! Everything the runner needs from the compute engine crosses through the
//! `TensorEngine` trait: tokenization, batched decode, sampling, embedding
//! extraction, and the cache-position bookkeeping that keeps engine-side KV
//! entries aligned with the slot histories the scheduler tracks. Nothing
//! about the engine's memory layout leaks past this module.

use std::collections::VecDeque;

use tokenloom_common::Result;
use tokenloom_wire::SamplingOptions;

pub mod dev;

/// Token id in the engine's vocabulary.
pub type Token = i32;

/// Engine-side cache sequence id. One per cache slot.
pub type SlotId = i32;

/// An element of the prompt to process: either a token or an image
/// embedding produced by a vision projector. Never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Token(Token),
    Embedding(Vec<f32>),
}

impl Input {
    pub fn is_embedding(&self) -> bool {
        matches!(self, Input::Embedding(_))
    }
}

/// The two batch flavors. A batch never mixes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Tokens,
    Embeddings,
}

/// One row of a decode batch.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub input: Input,

    /// Position in the owning slot's cache at submission time.
    pub pos: usize,

    /// Slot whose cache receives this entry.
    pub slot: SlotId,

    /// Whether logits are needed for this row (last input of a sequence).
    pub logits: bool,
}

/// A decode batch, allocated once and refilled every scheduler cycle.
#[derive(Debug)]
pub struct Batch {
    kind: BatchKind,
    per_seq_capacity: usize,
    cross_attention: bool,
    entries: Vec<BatchEntry>,
}

impl Batch {
    /// Create a batch of the given kind. `per_seq_capacity` bounds what one
    /// sequence may contribute per cycle; total capacity is that times the
    /// number of slots.
    pub fn new(kind: BatchKind, per_seq_capacity: usize, max_seqs: usize) -> Self {
        Self {
            kind,
            per_seq_capacity,
            cross_attention: false,
            entries: Vec::with_capacity(per_seq_capacity * max_seqs),
        }
    }

    pub fn add(&mut self, input: Input, pos: usize, slot: SlotId, logits: bool) {
        self.entries.push(BatchEntry {
            input,
            pos,
            slot,
            logits,
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cross_attention = false;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    pub fn per_seq_capacity(&self) -> usize {
        self.per_seq_capacity
    }

    pub fn cross_attention(&self) -> bool {
        self.cross_attention
    }

    pub fn set_cross_attention(&mut self, on: bool) {
        self.cross_attention = on;
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }
}

/// Sampling parameters for one sequence.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub seed: u32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub temperature: f32,
    pub repeat_last_n: i32,
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self::from(&SamplingOptions::default())
    }
}

impl From<&SamplingOptions> for SamplingParams {
    fn from(opts: &SamplingOptions) -> Self {
        Self {
            seed: opts.seed,
            top_k: opts.top_k,
            top_p: opts.top_p,
            min_p: opts.min_p,
            temperature: opts.temperature,
            repeat_last_n: opts.repeat_last_n,
            repeat_penalty: opts.repeat_penalty,
            presence_penalty: opts.presence_penalty,
            frequency_penalty: opts.frequency_penalty,
        }
    }
}

/// Per-sequence sampling state: the parameters plus the window of recently
/// accepted tokens the repeat penalties look at. The engine reads this when
/// sampling; the scheduler feeds accepted tokens back in.
#[derive(Debug)]
pub struct SamplingState {
    pub params: SamplingParams,
    recent: VecDeque<Token>,
}

impl SamplingState {
    pub fn new(params: SamplingParams) -> Self {
        Self {
            params,
            recent: VecDeque::new(),
        }
    }

    /// Record a token as part of the context the penalties consider.
    pub fn accept(&mut self, token: Token) {
        let window = self.params.repeat_last_n.max(0) as usize;
        if window == 0 {
            return;
        }
        if self.recent.len() == window {
            self.recent.pop_front();
        }
        self.recent.push_back(token);
    }

    pub fn recent(&self) -> impl Iterator<Item = &Token> {
        self.recent.iter()
    }
}

/// The opaque compute engine.
///
/// All calls are blocking; the scheduler treats `decode` as one atomic
/// forward pass. `cache_remove` and `cache_shift` keep the engine's KV
/// positions in lockstep with the slot history the cache manager maintains.
pub trait TensorEngine: Send {
    /// Tokenize a piece of prompt text.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>>;

    /// Raw bytes of a token's text piece. May end mid-character.
    fn token_to_piece(&self, token: Token) -> Vec<u8>;

    /// Whether the token ends generation.
    fn is_eog(&self, token: Token) -> bool;

    /// Whether the model prepends a BOS token during tokenization.
    fn adds_bos(&self) -> bool;

    /// Whether the model accepts image embeddings at all.
    fn supports_vision(&self) -> bool {
        false
    }

    /// Whether image inputs route through cross-attention layers.
    fn uses_cross_attention(&self) -> bool {
        false
    }

    /// Turn raw image bytes into projector embeddings.
    fn embed_image(&mut self, data: &[u8], aspect_ratio_id: i32) -> Result<Vec<Vec<f32>>>;

    /// Run one forward pass over the batch. All-or-nothing.
    fn decode(&mut self, batch: &Batch) -> Result<()>;

    /// Sample the next token from the logits at `batch_index`.
    fn sample(
        &mut self,
        slot: SlotId,
        state: &mut SamplingState,
        batch_index: usize,
    ) -> Result<Token>;

    /// Extract the pooled embedding for a slot after its final decode.
    fn embedding(&mut self, slot: SlotId) -> Result<Vec<f32>>;

    /// Drop cache entries `[start, end)` for a slot. `None` means to the
    /// end of the slot's cache.
    fn cache_remove(&mut self, slot: SlotId, start: usize, end: Option<usize>);

    /// Move cache entries `[start, end)` by `delta` positions so the cache
    /// stays contiguous after a removal.
    fn cache_shift(&mut self, slot: SlotId, start: usize, end: usize, delta: isize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_state_window_is_bounded() {
        let mut state = SamplingState::new(SamplingParams {
            repeat_last_n: 3,
            ..Default::default()
        });

        for t in 1..=5 {
            state.accept(t);
        }

        let recent: Vec<Token> = state.recent().copied().collect();
        assert_eq!(recent, vec![3, 4, 5]);
    }

    #[test]
    fn batch_capacity_accounts_for_all_slots() {
        let batch = Batch::new(BatchKind::Tokens, 8, 4);
        assert_eq!(batch.per_seq_capacity(), 8);
        assert!(batch.is_empty());
    }
}
