//! Deterministic in-process engine for development and tests.
//!
//! Stands in for the native compute engine behind the `TensorEngine` trait.
//! It keeps a per-slot mirror of the engine-side cache and verifies on
//! every call what a real engine would crash on: batch homogeneity,
//! contiguous cache positions, and the context-length bound. Sampling is
//! scripted so tests can steer generation token by token.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokenloom_common::{LoomError, Result};

use super::{Batch, BatchKind, Input, SamplingState, SlotId, TensorEngine, Token};

/// Token id reserved for end of generation.
pub const EOG_TOKEN: Token = 0;

/// What a cache position holds, as far as this engine cares.
#[derive(Debug, Clone, PartialEq)]
enum CacheCell {
    Token(Token),
    Embedding,
}

/// A scripted generation: once the slot's cache starts with `trigger`, each
/// sample pops the next token until the script runs dry.
#[derive(Debug)]
struct Script {
    trigger: Vec<Token>,
    tokens: VecDeque<Token>,
}

/// Counters shared between the engine and a test that handed the engine
/// off to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct DevProbe {
    decode_calls: Arc<AtomicUsize>,
    shift_calls: Arc<AtomicUsize>,
    max_resident: Arc<AtomicUsize>,
}

impl DevProbe {
    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    pub fn shift_calls(&self) -> usize {
        self.shift_calls.load(Ordering::SeqCst)
    }

    /// Largest cache residency observed for any slot.
    pub fn max_resident(&self) -> usize {
        self.max_resident.load(Ordering::SeqCst)
    }
}

/// Deterministic development engine.
pub struct DevEngine {
    vocab: RwLock<Vec<String>>,
    index: RwLock<HashMap<String, Token>>,
    slots: Mutex<HashMap<SlotId, Vec<CacheCell>>>,
    last_remove: Mutex<Option<(SlotId, usize, usize)>>,
    scripts: Mutex<Vec<Script>>,
    fail_decodes: AtomicUsize,
    probe: DevProbe,
    ctx_limit: Option<usize>,
    cross_attention: bool,
    vision: bool,
}

impl DevEngine {
    pub fn new() -> Self {
        Self {
            // Token 0 is reserved for end of generation.
            vocab: RwLock::new(vec!["</s>".to_string()]),
            index: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            last_remove: Mutex::new(None),
            scripts: Mutex::new(Vec::new()),
            fail_decodes: AtomicUsize::new(0),
            probe: DevProbe::default(),
            ctx_limit: None,
            cross_attention: false,
            vision: false,
        }
    }

    /// Enforce the context bound the way a fixed-size KV cache would.
    pub fn with_ctx_limit(mut self, limit: usize) -> Self {
        self.ctx_limit = Some(limit);
        self
    }

    /// Pretend to be a vision model with cross-attention layers.
    pub fn with_cross_attention(mut self) -> Self {
        self.vision = true;
        self.cross_attention = true;
        self
    }

    /// Intern a word, returning its token id. Tokenization uses the same
    /// table, so scripts can be written in terms of prompt words.
    pub fn token_for(&self, word: &str) -> Token {
        if let Some(&t) = self.index.read().get(word) {
            return t;
        }
        let mut vocab = self.vocab.write();
        let t = vocab.len() as Token;
        vocab.push(word.to_string());
        self.index.write().insert(word.to_string(), t);
        t
    }

    /// Queue a generation script for whichever slot's cache begins with
    /// `trigger` words.
    pub fn script(&self, trigger: &[&str], output: &[&str]) {
        let trigger = trigger.iter().map(|w| self.token_for(w)).collect();
        let tokens = output.iter().map(|w| self.token_for(w)).collect();
        self.scripts.lock().push(Script { trigger, tokens });
    }

    /// Make the next `n` decode calls fail.
    pub fn fail_next_decodes(&self, n: usize) {
        self.fail_decodes.store(n, Ordering::SeqCst);
    }

    /// Shared counter handle that stays usable after the engine moves into
    /// the scheduler.
    pub fn probe(&self) -> DevProbe {
        self.probe.clone()
    }

    pub fn decode_calls(&self) -> usize {
        self.probe.decode_calls()
    }

    pub fn shift_calls(&self) -> usize {
        self.probe.shift_calls()
    }

    /// Largest cache residency observed for any slot.
    pub fn max_resident(&self) -> usize {
        self.probe.max_resident()
    }

    /// Token ids currently resident in a slot's cache.
    pub fn resident_tokens(&self, slot: SlotId) -> Vec<Token> {
        self.slots
            .lock()
            .get(&slot)
            .map(|cells| {
                cells
                    .iter()
                    .filter_map(|c| match c {
                        CacheCell::Token(t) => Some(*t),
                        CacheCell::Embedding => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for DevEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorEngine for DevEngine {
    fn tokenize(&self, text: &str, _add_bos: bool) -> Result<Vec<Token>> {
        Ok(text
            .split_whitespace()
            .map(|word| self.token_for(word))
            .collect())
    }

    fn token_to_piece(&self, token: Token) -> Vec<u8> {
        self.vocab
            .read()
            .get(token as usize)
            .map(|word| format!(" {}", word).into_bytes())
            .unwrap_or_default()
    }

    fn is_eog(&self, token: Token) -> bool {
        token == EOG_TOKEN
    }

    fn adds_bos(&self) -> bool {
        false
    }

    fn supports_vision(&self) -> bool {
        self.vision
    }

    fn uses_cross_attention(&self) -> bool {
        self.cross_attention
    }

    fn embed_image(&mut self, data: &[u8], _aspect_ratio_id: i32) -> Result<Vec<Vec<f32>>> {
        if !self.vision {
            return Err(LoomError::runtime("model has no vision projector"));
        }
        let seed = data.iter().map(|&b| b as u32).sum::<u32>();
        Ok(vec![(0..8)
            .map(|i| ((seed.wrapping_add(i)) % 97) as f32 / 97.0)
            .collect()])
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        let pending = self.fail_decodes.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_decodes.store(pending - 1, Ordering::SeqCst);
            return Err(LoomError::runtime("injected decode failure"));
        }

        let mut slots = self.slots.lock();
        for entry in batch.entries() {
            assert_eq!(
                entry.input.is_embedding(),
                batch.kind() == BatchKind::Embeddings,
                "batch mixes input kinds"
            );

            let cells = slots.entry(entry.slot).or_default();
            assert_eq!(
                entry.pos,
                cells.len(),
                "non-contiguous cache position for slot {}",
                entry.slot
            );

            cells.push(match &entry.input {
                Input::Token(t) => CacheCell::Token(*t),
                Input::Embedding(_) => CacheCell::Embedding,
            });

            if let Some(limit) = self.ctx_limit {
                assert!(
                    cells.len() <= limit,
                    "slot {} exceeded context limit {}",
                    entry.slot,
                    limit
                );
            }
            self.probe
                .max_resident
                .fetch_max(cells.len(), Ordering::SeqCst);
        }

        self.probe.decode_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sample(
        &mut self,
        slot: SlotId,
        state: &mut SamplingState,
        _batch_index: usize,
    ) -> Result<Token> {
        let _ = state.params.temperature;
        let resident = self.resident_tokens(slot);

        let mut scripts = self.scripts.lock();
        for script in scripts.iter_mut() {
            if resident.starts_with(&script.trigger) {
                if let Some(token) = script.tokens.pop_front() {
                    return Ok(token);
                }
            }
        }
        Ok(EOG_TOKEN)
    }

    fn embedding(&mut self, slot: SlotId) -> Result<Vec<f32>> {
        let resident = self.resident_tokens(slot);
        if resident.is_empty() && self.slots.lock().get(&slot).map_or(true, Vec::is_empty) {
            return Err(LoomError::runtime("no decoded state for slot"));
        }
        let seed = resident.iter().map(|&t| t as i64).sum::<i64>();
        Ok((0..8)
            .map(|i| ((seed + i) % 89) as f32 / 89.0)
            .collect())
    }

    fn cache_remove(&mut self, slot: SlotId, start: usize, end: Option<usize>) {
        let mut slots = self.slots.lock();
        let cells = slots.entry(slot).or_default();
        let resolved = end.unwrap_or(cells.len());
        let clamped = resolved.min(cells.len());
        if start < clamped {
            cells.drain(start..clamped);
        }
        // Remember the requested range; a following shift is validated
        // against it even when the mirror held fewer entries.
        *self.last_remove.lock() = Some((slot, start, resolved));
    }

    fn cache_shift(&mut self, slot: SlotId, start: usize, end: usize, delta: isize) {
        // The mirror is index-addressed, so a removal already compacts it.
        // Verify the scheduler asked for the matching remap.
        let last = self.last_remove.lock().take();
        if let Some((last_slot, rm_start, rm_end)) = last {
            assert_eq!(last_slot, slot, "shift for a different slot than the removal");
            assert_eq!(start, rm_end, "shift must start where the removal ended");
            assert_eq!(
                delta,
                -((rm_end - rm_start) as isize),
                "shift delta must close the removed gap"
            );
        }
        let _ = end;
        self.probe.shift_calls.fetch_add(1, Ordering::SeqCst);
    }
}
