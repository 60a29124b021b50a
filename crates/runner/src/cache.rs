//! KV cache slot management
//!
//! A fixed pool of cache slots, one per concurrently active sequence. A new
//! prompt either reuses the free slot sharing the longest input prefix with
//! it, skipping recomputation of the shared part, or takes any free slot
//! from a clean start. When a slot's history would outgrow the context
//! window, a shift evicts part of the window while preserving a stable
//! prefix of `num_keep` inputs.

use tracing::debug;

use tokenloom_common::{LoomError, Result, METRICS};

use crate::backend::{Input, SlotId, TensorEngine};

/// One cache slot: what is resident in the engine's KV cache for this id.
#[derive(Debug)]
pub struct CacheSlot {
    pub id: SlotId,

    /// Inputs resident in the engine cache, in order. Always a prefix of
    /// the stream the slot accepted; only ever appended to or truncated.
    pub inputs: Vec<Input>,

    pub in_use: bool,
}

/// The slot pool. Sized to the configured parallelism; mutated only by the
/// scheduler loop and by handlers holding the scheduler's lock.
#[derive(Debug)]
pub struct SlotTable {
    num_ctx: usize,
    slots: Vec<CacheSlot>,
}

impl SlotTable {
    pub fn new(num_ctx: usize, parallel: usize) -> Self {
        let slots = (0..parallel)
            .map(|i| CacheSlot {
                id: i as SlotId,
                inputs: Vec::new(),
                in_use: false,
            })
            .collect();
        Self { num_ctx, slots }
    }

    pub fn num_ctx(&self) -> usize {
        self.num_ctx
    }

    pub fn get(&self, id: SlotId) -> &CacheSlot {
        &self.slots[id as usize]
    }

    pub fn get_mut(&mut self, id: SlotId) -> &mut CacheSlot {
        &mut self.slots[id as usize]
    }

    pub fn in_use_count(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    /// Mark a slot free again. Its history stays resident for future
    /// prefix reuse.
    pub fn release(&mut self, id: SlotId) {
        self.slots[id as usize].in_use = false;
    }

    /// Bind a slot for a new prompt.
    ///
    /// With `reuse`, picks the free slot whose resident history shares the
    /// longest prefix with `prompt` and returns the prompt with that prefix
    /// stripped; the engine cache is truncated to the shared part. When the
    /// whole prompt is resident, one trailing input is left unconsumed so
    /// the next decode still produces logits to sample from. Without
    /// `reuse`, any free slot is taken and fully reset.
    pub fn load_slot(
        &mut self,
        engine: &mut dyn TensorEngine,
        prompt: Vec<Input>,
        reuse: bool,
    ) -> Result<(SlotId, Vec<Input>)> {
        let idx = if reuse {
            let mut best: Option<(usize, usize)> = None;
            for (i, slot) in self.slots.iter().enumerate() {
                if slot.in_use {
                    continue;
                }
                let shared = common_prefix(&slot.inputs, &prompt);
                if best.map_or(true, |(_, len)| shared > len) {
                    best = Some((i, shared));
                }
            }
            best.map(|(i, _)| i)
        } else {
            self.slots.iter().position(|s| !s.in_use)
        };

        let Some(idx) = idx else {
            return Err(LoomError::capacity("no free cache slot"));
        };

        let slot = &mut self.slots[idx];
        slot.in_use = true;

        if reuse {
            let mut shared = common_prefix(&slot.inputs, &prompt);
            if shared == prompt.len() {
                // Leave one input so there is something to decode.
                shared -= 1;
            }
            engine.cache_remove(slot.id, shared, None);
            slot.inputs.truncate(shared);
            METRICS.scheduler.prefix_reused_total.inc_by(shared as u64);
            debug!(slot = slot.id, shared, total = prompt.len(), "reusing cache slot");
            Ok((slot.id, prompt[shared..].to_vec()))
        } else {
            engine.cache_remove(slot.id, 0, None);
            slot.inputs.clear();
            debug!(slot = slot.id, total = prompt.len(), "loading fresh cache slot");
            Ok((slot.id, prompt))
        }
    }

    /// Make room to append one more input to a full slot.
    ///
    /// Preserves `inputs[..num_keep]` untouched and discards half of the
    /// remaining window (at least one input) starting at `num_keep`,
    /// shifting the tail left in the engine cache so positions stay
    /// contiguous. The eviction fraction is policy, not contract.
    pub fn shift_slot(
        &mut self,
        engine: &mut dyn TensorEngine,
        id: SlotId,
        num_keep: usize,
    ) -> Result<()> {
        if num_keep + 1 > self.num_ctx {
            return Err(LoomError::config(format!(
                "num_keep {} leaves no room to shift within context {}",
                num_keep, self.num_ctx
            )));
        }

        let slot = &mut self.slots[id as usize];
        let len = slot.inputs.len();
        let discard = ((len - num_keep) / 2).max(1);

        debug!(
            slot = id,
            resident = len,
            num_keep,
            discard,
            "shifting context window"
        );

        engine.cache_remove(id, num_keep, Some(num_keep + discard));
        engine.cache_shift(id, num_keep + discard, len, -(discard as isize));
        slot.inputs.drain(num_keep..num_keep + discard);

        METRICS.scheduler.cache_shifts_total.inc();
        Ok(())
    }
}

/// Length of the longest common prefix of two input streams. Embeddings
/// compare by value, so an image never falsely extends a match.
fn common_prefix(a: &[Input], b: &[Input]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dev::DevEngine;

    fn tokens(engine: &DevEngine, words: &str) -> Vec<Input> {
        engine
            .tokenize(words, false)
            .unwrap()
            .into_iter()
            .map(Input::Token)
            .collect()
    }

    #[test]
    fn fresh_load_returns_all_inputs() {
        let mut engine = DevEngine::new();
        let mut table = SlotTable::new(16, 2);
        let prompt = tokens(&engine, "a b c");

        let (slot, remaining) = table.load_slot(&mut engine, prompt.clone(), false).unwrap();
        assert_eq!(remaining, prompt);
        assert!(table.get(slot).in_use);
        assert!(table.get(slot).inputs.is_empty());
    }

    #[test]
    fn prefix_reuse_strips_shared_inputs() {
        let mut engine = DevEngine::new();
        let mut table = SlotTable::new(16, 2);

        let first = tokens(&engine, "sys prompt hello");
        let (slot, _) = table.load_slot(&mut engine, first.clone(), true).unwrap();
        table.get_mut(slot).inputs = first;
        table.release(slot);

        let second = tokens(&engine, "sys prompt goodbye");
        let (slot2, remaining) = table.load_slot(&mut engine, second.clone(), true).unwrap();

        assert_eq!(slot2, slot);
        // Two shared inputs stripped, one divergent input left.
        assert_eq!(remaining.len(), second.len() - 2);
        assert_eq!(table.get(slot2).inputs.len(), 2);
    }

    #[test]
    fn full_prefix_match_leaves_one_input() {
        let mut engine = DevEngine::new();
        let mut table = SlotTable::new(16, 1);

        let prompt = tokens(&engine, "x y z");
        let (slot, _) = table.load_slot(&mut engine, prompt.clone(), true).unwrap();
        table.get_mut(slot).inputs = prompt.clone();
        table.release(slot);

        let (_, remaining) = table.load_slot(&mut engine, prompt, true).unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn no_free_slot_is_a_capacity_error() {
        let mut engine = DevEngine::new();
        let mut table = SlotTable::new(16, 1);

        let prompt = tokens(&engine, "p");
        table.load_slot(&mut engine, prompt.clone(), false).unwrap();

        let err = table.load_slot(&mut engine, prompt, false).unwrap_err();
        assert!(matches!(err, LoomError::Capacity(_)));
    }

    #[test]
    fn shift_preserves_prefix_and_shrinks_window() {
        let mut engine = DevEngine::new();
        let mut table = SlotTable::new(8, 1);

        let prompt = tokens(&engine, "k0 k1 a b c d e f");
        let (slot, _) = table.load_slot(&mut engine, prompt.clone(), false).unwrap();
        table.get_mut(slot).inputs = prompt.clone();

        table.shift_slot(&mut engine, slot, 2).unwrap();

        let inputs = &table.get(slot).inputs;
        assert_eq!(&inputs[..2], &prompt[..2]);
        assert!(inputs.len() < 8);
        // Half of the six-input window past num_keep is gone.
        assert_eq!(inputs.len(), 5);
    }

    #[test]
    fn shift_rejects_unschedulable_num_keep() {
        let mut engine = DevEngine::new();
        let mut table = SlotTable::new(4, 1);

        let err = table.shift_slot(&mut engine, 0, 4).unwrap_err();
        assert!(matches!(err, LoomError::Config(_)));
    }

    #[test]
    fn shift_evicts_at_least_one_input() {
        let mut engine = DevEngine::new();
        let mut table = SlotTable::new(4, 1);

        let prompt = tokens(&engine, "a b c d");
        let (slot, _) = table.load_slot(&mut engine, prompt.clone(), false).unwrap();
        table.get_mut(slot).inputs = prompt;

        // num_keep == ctx - 1 leaves a single-input window; the shift must
        // still free a position.
        table.shift_slot(&mut engine, slot, 3).unwrap();
        assert_eq!(table.get(slot).inputs.len(), 3);
    }

    #[test]
    fn embeddings_do_not_extend_a_prefix_by_kind_alone() {
        let a = vec![Input::Token(1), Input::Embedding(vec![0.1])];
        let b = vec![Input::Token(1), Input::Embedding(vec![0.2])];
        assert_eq!(common_prefix(&a, &b), 1);

        let c = vec![Input::Token(1), Input::Embedding(vec![0.1])];
        assert_eq!(common_prefix(&a, &c), 2);
    }
}
