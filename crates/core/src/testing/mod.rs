//! Shared test utilities for batchdec-core.
//!
//! [`ScriptedModel`] stands in for the model-execution side: it emits logits
//! that peak at a scripted token per slot and position, so decoder runs are
//! deterministic without a real model.

use std::collections::HashMap;

use candle_core::{Device, Tensor};

use crate::decoder::DecoderBatchInput;

/// Logit value given to the scripted token; every other entry is 0.
pub const SCRIPTED_PEAK: f32 = 10.0;

/// A mock model that replays a token script per slot.
#[derive(Debug, Clone)]
pub struct ScriptedModel {
    vocab_size: usize,
    vocab_size_padded: usize,
    device: Device,
    scripts: HashMap<usize, Vec<u32>>,
}

impl ScriptedModel {
    pub fn new(vocab_size: usize, vocab_size_padded: usize, device: Device) -> Self {
        Self {
            vocab_size,
            vocab_size_padded,
            device,
            scripts: HashMap::new(),
        }
    }

    pub fn cpu(vocab_size: usize) -> Self {
        Self::new(vocab_size, vocab_size, Device::Cpu)
    }

    pub fn with_padding(mut self, vocab_size_padded: usize) -> Self {
        self.vocab_size_padded = vocab_size_padded.max(self.vocab_size);
        self
    }

    pub fn with_script(mut self, slot: usize, tokens: Vec<u32>) -> Self {
        self.scripts.insert(slot, tokens);
        self
    }

    /// Scripted token at `position`; the last token repeats past the end and
    /// unscripted slots always produce 0.
    pub fn token_at(&self, slot: usize, position: usize) -> u32 {
        self.scripts
            .get(&slot)
            .and_then(|s| s.get(position).or_else(|| s.last()))
            .copied()
            .unwrap_or(0)
    }

    /// `[rows, vocab_size_padded]` where row `r` peaks at the token scripted
    /// for `position + r`.
    pub fn logits(&self, slot: usize, position: usize, rows: usize) -> candle_core::Result<Tensor> {
        let mut values = vec![0.0f32; rows * self.vocab_size_padded];
        for r in 0..rows {
            let token = self.token_at(slot, position + r) as usize;
            if token < self.vocab_size {
                values[r * self.vocab_size_padded + token] = SCRIPTED_PEAK;
            }
        }
        Tensor::from_vec(values, (rows, self.vocab_size_padded), &self.device)
    }

    /// One batch input; `positions[slot]` is the slot's script position, or
    /// `None` to leave the slot out.
    pub fn batch_input(
        &self,
        positions: &[Option<usize>],
        rows: usize,
    ) -> candle_core::Result<DecoderBatchInput> {
        let logits = positions
            .iter()
            .enumerate()
            .map(|(slot, pos)| pos.map(|p| self.logits(slot, p, rows)).transpose())
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(DecoderBatchInput::new(logits))
    }
}
