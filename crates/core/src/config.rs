use serde::Deserialize;

use crate::error::{DecodeError, Result};
use crate::sampling::MAX_TOP_K;

/// Batch-wide decoding mode, fixed at setup.
///
/// The mode decides which per-slot paths the decoder is prepared to run;
/// individual slots still choose greedy, top-k or top-p from their
/// `SamplingConfig` when the mode allows sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodingMode {
    /// Sampling for beam width 1, beam search otherwise.
    #[default]
    Auto,
    TopK,
    TopP,
    TopKTopP,
    BeamSearch,
    /// Tree-structured multi-head draft tokens validated against the target.
    Medusa,
    /// Draft tokens supplied by an external proposer every step.
    ExternalDraftTokens,
}

impl DecodingMode {
    pub fn allows_beam_search(&self) -> bool {
        matches!(self, DecodingMode::Auto | DecodingMode::BeamSearch)
    }

    pub fn is_speculative(&self) -> bool {
        matches!(
            self,
            DecodingMode::Medusa | DecodingMode::ExternalDraftTokens
        )
    }
}

/// Capacity and execution settings for a decoding session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecoderSetup {
    pub mode: DecodingMode,
    pub max_batch_size: usize,
    pub max_beam_width: usize,
    /// Attention window passed through to the attention collaborator.
    pub max_attention_window: usize,
    /// Tokens pinned at the start of a cyclic attention window.
    pub sink_token_length: usize,
    pub max_sequence_length: usize,
    /// Tokens a slot may emit in one step (draft length + 1 when speculating).
    pub max_tokens_per_step: usize,
    /// One shared stream stepping every slot, instead of per-group streams.
    pub fused_decoder: bool,
    /// Stream count for the unfused path.
    pub num_streams: usize,
    /// Upper bound on per-request top-k; sizes the workspace.
    pub max_top_k: usize,
    /// Medusa tree, one entry per draft node: the top-k rank chosen at each head.
    pub medusa_choices: Option<Vec<Vec<usize>>>,
}

impl Default for DecoderSetup {
    fn default() -> Self {
        Self {
            mode: DecodingMode::Auto,
            max_batch_size: 8,
            max_beam_width: 1,
            max_attention_window: 2048,
            sink_token_length: 0,
            max_sequence_length: 2048,
            max_tokens_per_step: 1,
            fused_decoder: true,
            num_streams: 4,
            max_top_k: 64,
            medusa_choices: None,
        }
    }
}

impl DecoderSetup {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(DecodeError::InvalidConfig(
                "max_batch_size must be > 0".to_string(),
            ));
        }
        if self.max_beam_width == 0 {
            return Err(DecodeError::InvalidConfig(
                "max_beam_width must be > 0".to_string(),
            ));
        }
        if self.max_beam_width > 1 && !self.mode.allows_beam_search() {
            return Err(DecodeError::InvalidConfig(format!(
                "mode {:?} does not support beam width {}",
                self.mode, self.max_beam_width
            )));
        }
        if self.max_sequence_length == 0 {
            return Err(DecodeError::InvalidConfig(
                "max_sequence_length must be > 0".to_string(),
            ));
        }
        if self.max_tokens_per_step == 0 {
            return Err(DecodeError::InvalidConfig(
                "max_tokens_per_step must be > 0".to_string(),
            ));
        }
        if self.max_tokens_per_step > 1 && !self.mode.is_speculative() {
            return Err(DecodeError::InvalidConfig(format!(
                "mode {:?} emits one token per step, got max_tokens_per_step {}",
                self.mode, self.max_tokens_per_step
            )));
        }
        if self.max_top_k > MAX_TOP_K {
            return Err(DecodeError::UnsupportedParameter {
                name: "max_top_k",
                value: self.max_top_k,
                max: MAX_TOP_K,
            });
        }
        if !self.fused_decoder && self.num_streams == 0 {
            return Err(DecodeError::InvalidConfig(
                "unfused decoding needs at least one stream".to_string(),
            ));
        }
        match (&self.mode, &self.medusa_choices) {
            (DecodingMode::Medusa, None) => {
                return Err(DecodeError::InvalidConfig(
                    "medusa mode requires medusa_choices".to_string(),
                ))
            }
            (DecodingMode::Medusa, Some(choices)) if choices.len() + 1 > self.max_tokens_per_step => {
                return Err(DecodeError::InvalidConfig(format!(
                    "medusa tree has {} nodes but max_tokens_per_step is {}",
                    choices.len() + 1,
                    self.max_tokens_per_step
                )))
            }
            _ => {}
        }
        Ok(())
    }

    /// Number of streams actually created.
    pub fn stream_count(&self) -> usize {
        if self.fused_decoder {
            1
        } else {
            self.num_streams.min(self.max_batch_size)
        }
    }

    /// Slots served by the busiest stream.
    pub fn slots_per_stream(&self) -> usize {
        self.max_batch_size.div_ceil(self.stream_count())
    }

    /// Maximum number of draft tokens a slot carries between steps.
    pub fn max_draft_len(&self) -> usize {
        self.max_tokens_per_step - 1
    }

    /// KV-cache position of absolute token `position` under a cyclic window
    /// with `sink_token_length` pinned tokens.
    pub fn kv_cache_position(&self, position: usize) -> usize {
        let sink = self.sink_token_length.min(self.max_attention_window);
        if position < self.max_attention_window || self.max_attention_window <= sink {
            return position.min(self.max_attention_window.saturating_sub(1));
        }
        sink + (position - sink) % (self.max_attention_window - sink)
    }
}
