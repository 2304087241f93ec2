//! A generation request as admitted into a decoder slot.

use candle_core::Tensor;

/// Draft tokens to validate on a speculative slot's next step.
#[derive(Debug, Clone, Default)]
pub struct DraftTokens {
    pub tokens: Vec<u32>,
    /// Draft-model logits `[tokens.len(), vocab]`; required when the request
    /// accepts drafts by distribution.
    pub logits: Option<Tensor>,
}

impl DraftTokens {
    pub fn new(tokens: Vec<u32>) -> Self {
        Self {
            tokens,
            logits: None,
        }
    }

    pub fn with_logits(mut self, logits: Tensor) -> Self {
        self.logits = Some(logits);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub input_ids: Vec<u32>,
    pub max_new_tokens: usize,
    pub end_id: u32,
    pub pad_id: u32,
    /// Generation stops once the sequence ends with any of these.
    pub stop_words: Vec<Vec<u32>>,
    /// Token sequences that must never be completed.
    pub bad_words: Vec<Vec<u32>>,
    /// Additive per-token bias `[vocab]`.
    pub embedding_bias: Option<Vec<f32>>,
    /// Drafts validated on the first step (external draft or Medusa slots).
    pub draft_tokens: DraftTokens,
}

impl Request {
    pub fn new(input_ids: Vec<u32>, max_new_tokens: usize, end_id: u32) -> Self {
        Self {
            input_ids,
            max_new_tokens,
            end_id,
            pad_id: end_id,
            stop_words: Vec::new(),
            bad_words: Vec::new(),
            embedding_bias: None,
            draft_tokens: DraftTokens::default(),
        }
    }

    pub fn with_pad_id(mut self, pad_id: u32) -> Self {
        self.pad_id = pad_id;
        self
    }

    pub fn with_stop_words(mut self, stop_words: Vec<Vec<u32>>) -> Self {
        self.stop_words = stop_words;
        self
    }

    pub fn with_bad_words(mut self, bad_words: Vec<Vec<u32>>) -> Self {
        self.bad_words = bad_words;
        self
    }

    pub fn with_embedding_bias(mut self, bias: Vec<f32>) -> Self {
        self.embedding_bias = Some(bias);
        self
    }

    pub fn with_draft_tokens(mut self, drafts: DraftTokens) -> Self {
        self.draft_tokens = drafts;
        self
    }

    pub fn input_len(&self) -> usize {
        self.input_ids.len()
    }
}
