//! Per-slot regions of the joint decoding buffers.

use crate::beam::{BeamTables, DISABLED_BEAM_LOG_PROB};
use crate::sampling::FinishedState;

/// One slot's share of the batch-wide tensors.
///
/// Every slot is laid out for `max_beam_width` beams so the batch views are
/// plain concatenations; only the first `beam_width` rows are meaningful.
#[derive(Debug, Clone)]
pub(crate) struct SlotBuffers {
    pub beam_width: usize,
    pub max_beam_width: usize,
    pub max_seq_len: usize,
    pub max_tokens_per_step: usize,
    /// `[max_beam_width, max_seq_len]`.
    pub output_ids: Vec<u32>,
    /// `[max_beam_width, max_seq_len]`.
    pub parent_ids: Vec<u32>,
    /// `[max_beam_width, max_seq_len]`.
    pub log_probs: Vec<f32>,
    /// `[max_beam_width]`.
    pub cum_log_probs: Vec<f32>,
    /// `[max_beam_width]`.
    pub seq_lens: Vec<usize>,
    /// `[max_beam_width]`.
    pub finished: Vec<FinishedState>,
    /// `[max_tokens_per_step, max_beam_width]`.
    pub new_tokens: Vec<u32>,
    /// Drafts validated on the next step (Medusa).
    pub draft_tokens: Vec<u32>,
    /// Drafts proposed by this step for the next one.
    pub next_draft_tokens: Vec<u32>,
    /// Draft tokens accepted by the last step.
    pub accepted_len: usize,
    /// Draft-buffer offsets of the accepted tokens.
    pub accepted_path: Vec<usize>,
}

impl SlotBuffers {
    pub fn new(max_beam_width: usize, max_seq_len: usize, max_tokens_per_step: usize) -> Self {
        let rows = max_beam_width * max_seq_len;
        Self {
            beam_width: 0,
            max_beam_width,
            max_seq_len,
            max_tokens_per_step,
            output_ids: vec![0; rows],
            parent_ids: vec![0; rows],
            log_probs: vec![0.0; rows],
            cum_log_probs: vec![0.0; max_beam_width],
            seq_lens: vec![0; max_beam_width],
            finished: vec![FinishedState::empty(); max_beam_width],
            new_tokens: vec![0; max_tokens_per_step * max_beam_width],
            draft_tokens: Vec::new(),
            next_draft_tokens: Vec::new(),
            accepted_len: 0,
            accepted_path: Vec::new(),
        }
    }

    /// Zero the region and write `prompt` into every live beam.
    pub fn reset(&mut self, beam_width: usize, prompt: &[u32], pad_id: u32, beam_search: bool) {
        self.beam_width = beam_width;
        self.output_ids.fill(pad_id);
        self.parent_ids.fill(0);
        self.log_probs.fill(0.0);
        self.cum_log_probs.fill(0.0);
        self.seq_lens.fill(0);
        self.finished.fill(FinishedState::empty());
        self.new_tokens.fill(pad_id);
        self.draft_tokens.clear();
        self.next_draft_tokens.clear();
        self.accepted_len = 0;
        self.accepted_path.clear();
        for beam in 0..beam_width {
            let start = beam * self.max_seq_len;
            self.output_ids[start..start + prompt.len()].copy_from_slice(prompt);
            self.seq_lens[beam] = prompt.len();
            if beam_search && beam > 0 {
                self.cum_log_probs[beam] = DISABLED_BEAM_LOG_PROB;
            }
        }
    }

    pub fn seq_len(&self) -> usize {
        self.seq_lens[0]
    }

    /// Tokens of beam 0 after the prompt.
    pub fn generated(&self, input_len: usize) -> &[u32] {
        &self.output_ids[input_len.min(self.seq_len())..self.seq_len()]
    }

    /// Tokens generated so far on live beam `beam`, rebuilt from parent ids.
    pub fn beam_history(&self, beam: usize, input_len: usize) -> Vec<u32> {
        let end = self.seq_len();
        let start = input_len.min(end);
        let mut history = vec![0; end - start];
        let mut b = beam;
        for j in (start..end).rev() {
            let at = b * self.max_seq_len + j;
            history[j - start] = self.output_ids[at];
            b = self.parent_ids[at] as usize;
        }
        history
    }

    /// Reset this step's new-token row to `fill`.
    pub fn clear_new_tokens(&mut self, fill: u32) {
        self.new_tokens.fill(fill);
    }

    pub fn set_new_token(&mut self, step: usize, beam: usize, token: u32) {
        self.new_tokens[step * self.max_beam_width + beam] = token;
    }

    /// Live-beam tables over the first `beam_width` rows.
    pub fn beam_tables(&mut self, input_len: usize) -> BeamTables<'_> {
        let rows = self.beam_width * self.max_seq_len;
        BeamTables {
            output_ids: &mut self.output_ids[..rows],
            parent_ids: &mut self.parent_ids[..rows],
            log_probs: &mut self.log_probs[..rows],
            cum_log_probs: &mut self.cum_log_probs[..self.beam_width],
            max_seq_len: self.max_seq_len,
            input_len,
            seq_len: self.seq_lens[0],
        }
    }

    /// Any beam reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.finished[..self.beam_width.max(1)]
            .iter()
            .any(|f| f.is_finished())
    }

    pub fn mark_all(&mut self, set: impl Fn(&mut FinishedState)) {
        for f in &mut self.finished[..self.beam_width.max(1)] {
            set(f);
        }
    }
}
