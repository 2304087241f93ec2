//! Beam search: online top-2K candidate selection, completed-beam tracking
//! and the final backtrace.
//!
//! Live beams are stored without reordering. Every step writes the chosen
//! token and its source beam at position `seq_len`, and a sequence is rebuilt
//! by following parent ids backwards.

mod finalize;
mod hypotheses;
mod search;

pub use finalize::{finalize_beams, FinalizedBeams};
pub use hypotheses::BeamHypotheses;
pub use search::{beam_search_step, BeamParams, BeamStepOutcome};

use serde::{Deserialize, Serialize};

/// Cumulative log-prob of a live beam that must never be expanded: beams 1..
/// at admission, and live rows left unfilled by a step.
pub const DISABLED_BEAM_LOG_PROB: f32 = -1e20;

/// When a request with `beam_width` completed beams stops searching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyStopping {
    /// Compare the worst completed beam with the best live beam at the
    /// current length.
    #[default]
    Heuristic,
    /// Stop as soon as `beam_width` beams completed.
    Always,
    /// Compare against the best score attainable at maximum length.
    Never,
}

/// `log_prob / length^length_penalty`; unchanged when the penalty is 0 or
/// the length is at most 1.
pub fn apply_length_penalty(log_prob: f32, length: usize, length_penalty: f32) -> f32 {
    if length_penalty == 0.0 || length <= 1 {
        log_prob
    } else {
        log_prob / (length as f32).powf(length_penalty)
    }
}

/// Per-slot live-beam tables, each `[beam_width, max_seq_len]` row-major.
#[derive(Debug)]
pub struct BeamTables<'a> {
    pub output_ids: &'a mut [u32],
    pub parent_ids: &'a mut [u32],
    pub log_probs: &'a mut [f32],
    /// `[beam_width]`.
    pub cum_log_probs: &'a mut [f32],
    pub max_seq_len: usize,
    pub input_len: usize,
    /// Current length shared by every live beam; the next token lands here.
    pub seq_len: usize,
}

impl BeamTables<'_> {
    /// Rebuild positions `0..end` of the beam whose token at `end - 1` was
    /// written by `last_beam`. The prompt is shared by all beams.
    pub(crate) fn backtrace(
        &self,
        end: usize,
        last_beam: usize,
        ids_out: &mut [u32],
        log_probs_out: &mut [f32],
    ) {
        let prompt = self.input_len.min(end);
        ids_out[..prompt].copy_from_slice(&self.output_ids[..prompt]);
        log_probs_out[..prompt].fill(0.0);
        let mut beam = last_beam;
        for j in (prompt..end).rev() {
            let at = beam * self.max_seq_len + j;
            ids_out[j] = self.output_ids[at];
            log_probs_out[j] = self.log_probs[at];
            beam = self.parent_ids[at] as usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_penalty_identity_cases() {
        assert_eq!(apply_length_penalty(-4.0, 5, 0.0), -4.0);
        assert_eq!(apply_length_penalty(-4.0, 1, 2.0), -4.0);
        assert_eq!(apply_length_penalty(-4.0, 0, 2.0), -4.0);
    }

    #[test]
    fn length_penalty_divides_by_power() {
        assert!((apply_length_penalty(-4.0, 4, 1.0) - -1.0).abs() < 1e-6);
        assert!((apply_length_penalty(-8.0, 2, 2.0) - -2.0).abs() < 1e-6);
    }

    #[test]
    fn early_stopping_serde() {
        let policy: EarlyStopping = serde_json::from_str("\"never\"").unwrap();
        assert_eq!(policy, EarlyStopping::Never);
        assert_eq!(EarlyStopping::default(), EarlyStopping::Heuristic);
    }

    #[test]
    fn backtrace_follows_parents() {
        // Two beams, max_seq_len 4, prompt of length 1 (token 9).
        // Step 1: beam0 <- beam0 token 1, beam1 <- beam0 token 2.
        // Step 2: beam0 <- beam1 token 3, beam1 <- beam0 token 4.
        let mut output_ids = vec![9, 1, 3, 0, 9, 2, 4, 0];
        let mut parent_ids = vec![0, 0, 1, 0, 0, 0, 0, 0];
        let mut log_probs = vec![0.0, -0.1, -0.3, 0.0, 0.0, -0.2, -0.4, 0.0];
        let mut cum = vec![-0.5, -0.5];
        let tables = BeamTables {
            output_ids: &mut output_ids,
            parent_ids: &mut parent_ids,
            log_probs: &mut log_probs,
            cum_log_probs: &mut cum,
            max_seq_len: 4,
            input_len: 1,
            seq_len: 3,
        };
        let mut ids = vec![0u32; 4];
        let mut lps = vec![0f32; 4];
        tables.backtrace(3, 0, &mut ids, &mut lps);
        assert_eq!(&ids[..3], &[9, 2, 3]);
        assert_eq!(&lps[..3], &[0.0, -0.2, -0.3]);
    }
}
