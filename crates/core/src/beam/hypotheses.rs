//! Completed-beam store for one request.

use super::{apply_length_penalty, EarlyStopping};

/// Completed beams of one request.
///
/// Holds up to `2 * beam_width` entries: at most `beam_width` completed
/// during search, plus room for the live beams merged in by finalize.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    beam_width: usize,
    max_seq_len: usize,
    /// `[2 * beam_width, max_seq_len]`.
    pub output_ids: Vec<u32>,
    /// `[2 * beam_width, max_seq_len]`.
    pub log_probs: Vec<f32>,
    pub seq_lens: Vec<usize>,
    pub cum_log_probs: Vec<f32>,
    pub normed_scores: Vec<f32>,
    num_beams: usize,
    min_normed_score: f32,
    is_done: bool,
}

impl BeamHypotheses {
    pub fn new(beam_width: usize, max_seq_len: usize) -> Self {
        let capacity = 2 * beam_width;
        Self {
            beam_width,
            max_seq_len,
            output_ids: vec![0; capacity * max_seq_len],
            log_probs: vec![0.0; capacity * max_seq_len],
            seq_lens: vec![0; capacity],
            cum_log_probs: vec![0.0; capacity],
            normed_scores: vec![0.0; capacity],
            num_beams: 0,
            min_normed_score: f32::MAX,
            is_done: false,
        }
    }

    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn num_beams(&self) -> usize {
        self.num_beams
    }

    /// Worst normalized score among retained beams (`f32::MAX` when empty).
    pub fn min_normed_score(&self) -> f32 {
        self.min_normed_score
    }

    pub fn is_done(&self) -> bool {
        self.is_done
    }

    pub(crate) fn mark_done(&mut self) {
        self.is_done = true;
    }

    /// Normalized scores of the retained completed beams.
    pub fn retained_scores(&self) -> &[f32] {
        &self.normed_scores[..self.num_beams]
    }

    /// Token row `index` (`max_seq_len` long).
    pub fn ids(&self, index: usize) -> &[u32] {
        &self.output_ids[index * self.max_seq_len..(index + 1) * self.max_seq_len]
    }

    pub(crate) fn rows_mut(&mut self, index: usize) -> (&mut [u32], &mut [f32]) {
        let range = index * self.max_seq_len..(index + 1) * self.max_seq_len;
        (&mut self.output_ids[range.clone()], &mut self.log_probs[range])
    }

    /// Choose where a completed beam with `normed_score` goes.
    ///
    /// Returns `None` when `beam_width` beams are retained and the new score is
    /// below the worst of them. Otherwise the worst retained beam (the first
    /// one, by index, whose score equals the minimum) is evicted to make room.
    pub(crate) fn admit(&mut self, normed_score: f32) -> Option<usize> {
        if self.num_beams < self.beam_width {
            return Some(self.num_beams);
        }
        if normed_score < self.min_normed_score {
            return None;
        }
        let victim = (0..self.beam_width).find(|&j| self.normed_scores[j] == self.min_normed_score)?;
        self.num_beams -= 1;
        self.normed_scores[victim] = normed_score;
        self.min_normed_score = self.normed_scores[..self.beam_width]
            .iter()
            .copied()
            .fold(f32::MAX, f32::min);
        Some(victim)
    }

    /// Record the bookkeeping of a beam written at `index` via [`Self::admit`].
    pub(crate) fn commit(&mut self, index: usize, normed_score: f32, cum_log_prob: f32, seq_len: usize) {
        self.normed_scores[index] = normed_score;
        self.cum_log_probs[index] = cum_log_prob;
        self.seq_lens[index] = seq_len;
        self.min_normed_score = self.min_normed_score.min(normed_score);
        self.num_beams += 1;
    }

    /// Append a live beam during finalize; capacity is `2 * beam_width`.
    pub(crate) fn push_unfinished(&mut self, normed_score: f32, cum_log_prob: f32, seq_len: usize) -> usize {
        let index = self.num_beams;
        self.normed_scores[index] = normed_score;
        self.cum_log_probs[index] = cum_log_prob;
        self.seq_lens[index] = seq_len;
        self.num_beams += 1;
        index
    }

    pub(crate) fn has_room(&self) -> bool {
        self.num_beams < 2 * self.beam_width
    }

    /// Decide whether searching further can still improve the result.
    ///
    /// `best_live_cum_log_prob` is the cumulative log-prob of the best live
    /// beam and `generated_len` its generated length before the token picked
    /// this step. `max_generated_len` is the bound used by `Never` with a
    /// positive length penalty.
    pub fn update_done(
        &mut self,
        policy: EarlyStopping,
        length_penalty: f32,
        best_live_cum_log_prob: f32,
        generated_len: usize,
        max_generated_len: usize,
    ) -> bool {
        if self.is_done {
            return true;
        }
        if self.num_beams < self.beam_width {
            return false;
        }
        self.is_done = match policy {
            EarlyStopping::Always => true,
            EarlyStopping::Heuristic => {
                let best = apply_length_penalty(best_live_cum_log_prob, generated_len, length_penalty);
                self.min_normed_score >= best
            }
            EarlyStopping::Never => {
                let len = if length_penalty > 0.0 {
                    max_generated_len
                } else {
                    generated_len
                };
                let best = apply_length_penalty(best_live_cum_log_prob, len, length_penalty);
                self.min_normed_score >= best
            }
        };
        self.is_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(h: &mut BeamHypotheses, score: f32) -> Option<usize> {
        let idx = h.admit(score)?;
        h.commit(idx, score, score, 3);
        Some(idx)
    }

    fn assert_min_matches(h: &BeamHypotheses) {
        let worst = h
            .retained_scores()
            .iter()
            .copied()
            .fold(f32::MAX, f32::min);
        assert_eq!(worst, h.min_normed_score());
    }

    #[test]
    fn admits_until_full() {
        let mut h = BeamHypotheses::new(2, 4);
        assert_eq!(fill(&mut h, -1.0), Some(0));
        assert_eq!(fill(&mut h, -2.0), Some(1));
        assert_eq!(h.num_beams(), 2);
        assert_eq!(h.min_normed_score(), -2.0);
        assert_min_matches(&h);
    }

    #[test]
    fn rejects_worse_than_min_when_full() {
        let mut h = BeamHypotheses::new(2, 4);
        fill(&mut h, -1.0);
        fill(&mut h, -2.0);
        assert_eq!(h.admit(-3.0), None);
        assert_eq!(h.num_beams(), 2);
    }

    #[test]
    fn evicts_worst_and_tracks_min() {
        let mut h = BeamHypotheses::new(3, 4);
        fill(&mut h, -1.0);
        fill(&mut h, -5.0);
        fill(&mut h, -3.0);
        assert_eq!(fill(&mut h, -2.0), Some(1));
        assert_eq!(h.num_beams(), 3);
        assert_eq!(h.min_normed_score(), -3.0);
        assert_min_matches(&h);
        assert!(h.num_beams() <= h.beam_width());
    }

    #[test]
    fn eviction_tie_takes_lowest_index() {
        let mut h = BeamHypotheses::new(3, 4);
        fill(&mut h, -4.0);
        fill(&mut h, -1.0);
        fill(&mut h, -4.0);
        assert_eq!(fill(&mut h, -4.0), Some(0));
        assert_eq!(h.min_normed_score(), -4.0);
        assert_min_matches(&h);
    }

    #[test]
    fn always_is_done_once_full() {
        let mut h = BeamHypotheses::new(2, 8);
        fill(&mut h, -9.0);
        assert!(!h.update_done(EarlyStopping::Always, 0.0, 0.0, 3, 6));
        fill(&mut h, -9.0);
        assert!(h.update_done(EarlyStopping::Always, 0.0, 0.0, 3, 6));
    }

    #[test]
    fn heuristic_compares_best_live_beam() {
        let mut h = BeamHypotheses::new(1, 8);
        fill(&mut h, -2.0);
        assert!(!h.update_done(EarlyStopping::Heuristic, 0.0, -1.0, 3, 6));
        assert!(h.update_done(EarlyStopping::Heuristic, 0.0, -2.5, 3, 6));
    }

    #[test]
    fn never_uses_max_length_with_positive_penalty() {
        let mut h = BeamHypotheses::new(1, 8);
        fill(&mut h, -1.0);
        // At current length 2: -4 / 2 = -2 < -1 -> done under heuristic.
        // At max length 8: -4 / 8 = -0.5 > -1 -> a live beam could still win.
        assert!(!h.clone().update_done(EarlyStopping::Never, 1.0, -4.0, 2, 8));
        assert!(h.update_done(EarlyStopping::Heuristic, 1.0, -4.0, 2, 8));
    }
}
