//! Nucleus (top-p) sampling and the per-request top-p decay schedule.

use std::cmp::Ordering;

use rayon::prelude::*;

use super::top_k::{SampledToken, SamplingRow};
use super::workspace::{top_p_workspace_size, Workspace};
use crate::error::{DecodeError, Result};

#[derive(Debug, Clone, Copy)]
pub struct TopPParams {
    pub vocab_size: usize,
    /// Rows already hold probabilities rather than logits.
    pub logits_has_probs: bool,
}

/// Fill `ids` with `0..vocab_size` for every row and return the row offsets.
pub fn top_p_initialize(ids: &mut [u32], batch_size: usize, vocab_size: usize) -> Vec<usize> {
    for row in ids.chunks_mut(vocab_size.max(1)).take(batch_size) {
        for (i, id) in row.iter_mut().enumerate() {
            *id = i as u32;
        }
    }
    (0..=batch_size).map(|b| b * vocab_size).collect()
}

/// Sample one token per row from its nucleus.
///
/// Candidates are sorted by descending probability (lower id first on ties);
/// the nucleus is the shortest prefix holding at least `top_p` of the mass,
/// and the draw is proportional to probability within it. The row's `top_k`
/// is ignored.
pub fn batch_top_p_sampling(
    workspace: &mut Workspace,
    rows: &[SamplingRow<'_>],
    params: &TopPParams,
) -> Result<Vec<SampledToken>> {
    for row in rows {
        if row.logits.len() < params.vocab_size {
            return Err(DecodeError::InvalidConfig(format!(
                "row has {} logits, vocabulary is {}",
                row.logits.len(),
                params.vocab_size
            )));
        }
    }
    let vocab = params.vocab_size;
    let (ids, vals) = workspace.take(top_p_workspace_size(rows.len(), vocab))?;
    if rows.is_empty() || vocab == 0 {
        return Ok(rows
            .iter()
            .map(|row| SampledToken::inactive(row.end_id, row.finished))
            .collect());
    }
    top_p_initialize(ids, rows.len(), vocab);

    let results = ids
        .par_chunks_mut(vocab)
        .zip(vals.par_chunks_mut(vocab))
        .zip(rows.par_iter())
        .map(|((ids, vals), row)| sample_nucleus(ids, vals, row, params))
        .collect();
    Ok(results)
}

fn sample_nucleus(
    ids: &mut [u32],
    vals: &mut [f32],
    row: &SamplingRow<'_>,
    params: &TopPParams,
) -> SampledToken {
    if row.finished.is_inactive() {
        return SampledToken::inactive(row.end_id, row.finished);
    }
    let logits = &row.logits[..params.vocab_size];
    if params.logits_has_probs {
        vals.copy_from_slice(logits);
    } else {
        vals.copy_from_slice(&super::softmax(logits));
    }

    let mut pairs: Vec<(u32, f32)> = ids.iter().copied().zip(vals.iter().copied()).collect();
    pairs.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    for (i, (id, p)) in pairs.iter().enumerate() {
        ids[i] = *id;
        vals[i] = *p;
    }

    let top_p = row.top_p.min(1.0);
    let nucleus_len = nucleus_len(vals, top_p);
    let mass: f32 = vals[..nucleus_len].iter().sum();
    let mut remaining = row.rand * mass;
    let mut chosen = nucleus_len - 1;
    for (i, &p) in vals[..nucleus_len].iter().enumerate() {
        remaining -= p;
        if remaining <= 0.0 {
            chosen = i;
            break;
        }
    }

    let token = ids[chosen];
    let mut finished = row.finished;
    if token == row.end_id {
        finished.set_finished_eos();
    }
    SampledToken {
        token,
        log_prob: vals[chosen].ln(),
        finished,
        advanced: token != row.end_id,
        candidates: Vec::new(),
    }
}

/// Length of the shortest prefix of descending `probs` with mass `>= top_p`.
pub(crate) fn nucleus_len(sorted_probs: &[f32], top_p: f32) -> usize {
    if top_p <= 0.0 {
        return 1;
    }
    let mut cumsum = 0.0f32;
    for (i, &p) in sorted_probs.iter().enumerate() {
        cumsum += p;
        if cumsum >= top_p {
            return i + 1;
        }
    }
    sorted_probs.len().max(1)
}

/// Per-request geometric decay of top-p across steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopPDecay {
    pub initial: f32,
    pub decay: f32,
    pub min: f32,
    /// Producing this token restores `initial`.
    pub reset_id: Option<u32>,
}

impl TopPDecay {
    pub fn next(&self, current: f32, token: u32) -> f32 {
        if self.reset_id == Some(token) {
            self.initial
        } else {
            (current * self.decay).max(self.min)
        }
    }
}

/// `p <- max(p * decay, p_min)` per row, reset on the row's reset token.
pub fn compute_top_p_decay(runtime_top_p: &mut [f32], schedules: &[TopPDecay], tokens: &[u32]) {
    for ((p, schedule), &token) in runtime_top_p.iter_mut().zip(schedules).zip(tokens) {
        *p = schedule.next(*p, token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::{FinishedState, SamplerState};

    fn row(probs: &[f32], top_p: f32, rand: f32) -> SamplingRow<'_> {
        SamplingRow {
            logits: probs,
            top_k: 0,
            top_p,
            end_id: 99,
            finished: FinishedState::empty(),
            rand,
        }
    }

    fn probs_params(vocab_size: usize) -> TopPParams {
        TopPParams {
            vocab_size,
            logits_has_probs: true,
        }
    }

    #[test]
    fn initialize_fills_ids_and_offsets() {
        let mut ids = vec![7u32; 6];
        let offsets = top_p_initialize(&mut ids, 2, 3);
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(offsets, vec![0, 3, 6]);
    }

    #[test]
    fn selected_rank_is_inside_nucleus() {
        let probs = [0.05f32, 0.4, 0.1, 0.3, 0.15];
        // Sorted: 0.4 (1), 0.3 (3), 0.15 (4), 0.1 (2), 0.05 (0). p=0.65 keeps {1, 3}.
        let mut ws = Workspace::new(top_p_workspace_size(1, 5));
        let mut state = SamplerState::new(Some(11));
        for _ in 0..500 {
            let r = state.next_rand_f32();
            let out = batch_top_p_sampling(&mut ws, &[row(&probs, 0.65, r)], &probs_params(5)).unwrap();
            assert!(out[0].token == 1 || out[0].token == 3, "token {}", out[0].token);
        }
    }

    #[test]
    fn nucleus_len_is_shortest_prefix() {
        let sorted = [0.5f32, 0.3, 0.2];
        assert_eq!(nucleus_len(&sorted, 0.5), 1);
        assert_eq!(nucleus_len(&sorted, 0.6), 2);
        assert_eq!(nucleus_len(&sorted, 1.0), 3);
        assert_eq!(nucleus_len(&sorted, 0.0), 1);
    }

    #[test]
    fn logits_are_softmaxed() {
        let logits = [0.0f32, 10.0, 0.0];
        let params = TopPParams {
            vocab_size: 3,
            logits_has_probs: false,
        };
        let mut ws = Workspace::new(3);
        let out = batch_top_p_sampling(&mut ws, &[row(&logits, 0.5, 0.9)], &params).unwrap();
        assert_eq!(out[0].token, 1);
        assert!(out[0].log_prob > -1e-3);
    }

    #[test]
    fn finished_row_short_circuits() {
        let probs = [0.5f32, 0.5];
        let mut r = row(&probs, 1.0, 0.5);
        r.finished = FinishedState::finished_max_length();
        let mut ws = Workspace::new(2);
        let out = batch_top_p_sampling(&mut ws, &[r], &probs_params(2)).unwrap();
        assert_eq!(out[0].token, 99);
        assert!(!out[0].advanced);
    }

    #[test]
    fn undersized_workspace_fails() {
        let probs = [0.5f32, 0.5];
        let mut ws = Workspace::new(1);
        assert!(matches!(
            batch_top_p_sampling(&mut ws, &[row(&probs, 1.0, 0.5)], &probs_params(2)),
            Err(DecodeError::WorkspaceTooSmall { .. })
        ));
    }

    #[test]
    fn decay_floors_and_resets() {
        let schedule = TopPDecay {
            initial: 0.9,
            decay: 0.5,
            min: 0.3,
            reset_id: Some(7),
        };
        let mut p = [0.9f32];
        compute_top_p_decay(&mut p, &[schedule], &[1]);
        assert!((p[0] - 0.45).abs() < 1e-6);
        compute_top_p_decay(&mut p, &[schedule], &[1]);
        assert!((p[0] - 0.3).abs() < 1e-6);
        compute_top_p_decay(&mut p, &[schedule], &[7]);
        assert!((p[0] - 0.9).abs() < 1e-6);
    }
}
