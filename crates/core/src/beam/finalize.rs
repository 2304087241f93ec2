//! Gather the final `beam_width` sequences of a request.

use std::cmp::Ordering;

use super::{apply_length_penalty, BeamHypotheses, BeamTables};

/// Final beams ordered best first, each row `max_seq_len` long.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedBeams {
    pub output_ids: Vec<u32>,
    pub log_probs: Vec<f32>,
    pub seq_lens: Vec<usize>,
    pub cum_log_probs: Vec<f32>,
    pub normed_scores: Vec<f32>,
}

/// Merge live beams into `hyps` when the search did not finish, then keep
/// the `beam_width` best by normalized score (stable for ties).
pub fn finalize_beams(
    tables: &BeamTables<'_>,
    hyps: &mut BeamHypotheses,
    length_penalty: f32,
) -> FinalizedBeams {
    let k = hyps.beam_width();
    let max_seq_len = hyps.max_seq_len();

    if !hyps.is_done() {
        let generated_len = tables.seq_len.saturating_sub(tables.input_len);
        for beam in 0..k {
            if !hyps.has_room() {
                break;
            }
            let cum = tables.cum_log_probs[beam];
            let normed = apply_length_penalty(cum, generated_len, length_penalty);
            let index = hyps.push_unfinished(normed, cum, tables.seq_len);
            let (ids_out, lps_out) = hyps.rows_mut(index);
            if tables.seq_len > tables.input_len {
                tables.backtrace(tables.seq_len, beam, ids_out, lps_out);
            } else {
                let prompt = tables.seq_len;
                ids_out[..prompt].copy_from_slice(&tables.output_ids[..prompt]);
            }
        }
        hyps.mark_done();
    }

    let mut order: Vec<usize> = (0..hyps.num_beams()).collect();
    order.sort_by(|&a, &b| {
        hyps.normed_scores[b]
            .partial_cmp(&hyps.normed_scores[a])
            .unwrap_or(Ordering::Equal)
    });
    order.truncate(k);

    let mut out = FinalizedBeams {
        output_ids: vec![0; k * max_seq_len],
        log_probs: vec![0.0; k * max_seq_len],
        seq_lens: vec![0; k],
        cum_log_probs: vec![0.0; k],
        normed_scores: vec![0.0; k],
    };
    for (rank, &index) in order.iter().enumerate() {
        let row = rank * max_seq_len..(rank + 1) * max_seq_len;
        let src = index * max_seq_len..(index + 1) * max_seq_len;
        out.output_ids[row.clone()].copy_from_slice(&hyps.output_ids[src.clone()]);
        out.log_probs[row].copy_from_slice(&hyps.log_probs[src]);
        out.seq_lens[rank] = hyps.seq_lens[index];
        out.cum_log_probs[rank] = hyps.cum_log_probs[index];
        out.normed_scores[rank] = hyps.normed_scores[index];
    }
    out
}
