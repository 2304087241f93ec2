//! One beam-search step for one request.

use rayon::prelude::*;

use super::{apply_length_penalty, BeamHypotheses, BeamTables, EarlyStopping, DISABLED_BEAM_LOG_PROB};
use crate::error::{DecodeError, Result};
use crate::sampling::online_softmax::{reduce_md_top_k, select_and_mask};
use crate::sampling::{beam_workspace_size, Workspace};

/// Per-request beam-search parameters.
#[derive(Debug, Clone, Copy)]
pub struct BeamParams {
    pub beam_width: usize,
    pub vocab_size: usize,
    pub end_id: u32,
    pub length_penalty: f32,
    pub early_stopping: EarlyStopping,
    pub diversity_rate: f32,
}

/// What a step did to one request.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamStepOutcome {
    /// Token written for each live beam at the old `seq_len`.
    pub new_tokens: Vec<u32>,
    /// Completed beams accepted this step.
    pub completed: usize,
    pub done: bool,
}

/// Advance one request by one token.
///
/// `logits` is `[beam_width, vocab_size]`. Stage 1 reduces every live beam to
/// its best `2K` continuations scored by `log_softmax + cum_log_prob`; stage 2
/// picks the best `2K` of the `2K * K` with select-and-mask; the walk then
/// moves end tokens into `hyps` and fills the `K` live beams. `tables.seq_len`
/// is not advanced here.
pub fn beam_search_step(
    workspace: &mut Workspace,
    logits: &[f32],
    bias: Option<&[f32]>,
    params: &BeamParams,
    tables: &mut BeamTables<'_>,
    hyps: &mut BeamHypotheses,
) -> Result<BeamStepOutcome> {
    let k = params.beam_width;
    let vocab = params.vocab_size;
    let cands_per_beam = 2 * k;
    if k == 0 || cands_per_beam > vocab {
        return Err(DecodeError::InvalidConfig(format!(
            "beam width {k} needs a vocabulary of at least {cands_per_beam}, got {vocab}"
        )));
    }
    if logits.len() < k * vocab {
        return Err(DecodeError::InvalidConfig(format!(
            "beam step needs {} logits, got {}",
            k * vocab,
            logits.len()
        )));
    }
    if tables.seq_len >= tables.max_seq_len {
        return Err(DecodeError::CapacityExceeded {
            what: "sequence length",
            requested: tables.seq_len + 1,
            capacity: tables.max_seq_len,
        });
    }
    let (ws_ids, ws_vals) = workspace.take(beam_workspace_size(1, k))?;

    // Stage 1: per-beam online softmax and top-2K.
    let cum = &*tables.cum_log_probs;
    ws_ids
        .par_chunks_mut(cands_per_beam)
        .zip(ws_vals.par_chunks_mut(cands_per_beam))
        .enumerate()
        .for_each(|(beam, (ids, vals))| {
            let row = &logits[beam * vocab..(beam + 1) * vocab];
            let (md, top) = reduce_md_top_k(row, bias, 0, cands_per_beam);
            let normalizer = md.log_sum_exp();
            for (j, &(token, x)) in top.entries().iter().enumerate() {
                ids[j] = (beam * vocab) as u32 + token;
                vals[j] = x - normalizer + cum[beam];
            }
        });

    // Stage 2: best 2K of the 2K * K candidates.
    let keys: Vec<f32> = ws_vals
        .iter()
        .enumerate()
        .map(|(i, &v)| v + params.diversity_rate * (i / cands_per_beam) as f32)
        .collect();
    let picked = select_and_mask(&keys, cands_per_beam);

    let old_cum = tables.cum_log_probs.to_vec();
    let step = tables.seq_len;
    let max_seq_len = tables.max_seq_len;
    // Generated length before and after this step's token.
    let live_len = step - tables.input_len.min(step);
    let generated_len = live_len + 1;
    let mut selected = 0usize;
    let mut completed = 0usize;
    let mut stopped = false;

    for (rank, &c) in picked.iter().enumerate() {
        let id = ws_ids[c] as usize;
        let value = ws_vals[c];
        let parent = id / vocab;
        let token = (id % vocab) as u32;

        if token == params.end_id {
            if rank >= k {
                continue;
            }
            let normed = apply_length_penalty(value, generated_len, params.length_penalty);
            let Some(index) = hyps.admit(normed) else {
                stopped = true;
                break;
            };
            let (ids_out, lps_out) = hyps.rows_mut(index);
            tables.backtrace(step, parent, ids_out, lps_out);
            ids_out[step] = params.end_id;
            lps_out[step] = value - old_cum[parent];
            hyps.commit(index, normed, value, step + 1);
            completed += 1;
        } else if selected < k {
            let at = selected * max_seq_len + step;
            tables.output_ids[at] = token;
            tables.parent_ids[at] = parent as u32;
            tables.log_probs[at] = value - old_cum[parent];
            tables.cum_log_probs[selected] = value;
            selected += 1;
        }
        if selected >= k {
            break;
        }
    }

    if stopped {
        // Live rows the walk did not reach are parked so they never expand.
        for b in selected..k {
            let at = b * max_seq_len + step;
            tables.output_ids[at] = params.end_id;
            tables.parent_ids[at] = b as u32;
            tables.log_probs[at] = 0.0;
            tables.cum_log_probs[b] = DISABLED_BEAM_LOG_PROB;
        }
    }
    let max_generated_len = max_seq_len - tables.input_len.min(max_seq_len);
    let done = hyps.update_done(
        params.early_stopping,
        params.length_penalty,
        tables.cum_log_probs[0],
        live_len,
        max_generated_len,
    );
    tracing::trace!(step, selected, completed, done, "beam step");

    let new_tokens = (0..k)
        .map(|b| tables.output_ids[b * max_seq_len + step])
        .collect();
    Ok(BeamStepOutcome {
        new_tokens,
        completed,
        done,
    })
}
