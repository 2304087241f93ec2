//! Batched top-k sampling over large vocabularies.
//!
//! Stage 1 splits every row into vocabulary chunks and reduces each chunk to
//! a partial top-k list (plus its online-softmax `(m, d)` pair) in the
//! workspace. Stage 2 merges the partial lists with select-and-mask and draws
//! one token from the surviving `k`, optionally restricted to top-p mass.

use rayon::prelude::*;

use super::finished::FinishedState;
use super::online_softmax::{reduce_md_top_k, select_and_mask, Md};
use super::workspace::{chunks_for_vocab, top_k_workspace_size, Workspace};
use crate::error::{DecodeError, Result};

/// Largest top-k the kernels accept.
pub const MAX_TOP_K: usize = 1024;

/// Batch-wide options.
#[derive(Debug, Clone, Copy)]
pub struct TopKParams {
    pub vocab_size: usize,
    /// Upper bound on any row's `top_k`; sizes the workspace.
    pub max_top_k: usize,
    /// Rows already hold probabilities rather than logits.
    pub logits_has_probs: bool,
    /// Report all `k` candidates alongside the sampled token.
    pub return_all_top_k: bool,
}

/// One row of a sampling batch.
#[derive(Debug, Clone, Copy)]
pub struct SamplingRow<'a> {
    pub logits: &'a [f32],
    pub top_k: usize,
    pub top_p: f32,
    pub end_id: u32,
    pub finished: FinishedState,
    /// Uniform draw in `[0, 1)` from the slot's generator.
    pub rand: f32,
}

/// Outcome for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledToken {
    pub token: u32,
    pub log_prob: f32,
    pub finished: FinishedState,
    /// Whether the sequence length grows by this token; an end token does
    /// not count.
    pub advanced: bool,
    /// `(token, log_prob)` of every candidate when requested.
    pub candidates: Vec<(u32, f32)>,
}

impl SampledToken {
    /// Result for a row that is finished or skipped: the end token, no growth.
    pub fn inactive(end_id: u32, finished: FinishedState) -> Self {
        Self {
            token: end_id,
            log_prob: 0.0,
            finished,
            advanced: false,
            candidates: Vec::new(),
        }
    }
}

pub(crate) fn validate_top_k(top_k: usize, max_top_k: usize) -> Result<()> {
    if top_k > MAX_TOP_K {
        return Err(DecodeError::UnsupportedParameter {
            name: "top_k",
            value: top_k,
            max: MAX_TOP_K,
        });
    }
    if top_k > max_top_k {
        return Err(DecodeError::UnsupportedParameter {
            name: "top_k",
            value: top_k,
            max: max_top_k,
        });
    }
    Ok(())
}

/// Sample one token per row from its top-`k` candidates.
///
/// `k == 1` is greedy arg-max (lowest id wins ties); `k == 0` behaves as 1.
/// Every parameter is checked before any row is touched.
pub fn batch_top_k_sampling(
    workspace: &mut Workspace,
    rows: &[SamplingRow<'_>],
    params: &TopKParams,
) -> Result<Vec<SampledToken>> {
    validate_top_k(params.max_top_k, MAX_TOP_K)?;
    for row in rows {
        validate_top_k(row.top_k, params.max_top_k)?;
        if row.logits.len() < params.vocab_size {
            return Err(DecodeError::InvalidConfig(format!(
                "row has {} logits, vocabulary is {}",
                row.logits.len(),
                params.vocab_size
            )));
        }
    }
    let chunks = chunks_for_vocab(params.vocab_size);
    let stride = chunks * params.max_top_k;
    let required = top_k_workspace_size(rows.len(), params.vocab_size, params.max_top_k);
    let (ws_ids, ws_vals) = workspace.take(required)?;
    if rows.is_empty() || stride == 0 {
        return Ok(rows
            .iter()
            .map(|row| SampledToken::inactive(row.end_id, row.finished))
            .collect());
    }

    tracing::trace!(rows = rows.len(), chunks, "top-k sampling");

    let results = ws_ids
        .par_chunks_mut(stride)
        .zip(ws_vals.par_chunks_mut(stride))
        .zip(rows.par_iter())
        .map(|((ids, vals), row)| sample_row(ids, vals, row, params, chunks))
        .collect();
    Ok(results)
}

fn sample_row(
    ids: &mut [u32],
    vals: &mut [f32],
    row: &SamplingRow<'_>,
    params: &TopKParams,
    chunks: usize,
) -> SampledToken {
    if row.finished.is_inactive() {
        return SampledToken::inactive(row.end_id, row.finished);
    }
    let vocab = params.vocab_size;
    let k = row.top_k.max(1).min(vocab);
    let logits = &row.logits[..vocab];

    // Stage 1: partial top-k per vocabulary chunk.
    let chunk_len = vocab.div_ceil(chunks);
    let mut md = Md::IDENTITY;
    for c in 0..chunks {
        let start = (c * chunk_len).min(vocab);
        let end = (start + chunk_len).min(vocab);
        let (chunk_md, top) = reduce_md_top_k(&logits[start..end], None, start as u32, k);
        md = md.merge(chunk_md);
        let base = c * params.max_top_k;
        for j in 0..k {
            let (id, val) = top.entries().get(j).copied().unwrap_or((u32::MAX, f32::NEG_INFINITY));
            ids[base + j] = id;
            vals[base + j] = val;
        }
    }

    // Stage 2: merge the chunk lists.
    let mut cand_ids = Vec::with_capacity(chunks * k);
    let mut cand_vals = Vec::with_capacity(chunks * k);
    for c in 0..chunks {
        let base = c * params.max_top_k;
        cand_ids.extend_from_slice(&ids[base..base + k]);
        cand_vals.extend_from_slice(&vals[base..base + k]);
    }
    let top: Vec<(u32, f32)> = select_and_mask(&cand_vals, k)
        .into_iter()
        .filter(|&i| cand_ids[i] != u32::MAX)
        .map(|i| (cand_ids[i], cand_vals[i]))
        .collect();
    let Some(&(_, max_val)) = top.first() else {
        return SampledToken::inactive(row.end_id, row.finished);
    };

    let s_vals: Vec<f32> = top
        .iter()
        .map(|&(_, v)| {
            if params.logits_has_probs {
                v
            } else {
                (v - max_val).exp()
            }
        })
        .collect();
    let s_sum: f32 = s_vals.iter().sum();
    let top_p = if row.top_p > 0.0 { row.top_p.min(1.0) } else { 1.0 };
    let mut remaining = row.rand * top_p * s_sum;
    let mut chosen = top.len() - 1;
    for (i, &s) in s_vals.iter().enumerate() {
        remaining -= s;
        if remaining <= 0.0 {
            chosen = i;
            break;
        }
    }

    let log_prob_of = |v: f32| {
        if params.logits_has_probs {
            v.ln()
        } else {
            v - md.log_sum_exp()
        }
    };
    let (token, value) = top[chosen];
    let mut finished = row.finished;
    if token == row.end_id {
        finished.set_finished_eos();
    }
    let candidates = if params.return_all_top_k {
        top.iter().map(|&(id, v)| (id, log_prob_of(v))).collect()
    } else {
        Vec::new()
    };
    SampledToken {
        token,
        log_prob: log_prob_of(value),
        finished,
        advanced: token != row.end_id,
        candidates,
    }
}
