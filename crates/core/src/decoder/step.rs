//! One decoding step over a group of slots.
//!
//! Every slot's inputs are read and checked before any slot is mutated, so a
//! malformed input leaves the whole group untouched. Sampling slots are then
//! stepped together through the batched kernels; beam and speculative slots
//! run in parallel, each on its own workspace.

use candle_core::{DType, Tensor};
use rayon::prelude::*;

use super::request::DraftTokens;
use super::slot::{SlotData, SlotMode};
use crate::beam::{beam_search_step, BeamParams};
use crate::error::{DecodeError, Result};
use crate::sampling::penalties::{apply_penalties, matches_stop_word};
use crate::sampling::{
    argmax, batch_top_k_sampling, batch_top_p_sampling, compute_top_p_decay, log_softmax,
    softmax, FinishedState, SampledToken, SamplingRow, TopKParams, TopPParams, Workspace,
};
use crate::speculative::{accept_draft_tokens_by_ids, accept_draft_tokens_by_logits, MedusaTree};

/// Session-wide constants every step needs.
#[derive(Debug)]
pub(crate) struct StepContext {
    pub vocab_size: usize,
    pub vocab_size_padded: usize,
    pub max_top_k: usize,
    pub max_draft_len: usize,
    pub medusa: Option<MedusaTree>,
}

impl StepContext {
    fn medusa_tree(&self) -> Result<&MedusaTree> {
        self.medusa
            .as_ref()
            .ok_or_else(|| DecodeError::InvalidConfig("medusa slot without a medusa tree".to_string()))
    }
}

/// What the caller supplied for one slot this step.
#[derive(Debug)]
pub(crate) struct SlotInput {
    /// `[rows, vocab_size_padded]`.
    pub logits: Tensor,
    /// `[num_nodes, num_heads, vocab_size_padded]`.
    pub medusa_logits: Option<Tensor>,
    pub drafts: Option<DraftTokens>,
}

pub(crate) struct SlotWork<'a> {
    pub slot: usize,
    pub data: &'a mut SlotData,
    pub input: SlotInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotOutcome {
    pub slot: usize,
    pub newly_finished: bool,
}

/// Host copies of one slot's inputs, padding stripped.
struct Prepared {
    logits: Vec<f32>,
    medusa_logits: Option<Vec<f32>>,
    drafts: DraftTokens,
    draft_logits: Option<Vec<f32>>,
}

type SlotPlan<'w, 'a> = (&'w mut SlotWork<'a>, Prepared);

/// Advance every slot in `work` by one step. Outcomes are ordered by slot.
pub(crate) fn run_step(
    ctx: &StepContext,
    workspace: &mut Workspace,
    work: &mut [SlotWork<'_>],
) -> Result<Vec<SlotOutcome>> {
    let prepared = work
        .par_iter()
        .map(|w| prepare(ctx, w))
        .collect::<Result<Vec<_>>>()?;

    let mut outcomes = Vec::with_capacity(work.len());
    let mut sampling: Vec<SlotPlan<'_, '_>> = Vec::new();
    let mut single: Vec<SlotPlan<'_, '_>> = Vec::new();
    for (w, plan) in work.iter_mut().zip(prepared) {
        match plan {
            None => {
                let end_id = w.data.request.end_id;
                w.data.buffers.clear_new_tokens(end_id);
                outcomes.push(SlotOutcome {
                    slot: w.slot,
                    newly_finished: false,
                });
            }
            Some(plan) => {
                let pad_id = w.data.request.pad_id;
                w.data.buffers.clear_new_tokens(pad_id);
                if w.data.mode.is_sampling() {
                    sampling.push((w, plan));
                } else {
                    single.push((w, plan));
                }
            }
        }
    }

    outcomes.extend(step_sampling(ctx, workspace, &mut sampling)?);
    let rest = single
        .into_par_iter()
        .map(|(w, plan)| step_single(ctx, w, plan))
        .collect::<Result<Vec<_>>>()?;
    outcomes.extend(rest);
    outcomes.sort_by_key(|o| o.slot);
    Ok(outcomes)
}

fn prepare(ctx: &StepContext, work: &SlotWork<'_>) -> Result<Option<Prepared>> {
    let data = &*work.data;
    if data.is_finished() || data.finalized {
        return Ok(None);
    }
    let slot = work.slot;
    let (rows, drafts) = match data.mode {
        SlotMode::BeamSearch => (data.buffers.beam_width, DraftTokens::default()),
        SlotMode::ExternalDraft => {
            let drafts = work
                .input
                .drafts
                .clone()
                .unwrap_or_else(|| data.pending_drafts.clone());
            if drafts.len() > ctx.max_draft_len {
                return Err(DecodeError::CapacityExceeded {
                    what: "draft tokens",
                    requested: drafts.len(),
                    capacity: ctx.max_draft_len,
                });
            }
            (drafts.len() + 1, drafts)
        }
        SlotMode::Medusa => (ctx.medusa_tree()?.num_nodes(), DraftTokens::default()),
        _ => (1, DraftTokens::default()),
    };
    let logits = read_rows(ctx, slot, &work.input.logits, rows)?;

    let medusa_logits = match (&work.input.medusa_logits, data.mode) {
        (Some(tensor), SlotMode::Medusa) => {
            let tree = ctx.medusa_tree()?;
            Some(read_rows(ctx, slot, tensor, tree.num_nodes() * tree.num_heads())?)
        }
        _ => None,
    };

    let by_logits = data.mode == SlotMode::ExternalDraft && data.config.accept_draft_by_logits;
    let draft_logits = match &drafts.logits {
        Some(tensor) if by_logits => Some(read_rows(ctx, slot, tensor, drafts.len())?),
        None if by_logits && !drafts.is_empty() => {
            return Err(DecodeError::InvalidConfig(format!(
                "slot {slot}: accepting drafts by logits needs draft logits"
            )))
        }
        _ => None,
    };

    Ok(Some(Prepared {
        logits,
        medusa_logits,
        drafts,
        draft_logits,
    }))
}

/// Copy `rows` rows of padded logits to the host and drop the padding.
fn read_rows(ctx: &StepContext, slot: usize, tensor: &Tensor, rows: usize) -> Result<Vec<f32>> {
    let padded = ctx.vocab_size_padded;
    if tensor.elem_count() != rows * padded {
        return Err(DecodeError::InvalidConfig(format!(
            "slot {slot}: expected {rows} rows of {padded} logits, got shape {:?}",
            tensor.dims()
        )));
    }
    let flat = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    if let Some(at) = flat.iter().position(|v| v.is_nan() || *v == f32::INFINITY) {
        return Err(DecodeError::Device(format!(
            "slot {slot}: non-finite logit at offset {at}"
        )));
    }
    if padded == ctx.vocab_size {
        return Ok(flat);
    }
    Ok(flat
        .chunks(padded)
        .flat_map(|row| row[..ctx.vocab_size].iter().copied())
        .collect())
}

fn step_sampling(
    ctx: &StepContext,
    workspace: &mut Workspace,
    plans: &mut [SlotPlan<'_, '_>],
) -> Result<Vec<SlotOutcome>> {
    if plans.is_empty() {
        return Ok(Vec::new());
    }
    let mut rows_logits = Vec::with_capacity(plans.len());
    let mut rands = Vec::with_capacity(plans.len());
    for (w, plan) in plans.iter_mut() {
        let data = &mut *w.data;
        let mut logits = std::mem::take(&mut plan.logits);
        apply_penalties(
            &mut logits,
            &data.config,
            data.buffers.generated(data.input_len()),
            data.request.embedding_bias.as_deref(),
            &data.request.bad_words,
            data.request.end_id,
        );
        rows_logits.push(logits);
        rands.push(data.sampler.next_rand_f32());
    }

    let (k_idx, p_idx): (Vec<usize>, Vec<usize>) =
        (0..plans.len()).partition(|&i| plans[i].0.data.top_k > 0);
    let sampled = {
        let row = |i: usize| {
            let data = &*plans[i].0.data;
            SamplingRow {
                logits: &rows_logits[i],
                top_k: data.top_k,
                top_p: data.top_p,
                end_id: data.request.end_id,
                finished: FinishedState::empty(),
                rand: rands[i],
            }
        };
        let k_rows: Vec<SamplingRow<'_>> = k_idx.iter().map(|&i| row(i)).collect();
        let p_rows: Vec<SamplingRow<'_>> = p_idx.iter().map(|&i| row(i)).collect();
        let k_out = batch_top_k_sampling(
            workspace,
            &k_rows,
            &TopKParams {
                vocab_size: ctx.vocab_size,
                max_top_k: ctx.max_top_k,
                logits_has_probs: false,
                return_all_top_k: false,
            },
        )?;
        let p_out = batch_top_p_sampling(
            workspace,
            &p_rows,
            &TopPParams {
                vocab_size: ctx.vocab_size,
                logits_has_probs: false,
            },
        )?;
        let mut sampled: Vec<Option<SampledToken>> = vec![None; plans.len()];
        for (i, s) in k_idx.into_iter().zip(k_out).chain(p_idx.into_iter().zip(p_out)) {
            sampled[i] = Some(s);
        }
        sampled
    };

    let mut outcomes = Vec::with_capacity(plans.len());
    let mut runtime_top_p = Vec::with_capacity(plans.len());
    let mut schedules = Vec::with_capacity(plans.len());
    let mut tokens = Vec::with_capacity(plans.len());
    for ((w, _), s) in plans.iter_mut().zip(sampled) {
        let Some(s) = s else { continue };
        let data = &mut *w.data;
        let committed = commit_tokens(data, &[s.token], &[s.log_prob]);
        finish_step(data, committed);
        runtime_top_p.push(data.top_p);
        schedules.push(data.decay);
        tokens.push(s.token);
        outcomes.push(SlotOutcome {
            slot: w.slot,
            newly_finished: data.is_finished(),
        });
    }

    compute_top_p_decay(&mut runtime_top_p, &schedules, &tokens);
    for ((w, _), top_p) in plans.iter_mut().zip(runtime_top_p) {
        w.data.top_p = top_p;
    }
    Ok(outcomes)
}

fn step_single(ctx: &StepContext, work: &mut SlotWork<'_>, plan: Prepared) -> Result<SlotOutcome> {
    let data = &mut *work.data;
    match data.mode {
        SlotMode::BeamSearch => step_beam(ctx, data, plan)?,
        SlotMode::ExternalDraft => step_external_draft(ctx, data, plan)?,
        SlotMode::Medusa => step_medusa(ctx, data, plan)?,
        mode => {
            return Err(DecodeError::InvalidConfig(format!(
                "slot {} in mode {mode:?} is stepped with the sampling batch",
                work.slot
            )))
        }
    }
    Ok(SlotOutcome {
        slot: work.slot,
        newly_finished: data.is_finished(),
    })
}

fn step_beam(ctx: &StepContext, data: &mut SlotData, plan: Prepared) -> Result<()> {
    let vocab = ctx.vocab_size;
    let beam_width = data.buffers.beam_width;
    let input_len = data.input_len();
    let end_id = data.request.end_id;
    let mut logits = plan.logits;
    for (beam, row) in logits.chunks_mut(vocab).enumerate() {
        let history = data.buffers.beam_history(beam, input_len);
        // The embedding bias joins the stage-1 reduction instead.
        apply_penalties(row, &data.config, &history, None, &data.request.bad_words, end_id);
    }
    let params = BeamParams {
        beam_width,
        vocab_size: vocab,
        end_id,
        length_penalty: data.config.length_penalty,
        early_stopping: data.config.early_stopping,
        diversity_rate: data.config.beam_search_diversity_rate,
    };

    let SlotData {
        buffers,
        hyps,
        workspace,
        request,
        ..
    } = &mut *data;
    let hyps = hyps
        .as_mut()
        .ok_or_else(|| DecodeError::InvalidConfig("beam slot without hypotheses".to_string()))?;
    let outcome = {
        let mut tables = buffers.beam_tables(input_len);
        beam_search_step(
            workspace,
            &logits,
            request.embedding_bias.as_deref(),
            &params,
            &mut tables,
            hyps,
        )?
    };
    for (beam, &token) in outcome.new_tokens.iter().enumerate().take(beam_width) {
        buffers.seq_lens[beam] += 1;
        buffers.set_new_token(0, beam, token);
    }
    if outcome.done {
        buffers.mark_all(FinishedState::set_finished_eos);
    }
    tracing::trace!(completed = outcome.completed, done = outcome.done, "beam step");
    finish_step(data, 1);
    Ok(())
}

fn step_external_draft(ctx: &StepContext, data: &mut SlotData, plan: Prepared) -> Result<()> {
    let vocab = ctx.vocab_size;
    let drafts = plan.drafts;
    let mut logits = plan.logits;
    penalize_rows(data, &mut logits, vocab);

    let (acceptance, log_probs) = if data.config.accept_draft_by_logits {
        let target_probs: Vec<f32> = logits.chunks(vocab).flat_map(softmax).collect();
        let draft_probs: Vec<f32> = plan
            .draft_logits
            .unwrap_or_default()
            .chunks(vocab)
            .flat_map(softmax)
            .collect();
        let acceptance = accept_draft_tokens_by_logits(
            &drafts.tokens,
            &draft_probs,
            &target_probs,
            vocab,
            data.sampler.rng_mut(),
        )?;
        let log_probs = acceptance
            .tokens
            .iter()
            .enumerate()
            .map(|(i, &t)| target_probs[i * vocab + t as usize].max(f32::MIN_POSITIVE).ln())
            .collect::<Vec<_>>();
        (acceptance, log_probs)
    } else {
        let targets = select_targets(ctx, data, &logits)?;
        let acceptance = accept_draft_tokens_by_ids(&drafts.tokens, &targets)?;
        let log_probs = row_log_probs(&logits, vocab, 0.., &acceptance.tokens);
        (acceptance, log_probs)
    };

    let committed = commit_tokens(data, &acceptance.tokens, &log_probs);
    let accepted = acceptance.accepted.min(committed);
    data.buffers.accepted_len = accepted;
    data.buffers.accepted_path = (0..accepted).collect();
    data.stats.draft_tokens_proposed += drafts.len();
    data.stats.draft_tokens_accepted += accepted;
    data.pending_drafts = DraftTokens::default();
    finish_step(data, committed);
    Ok(())
}

/// Target tokens following each row, chosen the way the slot samples.
fn select_targets(ctx: &StepContext, data: &mut SlotData, logits: &[f32]) -> Result<Vec<u32>> {
    let vocab = ctx.vocab_size;
    if data.top_k == 1 {
        return Ok(logits.chunks(vocab).map(argmax).collect());
    }
    let rands: Vec<f32> = (0..logits.len() / vocab)
        .map(|_| data.sampler.next_rand_f32())
        .collect();
    let rows: Vec<SamplingRow<'_>> = logits
        .chunks(vocab)
        .zip(&rands)
        .map(|(row, &rand)| SamplingRow {
            logits: row,
            top_k: data.top_k,
            top_p: data.top_p,
            end_id: data.request.end_id,
            finished: FinishedState::empty(),
            rand,
        })
        .collect();
    let sampled = if data.top_k > 0 {
        batch_top_k_sampling(
            &mut data.workspace,
            &rows,
            &TopKParams {
                vocab_size: vocab,
                max_top_k: ctx.max_top_k,
                logits_has_probs: false,
                return_all_top_k: false,
            },
        )?
    } else {
        batch_top_p_sampling(
            &mut data.workspace,
            &rows,
            &TopPParams {
                vocab_size: vocab,
                logits_has_probs: false,
            },
        )?
    };
    Ok(sampled.into_iter().map(|s| s.token).collect())
}

fn step_medusa(ctx: &StepContext, data: &mut SlotData, plan: Prepared) -> Result<()> {
    let tree = ctx.medusa_tree()?;
    let vocab = ctx.vocab_size;
    let mut logits = plan.logits;
    penalize_rows(data, &mut logits, vocab);

    let targets: Vec<u32> = logits.chunks(vocab).map(argmax).collect();
    let acceptance = tree.accept(&data.buffers.draft_tokens, &targets)?;
    let path = &tree.paths()[acceptance.path];
    let log_probs = row_log_probs(&logits, vocab, path.iter().copied(), &acceptance.tokens);

    let committed = commit_tokens(data, &acceptance.tokens, &log_probs);
    let accepted = acceptance.accepted.min(committed);
    data.stats.draft_tokens_proposed += data.buffers.draft_tokens.len();
    data.stats.draft_tokens_accepted += accepted;
    data.buffers.accepted_len = accepted;
    data.buffers.accepted_path = acceptance.path_offsets[..accepted].to_vec();

    let next = match plan.medusa_logits {
        Some(medusa_logits) if !data.is_finished() => {
            let base = path[committed.saturating_sub(1).min(path.len() - 1)];
            tree.next_draft_tokens(&medusa_logits, base, vocab)?
        }
        _ => Vec::new(),
    };
    data.buffers.next_draft_tokens = next.clone();
    data.buffers.draft_tokens = next;
    finish_step(data, committed);
    Ok(())
}

/// Penalize every row against the tokens generated so far.
fn penalize_rows(data: &SlotData, logits: &mut [f32], vocab: usize) {
    let generated = data.buffers.generated(data.input_len());
    for row in logits.chunks_mut(vocab) {
        apply_penalties(
            row,
            &data.config,
            generated,
            data.request.embedding_bias.as_deref(),
            &data.request.bad_words,
            data.request.end_id,
        );
    }
}

/// Log-probability of `tokens[i]` under row `rows[i]`.
fn row_log_probs(
    logits: &[f32],
    vocab: usize,
    rows: impl IntoIterator<Item = usize>,
    tokens: &[u32],
) -> Vec<f32> {
    rows.into_iter()
        .zip(tokens)
        .map(|(r, &t)| log_softmax(&logits[r * vocab..(r + 1) * vocab])[t as usize])
        .collect()
}

/// Append accepted tokens to beam 0, stopping at the first terminal one.
///
/// An end token is written and scored but does not grow the sequence.
/// Returns how many tokens were written.
fn commit_tokens(data: &mut SlotData, tokens: &[u32], log_probs: &[f32]) -> usize {
    let input_len = data.input_len();
    let end_id = data.request.end_id;
    let limit = data.sequence_limit;
    let b = &mut data.buffers;
    let mut committed = 0;
    for (step, (&token, &log_prob)) in tokens.iter().zip(log_probs).enumerate() {
        if step >= b.max_tokens_per_step || b.is_finished() {
            break;
        }
        let pos = b.seq_len();
        b.output_ids[pos] = token;
        b.log_probs[pos] = log_prob;
        b.cum_log_probs[0] += log_prob;
        b.set_new_token(step, 0, token);
        committed += 1;
        if token == end_id {
            b.finished[0].set_finished_eos();
            break;
        }
        b.seq_lens[0] += 1;
        if matches_stop_word(b.generated(input_len), &data.request.stop_words) {
            b.finished[0].set_finished_stop_words();
        } else if b.seq_len() >= limit {
            b.finished[0].set_finished_max_length();
        }
    }
    committed
}

fn finish_step(data: &mut SlotData, committed: usize) {
    data.nb_steps += 1;
    data.check_length_limits();
    data.stats.steps = data.nb_steps;
    data.stats.generated_tokens_per_step.push(committed);
    data.stats.finished = data.finished_state();
}
