//! Speculative decoding: validating draft tokens against the target model.
//!
//! Two draft sources are supported. External draft tokens come with the
//! request (or from a separate draft model) and are checked either by id or
//! by rejection sampling against the draft distribution. Medusa drafts are a
//! token tree produced by extra heads of the target model; see [`medusa`].

pub mod medusa;

pub use medusa::{MedusaAcceptance, MedusaTree};

use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{DecodeError, Result};
use crate::sampling::sample_from_probs;

/// Result of validating one slot's draft tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftAcceptance {
    /// Number of draft tokens accepted.
    pub accepted: usize,
    /// Tokens to append: the accepted drafts followed by one target token.
    pub tokens: Vec<u32>,
}

/// Accept the longest prefix of `draft` that matches the target's own choice.
///
/// `target` holds the token the target model selected at each of the
/// `draft.len() + 1` positions. The emitted tokens are always target tokens,
/// so a rejected draft is replaced by the target's choice at that position and
/// a fully accepted draft earns the bonus token at the end.
pub fn accept_draft_tokens_by_ids(draft: &[u32], target: &[u32]) -> Result<DraftAcceptance> {
    if target.len() != draft.len() + 1 {
        return Err(DecodeError::InvalidConfig(format!(
            "{} draft tokens need {} target tokens, got {}",
            draft.len(),
            draft.len() + 1,
            target.len()
        )));
    }
    let accepted = draft
        .iter()
        .zip(target)
        .take_while(|(d, t)| d == t)
        .count();
    Ok(DraftAcceptance {
        accepted,
        tokens: target[..=accepted].to_vec(),
    })
}

/// Rejection-sample the drafts against the target distribution.
///
/// `draft_probs` is `[n, vocab]` and `target_probs` is `[n + 1, vocab]`, both
/// normalized. Draft `i` is kept with probability
/// `min(1, p_target / p_draft)`; on the first rejection a replacement is drawn
/// from `max(p_target - p_draft, 0)` renormalized. When all drafts are kept,
/// a bonus token is drawn from the last target row.
pub fn accept_draft_tokens_by_logits(
    draft: &[u32],
    draft_probs: &[f32],
    target_probs: &[f32],
    vocab_size: usize,
    rng: &mut StdRng,
) -> Result<DraftAcceptance> {
    let n = draft.len();
    if draft_probs.len() != n * vocab_size || target_probs.len() != (n + 1) * vocab_size {
        return Err(DecodeError::InvalidConfig(format!(
            "draft acceptance expects [{n}, {vocab_size}] draft and [{}, {vocab_size}] target probabilities",
            n + 1
        )));
    }
    let mut tokens = Vec::with_capacity(n + 1);
    for (i, &token) in draft.iter().enumerate() {
        let q_row = &draft_probs[i * vocab_size..(i + 1) * vocab_size];
        let p_row = &target_probs[i * vocab_size..(i + 1) * vocab_size];
        let t = token as usize;
        if t >= vocab_size {
            return Err(DecodeError::InvalidConfig(format!(
                "draft token {token} outside vocabulary of {vocab_size}"
            )));
        }
        let (p, q) = (p_row[t], q_row[t]);
        let ratio = if q > 0.0 { (p / q).min(1.0) } else { 1.0 };
        let u: f32 = rng.gen();
        if u < ratio {
            tokens.push(token);
            continue;
        }
        tokens.push(sample_recovered_token(p_row, q_row, rng));
        return Ok(DraftAcceptance {
            accepted: i,
            tokens,
        });
    }
    let bonus_row = &target_probs[n * vocab_size..];
    tokens.push(sample_from_probs(bonus_row, rng));
    Ok(DraftAcceptance { accepted: n, tokens })
}

/// Draw from `max(p - q, 0)`; falls back to `p` when the residual is empty.
fn sample_recovered_token(target: &[f32], draft: &[f32], rng: &mut StdRng) -> u32 {
    let mut adjusted: Vec<f32> = target
        .iter()
        .zip(draft)
        .map(|(&p, &q)| (p - q).max(0.0))
        .collect();
    let sum: f32 = adjusted.iter().sum();
    if sum <= 0.0 {
        return sample_from_probs(target, rng);
    }
    let inv_sum = 1.0 / sum;
    for p in adjusted.iter_mut() {
        *p *= inv_sum;
    }
    sample_from_probs(&adjusted, rng)
}

/// Exclusive prefix sum `[0, a0, a0 + a1, ..]` with `lengths.len() + 1` entries.
pub fn exclusive_cumsum(lengths: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(lengths.len() + 1);
    let mut total = 0;
    out.push(0);
    for &len in lengths {
        total += len;
        out.push(total);
    }
    out
}
