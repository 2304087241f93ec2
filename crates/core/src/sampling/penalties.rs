//! Logit adjustments applied before token selection.

use std::collections::HashMap;

use super::SamplingConfig;

/// Apply every adjustment `config` enables to one row of logits.
///
/// `generated` holds the tokens produced so far (prompt excluded), and
/// `embedding_bias` is the request's per-token additive bias.
pub fn apply_penalties(
    logits: &mut [f32],
    config: &SamplingConfig,
    generated: &[u32],
    embedding_bias: Option<&[f32]>,
    bad_words: &[Vec<u32>],
    end_id: u32,
) {
    if let Some(bias) = embedding_bias {
        apply_embedding_bias(logits, bias);
    }
    if config.repetition_penalty != 1.0 {
        apply_repetition_penalty(logits, generated, config.repetition_penalty);
    }
    if config.frequency_penalty != 0.0 || config.presence_penalty != 0.0 {
        apply_frequency_presence_penalty(
            logits,
            generated,
            config.frequency_penalty,
            config.presence_penalty,
        );
    }
    if !bad_words.is_empty() {
        apply_bad_words(logits, bad_words, generated);
    }
    if config.min_length > 0 {
        apply_min_length(logits, end_id, config.min_length, generated.len());
    }
    // Near-zero temperature is served by arg-max; scaling would only overflow.
    if !config.is_zero_temperature() && config.temperature != 1.0 {
        let inv_temp = 1.0 / config.temperature;
        for logit in logits.iter_mut() {
            *logit *= inv_temp;
        }
    }
}

pub(crate) fn apply_embedding_bias(logits: &mut [f32], bias: &[f32]) {
    for (logit, b) in logits.iter_mut().zip(bias) {
        *logit += *b;
    }
}

pub(crate) fn apply_repetition_penalty(logits: &mut [f32], generated: &[u32], penalty: f32) {
    let mut seen = vec![false; logits.len()];
    for &token_id in generated {
        let idx = token_id as usize;
        if idx < logits.len() && !seen[idx] {
            seen[idx] = true;
            if logits[idx] > 0.0 {
                logits[idx] /= penalty;
            } else {
                logits[idx] *= penalty;
            }
        }
    }
}

/// `logit -= frequency * count + presence` for every generated token.
pub(crate) fn apply_frequency_presence_penalty(
    logits: &mut [f32],
    generated: &[u32],
    frequency_penalty: f32,
    presence_penalty: f32,
) {
    let mut counts = HashMap::<u32, u32>::new();
    for &token_id in generated {
        *counts.entry(token_id).or_insert(0) += 1;
    }
    for (&token_id, &count) in &counts {
        let idx = token_id as usize;
        if idx < logits.len() {
            logits[idx] -= frequency_penalty * count as f32 + presence_penalty;
        }
    }
}

/// Ban the last token of every bad word whose prefix ends `generated`.
pub(crate) fn apply_bad_words(logits: &mut [f32], bad_words: &[Vec<u32>], generated: &[u32]) {
    for word in bad_words {
        let Some((&last, prefix)) = word.split_last() else {
            continue;
        };
        if prefix.len() > generated.len() {
            continue;
        }
        if generated.ends_with(prefix) {
            let idx = last as usize;
            if idx < logits.len() {
                logits[idx] = f32::NEG_INFINITY;
            }
        }
    }
}

pub(crate) fn apply_min_length(
    logits: &mut [f32],
    end_id: u32,
    min_length: usize,
    generated_len: usize,
) {
    if generated_len < min_length {
        if let Some(logit) = logits.get_mut(end_id as usize) {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// Whether `sequence` ends with any of `stop_words`.
pub fn matches_stop_word(sequence: &[u32], stop_words: &[Vec<u32>]) -> bool {
    stop_words
        .iter()
        .any(|word| !word.is_empty() && sequence.ends_with(word))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repetition_penalty_counts_each_token_once() {
        let mut logits = vec![2.0f32, -2.0, 1.0];
        apply_repetition_penalty(&mut logits, &[0, 0, 1], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 1.0]);
    }

    #[test]
    fn frequency_and_presence() {
        let mut logits = vec![0.0f32; 3];
        apply_frequency_presence_penalty(&mut logits, &[1, 1, 2], 0.5, 1.0);
        assert_eq!(logits, vec![0.0, -2.0, -1.5]);
    }

    #[test]
    fn single_token_bad_word_always_banned() {
        let mut logits = vec![0.0f32; 4];
        apply_bad_words(&mut logits, &[vec![2]], &[]);
        assert_eq!(logits[2], f32::NEG_INFINITY);
    }

    #[test]
    fn multi_token_bad_word_needs_prefix() {
        let mut logits = vec![0.0f32; 4];
        apply_bad_words(&mut logits, &[vec![1, 3]], &[0, 2]);
        assert_eq!(logits[3], 0.0);
        apply_bad_words(&mut logits, &[vec![1, 3]], &[0, 1]);
        assert_eq!(logits[3], f32::NEG_INFINITY);
    }

    #[test]
    fn min_length_blocks_end_token() {
        let mut logits = vec![0.0f32; 3];
        apply_min_length(&mut logits, 2, 3, 1);
        assert_eq!(logits[2], f32::NEG_INFINITY);
        let mut logits = vec![0.0f32; 3];
        apply_min_length(&mut logits, 2, 3, 3);
        assert_eq!(logits[2], 0.0);
    }

    #[test]
    fn apply_penalties_bias_then_temperature() {
        let config = SamplingConfig {
            temperature: 0.5,
            ..Default::default()
        };
        let mut logits = vec![1.0f32, 2.0];
        apply_penalties(&mut logits, &config, &[], Some(&[1.0, 0.0]), &[], 9);
        assert_eq!(logits, vec![4.0, 4.0]);
    }

    #[test]
    fn stop_word_suffix_match() {
        let stops = vec![vec![4, 5], vec![]];
        assert!(matches_stop_word(&[1, 4, 5], &stops));
        assert!(!matches_stop_word(&[4, 5, 1], &stops));
        assert!(!matches_stop_word(&[], &stops));
    }
}
