//! Token selection primitives.
//!
//! This module provides:
//! - Per-request sampling configuration and generator state
//! - Batched top-k sampling on top of an online-softmax reduction
//! - Nucleus (top-p) sampling and the top-p decay schedule
//! - Logit penalties and the bit-packed finished state
//!
//! The batched kernels take caller-owned [`Workspace`] memory sized with the
//! `*_workspace_size` functions, and reject unsupported parameters before
//! touching any row.

mod finished;
pub mod online_softmax;
pub mod penalties;
mod top_k;
mod top_p;
mod workspace;

pub use finished::FinishedState;
pub use top_k::{batch_top_k_sampling, SampledToken, SamplingRow, TopKParams, MAX_TOP_K};
pub use top_p::{
    batch_top_p_sampling, compute_top_p_decay, top_p_initialize, TopPDecay, TopPParams,
};
pub use workspace::{
    beam_workspace_size, top_k_workspace_size, top_p_workspace_size, Workspace,
    VOCAB_CHUNKS_PER_ROW,
};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::beam::EarlyStopping;
use crate::error::{DecodeError, Result};

/// Temperatures below this decode greedily.
pub const GREEDY_TEMPERATURE: f32 = 1e-6;

/// Per-request sampling and beam-search parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Beams per request. 1 = sampling.
    pub beam_width: usize,
    /// Top-K filtering. 0 = disabled (top-p only, or greedy when top-p is 1).
    pub top_k: usize,
    /// Nucleus threshold in (0, 1]. 1.0 = whole distribution.
    pub top_p: f32,
    /// Per-step multiplicative decay of top-p. 1.0 = none.
    pub top_p_decay: f32,
    /// Floor for the decayed top-p.
    pub top_p_min: f32,
    /// Producing this token resets top-p to its initial value.
    pub top_p_reset_id: Option<u32>,
    /// Temperature for logit scaling. 1.0 = unchanged, 0.0 = greedy.
    pub temperature: f32,
    /// Penalty for repeated tokens. 1.0 = none.
    pub repetition_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    /// End token is suppressed until this many tokens were generated.
    pub min_length: usize,
    /// Beam score normalization exponent. 0.0 = raw cumulative log-prob.
    pub length_penalty: f32,
    pub early_stopping: EarlyStopping,
    /// Added to stage-2 beam candidate keys per source beam index.
    pub beam_search_diversity_rate: f32,
    /// Optional seed for deterministic sampling.
    pub random_seed: Option<u64>,
    /// Validate external draft tokens by distribution rather than by id.
    pub accept_draft_by_logits: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            beam_width: 1,
            top_k: 0,
            top_p: 1.0,
            top_p_decay: 1.0,
            top_p_min: 1e-6,
            top_p_reset_id: None,
            temperature: 1.0,
            repetition_penalty: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            min_length: 0,
            length_penalty: 0.0,
            early_stopping: EarlyStopping::Heuristic,
            beam_search_diversity_rate: 0.0,
            random_seed: None,
            accept_draft_by_logits: false,
        }
    }
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        Self {
            top_k: 1,
            ..Default::default()
        }
    }

    pub fn top_k(k: usize) -> Self {
        Self {
            top_k: k,
            ..Default::default()
        }
    }

    pub fn top_p(p: f32) -> Self {
        Self {
            top_p: p,
            ..Default::default()
        }
    }

    pub fn beam_search(beam_width: usize) -> Self {
        Self {
            beam_width,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DecodeError::InvalidConfig(e.to_string()))
    }

    pub fn is_beam_search(&self) -> bool {
        self.beam_width > 1
    }

    /// Greedy at near-zero temperature, when top-k is 1, or when neither
    /// top-k nor top-p restricts.
    pub fn is_greedy(&self) -> bool {
        self.is_zero_temperature() || self.top_k == 1 || (self.top_k == 0 && self.top_p >= 1.0)
    }

    /// Temperature below [`GREEDY_TEMPERATURE`] collapses to arg-max.
    pub fn is_zero_temperature(&self) -> bool {
        self.temperature < GREEDY_TEMPERATURE
    }

    pub fn top_p_decay_schedule(&self) -> TopPDecay {
        TopPDecay {
            initial: self.top_p,
            decay: self.top_p_decay,
            min: self.top_p_min,
            reset_id: self.top_p_reset_id,
        }
    }

    /// Check against the session's capacities.
    pub fn validate(&self, max_top_k: usize, max_beam_width: usize) -> Result<()> {
        top_k::validate_top_k(self.top_k, max_top_k)?;
        if self.beam_width == 0 {
            return Err(DecodeError::InvalidConfig(
                "beam_width must be > 0".to_string(),
            ));
        }
        if self.beam_width > max_beam_width {
            return Err(DecodeError::CapacityExceeded {
                what: "beam width",
                requested: self.beam_width,
                capacity: max_beam_width,
            });
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(DecodeError::InvalidConfig(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if !(self.top_p_decay > 0.0 && self.top_p_decay <= 1.0) {
            return Err(DecodeError::InvalidConfig(format!(
                "top_p_decay must be in (0, 1], got {}",
                self.top_p_decay
            )));
        }
        if self.temperature < 0.0 {
            return Err(DecodeError::InvalidConfig(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if self.repetition_penalty <= 0.0 {
            return Err(DecodeError::InvalidConfig(format!(
                "repetition_penalty must be > 0, got {}",
                self.repetition_penalty
            )));
        }
        Ok(())
    }
}

/// Mutable state for sampling (holds RNG per slot).
#[derive(Debug)]
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Access the underlying RNG for use in rejection sampling.
    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Uniform f32 in [0, 1), one per sampled row.
    pub fn next_rand_f32(&mut self) -> f32 {
        self.rng.gen::<f32>()
    }
}

pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

/// Compute log-softmax in a numerically stable way.
/// log_softmax(x_i) = x_i - max(x) - log(sum(exp(x_j - max(x))))
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum_ln = logits
        .iter()
        .map(|&x| (x - max_logit).exp())
        .sum::<f32>()
        .ln();
    logits.iter().map(|&x| x - max_logit - exp_sum_ln).collect()
}

/// Index of the largest value; the lowest index wins ties.
pub fn argmax(values: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best as u32
}

/// Draw an index proportionally to `probs`.
pub(crate) fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> u32 {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if cumsum > r {
            return i as u32;
        }
    }
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or(probs.len().saturating_sub(1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_greedy() {
        let config = SamplingConfig::default();
        assert!(config.is_greedy());
        assert!(!config.is_beam_search());
        assert!(SamplingConfig::greedy().is_greedy());
        assert!(!SamplingConfig::top_k(4).is_greedy());
        assert!(!SamplingConfig::top_p(0.9).is_greedy());
    }

    #[test]
    fn temperature_zero_is_greedy() {
        let config = SamplingConfig {
            temperature: 0.0,
            top_k: 8,
            top_p: 0.5,
            ..Default::default()
        };
        assert!(config.validate(16, 1).is_ok());
        assert!(config.is_greedy());
        let warm = SamplingConfig {
            temperature: 0.7,
            ..config
        };
        assert!(!warm.is_greedy());
    }

    #[test]
    fn parse_config_from_json() {
        let config = SamplingConfig::from_json(
            r#"{"beam_width": 4, "length_penalty": 1.0, "early_stopping": "always", "random_seed": 7}"#,
        )
        .unwrap();
        assert_eq!(config.beam_width, 4);
        assert_eq!(config.early_stopping, EarlyStopping::Always);
        assert_eq!(config.random_seed, Some(7));
        assert_eq!(config.top_p, 1.0);
    }

    #[test]
    fn malformed_json_is_invalid_config() {
        assert!(matches!(
            SamplingConfig::from_json("{\"top_k\": -1}"),
            Err(DecodeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_top_k_above_cap() {
        let config = SamplingConfig::top_k(1025);
        assert!(matches!(
            config.validate(1024, 1),
            Err(DecodeError::UnsupportedParameter { value: 1025, .. })
        ));
    }

    #[test]
    fn validate_rejects_oversized_beam() {
        let config = SamplingConfig::beam_search(8);
        assert!(matches!(
            config.validate(64, 4),
            Err(DecodeError::CapacityExceeded { requested: 8, .. })
        ));
        config.validate(64, 8).unwrap();
    }

    #[test]
    fn validate_rejects_bad_top_p() {
        assert!(SamplingConfig::top_p(1.5).validate(64, 1).is_err());
        let config = SamplingConfig {
            top_p_decay: 0.0,
            ..Default::default()
        };
        assert!(config.validate(64, 1).is_err());
    }

    #[test]
    fn sampler_state_is_deterministic() {
        let mut a = SamplerState::new(Some(42));
        let mut b = SamplerState::new(Some(42));
        for _ in 0..10 {
            assert_eq!(a.next_rand_f32(), b.next_rand_f32());
        }
    }

    #[test]
    fn argmax_first_wins() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0]), 1);
        assert_eq!(argmax(&[f32::NEG_INFINITY, -1.0]), 1);
    }

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn sample_from_probs_respects_zero_mass() {
        let mut state = SamplerState::new(Some(3));
        for _ in 0..100 {
            let t = sample_from_probs(&[0.0, 0.5, 0.0, 0.5], state.rng_mut());
            assert!(t == 1 || t == 3);
        }
    }
}
