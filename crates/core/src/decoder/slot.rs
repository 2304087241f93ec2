//! Per-slot decoding state.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use super::buffers::SlotBuffers;
use super::request::{DraftTokens, Request};
use crate::beam::{finalize_beams, BeamHypotheses};
use crate::config::DecodingMode;
use crate::error::{DecodeError, Result};
use crate::sampling::{beam_workspace_size, FinishedState, SamplerState, SamplingConfig, TopPDecay, Workspace};

/// How a slot selects tokens, resolved at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotMode {
    Greedy,
    TopK,
    TopP,
    BeamSearch,
    ExternalDraft,
    Medusa,
}

impl SlotMode {
    /// Resolve the batch mode and request config into a slot mode plus the
    /// effective `(top_k, top_p)`.
    pub(crate) fn resolve(mode: DecodingMode, config: &SamplingConfig) -> (Self, usize, f32) {
        match mode {
            DecodingMode::Medusa => (SlotMode::Medusa, 1, 1.0),
            DecodingMode::TopK | DecodingMode::TopP if config.is_zero_temperature() => {
                (SlotMode::Greedy, 1, 1.0)
            }
            DecodingMode::ExternalDraftTokens => {
                let (_, k, p) = Self::resolve_sampling(config);
                (SlotMode::ExternalDraft, k, p)
            }
            DecodingMode::BeamSearch => (SlotMode::BeamSearch, 0, 1.0),
            DecodingMode::Auto if config.is_beam_search() => (SlotMode::BeamSearch, 0, 1.0),
            DecodingMode::TopK => {
                let k = config.top_k.max(1);
                let mode = if k == 1 { SlotMode::Greedy } else { SlotMode::TopK };
                (mode, k, 1.0)
            }
            DecodingMode::TopP => (SlotMode::TopP, 0, config.top_p),
            DecodingMode::Auto | DecodingMode::TopKTopP => Self::resolve_sampling(config),
        }
    }

    fn resolve_sampling(config: &SamplingConfig) -> (Self, usize, f32) {
        if config.is_greedy() {
            (SlotMode::Greedy, 1, 1.0)
        } else if config.top_k > 0 {
            (SlotMode::TopK, config.top_k, config.top_p)
        } else {
            (SlotMode::TopP, 0, config.top_p)
        }
    }

    /// Modes stepped through the batched sampling kernels.
    pub fn is_sampling(self) -> bool {
        matches!(self, SlotMode::Greedy | SlotMode::TopK | SlotMode::TopP)
    }

    pub fn is_speculative(self) -> bool {
        matches!(self, SlotMode::ExternalDraft | SlotMode::Medusa)
    }
}

/// Issued by admission; reads through a handle fail once the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotHandle {
    pub slot: usize,
    pub epoch: u64,
}

/// Per-slot counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlotStats {
    pub mode: Option<SlotMode>,
    pub steps: usize,
    /// Tokens committed by each step.
    pub generated_tokens_per_step: Vec<usize>,
    pub draft_tokens_proposed: usize,
    pub draft_tokens_accepted: usize,
    pub finished: FinishedState,
}

impl SlotStats {
    pub fn generated_tokens(&self) -> usize {
        self.generated_tokens_per_step.iter().sum()
    }

    /// Fraction of proposed draft tokens that were accepted.
    pub fn acceptance_rate(&self) -> f64 {
        if self.draft_tokens_proposed == 0 {
            0.0
        } else {
            self.draft_tokens_accepted as f64 / self.draft_tokens_proposed as f64
        }
    }
}

/// Everything bound to a slot between admission and reuse.
#[derive(Debug)]
pub(crate) struct SlotData {
    pub request: Request,
    pub config: SamplingConfig,
    pub mode: SlotMode,
    pub top_k: usize,
    /// Current top-p after decay.
    pub top_p: f32,
    pub decay: TopPDecay,
    pub sampler: SamplerState,
    pub buffers: SlotBuffers,
    pub hyps: Option<BeamHypotheses>,
    /// Scratch for per-slot kernels (beam search, draft verification).
    pub workspace: Workspace,
    /// External drafts to validate when the step input carries none.
    pub pending_drafts: DraftTokens,
    /// `min(max_sequence_length, input_len + max_new_tokens)`.
    pub sequence_limit: usize,
    pub nb_steps: usize,
    pub stats: SlotStats,
    pub finalized: bool,
}

impl SlotData {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request: Request,
        config: SamplingConfig,
        mode: SlotMode,
        top_k: usize,
        top_p: f32,
        mut buffers: SlotBuffers,
        vocab_size: usize,
        max_top_k: usize,
    ) -> Self {
        let beam_width = if mode == SlotMode::BeamSearch {
            config.beam_width
        } else {
            1
        };
        buffers.reset(
            beam_width,
            &request.input_ids,
            request.pad_id,
            mode == SlotMode::BeamSearch,
        );
        let max_seq_len = buffers.max_seq_len;
        let sequence_limit = (request.input_len() + request.max_new_tokens).min(max_seq_len);

        let (hyps, workspace, pending_drafts) = match mode {
            SlotMode::BeamSearch => (
                Some(BeamHypotheses::new(beam_width, max_seq_len)),
                Workspace::new(beam_workspace_size(1, beam_width)),
                DraftTokens::default(),
            ),
            SlotMode::ExternalDraft => (
                None,
                Workspace::for_batch(buffers.max_tokens_per_step, vocab_size, max_top_k, 1),
                request.draft_tokens.clone(),
            ),
            SlotMode::Medusa => {
                buffers.draft_tokens = request.draft_tokens.tokens.clone();
                (None, Workspace::default(), DraftTokens::default())
            }
            _ => (None, Workspace::default(), DraftTokens::default()),
        };

        Self {
            decay: TopPDecay {
                initial: top_p,
                ..config.top_p_decay_schedule()
            },
            sampler: SamplerState::new(config.random_seed),
            stats: SlotStats {
                mode: Some(mode),
                ..Default::default()
            },
            request,
            config,
            mode,
            top_k,
            top_p,
            buffers,
            hyps,
            workspace,
            pending_drafts,
            sequence_limit,
            nb_steps: 0,
            finalized: false,
        }
    }

    pub fn input_len(&self) -> usize {
        self.request.input_len()
    }

    pub fn is_finished(&self) -> bool {
        self.buffers.is_finished()
    }

    pub fn finished_state(&self) -> FinishedState {
        self.buffers.finished[0]
    }

    /// Mark length-based termination after a step.
    pub fn check_length_limits(&mut self) {
        if self.buffers.is_finished() {
            return;
        }
        if self.buffers.seq_len() >= self.sequence_limit
            || self.nb_steps >= self.request.max_new_tokens
        {
            self.buffers.mark_all(FinishedState::set_finished_max_length);
        }
    }

    /// Gather the final beams into the output buffers. Idempotent.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        let input_len = self.input_len();
        let length_penalty = self.config.length_penalty;
        let Some(hyps) = self.hyps.as_mut() else {
            return;
        };
        let fin = {
            let tables = self.buffers.beam_tables(input_len);
            finalize_beams(&tables, hyps, length_penalty)
        };
        let l = self.buffers.max_seq_len;
        for rank in 0..self.buffers.beam_width {
            let row = rank * l..(rank + 1) * l;
            self.buffers.output_ids[row.clone()].copy_from_slice(&fin.output_ids[row.clone()]);
            self.buffers.log_probs[row].copy_from_slice(&fin.log_probs[rank * l..(rank + 1) * l]);
            self.buffers.seq_lens[rank] = fin.seq_lens[rank];
            self.buffers.cum_log_probs[rank] = fin.cum_log_probs[rank];
        }
        tracing::debug!(
            best_score = fin.normed_scores.first().copied().unwrap_or(f32::NEG_INFINITY),
            "finalized beams"
        );
    }
}

/// Lifecycle of a slot: `Empty -> Active -> Finished -> (reused)`.
#[derive(Debug, Default)]
pub(crate) enum SlotState {
    #[default]
    Empty,
    Active(Box<SlotData>),
    Finished(Box<SlotData>),
}

impl SlotState {
    pub fn data(&self) -> Option<&SlotData> {
        match self {
            SlotState::Empty => None,
            SlotState::Active(data) | SlotState::Finished(data) => Some(data),
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut SlotData> {
        match self {
            SlotState::Empty => None,
            SlotState::Active(data) | SlotState::Finished(data) => Some(data),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, SlotState::Finished(_))
    }

    /// `Active -> Finished`; other states are unchanged.
    pub fn finish(&mut self) {
        if let SlotState::Active(_) = self {
            if let SlotState::Active(data) = std::mem::take(self) {
                *self = SlotState::Finished(data);
            }
        }
    }
}

/// One batch slot. The state sits behind a lock held by running steps; the
/// reuse epoch, occupancy and pending-work count are atomics so submission
/// never waits on a step.
#[derive(Debug, Default)]
pub(crate) struct SlotCell {
    epoch: AtomicU64,
    occupied: AtomicBool,
    /// Jobs enqueued for this slot that have not completed.
    in_flight: AtomicUsize,
    state: Mutex<SlotState>,
}

impl SlotCell {
    pub fn lock(&self) -> Result<MutexGuard<'_, SlotState>> {
        self.state
            .lock()
            .map_err(|_| DecodeError::Device("slot state poisoned by a panicked job".to_string()))
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Whether a request was ever admitted; slots never return to empty.
    pub fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn check(&self, index: usize, handle: SlotHandle) -> Result<()> {
        let current = self.epoch();
        if handle.epoch != current {
            return Err(DecodeError::StaleSlot {
                slot: index,
                held: handle.epoch,
                current,
            });
        }
        if !self.is_occupied() {
            return Err(DecodeError::EmptySlot { slot: index });
        }
        Ok(())
    }

    /// Register one more pending job.
    pub fn claim(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Claim the slot only if nothing is pending on it.
    pub fn claim_idle(&self) -> bool {
        self.in_flight
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Install freshly admitted state and bump the epoch. The caller holds an
    /// idle claim.
    pub fn admit(&self, data: SlotData) -> Result<u64> {
        let mut state = self.lock()?;
        *state = SlotState::Active(Box::new(data));
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.occupied.store(true, Ordering::Release);
        Ok(epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::EarlyStopping;

    #[test]
    fn resolves_sampling_modes() {
        let auto = DecodingMode::Auto;
        assert_eq!(SlotMode::resolve(auto, &SamplingConfig::default()).0, SlotMode::Greedy);
        assert_eq!(SlotMode::resolve(auto, &SamplingConfig::top_k(4)).0, SlotMode::TopK);
        assert_eq!(SlotMode::resolve(auto, &SamplingConfig::top_p(0.5)).0, SlotMode::TopP);
        assert_eq!(SlotMode::resolve(auto, &SamplingConfig::beam_search(2)).0, SlotMode::BeamSearch);
        assert_eq!(
            SlotMode::resolve(DecodingMode::TopK, &SamplingConfig::default()),
            (SlotMode::Greedy, 1, 1.0)
        );
        assert_eq!(
            SlotMode::resolve(DecodingMode::TopP, &SamplingConfig::top_p(0.3)),
            (SlotMode::TopP, 0, 0.3)
        );
        assert_eq!(SlotMode::resolve(DecodingMode::Medusa, &SamplingConfig::top_k(4)).0, SlotMode::Medusa);

        let frozen = SamplingConfig {
            temperature: 0.0,
            ..SamplingConfig::top_k(4)
        };
        for mode in [auto, DecodingMode::TopK, DecodingMode::TopP, DecodingMode::TopKTopP] {
            assert_eq!(SlotMode::resolve(mode, &frozen), (SlotMode::Greedy, 1, 1.0));
        }
        assert_eq!(
            SlotMode::resolve(DecodingMode::ExternalDraftTokens, &frozen),
            (SlotMode::ExternalDraft, 1, 1.0)
        );
    }

    #[test]
    fn state_transitions() {
        let mut state = SlotState::Empty;
        state.finish();
        assert!(matches!(state, SlotState::Empty));

        let data = SlotData::new(
            Request::new(vec![1, 2], 4, 0),
            SamplingConfig::greedy(),
            SlotMode::Greedy,
            1,
            1.0,
            SlotBuffers::new(1, 8, 1),
            4,
            4,
        );
        assert_eq!(data.sequence_limit, 6);
        state = SlotState::Active(Box::new(data));
        state.finish();
        assert!(state.is_finished());
        assert!(state.data().is_some());
    }

    #[test]
    fn stale_and_empty_handles_rejected() {
        let cell = SlotCell::default();
        let current = SlotHandle { slot: 0, epoch: 0 };
        assert!(matches!(cell.check(0, current), Err(DecodeError::EmptySlot { slot: 0 })));

        let data = SlotData::new(
            Request::new(vec![1], 4, 0),
            SamplingConfig::greedy(),
            SlotMode::Greedy,
            1,
            1.0,
            SlotBuffers::new(1, 8, 1),
            4,
            4,
        );
        assert!(cell.claim_idle());
        assert_eq!(cell.admit(data).unwrap(), 1);
        cell.release();
        assert!(matches!(cell.check(0, current), Err(DecodeError::StaleSlot { held: 0, current: 1, .. })));
        assert!(cell.check(0, SlotHandle { slot: 0, epoch: 1 }).is_ok());
    }

    #[test]
    fn pending_work_blocks_idle_claims() {
        let cell = SlotCell::default();
        cell.claim();
        assert!(!cell.claim_idle());
        cell.release();
        assert!(cell.claim_idle());
        cell.release();
        cell.release();
        assert_eq!(cell.in_flight(), 0);
    }

    #[test]
    fn beam_slot_gets_hypotheses() {
        let config = SamplingConfig {
            beam_width: 2,
            early_stopping: EarlyStopping::Always,
            ..Default::default()
        };
        let data = SlotData::new(
            Request::new(vec![3], 10, 0),
            config,
            SlotMode::BeamSearch,
            0,
            1.0,
            SlotBuffers::new(2, 8, 1),
            8,
            4,
        );
        assert_eq!(data.buffers.beam_width, 2);
        assert!(data.hyps.is_some());
        assert_eq!(data.sequence_limit, 8);
    }

    #[test]
    fn stats_serialize() {
        let stats = SlotStats {
            mode: Some(SlotMode::Medusa),
            steps: 2,
            generated_tokens_per_step: vec![3, 1],
            draft_tokens_proposed: 4,
            draft_tokens_accepted: 2,
            finished: FinishedState::finished_eos(),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["mode"], "medusa");
        assert_eq!(json["finished"], 1);
        assert_eq!(stats.generated_tokens(), 4);
        assert!((stats.acceptance_rate() - 0.5).abs() < 1e-9);
    }
}
