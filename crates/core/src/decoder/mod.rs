//! Batch decode orchestration.
//!
//! A [`DecoderBatch`] owns a fixed set of request slots. Requests are admitted
//! into slots, every forward call advances all active slots by one step, and
//! results are read back through the getters once the step has been waited
//! on.
//!
//! # Lifecycle
//!
//! ```ignore
//! let mut decoder = DecoderBatch::new(vocab_size, vocab_size);
//! decoder.setup(DecoderSetup::default())?;
//! let handle = decoder.new_request(0, Request::new(prompt, 16, eos), SamplingConfig::greedy())?;
//! loop {
//!     let token = decoder.forward_async(DecoderBatchInput::new(logits))?;
//!     let report = decoder.forward_sync(token)?;
//!     if report.newly_finished.contains(&handle.slot) {
//!         break;
//!     }
//! }
//! decoder.finalize(handle)?.wait()?;
//! let ids = decoder.output_ids(handle)?;
//! ```
//!
//! Work runs on [`DecodeStream`] workers. In fused mode a single job steps
//! every slot; otherwise each slot gets its own job on stream
//! `slot % num_streams`. Jobs for one slot always land on the same stream, so
//! a slot's steps and its finalize run in order.

mod buffers;
pub mod request;
mod slot;
mod step;
mod stream;

pub use request::{DraftTokens, Request};
pub use slot::{SlotHandle, SlotMode, SlotStats};
pub use stream::DecodeStream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::{Device, Tensor};
use tokio::sync::oneshot;

use crate::config::{DecoderSetup, DecodingMode};
use crate::error::{DecodeError, Result};
use crate::sampling::{SamplingConfig, Workspace};
use crate::speculative::{exclusive_cumsum, MedusaTree};
use buffers::SlotBuffers;
use slot::{SlotCell, SlotData};
use step::{run_step, SlotInput, SlotOutcome, SlotWork, StepContext};

/// Per-slot inputs for one step. Index `i` addresses slot `i`.
#[derive(Debug, Default)]
pub struct DecoderBatchInput {
    /// `[rows, vocab_size_padded]` logits per slot, where `rows` is the beam
    /// width, the number of drafts plus one, or the Medusa node count.
    /// `None` leaves the slot out of this step.
    pub logits: Vec<Option<Tensor>>,
    /// Medusa head logits `[num_nodes, num_heads, vocab_size_padded]`.
    pub medusa_logits: Vec<Option<Tensor>>,
    /// External drafts to validate this step, replacing the request's.
    pub drafts: Vec<Option<DraftTokens>>,
}

impl DecoderBatchInput {
    pub fn new(logits: Vec<Option<Tensor>>) -> Self {
        Self {
            logits,
            ..Default::default()
        }
    }

    pub fn with_medusa_logits(mut self, medusa_logits: Vec<Option<Tensor>>) -> Self {
        self.medusa_logits = medusa_logits;
        self
    }

    pub fn with_drafts(mut self, drafts: Vec<Option<DraftTokens>>) -> Self {
        self.drafts = drafts;
        self
    }
}

/// Completion handle for one enqueued step.
#[must_use = "pass the token to forward_sync before reading results"]
#[derive(Debug)]
pub struct DecodeToken {
    receivers: Vec<oneshot::Receiver<Result<Vec<SlotOutcome>>>>,
    stepped: Vec<usize>,
}

impl DecodeToken {
    /// Slots included in the step.
    pub fn stepped_slots(&self) -> &[usize] {
        &self.stepped
    }
}

/// Completion handle for enqueued finalize work.
#[must_use = "wait on the event before reading finalized outputs"]
#[derive(Debug)]
pub struct DecodeEvent {
    receivers: Vec<oneshot::Receiver<Result<()>>>,
}

impl DecodeEvent {
    /// Block until every finalize job has run.
    ///
    /// Panics if called from a tokio runtime thread; use
    /// [`wait_async`](Self::wait_async) there.
    pub fn wait(self) -> Result<()> {
        let mut first_err = None;
        for rx in self.receivers {
            if let Err(e) = stream::wait(rx).and_then(|r| r) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub async fn wait_async(self) -> Result<()> {
        let mut first_err = None;
        for rx in self.receivers {
            if let Err(e) = stream::wait_async(rx).await.and_then(|r| r) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Summary of a completed step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub stepped: Vec<usize>,
    /// Slots that reached a terminal state during this step.
    pub newly_finished: Vec<usize>,
    pub nb_finished: usize,
}

struct Session {
    setup: DecoderSetup,
    ctx: Arc<StepContext>,
    slots: Vec<Arc<SlotCell>>,
    /// One scratch buffer per stream for the batched sampling kernels.
    workspaces: Vec<Arc<Mutex<Workspace>>>,
    faulted: Arc<AtomicBool>,
    streams: Vec<DecodeStream>,
}

impl Session {
    fn stream_index(&self, slot: usize) -> usize {
        slot % self.streams.len()
    }

    /// Enqueue a finalize job; the caller has already claimed the slot.
    fn submit_finalize(&self, slot: usize) -> Result<oneshot::Receiver<Result<()>>> {
        let cell = Arc::clone(&self.slots[slot]);
        let job_cell = Arc::clone(&cell);
        self.streams[self.stream_index(slot)]
            .submit(move || {
                let result = finalize_slot(&job_cell, slot);
                job_cell.release();
                result
            })
            .map_err(|e| {
                cell.release();
                e
            })
    }

    fn cell(&self, slot: usize) -> Result<&Arc<SlotCell>> {
        self.slots.get(slot).ok_or(DecodeError::CapacityExceeded {
            what: "slot index",
            requested: slot,
            capacity: self.slots.len(),
        })
    }
}

/// The batch decoder.
pub struct DecoderBatch {
    vocab_size: usize,
    vocab_size_padded: usize,
    device: Device,
    session: Option<Session>,
}

impl DecoderBatch {
    pub fn new(vocab_size: usize, vocab_size_padded: usize) -> Self {
        Self {
            vocab_size,
            vocab_size_padded,
            device: Device::Cpu,
            session: None,
        }
    }

    /// Device the getters place their tensors on.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn vocab_size_padded(&self) -> usize {
        self.vocab_size_padded
    }

    pub fn decoder_setup(&self) -> Option<&DecoderSetup> {
        self.session.as_ref().map(|s| &s.setup)
    }

    /// Allocate every slot and start the streams, replacing any previous
    /// session. Queued work of the old session drains first.
    pub fn setup(&mut self, setup: DecoderSetup) -> Result<()> {
        setup.validate()?;
        if self.vocab_size == 0 || self.vocab_size_padded < self.vocab_size {
            return Err(DecodeError::InvalidConfig(format!(
                "vocab size {} with padded size {} is not usable",
                self.vocab_size, self.vocab_size_padded
            )));
        }
        let medusa = match (&setup.mode, &setup.medusa_choices) {
            (DecodingMode::Medusa, Some(choices)) => Some(MedusaTree::from_choices(choices)?),
            _ => None,
        };
        let ctx = StepContext {
            vocab_size: self.vocab_size,
            vocab_size_padded: self.vocab_size_padded,
            max_top_k: setup.max_top_k.max(1),
            max_draft_len: setup.max_draft_len(),
            medusa,
        };

        self.session = None;
        let num_streams = setup.stream_count();
        let streams = (0..num_streams)
            .map(DecodeStream::spawn)
            .collect::<Result<Vec<_>>>()?;
        let workspaces = (0..num_streams)
            .map(|_| {
                Arc::new(Mutex::new(Workspace::for_batch(
                    setup.slots_per_stream(),
                    self.vocab_size,
                    ctx.max_top_k,
                    1,
                )))
            })
            .collect();
        let slots = (0..setup.max_batch_size)
            .map(|_| Arc::new(SlotCell::default()))
            .collect();

        tracing::info!(
            mode = ?setup.mode,
            max_batch_size = setup.max_batch_size,
            max_beam_width = setup.max_beam_width,
            max_sequence_length = setup.max_sequence_length,
            max_tokens_per_step = setup.max_tokens_per_step,
            fused = setup.fused_decoder,
            streams = num_streams,
            "decoder set up"
        );
        self.session = Some(Session {
            setup,
            ctx: Arc::new(ctx),
            slots,
            workspaces,
            faulted: Arc::new(AtomicBool::new(false)),
            streams,
        });
        Ok(())
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(DecodeError::NotSetUp)
    }

    /// Admit `request` into `slot`, replacing whatever the slot held.
    ///
    /// Every check runs before the slot is touched.
    pub fn new_request(
        &self,
        slot: usize,
        request: Request,
        config: SamplingConfig,
    ) -> Result<SlotHandle> {
        let session = self.session()?;
        let setup = &session.setup;
        let cell = session.cell(slot)?;
        if let Err(e) = self.check_request(session, &request, &config) {
            tracing::warn!(slot, error = %e, "request rejected");
            return Err(e);
        }
        let (mode, top_k, top_p) = SlotMode::resolve(setup.mode, &config);

        let input_len = request.input_len();
        let buffers = SlotBuffers::new(
            setup.max_beam_width,
            setup.max_sequence_length,
            setup.max_tokens_per_step,
        );
        let data = SlotData::new(
            request,
            config,
            mode,
            top_k,
            top_p,
            buffers,
            self.vocab_size,
            session.ctx.max_top_k,
        );
        if !cell.claim_idle() {
            return Err(DecodeError::SlotBusy { slot });
        }
        let admitted = cell.admit(data);
        cell.release();
        let epoch = admitted?;
        tracing::debug!(slot, epoch, ?mode, input_len, "request admitted");
        Ok(SlotHandle { slot, epoch })
    }

    /// Admit several requests in order; stops at the first rejection, leaving
    /// earlier admissions in place.
    pub fn new_requests(
        &self,
        requests: impl IntoIterator<Item = (usize, Request, SamplingConfig)>,
    ) -> Result<Vec<SlotHandle>> {
        requests
            .into_iter()
            .map(|(slot, request, config)| self.new_request(slot, request, config))
            .collect()
    }

    fn check_request(&self, session: &Session, request: &Request, config: &SamplingConfig) -> Result<()> {
        let setup = &session.setup;
        config.validate(setup.max_top_k.max(1), setup.max_beam_width)?;
        let (mode, _, _) = SlotMode::resolve(setup.mode, config);

        if config.beam_width > 1 && mode != SlotMode::BeamSearch {
            return Err(DecodeError::InvalidConfig(format!(
                "beam width {} needs beam search, slot decodes as {mode:?}",
                config.beam_width
            )));
        }
        if mode == SlotMode::BeamSearch && 2 * config.beam_width > self.vocab_size {
            return Err(DecodeError::InvalidConfig(format!(
                "beam width {} needs a vocabulary of at least {}",
                config.beam_width,
                2 * config.beam_width
            )));
        }
        let input_len = request.input_len();
        if input_len == 0 {
            return Err(DecodeError::InvalidConfig("empty prompt".to_string()));
        }
        if input_len >= setup.max_sequence_length {
            return Err(DecodeError::CapacityExceeded {
                what: "input length",
                requested: input_len,
                capacity: setup.max_sequence_length - 1,
            });
        }
        if request.max_new_tokens == 0 {
            return Err(DecodeError::InvalidConfig(
                "max_new_tokens must be > 0".to_string(),
            ));
        }
        if let Some(bias) = &request.embedding_bias {
            if bias.len() != self.vocab_size {
                return Err(DecodeError::InvalidConfig(format!(
                    "embedding bias has {} entries, vocabulary is {}",
                    bias.len(),
                    self.vocab_size
                )));
            }
        }

        let drafts = request.draft_tokens.len();
        let draft_capacity = match mode {
            SlotMode::ExternalDraft => session.ctx.max_draft_len,
            SlotMode::Medusa => session
                .ctx
                .medusa
                .as_ref()
                .map_or(0, MedusaTree::num_draft_tokens),
            _ if drafts > 0 => {
                return Err(DecodeError::InvalidConfig(format!(
                    "draft tokens given to a {mode:?} slot"
                )))
            }
            _ => 0,
        };
        if drafts > draft_capacity {
            return Err(DecodeError::CapacityExceeded {
                what: "draft tokens",
                requested: drafts,
                capacity: draft_capacity,
            });
        }
        Ok(())
    }

    /// Enqueue one step for every slot that has logits in `input`.
    ///
    /// Returns without waiting on decode work. Finished slots still take part
    /// and report the end token.
    pub fn forward_async(&self, input: DecoderBatchInput) -> Result<DecodeToken> {
        let session = self.session()?;
        if session.faulted.load(Ordering::Acquire) {
            return Err(DecodeError::BatchFaulted);
        }
        let DecoderBatchInput {
            logits,
            mut medusa_logits,
            mut drafts,
        } = input;
        if logits.len() > session.slots.len() {
            return Err(DecodeError::CapacityExceeded {
                what: "batch size",
                requested: logits.len(),
                capacity: session.slots.len(),
            });
        }

        let mut entries = Vec::new();
        for (slot, logits) in logits.into_iter().enumerate() {
            let Some(logits) = logits else { continue };
            if !session.slots[slot].is_occupied() {
                return Err(DecodeError::EmptySlot { slot });
            }
            entries.push((
                slot,
                SlotInput {
                    logits,
                    medusa_logits: medusa_logits.get_mut(slot).and_then(Option::take),
                    drafts: drafts.get_mut(slot).and_then(Option::take),
                },
            ));
        }
        let stepped: Vec<usize> = entries.iter().map(|(slot, _)| *slot).collect();

        let mut groups: Vec<Vec<(usize, SlotInput)>> = Vec::new();
        let mut group_streams = Vec::new();
        if session.setup.fused_decoder {
            if !entries.is_empty() {
                groups.push(entries);
                group_streams.push(0);
            }
        } else {
            for (slot, input) in entries {
                group_streams.push(session.stream_index(slot));
                groups.push(vec![(slot, input)]);
            }
        }

        let mut receivers = Vec::with_capacity(groups.len());
        for (group, stream) in groups.into_iter().zip(group_streams) {
            let job = StepJob::new(session, stream, group);
            let cells = job.cells.clone();
            match session.streams[stream].submit(move || job.run()) {
                Ok(rx) => receivers.push(rx),
                Err(e) => {
                    release(&cells);
                    session.faulted.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        }
        tracing::trace!(slots = stepped.len(), jobs = receivers.len(), "step enqueued");
        Ok(DecodeToken { receivers, stepped })
    }

    /// Wait for a step enqueued by [`forward_async`](Self::forward_async).
    ///
    /// Every job is drained before the first error is returned. This blocks
    /// the calling thread and panics on a tokio runtime thread; async callers
    /// use [`forward_await`](Self::forward_await).
    pub fn forward_sync(&self, token: DecodeToken) -> Result<StepReport> {
        let session = self.session()?;
        let DecodeToken { receivers, stepped } = token;
        let results = receivers
            .into_iter()
            .map(|rx| stream::wait(rx).and_then(|r| r))
            .collect();
        self.complete_step(session, stepped, results)
    }

    /// Async counterpart of [`forward_sync`](Self::forward_sync).
    pub async fn forward_await(&self, token: DecodeToken) -> Result<StepReport> {
        let session = self.session()?;
        let DecodeToken { receivers, stepped } = token;
        let mut results = Vec::with_capacity(receivers.len());
        for rx in receivers {
            results.push(stream::wait_async(rx).await.and_then(|r| r));
        }
        self.complete_step(session, stepped, results)
    }

    fn complete_step(
        &self,
        session: &Session,
        stepped: Vec<usize>,
        results: Vec<Result<Vec<SlotOutcome>>>,
    ) -> Result<StepReport> {
        let mut first_err = None;
        let mut newly_finished = Vec::new();
        for result in results {
            match result {
                Ok(outcomes) => newly_finished.extend(
                    outcomes
                        .into_iter()
                        .filter(|o| o.newly_finished)
                        .map(|o| o.slot),
                ),
                Err(e) => {
                    if e.is_fatal() {
                        session.faulted.store(true, Ordering::Release);
                    }
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        newly_finished.sort_unstable();
        Ok(StepReport {
            stepped,
            newly_finished,
            nb_finished: self.nb_finished()?,
        })
    }

    /// `forward_async` followed by `forward_sync`.
    pub fn forward(&self, input: DecoderBatchInput) -> Result<StepReport> {
        let token = self.forward_async(input)?;
        self.forward_sync(token)
    }

    /// Enqueue the final gather for `handle`'s slot. Beam slots are
    /// backtraced into best-first order; other slots are only marked
    /// finished.
    pub fn finalize(&self, handle: SlotHandle) -> Result<DecodeEvent> {
        let session = self.session()?;
        let cell = session.cell(handle.slot)?;
        cell.check(handle.slot, handle)?;
        cell.claim();
        let rx = session.submit_finalize(handle.slot)?;
        Ok(DecodeEvent {
            receivers: vec![rx],
        })
    }

    /// Finalize every occupied slot.
    pub fn finalize_all(&self) -> Result<DecodeEvent> {
        let session = self.session()?;
        let mut receivers = Vec::new();
        for (slot, cell) in session.slots.iter().enumerate() {
            if !cell.is_occupied() {
                continue;
            }
            cell.claim();
            receivers.push(session.submit_finalize(slot)?);
        }
        Ok(DecodeEvent { receivers })
    }

    /// Finished flags `[batch, max_beam_width]` as `u8`.
    pub fn finished(&self) -> Result<Tensor> {
        let beams = self.session()?.setup.max_beam_width;
        let flags = self.gather(beams, |data, out: &mut [u8]| {
            for (o, f) in out.iter_mut().zip(&data.buffers.finished) {
                *o = f.bits();
            }
        })?;
        self.tensor(flags, &[self.batch()?, beams])
    }

    /// Steps taken per slot since admission.
    pub fn nb_steps(&self) -> Result<Vec<usize>> {
        self.gather(1, |data, out: &mut [usize]| out[0] = data.nb_steps)
    }

    /// Slots whose request reached a terminal state.
    pub fn nb_finished(&self) -> Result<usize> {
        let session = self.session()?;
        let mut count = 0;
        for cell in &session.slots {
            if cell.lock()?.is_finished() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Output ids `[max_beam_width, max_sequence_length]` of one slot.
    pub fn output_ids(&self, handle: SlotHandle) -> Result<Tensor> {
        let session = self.session()?;
        let cell = session.cell(handle.slot)?;
        cell.check(handle.slot, handle)?;
        let guard = cell.lock()?;
        let data = guard.data().ok_or(DecodeError::EmptySlot { slot: handle.slot })?;
        let b = &data.buffers;
        self.tensor(b.output_ids.clone(), &[b.max_beam_width, b.max_seq_len])
    }

    /// Output ids `[batch, max_beam_width, max_sequence_length]`.
    pub fn output_ids_all(&self) -> Result<Tensor> {
        let (beams, len) = self.row_dims()?;
        let ids = self.gather(beams * len, |data, out: &mut [u32]| {
            out.copy_from_slice(&data.buffers.output_ids)
        })?;
        self.tensor(ids, &[self.batch()?, beams, len])
    }

    /// Beam parent ids `[batch, max_beam_width, max_sequence_length]`.
    pub fn parent_ids(&self) -> Result<Tensor> {
        let (beams, len) = self.row_dims()?;
        let ids = self.gather(beams * len, |data, out: &mut [u32]| {
            out.copy_from_slice(&data.buffers.parent_ids)
        })?;
        self.tensor(ids, &[self.batch()?, beams, len])
    }

    /// `[batch, max_beam_width]`.
    pub fn cum_log_probs(&self) -> Result<Tensor> {
        let (beams, _) = self.row_dims()?;
        let values = self.gather(beams, |data, out: &mut [f32]| {
            out.copy_from_slice(&data.buffers.cum_log_probs)
        })?;
        self.tensor(values, &[self.batch()?, beams])
    }

    /// Per-token log-probs `[batch, max_beam_width, max_sequence_length]`.
    pub fn log_probs(&self) -> Result<Tensor> {
        let (beams, len) = self.row_dims()?;
        let values = self.gather(beams * len, |data, out: &mut [f32]| {
            out.copy_from_slice(&data.buffers.log_probs)
        })?;
        self.tensor(values, &[self.batch()?, beams, len])
    }

    /// Tokens written by the last step `[max_tokens_per_step, batch, max_beam_width]`.
    pub fn all_new_tokens(&self) -> Result<Tensor> {
        let session = self.session()?;
        let steps = session.setup.max_tokens_per_step;
        let beams = session.setup.max_beam_width;
        let batch = session.slots.len();
        let per_slot = self.gather(steps * beams, |data, out: &mut [u32]| {
            out.copy_from_slice(&data.buffers.new_tokens)
        })?;
        let mut tokens = vec![0u32; steps * batch * beams];
        for slot in 0..batch {
            for step in 0..steps {
                let src = (slot * steps + step) * beams;
                let dst = (step * batch + slot) * beams;
                tokens[dst..dst + beams].copy_from_slice(&per_slot[src..src + beams]);
            }
        }
        self.tensor(tokens, &[steps, batch, beams])
    }

    /// Tokens written at position `iter` of the last step `[batch, max_beam_width]`.
    pub fn new_tokens(&self, iter: usize) -> Result<Tensor> {
        let session = self.session()?;
        let steps = session.setup.max_tokens_per_step;
        if iter >= steps {
            return Err(DecodeError::CapacityExceeded {
                what: "new token index",
                requested: iter,
                capacity: steps,
            });
        }
        let beams = session.setup.max_beam_width;
        let tokens = self.gather(beams, |data, out: &mut [u32]| {
            out.copy_from_slice(&data.buffers.new_tokens[iter * beams..(iter + 1) * beams])
        })?;
        self.tensor(tokens, &[session.slots.len(), beams])
    }

    /// `[batch, max_beam_width]` as `u32`.
    pub fn sequence_lengths(&self) -> Result<Tensor> {
        let (beams, _) = self.row_dims()?;
        let lens = self.gather(beams, |data, out: &mut [u32]| {
            for (o, &l) in out.iter_mut().zip(&data.buffers.seq_lens) {
                *o = l as u32;
            }
        })?;
        self.tensor(lens, &[self.batch()?, beams])
    }

    /// Drafts proposed for the next step `[batch, max_draft_len]`, zero padded.
    pub fn next_draft_tokens(&self) -> Result<Tensor> {
        let width = self.session()?.ctx.max_draft_len;
        let tokens = self.gather(width, |data, out: &mut [u32]| {
            for (o, &t) in out.iter_mut().zip(&data.buffers.next_draft_tokens) {
                *o = t;
            }
        })?;
        self.tensor(tokens, &[self.batch()?, width])
    }

    /// Exclusive prefix sum of accepted draft lengths `[batch + 1]`.
    pub fn accepted_lengths_cumsum(&self) -> Result<Tensor> {
        let lengths = self.gather(1, |data, out: &mut [usize]| out[0] = data.buffers.accepted_len)?;
        let cumsum: Vec<u32> = exclusive_cumsum(&lengths).into_iter().map(|v| v as u32).collect();
        let len = cumsum.len();
        self.tensor(cumsum, &[len])
    }

    /// Accepted draft offsets of every slot, packed in slot order.
    pub fn accepted_packed_paths(&self) -> Result<Tensor> {
        let session = self.session()?;
        let mut packed = Vec::new();
        for cell in &session.slots {
            if let Some(data) = cell.lock()?.data() {
                packed.extend(data.buffers.accepted_path.iter().map(|&p| p as u32));
            }
        }
        let len = packed.len();
        self.tensor(packed, &[len])
    }

    pub fn slot_stats(&self, handle: SlotHandle) -> Result<SlotStats> {
        let session = self.session()?;
        let cell = session.cell(handle.slot)?;
        cell.check(handle.slot, handle)?;
        let guard = cell.lock()?;
        let data = guard.data().ok_or(DecodeError::EmptySlot { slot: handle.slot })?;
        Ok(data.stats.clone())
    }

    fn batch(&self) -> Result<usize> {
        Ok(self.session()?.slots.len())
    }

    fn row_dims(&self) -> Result<(usize, usize)> {
        let setup = &self.session()?.setup;
        Ok((setup.max_beam_width, setup.max_sequence_length))
    }

    /// Concatenate `width` values per slot; empty slots read as zeros.
    fn gather<T: Copy + Default>(
        &self,
        width: usize,
        fill: impl Fn(&SlotData, &mut [T]),
    ) -> Result<Vec<T>> {
        let session = self.session()?;
        let mut out = vec![T::default(); session.slots.len() * width];
        if width == 0 {
            return Ok(out);
        }
        for (cell, chunk) in session.slots.iter().zip(out.chunks_mut(width)) {
            if let Some(data) = cell.lock()?.data() {
                fill(data, chunk);
            }
        }
        Ok(out)
    }

    fn tensor<T: candle_core::WithDType>(&self, values: Vec<T>, shape: &[usize]) -> Result<Tensor> {
        Ok(Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(&self.device)?)
    }
}

impl std::fmt::Debug for DecoderBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderBatch")
            .field("vocab_size", &self.vocab_size)
            .field("vocab_size_padded", &self.vocab_size_padded)
            .field("setup", &self.decoder_setup())
            .finish()
    }
}

/// One enqueued step over a group of slots.
struct StepJob {
    ctx: Arc<StepContext>,
    workspace: Arc<Mutex<Workspace>>,
    faulted: Arc<AtomicBool>,
    cells: Vec<(usize, Arc<SlotCell>)>,
    inputs: Vec<SlotInput>,
}

impl StepJob {
    /// Claim the slots of `group`; they stay busy until the job has run.
    /// Claiming never waits on a step that is already running.
    fn new(session: &Session, stream: usize, group: Vec<(usize, SlotInput)>) -> Self {
        let mut cells = Vec::with_capacity(group.len());
        let mut inputs = Vec::with_capacity(group.len());
        for (slot, input) in group {
            let cell = Arc::clone(&session.slots[slot]);
            cell.claim();
            cells.push((slot, cell));
            inputs.push(input);
        }
        Self {
            ctx: Arc::clone(&session.ctx),
            workspace: Arc::clone(&session.workspaces[stream]),
            faulted: Arc::clone(&session.faulted),
            cells,
            inputs,
        }
    }

    fn run(mut self) -> Result<Vec<SlotOutcome>> {
        let inputs = std::mem::take(&mut self.inputs);
        let result = self.step(inputs);
        release(&self.cells);
        if let Err(e) = &result {
            if e.is_fatal() && !self.faulted.swap(true, Ordering::AcqRel) {
                tracing::error!(error = %e, "decode step faulted, batch aborted");
            }
        }
        result
    }

    fn step(&self, inputs: Vec<SlotInput>) -> Result<Vec<SlotOutcome>> {
        if self.faulted.load(Ordering::Acquire) {
            return Err(DecodeError::BatchFaulted);
        }
        let mut guards = self
            .cells
            .iter()
            .map(|(_, cell)| cell.lock())
            .collect::<Result<Vec<_>>>()?;
        let mut work = Vec::with_capacity(guards.len());
        for ((&(slot, _), guard), input) in self.cells.iter().zip(guards.iter_mut()).zip(inputs) {
            let data = guard.data_mut().ok_or(DecodeError::EmptySlot { slot })?;
            work.push(SlotWork { slot, data, input });
        }
        let outcomes = {
            let mut workspace = self
                .workspace
                .lock()
                .map_err(|_| DecodeError::Device("workspace poisoned by a panicked job".to_string()))?;
            run_step(&self.ctx, &mut workspace, &mut work)?
        };
        drop(work);
        for guard in guards.iter_mut() {
            if guard.data().is_some_and(SlotData::is_finished) {
                guard.finish();
            }
        }
        Ok(outcomes)
    }
}

fn finalize_slot(cell: &SlotCell, slot: usize) -> Result<()> {
    let mut state = cell.lock()?;
    let data = state.data_mut().ok_or(DecodeError::EmptySlot { slot })?;
    data.finalize();
    data.stats.finished = data.finished_state();
    state.finish();
    Ok(())
}

/// Drop one unit of pending work from each slot.
fn release(cells: &[(usize, Arc<SlotCell>)]) {
    for (_, cell) in cells {
        cell.release();
    }
}
