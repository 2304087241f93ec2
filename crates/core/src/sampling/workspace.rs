//! Caller-sized scratch memory for the selection kernels.
//!
//! Sizes are pure functions of the batch shape so the decoder can allocate
//! once at setup. Kernels check the size before touching any row.

use crate::error::{DecodeError, Result};

/// Vocabulary partitions reduced independently in top-k stage 1.
pub const VOCAB_CHUNKS_PER_ROW: usize = 8;

pub(crate) fn chunks_for_vocab(vocab_size: usize) -> usize {
    VOCAB_CHUNKS_PER_ROW.min(vocab_size.max(1))
}

/// Entries needed by `batch_top_k_sampling`: one partial top-k list per
/// vocabulary chunk per row.
pub fn top_k_workspace_size(batch_size: usize, vocab_size: usize, max_top_k: usize) -> usize {
    batch_size * chunks_for_vocab(vocab_size) * max_top_k
}

/// Entries needed by `batch_top_p_sampling`: a sorted copy of every row.
pub fn top_p_workspace_size(batch_size: usize, vocab_size: usize) -> usize {
    batch_size * vocab_size
}

/// Entries needed by one beam-search step: `2 * beam_width` candidates per beam.
pub fn beam_workspace_size(batch_size: usize, beam_width: usize) -> usize {
    batch_size * beam_width * 2 * beam_width
}

/// Paired id/value scratch buffers.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    ids: Vec<u32>,
    vals: Vec<f32>,
}

impl Workspace {
    pub fn new(entries: usize) -> Self {
        Self {
            ids: vec![0; entries],
            vals: vec![0.0; entries],
        }
    }

    /// Large enough for any kernel over `batch_size` rows.
    pub fn for_batch(
        batch_size: usize,
        vocab_size: usize,
        max_top_k: usize,
        max_beam_width: usize,
    ) -> Self {
        let entries = top_k_workspace_size(batch_size, vocab_size, max_top_k)
            .max(top_p_workspace_size(batch_size, vocab_size))
            .max(beam_workspace_size(batch_size, max_beam_width));
        Self::new(entries)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn check(&self, required: usize) -> Result<()> {
        if self.len() < required {
            return Err(DecodeError::WorkspaceTooSmall {
                required,
                available: self.len(),
            });
        }
        Ok(())
    }

    /// Borrow the first `required` entries of both buffers.
    pub fn take(&mut self, required: usize) -> Result<(&mut [u32], &mut [f32])> {
        self.check(required)?;
        Ok((&mut self.ids[..required], &mut self.vals[..required]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_scale_with_batch() {
        assert_eq!(top_k_workspace_size(2, 32_000, 4), 2 * 8 * 4);
        assert_eq!(top_k_workspace_size(1, 4, 4), 4 * 4);
        assert_eq!(top_p_workspace_size(3, 100), 300);
        assert_eq!(beam_workspace_size(2, 4), 64);
    }

    #[test]
    fn for_batch_covers_every_kernel() {
        let ws = Workspace::for_batch(4, 50, 16, 3);
        ws.check(top_k_workspace_size(4, 50, 16)).unwrap();
        ws.check(top_p_workspace_size(4, 50)).unwrap();
        ws.check(beam_workspace_size(4, 3)).unwrap();
    }

    #[test]
    fn undersized_workspace_is_rejected() {
        let mut ws = Workspace::new(10);
        let err = ws.take(11).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::WorkspaceTooSmall {
                required: 11,
                available: 10
            }
        ));
        let (ids, vals) = ws.take(10).unwrap();
        assert_eq!(ids.len(), 10);
        assert_eq!(vals.len(), 10);
    }
}
