//! Bit-packed per-beam finished status.

use serde::{Deserialize, Serialize};

/// Why (and whether) a beam stopped generating.
///
/// Bits only ever get set while a slot is bound to a request; the state is
/// cleared when the slot is reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinishedState(u8);

impl FinishedState {
    pub const EOS: u8 = 1 << 0;
    pub const STOP_WORDS: u8 = 1 << 1;
    pub const MAX_LENGTH: u8 = 1 << 2;
    /// Row is present in the batch but must not be decoded this step.
    pub const SKIP_DECODING: u8 = 1 << 3;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn finished_eos() -> Self {
        Self(Self::EOS)
    }

    pub fn finished_stop_words() -> Self {
        Self(Self::STOP_WORDS)
    }

    pub fn finished_max_length() -> Self {
        Self(Self::MAX_LENGTH)
    }

    pub fn skip_decoding() -> Self {
        Self(Self::SKIP_DECODING)
    }

    pub fn set_finished_eos(&mut self) {
        self.0 |= Self::EOS;
    }

    pub fn set_finished_stop_words(&mut self) {
        self.0 |= Self::STOP_WORDS;
    }

    pub fn set_finished_max_length(&mut self) {
        self.0 |= Self::MAX_LENGTH;
    }

    pub fn set_skip_decoding(&mut self) {
        self.0 |= Self::SKIP_DECODING;
    }

    pub fn is_finished_eos(self) -> bool {
        self.0 & Self::EOS != 0
    }

    pub fn is_finished_stop_words(self) -> bool {
        self.0 & Self::STOP_WORDS != 0
    }

    pub fn is_finished_max_length(self) -> bool {
        self.0 & Self::MAX_LENGTH != 0
    }

    pub fn is_skip_decoding(self) -> bool {
        self.0 & Self::SKIP_DECODING != 0
    }

    /// Finished for any reason.
    pub fn is_finished(self) -> bool {
        self.0 & (Self::EOS | Self::STOP_WORDS | Self::MAX_LENGTH) != 0
    }

    /// Excluded from decoding this step, either finished or skipped.
    pub fn is_inactive(self) -> bool {
        self.0 != 0
    }
}
