//! Voice Activity Detection (VAD).
//!
//! The decision is made per frame from two cheap time-domain features, so it
//! can run inside the capture dispatch without any lookahead or hangover.

pub mod energy;

pub use energy::{rms, zero_crossing_rate, ThresholdVad};

/// Whether a given audio frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// Voiced (high energy) or unvoiced (high ZCR, moderate energy) speech.
    Speech,
    /// Below both thresholds.
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}
