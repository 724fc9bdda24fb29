//! Energy + zero-crossing VAD.
//!
//! ## Algorithm
//!
//! 1. Compute RMS and zero-crossing rate of the frame.
//! 2. If RMS > `rms_threshold` → `Speech` (vowel-like, voiced).
//! 3. If ZCR > `zcr_threshold` and RMS > `rms_threshold / 2` → `Speech`
//!    (consonant-like, unvoiced).
//! 4. Otherwise → `Silence`.

use super::VadDecision;

/// Root-mean-square of a sample slice. Empty input is 0.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Sign changes per sample. Zero counts as positive.
pub fn zero_crossing_rate(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    crossings as f32 / samples.len() as f32
}

/// Stateless two-feature voice activity rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdVad {
    /// RMS level above which a frame is voiced speech. Default `0.02`.
    pub rms_threshold: f32,
    /// ZCR above which a moderately loud frame is unvoiced speech. Default `0.1`.
    pub zcr_threshold: f32,
}

impl ThresholdVad {
    pub fn new(rms_threshold: f32, zcr_threshold: f32) -> Self {
        Self {
            rms_threshold,
            zcr_threshold,
        }
    }

    /// Classify from precomputed features.
    pub fn decide(&self, rms: f32, zcr: f32) -> VadDecision {
        if rms > self.rms_threshold || (zcr > self.zcr_threshold && rms > self.rms_threshold * 0.5)
        {
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }

    pub fn classify(&self, samples: &[f32]) -> VadDecision {
        self.decide(rms(samples), zero_crossing_rate(samples))
    }
}

impl Default for ThresholdVad {
    fn default() -> Self {
        Self::new(0.02, 0.1)
    }
}
