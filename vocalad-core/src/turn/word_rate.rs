//! Word-count and words-per-minute estimation.
//!
//! Two strategies are chosen at startup:
//!
//! - `Energy`: gate the turn audio in short frames, take the speech share of
//!   the audio duration and multiply by an average speaking rate.
//! - `Phoneme`: run a [`PhonemeRecognizer`] and count non-silence runs. If the
//!   recognizer errors, the energy estimate is used for that turn.
//!
//! Neither strategy transcribes. Only `EstimateSource::PhonemeModel` comes
//! from a real model.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    inference::{count_words, ModelHandle},
    vad::rms,
};

/// Where a word count came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EstimateSource {
    EnergyHeuristic,
    PhonemeModel,
    PhonemeStub,
}

/// Constants of the energy heuristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyGate {
    /// Average words per second of active speech.
    pub words_per_second: f64,
    /// Gating frame length in samples.
    pub frame_len: usize,
    /// RMS a gating frame must exceed to count as speech.
    pub rms_threshold: f32,
}

impl Default for EnergyGate {
    fn default() -> Self {
        Self {
            words_per_second: 2.5,
            frame_len: 512,
            rms_threshold: 0.02,
        }
    }
}

impl EnergyGate {
    /// Seconds of `samples` judged to be speech.
    pub fn speech_secs(&self, samples: &[f32], sample_rate: u32) -> f64 {
        if samples.is_empty() || sample_rate == 0 {
            return 0.0;
        }
        let frame_len = self.frame_len.max(1);
        let total = samples.len().div_ceil(frame_len);
        let voiced = samples
            .chunks(frame_len)
            .filter(|f| rms(f) > self.rms_threshold)
            .count();
        let total_secs = samples.len() as f64 / sample_rate as f64;
        total_secs * voiced as f64 / total as f64
    }

    pub fn estimate_words(&self, samples: &[f32], sample_rate: u32) -> u32 {
        let words = (self.speech_secs(samples, sample_rate) * self.words_per_second).round();
        words.max(0.0) as u32
    }
}

/// `words / (duration / 60)`, or 0 for a zero-length turn.
pub fn words_per_minute(words: u32, duration_secs: f64) -> f64 {
    if duration_secs <= 0.0 {
        return 0.0;
    }
    words as f64 / (duration_secs / 60.0)
}

/// Result of one word-rate estimation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WordRate {
    pub word_count: u32,
    pub source: EstimateSource,
}

/// Capability-typed word-rate strategy.
#[derive(Debug, Clone)]
pub enum WordRateStrategy {
    Energy(EnergyGate),
    Phoneme {
        model: ModelHandle,
        fallback: EnergyGate,
    },
}

impl Default for WordRateStrategy {
    fn default() -> Self {
        WordRateStrategy::Energy(EnergyGate::default())
    }
}

impl WordRateStrategy {
    pub fn estimate(&self, samples: &[f32], sample_rate: u32) -> WordRate {
        match self {
            WordRateStrategy::Energy(gate) => WordRate {
                word_count: gate.estimate_words(samples, sample_rate),
                source: EstimateSource::EnergyHeuristic,
            },
            WordRateStrategy::Phoneme { model, fallback } => {
                let mut recognizer = model.0.lock();
                match recognizer.recognize(samples, sample_rate) {
                    Ok(phonemes) => WordRate {
                        word_count: count_words(&phonemes),
                        source: if recognizer.is_model_backed() {
                            EstimateSource::PhonemeModel
                        } else {
                            EstimateSource::PhonemeStub
                        },
                    },
                    Err(e) => {
                        warn!("phoneme recognition failed, using energy estimate: {e}");
                        WordRate {
                            word_count: fallback.estimate_words(samples, sample_rate),
                            source: EstimateSource::EnergyHeuristic,
                        }
                    }
                }
            }
        }
    }

    /// Reset recognizer state at a turn boundary.
    pub fn reset(&self) {
        if let WordRateStrategy::Phoneme { model, .. } = self {
            model.0.lock().reset();
        }
    }

    /// `true` when word counts come from a real model.
    pub fn is_model_backed(&self) -> bool {
        match self {
            WordRateStrategy::Energy(_) => false,
            WordRateStrategy::Phoneme { model, .. } => model.0.lock().is_model_backed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{Result, VocaladError},
        inference::{PhonemeAlignment, PhonemeRecognizer, StubRecognizer},
    };
    use approx::assert_relative_eq;

    struct Broken;

    impl PhonemeRecognizer for Broken {
        fn warm_up(&mut self) -> Result<()> {
            Ok(())
        }
        fn recognize(&mut self, _: &[f32], _: u32) -> Result<Vec<PhonemeAlignment>> {
            Err(VocaladError::Inference("no weights".into()))
        }
        fn is_model_backed(&self) -> bool {
            true
        }
        fn reset(&mut self) {}
    }

    #[test]
    fn wpm_is_zero_for_zero_duration() {
        assert_eq!(words_per_minute(5, 0.0), 0.0);
        assert_relative_eq!(words_per_minute(5, 2.0), 150.0);
    }

    #[test]
    fn energy_gate_counts_only_loud_frames() {
        let gate = EnergyGate::default();
        // 1 s speech + 1 s silence at 16 kHz.
        let mut samples = vec![0.1f32; 16_000];
        samples.extend(vec![0.0; 16_000]);
        let secs = gate.speech_secs(&samples, 16_000);
        assert!((secs - 1.0).abs() < 0.05, "{secs}");
        assert_eq!(gate.estimate_words(&samples, 16_000), 3);
    }

    #[test]
    fn silence_estimates_zero_words() {
        let strategy = WordRateStrategy::default();
        let rate = strategy.estimate(&[0.0; 32_000], 16_000);
        assert_eq!(rate.word_count, 0);
        assert_eq!(rate.source, EstimateSource::EnergyHeuristic);
    }

    #[test]
    fn stub_output_is_tagged_as_stub() {
        let strategy = WordRateStrategy::Phoneme {
            model: ModelHandle::new(StubRecognizer::default()),
            fallback: EnergyGate::default(),
        };
        let mut samples = vec![0.3f32; 3200];
        samples.extend(vec![0.0; 1600]);
        samples.extend(vec![0.3; 3200]);
        let rate = strategy.estimate(&samples, 16_000);
        assert_eq!(rate.word_count, 2);
        assert_eq!(rate.source, EstimateSource::PhonemeStub);
        assert!(!strategy.is_model_backed());
    }

    #[test]
    fn recognizer_failure_falls_back_to_energy() {
        let strategy = WordRateStrategy::Phoneme {
            model: ModelHandle::new(Broken),
            fallback: EnergyGate::default(),
        };
        let rate = strategy.estimate(&[0.1; 16_000], 16_000);
        assert_eq!(rate.source, EstimateSource::EnergyHeuristic);
        assert_eq!(rate.word_count, 3);
    }
}
