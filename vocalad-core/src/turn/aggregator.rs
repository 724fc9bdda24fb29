//! Per-turn accumulation of frame metrics and raw audio.

use serde::{Deserialize, Serialize};

use super::word_rate::{words_per_minute, EstimateSource, WordRateStrategy};
use crate::{
    analysis::{AcousticMetrics, N_MFCC},
    buffering::frame::AudioFrame,
};

/// Aggregated description of one user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSummary {
    /// Mean pitch over voice-active frames that had one.
    pub avg_pitch_hz: Option<f32>,
    pub avg_pitch_confidence: f32,
    pub avg_rms: f32,
    pub avg_loudness: f32,
    pub avg_zcr: f32,
    pub avg_spectral_centroid: f32,
    pub avg_spectral_flatness: f32,
    pub avg_mfcc: [f32; N_MFCC],
    pub word_count: u32,
    pub words_per_minute: f64,
    pub duration_secs: f64,
    pub speech_frames: usize,
    pub total_frames: usize,
    pub estimate_source: EstimateSource,
}

/// Collects metrics and samples until the turn ends.
///
/// The sample buffer is unbounded: a turn lasts until it is ended.
#[derive(Debug)]
pub struct TurnAggregator {
    metrics: Vec<AcousticMetrics>,
    samples: Vec<f32>,
    sample_rate: u32,
}

impl TurnAggregator {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            metrics: Vec::new(),
            samples: Vec::new(),
            sample_rate,
        }
    }

    pub fn push(&mut self, metrics: AcousticMetrics) {
        self.metrics.push(metrics);
    }

    pub fn push_samples(&mut self, frame: &AudioFrame) {
        if frame.sample_rate != self.sample_rate {
            tracing::warn!(
                seq = frame.seq,
                frame_rate = frame.sample_rate,
                turn_rate = self.sample_rate,
                "frame rate differs from turn rate"
            );
        }
        self.samples.extend_from_slice(&frame.samples);
    }

    /// Seconds of audio captured so far this turn.
    pub fn captured_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn frame_count(&self) -> usize {
        self.metrics.len()
    }

    /// Build the summary for a turn of `duration_secs`. State is kept until
    /// [`reset`](Self::reset).
    pub fn finalize(&self, duration_secs: f64, strategy: &WordRateStrategy) -> TurnSummary {
        let duration_secs = duration_secs.max(0.0);
        let speech: Vec<&AcousticMetrics> = self.metrics.iter().filter(|m| m.is_speech).collect();

        if speech.is_empty() {
            return TurnSummary {
                avg_pitch_hz: None,
                avg_pitch_confidence: 0.0,
                avg_rms: 0.0,
                avg_loudness: 0.0,
                avg_zcr: 0.0,
                avg_spectral_centroid: 0.0,
                avg_spectral_flatness: 0.0,
                avg_mfcc: [0.0; N_MFCC],
                word_count: 0,
                words_per_minute: 0.0,
                duration_secs,
                speech_frames: 0,
                total_frames: self.metrics.len(),
                estimate_source: EstimateSource::EnergyHeuristic,
            };
        }

        let mean = |f: fn(&AcousticMetrics) -> f32| -> f32 {
            speech.iter().map(|m| f(m)).sum::<f32>() / speech.len() as f32
        };

        let pitched: Vec<f32> = speech.iter().filter_map(|m| m.pitch_hz).collect();
        let avg_pitch_hz =
            (!pitched.is_empty()).then(|| pitched.iter().sum::<f32>() / pitched.len() as f32);

        let mut avg_mfcc = [0f32; N_MFCC];
        for m in &speech {
            for (acc, v) in avg_mfcc.iter_mut().zip(m.mfcc.iter()) {
                *acc += v / speech.len() as f32;
            }
        }

        let rate = strategy.estimate(&self.samples, self.sample_rate);

        TurnSummary {
            avg_pitch_hz,
            avg_pitch_confidence: mean(|m| m.pitch_confidence),
            avg_rms: mean(|m| m.rms),
            avg_loudness: mean(|m| m.loudness),
            avg_zcr: mean(|m| m.zcr),
            avg_spectral_centroid: mean(|m| m.spectral_centroid),
            avg_spectral_flatness: mean(|m| m.spectral_flatness),
            avg_mfcc,
            word_count: rate.word_count,
            words_per_minute: words_per_minute(rate.word_count, duration_secs),
            duration_secs,
            speech_frames: speech.len(),
            total_frames: self.metrics.len(),
            estimate_source: rate.source,
        }
    }

    /// Drop all accumulated metrics and audio.
    pub fn reset(&mut self) {
        self.metrics.clear();
        self.samples.clear();
    }
}
