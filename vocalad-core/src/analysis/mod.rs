//! Per-frame acoustic feature extraction.
//!
//! `FeatureExtractor::analyze` is a pure function of the frame apart from its
//! reusable FFT scratch. It never fails: frames with non-finite samples yield
//! [`AcousticMetrics::zeroed`].
//!
//! Pitch and spectral analysis use a fixed window (2048 by default). Shorter
//! frames are zero-padded; longer frames are truncated to the window and the
//! discarded tail contributes only to RMS/ZCR/VAD, never to pitch.

pub mod pitch;
pub mod spectral;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    buffering::frame::AudioFrame,
    vad::{rms, zero_crossing_rate, ThresholdVad},
};

pub use pitch::{PitchDetector, PitchEstimate};
pub use spectral::{SpectralAnalyzer, SpectralFeatures, N_MFCC};

/// Metrics computed for one captured frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcousticMetrics {
    /// Fundamental frequency, present only for a confident in-band estimate.
    pub pitch_hz: Option<f32>,
    /// Clarity of `pitch_hz`; 0 when no pitch is reported.
    pub pitch_confidence: f32,
    pub rms: f32,
    /// RMS × 100.
    pub loudness: f32,
    pub zcr: f32,
    pub spectral_centroid: f32,
    pub spectral_flatness: f32,
    pub mfcc: [f32; N_MFCC],
    pub is_speech: bool,
}

impl AcousticMetrics {
    /// Record reported for frames that cannot be analysed.
    pub fn zeroed() -> Self {
        Self {
            pitch_hz: None,
            pitch_confidence: 0.0,
            rms: 0.0,
            loudness: 0.0,
            zcr: 0.0,
            spectral_centroid: 0.0,
            spectral_flatness: 0.0,
            mfcc: [0.0; N_MFCC],
            is_speech: false,
        }
    }
}

/// Tunables for [`FeatureExtractor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisSettings {
    /// Pitch/spectral analysis window in samples.
    pub window: usize,
    pub pitch_min_hz: f32,
    pub pitch_max_hz: f32,
    /// Minimum clarity for a pitch to be reported.
    pub clarity_threshold: f32,
    pub vad: ThresholdVad,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            window: 2048,
            pitch_min_hz: 60.0,
            pitch_max_hz: 500.0,
            clarity_threshold: 0.9,
            vad: ThresholdVad::default(),
        }
    }
}

/// Frame → [`AcousticMetrics`] transform.
pub struct FeatureExtractor {
    settings: AnalysisSettings,
    pitch: PitchDetector,
    spectral: SpectralAnalyzer,
    scratch: Vec<f32>,
}

impl FeatureExtractor {
    pub fn new(settings: AnalysisSettings, sample_rate: u32) -> Self {
        let window = settings.window.max(4);
        Self {
            settings,
            pitch: PitchDetector::new(window),
            spectral: SpectralAnalyzer::new(window, sample_rate),
            scratch: vec![0.0; window],
        }
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    pub fn analyze(&mut self, frame: &AudioFrame) -> AcousticMetrics {
        if frame.is_empty() || !frame.is_finite() || frame.sample_rate == 0 {
            debug!(seq = frame.seq, "frame rejected by analyzer");
            return AcousticMetrics::zeroed();
        }

        let rms = rms(&frame.samples);
        let zcr = zero_crossing_rate(&frame.samples);
        let is_speech = self.settings.vad.decide(rms, zcr).is_speech();

        let window = self.scratch.len();
        let take = frame.len().min(window);
        self.scratch[..take].copy_from_slice(&frame.samples[..take]);
        self.scratch[take..].fill(0.0);

        let (pitch_hz, pitch_confidence) = match self.pitch.detect(&self.scratch, frame.sample_rate)
        {
            Some(est)
                if est.clarity >= self.settings.clarity_threshold
                    && est.frequency_hz >= self.settings.pitch_min_hz
                    && est.frequency_hz <= self.settings.pitch_max_hz =>
            {
                (Some(est.frequency_hz), est.clarity)
            }
            _ => (None, 0.0),
        };

        if self.spectral.sample_rate() != frame.sample_rate {
            self.spectral = SpectralAnalyzer::new(window, frame.sample_rate);
        }
        let spectral = self.spectral.analyze(&self.scratch);

        AcousticMetrics {
            pitch_hz,
            pitch_confidence,
            rms,
            loudness: rms * 100.0,
            zcr,
            spectral_centroid: spectral.centroid_hz,
            spectral_flatness: spectral.flatness,
            mfcc: spectral.mfcc,
            is_speech,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tone(freq: f32, amp: f32, len: usize) -> AudioFrame {
        let samples = (0..len)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / 16_000.0).sin())
            .collect();
        AudioFrame::new(0, samples, 16_000)
    }

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(AnalysisSettings::default(), 16_000)
    }

    #[test]
    fn voiced_tone_reports_pitch_and_speech() {
        let m = extractor().analyze(&tone(150.0, 0.4, 2048));
        let pitch = m.pitch_hz.unwrap();
        assert!((pitch - 150.0).abs() < 2.0);
        assert!(m.pitch_confidence >= 0.9);
        assert!(m.is_speech);
        assert_relative_eq!(m.loudness, m.rms * 100.0, epsilon = 1e-4);
    }

    #[test]
    fn out_of_band_tone_has_no_pitch() {
        let m = extractor().analyze(&tone(1_200.0, 0.4, 2048));
        assert_eq!(m.pitch_hz, None);
        assert_eq!(m.pitch_confidence, 0.0);
        assert!(m.is_speech);
    }

    #[test]
    fn silence_is_quiet_and_unpitched() {
        let m = extractor().analyze(&AudioFrame::silence(0, 2048, 16_000));
        assert_eq!(m.rms, 0.0);
        assert_eq!(m.pitch_hz, None);
        assert!(!m.is_speech);
    }

    #[test]
    fn non_finite_frame_yields_zeroed_metrics() {
        let mut samples = vec![0.3; 2048];
        samples[100] = f32::INFINITY;
        let m = extractor().analyze(&AudioFrame::new(7, samples, 16_000));
        assert_eq!(m, AcousticMetrics::zeroed());
    }

    #[test]
    fn short_frame_is_zero_padded() {
        let m = extractor().analyze(&tone(200.0, 0.4, 1024));
        assert!(m.rms > 0.0);
        assert!(m.pitch_hz.map_or(true, |p| (60.0..=500.0).contains(&p)));
    }

    #[test]
    fn long_frame_is_truncated_for_pitch() {
        let m = extractor().analyze(&tone(200.0, 0.4, 4096));
        let pitch = m.pitch_hz.unwrap();
        assert!((pitch - 200.0).abs() < 2.0);
    }

    #[test]
    fn metrics_serialize_camel_case() {
        let json = serde_json::to_value(AcousticMetrics::zeroed()).unwrap();
        assert!(json.get("pitchConfidence").is_some());
        assert!(json.get("isSpeech").is_some());
        assert!(json["pitchHz"].is_null());
    }
}
