//! Session configuration (JSON file, environment overrides).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    analysis::AnalysisSettings,
    audio::CaptureSettings,
    error::{Result, VocaladError},
    inference::{ModelHandle, StubRecognizer},
    turn::{ChannelErrorPolicy, EnergyGate, WordRateStrategy},
    vad::ThresholdVad,
};

/// Longest capture cadence allowed, in seconds.
pub const MAX_FRAME_CADENCE_SECS: f64 = 0.150;

/// Which playback strategy the session builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStrategy {
    #[default]
    Timeline,
    Sequential,
}

impl PlaybackStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "timeline" | "scheduled" => Some(PlaybackStrategy::Timeline),
            "sequential" | "stream" => Some(PlaybackStrategy::Sequential),
            _ => None,
        }
    }
}

/// Which word-rate estimator the session builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WordRateKind {
    #[default]
    Energy,
    PhonemeStub,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SessionConfig {
    pub capture_sample_rate: u32,
    pub frame_len: usize,
    /// Rate the remote session declares for its audio.
    pub inbound_sample_rate: u32,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub vad_rms_threshold: f32,
    pub vad_zcr_threshold: f32,
    pub pitch_window: usize,
    pub pitch_min_hz: f32,
    pub pitch_max_hz: f32,
    pub pitch_clarity_threshold: f32,
    pub stabilization_ms: u32,
    pub playback: PlaybackStrategy,
    pub word_rate: WordRateKind,
    pub words_per_second: f64,
    pub word_gate_frame_len: usize,
    pub word_gate_rms: f32,
    pub channel_error_policy: ChannelErrorPolicy,
    pub annotation_prefix: String,
    /// Multiplier from RMS to meter level.
    pub meter_gain: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16_000,
            frame_len: 2048,
            inbound_sample_rate: 24_000,
            preferred_input_device: None,
            preferred_output_device: None,
            vad_rms_threshold: 0.02,
            vad_zcr_threshold: 0.1,
            pitch_window: 2048,
            pitch_min_hz: 60.0,
            pitch_max_hz: 500.0,
            pitch_clarity_threshold: 0.9,
            stabilization_ms: 50,
            playback: PlaybackStrategy::Timeline,
            word_rate: WordRateKind::Energy,
            words_per_second: 2.5,
            word_gate_frame_len: 512,
            word_gate_rms: 0.02,
            channel_error_policy: ChannelErrorPolicy::Close,
            annotation_prefix: "SYSTEM_METRICS: ".into(),
            meter_gain: 5.0,
        }
    }
}

impl SessionConfig {
    /// Read `path`. A missing file yields defaults.
    ///
    /// # Errors
    /// `Io` on read failure, `Json` on malformed content.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let mut config: SessionConfig = serde_json::from_str(&raw)?;
        config.normalize();
        Ok(config)
    }

    /// Write pretty JSON to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    pub fn normalize(&mut self) {
        self.capture_sample_rate = self.capture_sample_rate.clamp(8_000, 48_000);
        self.inbound_sample_rate = self.inbound_sample_rate.clamp(8_000, 48_000);
        let max_frame =
            (self.capture_sample_rate as f64 * MAX_FRAME_CADENCE_SECS).floor() as usize;
        self.frame_len = self.frame_len.clamp(256, max_frame);
        self.preferred_input_device = normalize_device_name(self.preferred_input_device.take());
        self.preferred_output_device = normalize_device_name(self.preferred_output_device.take());
        self.vad_rms_threshold = clamp_finite(self.vad_rms_threshold, 0.001, 0.5, 0.02);
        self.vad_zcr_threshold = clamp_finite(self.vad_zcr_threshold, 0.01, 0.9, 0.1);
        self.pitch_window = self.pitch_window.clamp(256, 8192);
        self.pitch_min_hz = clamp_finite(self.pitch_min_hz, 20.0, 1000.0, 60.0);
        self.pitch_max_hz = clamp_finite(self.pitch_max_hz, 40.0, 2000.0, 500.0);
        if self.pitch_max_hz <= self.pitch_min_hz {
            self.pitch_min_hz = 60.0;
            self.pitch_max_hz = 500.0;
        }
        self.pitch_clarity_threshold = clamp_finite(self.pitch_clarity_threshold, 0.5, 1.0, 0.9);
        self.stabilization_ms = self.stabilization_ms.min(500);
        self.words_per_second = if self.words_per_second.is_finite() {
            self.words_per_second.clamp(0.5, 6.0)
        } else {
            2.5
        };
        self.word_gate_frame_len = self.word_gate_frame_len.clamp(64, 8192);
        self.word_gate_rms = clamp_finite(self.word_gate_rms, 0.001, 0.5, 0.02);
        if self.annotation_prefix.trim().is_empty() {
            self.annotation_prefix = "SYSTEM_METRICS: ".into();
        }
        self.meter_gain = clamp_finite(self.meter_gain, 0.5, 50.0, 5.0);
    }

    /// Apply `VOCALAD_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides read through `lookup`, then normalize.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("VOCALAD_INBOUND_SAMPLE_RATE") {
            match raw.trim().parse::<u32>() {
                Ok(rate) => self.inbound_sample_rate = rate,
                Err(_) => warn!(value = raw.as_str(), "ignoring VOCALAD_INBOUND_SAMPLE_RATE"),
            }
        }
        if let Some(raw) = lookup("VOCALAD_PLAYBACK") {
            match PlaybackStrategy::parse(&raw) {
                Some(strategy) => self.playback = strategy,
                None => warn!(value = raw.as_str(), "ignoring VOCALAD_PLAYBACK"),
            }
        }
        if let Some(raw) = lookup("VOCALAD_STABILIZATION_MS") {
            match raw.trim().parse::<u32>() {
                Ok(ms) => self.stabilization_ms = ms,
                Err(_) => warn!(value = raw.as_str(), "ignoring VOCALAD_STABILIZATION_MS"),
            }
        }
        self.normalize();
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            sample_rate: self.capture_sample_rate,
            frame_len: self.frame_len,
            preferred_device: self.preferred_input_device.clone(),
        }
    }

    pub fn analysis_settings(&self) -> AnalysisSettings {
        AnalysisSettings {
            window: self.pitch_window,
            pitch_min_hz: self.pitch_min_hz,
            pitch_max_hz: self.pitch_max_hz,
            clarity_threshold: self.pitch_clarity_threshold,
            vad: ThresholdVad::new(self.vad_rms_threshold, self.vad_zcr_threshold),
        }
    }

    pub fn energy_gate(&self) -> EnergyGate {
        EnergyGate {
            words_per_second: self.words_per_second,
            frame_len: self.word_gate_frame_len,
            rms_threshold: self.word_gate_rms,
        }
    }

    pub fn word_rate_strategy(&self) -> WordRateStrategy {
        match self.word_rate {
            WordRateKind::Energy => WordRateStrategy::Energy(self.energy_gate()),
            WordRateKind::PhonemeStub => WordRateStrategy::Phoneme {
                model: ModelHandle::new(StubRecognizer::new(self.word_gate_rms)),
                fallback: self.energy_gate(),
            },
        }
    }

    pub fn stabilization_secs(&self) -> f64 {
        self.stabilization_ms as f64 / 1000.0
    }

    /// Capture cadence implied by the frame layout.
    pub fn frame_cadence_secs(&self) -> f64 {
        self.frame_len as f64 / self.capture_sample_rate.max(1) as f64
    }

    /// Reject configurations `normalize` cannot repair.
    pub fn validate(&self) -> Result<()> {
        if self.frame_cadence_secs() > MAX_FRAME_CADENCE_SECS + f64::EPSILON {
            return Err(VocaladError::Config(format!(
                "frame cadence {:.0} ms exceeds {:.0} ms",
                self.frame_cadence_secs() * 1000.0,
                MAX_FRAME_CADENCE_SECS * 1000.0
            )));
        }
        Ok(())
    }
}

fn normalize_device_name(raw: Option<String>) -> Option<String> {
    raw.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

fn clamp_finite(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::HashMap;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("vocalad-config-{}-{name}", std::process::id()))
            .join("session.json")
    }

    #[test]
    fn defaults_match_documented_constants() {
        let c = SessionConfig::default();
        assert_eq!(c.capture_sample_rate, 16_000);
        assert_eq!(c.frame_len, 2048);
        assert_eq!(c.inbound_sample_rate, 24_000);
        assert_relative_eq!(c.stabilization_secs(), 0.05);
        assert!(c.frame_cadence_secs() < MAX_FRAME_CADENCE_SECS);
        assert!(c.validate().is_ok());
        assert_eq!(c.annotation_prefix, "SYSTEM_METRICS: ");
    }

    #[test]
    fn normalize_caps_frame_cadence() {
        let mut c = SessionConfig {
            frame_len: 16_000,
            ..SessionConfig::default()
        };
        assert!(c.validate().is_err());
        c.normalize();
        assert_eq!(c.frame_len, 2400);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn normalize_repairs_bad_values() {
        let mut c = SessionConfig {
            vad_rms_threshold: f32::NAN,
            pitch_min_hz: 600.0,
            pitch_max_hz: 100.0,
            preferred_input_device: Some("   ".into()),
            annotation_prefix: String::new(),
            ..SessionConfig::default()
        };
        c.normalize();
        assert_relative_eq!(c.vad_rms_threshold, 0.02);
        assert_relative_eq!(c.pitch_min_hz, 60.0);
        assert_relative_eq!(c.pitch_max_hz, 500.0);
        assert!(c.preferred_input_device.is_none());
        assert_eq!(c.annotation_prefix, "SYSTEM_METRICS: ");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c: SessionConfig =
            serde_json::from_str(r#"{"playback":"sequential","channelErrorPolicy":"idle"}"#)
                .unwrap();
        assert_eq!(c.playback, PlaybackStrategy::Sequential);
        assert_eq!(c.channel_error_policy, ChannelErrorPolicy::Idle);
        assert_eq!(c.frame_len, 2048);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let path = scratch_path("roundtrip");
        let c = SessionConfig {
            inbound_sample_rate: 22_050,
            word_rate: WordRateKind::PhonemeStub,
            ..SessionConfig::default()
        };
        c.save(&path).unwrap();
        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded, c);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = scratch_path("missing");
        assert_eq!(SessionConfig::load(&path).unwrap(), SessionConfig::default());
    }

    #[test]
    fn overrides_apply_and_bad_values_are_ignored() {
        let vars: HashMap<&str, &str> = [
            ("VOCALAD_INBOUND_SAMPLE_RATE", "16000"),
            ("VOCALAD_PLAYBACK", "Sequential"),
            ("VOCALAD_STABILIZATION_MS", "fast"),
        ]
        .into_iter()
        .collect();
        let mut c = SessionConfig::default();
        c.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.inbound_sample_rate, 16_000);
        assert_eq!(c.playback, PlaybackStrategy::Sequential);
        assert_eq!(c.stabilization_ms, 50);
    }

    #[test]
    fn derived_settings_follow_config() {
        let c = SessionConfig {
            vad_rms_threshold: 0.05,
            word_rate: WordRateKind::PhonemeStub,
            ..SessionConfig::default()
        };
        assert_relative_eq!(c.analysis_settings().vad.rms_threshold, 0.05);
        assert_eq!(c.capture_settings().frame_len, 2048);
        assert!(matches!(
            c.word_rate_strategy(),
            WordRateStrategy::Phoneme { .. }
        ));
        assert!(!c.word_rate_strategy().is_model_backed());
    }
}
