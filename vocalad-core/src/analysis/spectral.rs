//! FFT-based spectral descriptors: centroid, flatness and MFCCs.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// Number of cepstral coefficients reported per frame.
pub const N_MFCC: usize = 13;

/// Mel bands feeding the DCT.
const N_MEL_BANDS: usize = 26;

/// Magnitude sum below which a window is treated as silent.
const SILENCE_FLOOR: f32 = 1e-8;

/// Spectral descriptors of one analysis window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralFeatures {
    pub centroid_hz: f32,
    pub flatness: f32,
    pub mfcc: [f32; N_MFCC],
}

impl SpectralFeatures {
    pub const ZERO: Self = Self {
        centroid_hz: 0.0,
        flatness: 0.0,
        mfcc: [0.0; N_MFCC],
    };
}

pub struct SpectralAnalyzer {
    fft_size: usize,
    sample_rate: u32,
    hann_window: Vec<f32>,
    mel_filters: Vec<Vec<f32>>,
    fft: Arc<dyn Fft<f32>>,
    buf: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
}

impl SpectralAnalyzer {
    pub fn new(fft_size: usize, sample_rate: u32) -> Self {
        let fft_size = fft_size.max(4);
        let nyquist = sample_rate as f32 / 2.0;
        Self {
            fft_size,
            sample_rate,
            hann_window: build_hann_window(fft_size),
            mel_filters: build_mel_filters(fft_size, sample_rate, N_MEL_BANDS, 0.0, nyquist),
            fft: FftPlanner::<f32>::new().plan_fft_forward(fft_size),
            buf: vec![Complex::new(0.0, 0.0); fft_size],
            magnitudes: vec![0.0; fft_size / 2 + 1],
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Analyse one window. Shorter input is zero-padded, longer is truncated.
    pub fn analyze(&mut self, samples: &[f32]) -> SpectralFeatures {
        for (i, slot) in self.buf.iter_mut().enumerate() {
            let s = samples.get(i).copied().unwrap_or(0.0);
            *slot = Complex::new(s * self.hann_window[i], 0.0);
        }
        self.fft.process(&mut self.buf);

        for (mag, c) in self.magnitudes.iter_mut().zip(self.buf.iter()) {
            *mag = c.norm();
        }
        let total: f32 = self.magnitudes.iter().sum();
        if total < SILENCE_FLOOR {
            return SpectralFeatures::ZERO;
        }

        let bin_hz = self.sample_rate as f32 / self.fft_size as f32;
        let centroid_hz = self
            .magnitudes
            .iter()
            .enumerate()
            .map(|(k, m)| k as f32 * bin_hz * m)
            .sum::<f32>()
            / total;

        let n = self.magnitudes.len() as f32;
        let log_mean = self
            .magnitudes
            .iter()
            .map(|m| m.max(SILENCE_FLOOR).ln())
            .sum::<f32>()
            / n;
        let flatness = (log_mean.exp() / (total / n)).clamp(0.0, 1.0);

        SpectralFeatures {
            centroid_hz,
            flatness,
            mfcc: self.mfcc(),
        }
    }

    fn mfcc(&self) -> [f32; N_MFCC] {
        let log_mel: Vec<f32> = self
            .mel_filters
            .iter()
            .map(|filter| {
                let energy: f32 = filter
                    .iter()
                    .zip(self.magnitudes.iter())
                    .map(|(w, m)| w * m * m)
                    .sum();
                energy.max(1e-10).ln()
            })
            .collect();

        let bands = log_mel.len() as f32;
        let mut out = [0f32; N_MFCC];
        for (i, coeff) in out.iter_mut().enumerate() {
            *coeff = log_mel
                .iter()
                .enumerate()
                .map(|(m, &e)| {
                    e * (std::f32::consts::PI * i as f32 * (m as f32 + 0.5) / bands).cos()
                })
                .sum();
        }
        out
    }
}

fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

fn build_mel_filters(
    fft_size: usize,
    sr: u32,
    n_mels: usize,
    fmin: f32,
    fmax: f32,
) -> Vec<Vec<f32>> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel_slaney(fmin);
    let mel_max = hz_to_mel_slaney(fmax);

    let hz_pts: Vec<f32> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz_slaney(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    (0..n_mels)
        .map(|m| {
            let (lower, center, upper) = (hz_pts[m], hz_pts[m + 1], hz_pts[m + 2]);
            let enorm = 2.0 / (upper - lower).max(1e-10);
            (0..n_freqs)
                .map(|k| {
                    let freq = k as f32 * sr as f32 / fft_size as f32;
                    let w = if freq >= lower && freq <= center {
                        (freq - lower) / (center - lower).max(1e-10)
                    } else if freq > center && freq <= upper {
                        (upper - freq) / (upper - center).max(1e-10)
                    } else {
                        0.0
                    };
                    (w * enorm).max(0.0)
                })
                .collect()
        })
        .collect()
}

const F_SP: f32 = 200.0 / 3.0;
const MIN_LOG_HZ: f32 = 1_000.0;

fn mel_logstep() -> f32 {
    (6.4_f32).ln() / 27.0
}

fn hz_to_mel_slaney(hz: f32) -> f32 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_HZ / F_SP + (hz / MIN_LOG_HZ).ln() / mel_logstep()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    let min_log_mel = MIN_LOG_HZ / F_SP;
    if mel >= min_log_mel {
        MIN_LOG_HZ * (mel_logstep() * (mel - min_log_mel)).exp()
    } else {
        mel * F_SP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / 16_000.0).sin())
            .collect()
    }

    #[test]
    fn silent_window_is_all_zero() {
        let mut sa = SpectralAnalyzer::new(2048, 16_000);
        assert_eq!(sa.analyze(&[0.0; 2048]), SpectralFeatures::ZERO);
    }

    #[test]
    fn centroid_tracks_pure_tone() {
        let mut sa = SpectralAnalyzer::new(2048, 16_000);
        let f = sa.analyze(&sine(1_000.0, 2048));
        assert!((f.centroid_hz - 1_000.0).abs() < 60.0, "{}", f.centroid_hz);
    }

    #[test]
    fn tone_is_less_flat_than_noise() {
        let mut sa = SpectralAnalyzer::new(2048, 16_000);
        let tone = sa.analyze(&sine(440.0, 2048)).flatness;

        // Deterministic LCG noise.
        let mut state = 0x1234_5678u32;
        let noise: Vec<f32> = (0..2048)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
            })
            .collect();
        let noisy = sa.analyze(&noise).flatness;
        assert!(tone < noisy, "tone={tone} noise={noisy}");
        assert!((0.0..=1.0).contains(&noisy));
    }

    #[test]
    fn mfcc_is_finite_for_speech_like_input() {
        let mut sa = SpectralAnalyzer::new(2048, 16_000);
        let f = sa.analyze(&sine(180.0, 1500));
        assert!(f.mfcc.iter().all(|c| c.is_finite()));
        assert!(f.mfcc[0] != 0.0);
    }

    #[test]
    fn slaney_scale_round_trips_across_the_log_knee() {
        for hz in [200.0f32, 999.0, 1_000.0, 4_000.0] {
            assert!((mel_to_hz_slaney(hz_to_mel_slaney(hz)) - hz).abs() < 0.5);
        }
    }
}
