//! McLeod Pitch Method (MPM) fundamental-frequency detector.
//!
//! ## Algorithm
//!
//! 1. Autocorrelation `r(τ)` via zero-padded FFT (O(n log n)).
//! 2. Normalised square difference `nsdf(τ) = 2·r(τ) / m(τ)` where
//!    `m(τ) = Σ x[j]² + x[j+τ]²` over the overlap, computed incrementally.
//! 3. Key maxima: the highest point of every positive lobe after the first
//!    negative-going zero crossing.
//! 4. Pick the first key maximum within `k · max(nsdf)` (k = 0.9), refine it by
//!    parabolic interpolation. The interpolated peak height is the clarity.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// Share of the highest key maximum a candidate must reach to be picked.
const KEY_MAXIMUM_CUTOFF: f32 = 0.9;

/// Energy below which the window is treated as silent.
const MIN_ENERGY: f32 = 1e-9;

/// A raw pitch estimate before band/clarity filtering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchEstimate {
    pub frequency_hz: f32,
    /// Interpolated NSDF peak, clamped to [0, 1].
    pub clarity: f32,
}

/// Fixed-window MPM detector with reusable FFT scratch.
pub struct PitchDetector {
    window: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    spectrum: Vec<Complex<f32>>,
    nsdf: Vec<f32>,
}

impl PitchDetector {
    pub fn new(window: usize) -> Self {
        let window = window.max(4);
        let fft_len = (window * 2).next_power_of_two();
        let mut planner = FftPlanner::<f32>::new();
        Self {
            window,
            forward: planner.plan_fft_forward(fft_len),
            inverse: planner.plan_fft_inverse(fft_len),
            spectrum: vec![Complex::new(0.0, 0.0); fft_len],
            nsdf: vec![0.0; window],
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Estimate the pitch of `samples`, which must hold exactly `window()`
    /// samples. Returns `None` when no periodic structure is found.
    pub fn detect(&mut self, samples: &[f32], sample_rate: u32) -> Option<PitchEstimate> {
        if samples.len() != self.window || sample_rate == 0 {
            return None;
        }
        if !self.compute_nsdf(samples) {
            return None;
        }

        let maxima = key_maxima(&self.nsdf);
        let highest = maxima
            .iter()
            .map(|&i| self.nsdf[i])
            .fold(f32::NEG_INFINITY, f32::max);
        if !highest.is_finite() {
            return None;
        }
        let cutoff = KEY_MAXIMUM_CUTOFF * highest;
        let chosen = maxima.into_iter().find(|&i| self.nsdf[i] >= cutoff)?;

        let (tau, clarity) = refine_peak(&self.nsdf, chosen);
        if tau <= 0.0 {
            return None;
        }
        Some(PitchEstimate {
            frequency_hz: sample_rate as f32 / tau,
            clarity: clarity.clamp(0.0, 1.0),
        })
    }

    /// Fill `self.nsdf`. Returns `false` for a silent window.
    fn compute_nsdf(&mut self, samples: &[f32]) -> bool {
        let n = self.window;
        let fft_len = self.spectrum.len();

        for (slot, &s) in self.spectrum.iter_mut().zip(samples) {
            *slot = Complex::new(s, 0.0);
        }
        for slot in self.spectrum[n..].iter_mut() {
            *slot = Complex::new(0.0, 0.0);
        }

        self.forward.process(&mut self.spectrum);
        for c in self.spectrum.iter_mut() {
            *c = Complex::new(c.norm_sqr(), 0.0);
        }
        self.inverse.process(&mut self.spectrum);

        let scale = 1.0 / fft_len as f32;
        let mut m = 2.0 * samples.iter().map(|s| s * s).sum::<f32>();
        if m < MIN_ENERGY {
            return false;
        }
        for tau in 0..n {
            if tau > 0 {
                let lead = samples[tau - 1];
                let tail = samples[n - tau];
                m -= lead * lead + tail * tail;
            }
            let r = self.spectrum[tau].re * scale;
            self.nsdf[tau] = if m > MIN_ENERGY { 2.0 * r / m } else { 0.0 };
        }
        true
    }
}

/// Index of the highest value in every positive lobe of `nsdf`, skipping the
/// lobe around τ = 0.
fn key_maxima(nsdf: &[f32]) -> Vec<usize> {
    let mut out = Vec::new();
    let mut in_lobe = false;
    let mut best = f32::NEG_INFINITY;
    let mut best_idx: Option<usize> = None;

    for i in 1..nsdf.len().saturating_sub(1) {
        let (prev, cur) = (nsdf[i - 1], nsdf[i]);
        if prev <= 0.0 && cur > 0.0 {
            in_lobe = true;
            best = cur;
            best_idx = Some(i);
        } else if prev > 0.0 && cur <= 0.0 {
            in_lobe = false;
            if let Some(idx) = best_idx.take() {
                out.push(idx);
            }
        } else if in_lobe && cur > best {
            best = cur;
            best_idx = Some(i);
        }
    }
    out
}

/// Parabolic interpolation around `idx`: (fractional lag, peak height).
fn refine_peak(nsdf: &[f32], idx: usize) -> (f32, f32) {
    if idx == 0 || idx + 1 >= nsdf.len() {
        return (idx as f32, nsdf[idx]);
    }
    let (y0, y1, y2) = (nsdf[idx - 1], nsdf[idx], nsdf[idx + 1]);
    let denom = y0 - 2.0 * y1 + y2;
    if denom.abs() < f32::EPSILON {
        return (idx as f32, y1);
    }
    let delta = 0.5 * (y0 - y2) / denom;
    (idx as f32 + delta, y1 - 0.25 * (y0 - y2) * delta)
}
