//! Audio sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! Used in two directions:
//! - capture: device native rate (commonly 48 kHz) → 16 kHz session rate;
//! - sequential playback: session output rate (commonly 24 kHz) → device rate.
//!
//! When both rates match, `RateConverter` is a passthrough and no rubato
//! session is created at all.
//!
//! ## Usage
//!
//! ```ignore
//! let mut rc = RateConverter::new(48_000, 16_000, 960)?;
//! let out = rc.process(&raw_samples); // Vec<f32> at 16 kHz
//! let tail = rc.finish();              // remainder, zero-padded through rubato
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{Result, VocaladError};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    from_rate: u32,
    to_rate: u32,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Errors
    /// Returns `VocaladError::AudioDevice` if rubato fails to initialise.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(VocaladError::AudioDevice(format!(
                "invalid resampling rates {from_rate} -> {to_rate}"
            )));
        }
        let chunk_size = chunk_size.max(1);

        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                from_rate,
                to_rate,
            });
        }

        let resampler = Self::build(from_rate, to_rate, chunk_size)?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];

        tracing::info!(from_rate, to_rate, chunk_size, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf,
            from_rate,
            to_rate,
        })
    }

    fn build(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<FastFixedIn<f32>> {
        FastFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            1,
        )
        .map_err(|e| VocaladError::AudioDevice(format!("resampler init: {e}")))
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated until a full `chunk_size` block is available for
    /// rubato; any remainder is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();
        let mut consumed = 0usize;
        while self.input_buf.len() - consumed >= self.chunk_size {
            let input_slice = &self.input_buf[consumed..consumed + self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_, produced)) => result.extend_from_slice(&self.output_buf[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            consumed += self.chunk_size;
        }
        self.input_buf.drain(..consumed);

        result
    }

    /// Push the buffered remainder through rubato and return it.
    ///
    /// Call at the end of a contiguous stream (end of a remote reply) so the
    /// last partial chunk is not held back indefinitely.
    pub fn finish(&mut self) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return Vec::new();
        };
        if self.input_buf.is_empty() {
            return Vec::new();
        }

        let expected = (self.input_buf.len() as u64 * self.to_rate as u64
            / self.from_rate as u64) as usize;
        let mut result = Vec::new();
        let tail: [&[f32]; 1] = [self.input_buf.as_slice()];
        match resampler.process_partial_into_buffer(Some(&tail[..]), &mut self.output_buf, None) {
            Ok((_, produced)) => {
                result.extend_from_slice(&self.output_buf[0][..produced.min(expected)]);
            }
            Err(e) => error!("resampler tail error: {e}"),
        }
        self.input_buf.clear();
        debug!(samples = result.len(), "resampler tail flushed");
        result
    }

    /// Discard buffered input and rubato's internal delay line.
    pub fn reset(&mut self) {
        self.input_buf.clear();
        if let Some(ref mut resampler) = self.resampler {
            resampler.reset();
        }
    }

    /// Returns `true` when both rates match (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }
}
