//! Typed audio frame handed from capture to the analysis and forwarding paths.

/// A fixed-length block of mono PCM samples with a monotonic sequence number.
///
/// Both consumers of a capture tick receive `&AudioFrame`; neither may mutate it.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Monotonic capture sequence number.
    pub seq: u64,
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (16 000 for the capture path).
    pub sample_rate: u32,
    /// Channel count. Capture always downmixes to mono.
    pub channels: u16,
}

impl AudioFrame {
    /// Build a mono frame, clamping finite samples into [-1.0, 1.0].
    ///
    /// Non-finite samples are kept as-is so the feature extractor can reject the
    /// frame instead of silently analysing repaired data.
    pub fn new(seq: u64, mut samples: Vec<f32>, sample_rate: u32) -> Self {
        for s in samples.iter_mut() {
            if s.is_finite() {
                *s = s.clamp(-1.0, 1.0);
            }
        }
        Self {
            seq,
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// A frame of `len` zero samples.
    pub fn silence(seq: u64, len: usize, sample_rate: u32) -> Self {
        Self::new(seq, vec![0.0; len], sample_rate)
    }

    /// Returns the duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether every sample is a finite number.
    pub fn is_finite(&self) -> bool {
        self.samples.iter().all(|s| s.is_finite())
    }
}
