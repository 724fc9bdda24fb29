//! Cuts arbitrarily-sized sample blocks into fixed-length `AudioFrame`s.

use super::frame::AudioFrame;

/// Accumulates samples and emits frames of exactly `frame_len` samples.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_len: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    next_seq: u64,
}

impl FrameAssembler {
    /// # Panics
    /// Never panics. A zero `frame_len` is treated as 1.
    pub fn new(frame_len: usize, sample_rate: u32) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            frame_len,
            sample_rate,
            pending: Vec::with_capacity(frame_len * 2),
            next_seq: 0,
        }
    }

    /// Append samples and return every frame completed by them, in order.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::with_capacity(self.pending.len() / self.frame_len);
        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            let full = std::mem::replace(&mut self.pending, rest);
            frames.push(AudioFrame::new(self.next_seq, full, self.sample_rate));
            self.next_seq += 1;
        }
        frames
    }

    /// Samples waiting for a full frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Drop any partial frame. Sequence numbering continues.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
