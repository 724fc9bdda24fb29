//! Sequential strategy: decoded chunks are appended to one continuous stream
//! and the sink's FIFO keeps them in order.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{PlaybackScheduler, PlaybackStats};
use crate::{audio::pcm::Pcm16Decoder, error::Result};

/// A continuous mono output stream fed at the decoder's rate.
pub trait StreamSink: Send {
    /// Append samples behind everything already written.
    fn write(&mut self, samples: &[f32]) -> Result<()>;

    /// Discard everything written but not yet rendered.
    fn flush(&mut self);

    /// Push any samples held back by conversion so the burst plays to the end.
    fn drain_tail(&mut self) -> Result<()>;

    /// `true` while written samples remain unrendered.
    fn is_playing(&self) -> bool;
}

pub struct SequentialScheduler<S: StreamSink> {
    sink: S,
    decoder: Pcm16Decoder,
    stats: PlaybackStats,
}

impl<S: StreamSink> SequentialScheduler<S> {
    pub fn new(sink: S, decoder: Pcm16Decoder) -> Self {
        Self {
            sink,
            decoder,
            stats: PlaybackStats::default(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: StreamSink> PlaybackScheduler for SequentialScheduler<S> {
    fn enqueue(&mut self, chunk: &[u8]) -> Result<()> {
        let samples = match self.decoder.decode(chunk) {
            Ok(s) => s,
            Err(e) => {
                self.stats.dropped += 1;
                warn!(bytes = chunk.len(), "dropping undecodable chunk: {e}");
                return Err(e);
            }
        };
        if samples.is_empty() {
            return Ok(());
        }
        self.sink.write(&samples)?;
        self.stats.enqueued += 1;
        self.stats.enqueued_secs += self.decoder.duration_of(chunk.len());
        Ok(())
    }

    fn flush(&mut self) {
        self.sink.flush();
        self.stats.flushes += 1;
        debug!("stream sink flushed");
    }

    fn stop(&mut self) {
        if self.sink.is_playing() {
            self.flush();
        }
    }

    fn finish_burst(&mut self) {
        if let Err(e) = self.sink.drain_tail() {
            warn!("could not drain conversion tail: {e}");
        }
    }

    fn is_playing(&self) -> bool {
        self.sink.is_playing()
    }

    fn stats(&self) -> PlaybackStats {
        self.stats
    }
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SinkState {
    pending: Vec<f32>,
    rendered: Vec<f32>,
    discarded: usize,
    flushes: u32,
    tails: u32,
}

/// Sink that renders only when its probe says so.
#[derive(Default)]
pub struct MemoryStreamSink {
    state: Arc<Mutex<SinkState>>,
}

/// Test-side handle onto a [`MemoryStreamSink`].
#[derive(Clone)]
pub struct MemorySinkProbe {
    state: Arc<Mutex<SinkState>>,
}

impl MemoryStreamSink {
    pub fn new() -> (MemoryStreamSink, MemorySinkProbe) {
        let sink = MemoryStreamSink::default();
        let probe = MemorySinkProbe {
            state: Arc::clone(&sink.state),
        };
        (sink, probe)
    }
}

impl StreamSink for MemoryStreamSink {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        self.state.lock().pending.extend_from_slice(samples);
        Ok(())
    }

    fn flush(&mut self) {
        let mut state = self.state.lock();
        state.discarded += state.pending.len();
        state.pending.clear();
        state.flushes += 1;
    }

    fn drain_tail(&mut self) -> Result<()> {
        self.state.lock().tails += 1;
        Ok(())
    }

    fn is_playing(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }
}

impl MemorySinkProbe {
    /// Render up to `n` samples; returns how many were rendered.
    pub fn render(&self, n: usize) -> usize {
        let mut state = self.state.lock();
        let n = n.min(state.pending.len());
        let head: Vec<f32> = state.pending.drain(..n).collect();
        state.rendered.extend(head);
        n
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn rendered(&self) -> Vec<f32> {
        self.state.lock().rendered.clone()
    }

    pub fn discarded(&self) -> usize {
        self.state.lock().discarded
    }

    pub fn flush_count(&self) -> u32 {
        self.state.lock().flushes
    }

    pub fn tail_drains(&self) -> u32 {
        self.state.lock().tails
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::encode_pcm16_le;

    fn scheduler() -> (SequentialScheduler<MemoryStreamSink>, MemorySinkProbe) {
        let (sink, probe) = MemoryStreamSink::new();
        (
            SequentialScheduler::new(sink, Pcm16Decoder::new(24_000, 1)),
            probe,
        )
    }

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|i| -(i as f32) / 4096.0).collect()
    }

    #[test]
    fn chunks_render_in_arrival_order() {
        let (mut s, probe) = scheduler();
        s.enqueue(&encode_pcm16_le(&ramp(0, 100))).unwrap();
        s.enqueue(&encode_pcm16_le(&ramp(100, 100))).unwrap();
        assert!(s.is_playing());
        assert_eq!(probe.render(1000), 200);
        assert!(!s.is_playing());
        // -i/4096 survives the PCM16 round trip exactly.
        assert_eq!(probe.rendered(), ramp(0, 200));
    }

    #[test]
    fn flush_discards_pending_audio_only() {
        let (mut s, probe) = scheduler();
        s.enqueue(&encode_pcm16_le(&ramp(0, 480))).unwrap();
        probe.render(100);
        s.flush();
        assert_eq!(probe.discarded(), 380);
        assert!(!s.is_playing());

        s.enqueue(&encode_pcm16_le(&ramp(0, 10))).unwrap();
        probe.render(10);
        assert_eq!(probe.rendered().len(), 110);
        assert_eq!(s.stats().flushes, 1);
    }

    #[test]
    fn stop_only_flushes_when_something_is_pending() {
        let (mut s, probe) = scheduler();
        s.stop();
        assert_eq!(probe.flush_count(), 0);
        s.enqueue(&encode_pcm16_le(&ramp(0, 10))).unwrap();
        s.stop();
        s.stop();
        assert_eq!(probe.flush_count(), 1);
    }

    #[test]
    fn finish_burst_drains_tail_and_keeps_audio() {
        let (mut s, probe) = scheduler();
        s.enqueue(&encode_pcm16_le(&ramp(0, 10))).unwrap();
        s.finish_burst();
        assert_eq!(probe.tail_drains(), 1);
        assert_eq!(probe.pending_len(), 10);
    }

    #[test]
    fn malformed_chunk_counts_as_dropped() {
        let (mut s, probe) = scheduler();
        assert!(s.enqueue(&[7]).is_err());
        s.enqueue(&encode_pcm16_le(&ramp(0, 4))).unwrap();
        assert_eq!(probe.pending_len(), 4);
        assert_eq!(s.stats().dropped, 1);
        assert_eq!(s.stats().enqueued, 1);
    }
}
