//! Device backends for both playback strategies.
//!
//! Neither backend touches the device from the session thread. The session
//! side converts audio to the device rate and hands it over; the render
//! source running inside the output callback only copies samples.
//!
//! ## Flush
//!
//! - Timeline: `cancel_all` bumps a generation counter. The render source
//!   drops every voice tagged with an older generation on its next callback.
//! - Stream: `flush` records a discard mark at the current write position.
//!   The render source skips everything before the mark.
//!
//! ## Buffers
//!
//! The timeline render source never frees a voice buffer. Finished and
//! cancelled voices go back over a bounded return channel and the session
//! side reuses them for the next scheduled voice.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use super::{sequential::StreamSink, timeline::TimelineOutput, PlaybackItem};
use crate::{
    audio::{
        output::{OutputStream, RenderSource},
        resample::RateConverter,
    },
    buffering::{create_playback_ring, AudioConsumer, AudioProducer, Consumer, Observer, Producer},
    error::{Result, VocaladError},
};

/// Linear-interpolation rate conversion for whole buffers.
///
/// Stateless: every buffer is converted on its own.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let mut out = Vec::new();
    resample_linear_into(samples, from_rate, to_rate, &mut out);
    out
}

/// [`resample_linear`] into a caller-owned buffer. `out` is cleared first.
pub fn resample_linear_into(samples: &[f32], from_rate: u32, to_rate: u32, out: &mut Vec<f32>) {
    out.clear();
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        out.extend_from_slice(samples);
        return;
    }
    let out_len = ((samples.len() as u64 * to_rate as u64) / from_rate as u64).max(1) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;
    out.extend((0..out_len).map(|i| {
        let pos = i as f64 * step;
        let idx = (pos as usize).min(last);
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = samples[(idx + 1).min(last)];
        a + (b - a) * frac
    }));
}

// ---------------------------------------------------------------------------
// Timeline backend
// ---------------------------------------------------------------------------

/// Voices the render source holds at once; the hand-over queue has the same bound.
pub const VOICE_CAPACITY: usize = 256;

struct Voice {
    generation: u64,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Render source that mixes scheduled voices against a frame clock.
pub struct TimelineRender {
    voices_rx: Receiver<Voice>,
    voices: VecDeque<Voice>,
    retired_tx: Sender<Vec<f32>>,
    clock: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
}

impl TimelineRender {
    /// Hand a buffer back to the session side.
    fn retire(&self, voice: Voice) {
        // The return channel holds every buffer that can exist at once.
        let _ = self.retired_tx.try_send(voice.samples);
    }

    /// Keep the voices that satisfy `keep`, in order, without reallocating.
    fn retain_voices(&mut self, keep: impl Fn(&Voice) -> bool) {
        for _ in 0..self.voices.len() {
            let Some(voice) = self.voices.pop_front() else {
                break;
            };
            if keep(&voice) {
                self.voices.push_back(voice);
            } else {
                self.retire(voice);
            }
        }
    }
}

impl RenderSource for TimelineRender {
    fn render(&mut self, out: &mut [f32]) {
        let generation = self.generation.load(Ordering::Acquire);
        self.retain_voices(|v| v.generation == generation);
        while self.voices.len() < self.voices.capacity() {
            let Ok(voice) = self.voices_rx.try_recv() else {
                break;
            };
            if voice.generation == generation {
                self.voices.push_back(voice);
            } else {
                self.retire(voice);
            }
        }

        let first = self.clock.load(Ordering::Acquire);
        let last = first + out.len() as u64;
        out.fill(0.0);
        for voice in &self.voices {
            if voice.end_frame() <= first || voice.start_frame >= last {
                continue;
            }
            let from = voice.start_frame.max(first);
            let to = voice.end_frame().min(last);
            for frame in from..to {
                out[(frame - first) as usize] += voice.samples[(frame - voice.start_frame) as usize];
            }
        }
        self.retain_voices(|v| v.end_frame() > last);
        self.clock.store(last, Ordering::Release);
    }
}

/// Timeline output on a cpal device. The clock is the count of frames the
/// device has rendered.
pub struct CpalTimelineOutput {
    voices_tx: Sender<Voice>,
    retired_rx: Receiver<Vec<f32>>,
    clock: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
    device_rate: u32,
    busy_until: f64,
    stream: Option<OutputStream>,
}

impl CpalTimelineOutput {
    /// Open `preferred` (or the default output device).
    ///
    /// # Errors
    /// Device errors from [`OutputStream::open`].
    pub fn open(preferred: Option<&str>) -> Result<Self> {
        let (mut output, render) = Self::detached(0);
        let stream = OutputStream::open(preferred, render)?;
        output.device_rate = stream.sample_rate();
        output.stream = Some(stream);
        Ok(output)
    }

    /// Build the session half and the render half without a device.
    pub fn detached(device_rate: u32) -> (Self, TimelineRender) {
        let (voices_tx, voices_rx) = crossbeam_channel::bounded(VOICE_CAPACITY);
        // Queued plus held voices, and the one being scheduled.
        let (retired_tx, retired_rx) = crossbeam_channel::bounded(2 * VOICE_CAPACITY + 1);
        let clock = Arc::new(AtomicU64::new(0));
        let generation = Arc::new(AtomicU64::new(0));
        let render = TimelineRender {
            voices_rx,
            voices: VecDeque::with_capacity(VOICE_CAPACITY),
            retired_tx,
            clock: Arc::clone(&clock),
            generation: Arc::clone(&generation),
        };
        (
            Self {
                voices_tx,
                retired_rx,
                clock,
                generation,
                device_rate,
                busy_until: 0.0,
                stream: None,
            },
            render,
        )
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    pub fn is_device_backed(&self) -> bool {
        self.stream.is_some()
    }
}

impl TimelineOutput for CpalTimelineOutput {
    fn now(&self) -> f64 {
        if self.device_rate == 0 {
            return 0.0;
        }
        self.clock.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn schedule(&mut self, item: PlaybackItem) -> Result<()> {
        if self.device_rate == 0 {
            return Err(VocaladError::AudioStream("output device rate unknown".into()));
        }
        let end_at = item.end_at();
        let mut samples = self.retired_rx.try_recv().unwrap_or_default();
        resample_linear_into(&item.samples, item.sample_rate, self.device_rate, &mut samples);
        let start_frame = (item.start_at.max(0.0) * self.device_rate as f64).round() as u64;
        let voice = Voice {
            generation: self.generation.load(Ordering::Acquire),
            start_frame,
            samples,
        };
        self.voices_tx.try_send(voice).map_err(|e| match e {
            TrySendError::Full(_) => VocaladError::AudioStream("output voice queue full".into()),
            TrySendError::Disconnected(_) => {
                VocaladError::AudioStream("output render source is gone".into())
            }
        })?;
        self.busy_until = self.busy_until.max(end_at);
        Ok(())
    }

    fn cancel_all(&mut self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.busy_until = 0.0;
        debug!(generation, "timeline voices cancelled");
    }

    fn is_busy(&self) -> bool {
        self.now() < self.busy_until
    }
}

// ---------------------------------------------------------------------------
// Stream backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RingMarks {
    /// Samples ever pushed into the ring.
    written: AtomicU64,
    /// Samples ever taken out of the ring, played or skipped.
    consumed: AtomicU64,
    /// Everything before this position is discarded unplayed.
    discard_until: AtomicU64,
}

/// Render source draining the playback ring.
pub struct RingRender {
    consumer: AudioConsumer,
    marks: Arc<RingMarks>,
}

impl RenderSource for RingRender {
    fn render(&mut self, out: &mut [f32]) {
        let consumed = self.marks.consumed.load(Ordering::Acquire);
        let discard_until = self.marks.discard_until.load(Ordering::Acquire);
        let mut taken = 0u64;
        if discard_until > consumed {
            let backlog = (discard_until - consumed) as usize;
            taken += self.consumer.skip(backlog.min(self.consumer.occupied_len())) as u64;
        }
        let n = self.consumer.pop_slice(out);
        out[n..].fill(0.0);
        taken += n as u64;
        self.marks.consumed.store(consumed + taken, Ordering::Release);
    }
}

/// Continuous stream on a cpal device fed through the playback ring.
pub struct CpalStreamSink {
    producer: AudioProducer,
    converter: RateConverter,
    marks: Arc<RingMarks>,
    stream: Option<OutputStream>,
}

impl CpalStreamSink {
    /// Open `preferred` (or the default output device) for audio arriving at
    /// `input_rate`.
    ///
    /// # Errors
    /// Device errors from [`OutputStream::open`], or a resampler init error.
    pub fn open(preferred: Option<&str>, input_rate: u32) -> Result<Self> {
        let (producer, consumer) = create_playback_ring();
        let marks = Arc::new(RingMarks::default());
        let render = RingRender {
            consumer,
            marks: Arc::clone(&marks),
        };
        let stream = OutputStream::open(preferred, render)?;
        let converter = RateConverter::new(input_rate, stream.sample_rate(), 1024)?;
        Ok(Self {
            producer,
            converter,
            marks,
            stream: Some(stream),
        })
    }

    /// Build the session half and the render half without a device.
    ///
    /// # Errors
    /// Resampler init error.
    pub fn detached(input_rate: u32, device_rate: u32) -> Result<(Self, RingRender)> {
        let (producer, consumer) = create_playback_ring();
        let marks = Arc::new(RingMarks::default());
        let render = RingRender {
            consumer,
            marks: Arc::clone(&marks),
        };
        Ok((
            Self {
                producer,
                converter: RateConverter::new(input_rate, device_rate, 1024)?,
                marks,
                stream: None,
            },
            render,
        ))
    }

    fn push(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let pushed = self.producer.push_slice(samples);
        if pushed < samples.len() {
            warn!(
                dropped = samples.len() - pushed,
                "playback ring full, dropping samples"
            );
        }
        self.marks.written.fetch_add(pushed as u64, Ordering::AcqRel);
    }

    pub fn is_device_backed(&self) -> bool {
        self.stream.is_some()
    }
}

impl StreamSink for CpalStreamSink {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        let converted = self.converter.process(samples);
        self.push(&converted);
        Ok(())
    }

    fn flush(&mut self) {
        self.converter.reset();
        let written = self.marks.written.load(Ordering::Acquire);
        self.marks.discard_until.store(written, Ordering::Release);
    }

    fn drain_tail(&mut self) -> Result<()> {
        let tail = self.converter.finish();
        self.push(&tail);
        Ok(())
    }

    fn is_playing(&self) -> bool {
        let consumed = self.marks.consumed.load(Ordering::Acquire);
        let discard_until = self.marks.discard_until.load(Ordering::Acquire);
        consumed.max(discard_until) < self.marks.written.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::pcm::Pcm16Decoder,
        playback::{PlaybackScheduler, TimelineScheduler},
    };
    use approx::assert_relative_eq;

    #[test]
    fn linear_resample_preserves_length_ratio_and_endpoints() {
        let up = resample_linear(&[0.0, 1.0, 0.0, -1.0], 1, 2);
        assert_eq!(up.len(), 8);
        assert_relative_eq!(up[1], 0.5);
        assert_relative_eq!(up[2], 1.0);
        assert_eq!(resample_linear(&[0.3; 10], 24_000, 24_000), vec![0.3; 10]);
        assert_eq!(resample_linear(&[0.5; 480], 24_000, 48_000).len(), 960);
    }

    #[test]
    fn timeline_render_places_voices_on_the_frame_clock() {
        let (mut out, mut render) = CpalTimelineOutput::detached(1000);
        out.schedule(PlaybackItem {
            seq: 0,
            samples: vec![1.0; 10],
            sample_rate: 1000,
            start_at: 0.005,
        })
        .unwrap();
        let mut buf = [9.0f32; 20];
        render.render(&mut buf);
        assert!(buf[..5].iter().all(|&s| s == 0.0));
        assert!(buf[5..15].iter().all(|&s| s == 1.0));
        assert!(buf[15..].iter().all(|&s| s == 0.0));
        assert_relative_eq!(out.now(), 0.02);
        assert!(!out.is_busy());
    }

    #[test]
    fn cancel_silences_in_flight_voice() {
        let (mut out, mut render) = CpalTimelineOutput::detached(1000);
        out.schedule(PlaybackItem {
            seq: 0,
            samples: vec![0.5; 100],
            sample_rate: 1000,
            start_at: 0.0,
        })
        .unwrap();
        let mut buf = [0.0f32; 10];
        render.render(&mut buf);
        assert_eq!(buf, [0.5; 10]);
        assert!(out.is_busy());

        out.cancel_all();
        render.render(&mut buf);
        assert_eq!(buf, [0.0; 10]);
        assert!(!out.is_busy());
    }

    #[test]
    fn finished_and_cancelled_buffers_come_back_for_reuse() {
        let (mut out, mut render) = CpalTimelineOutput::detached(1000);
        let item = |start_at| PlaybackItem {
            seq: 0,
            samples: vec![0.25; 10],
            sample_rate: 1000,
            start_at,
        };
        out.schedule(item(0.0)).unwrap();
        let mut buf = [0.0f32; 20];
        render.render(&mut buf);
        assert_eq!(out.retired_rx.len(), 1);

        out.schedule(item(1.0)).unwrap();
        assert!(out.retired_rx.is_empty());
        out.cancel_all();
        render.render(&mut buf);
        let returned = out.retired_rx.try_recv().unwrap();
        assert!(returned.capacity() >= 10);
    }

    #[test]
    fn render_holds_voices_without_growing() {
        let (mut out, mut render) = CpalTimelineOutput::detached(1000);
        let capacity = render.voices.capacity();
        let future = |i: usize| PlaybackItem {
            seq: i as u64,
            samples: vec![0.1; 4],
            sample_rate: 1000,
            start_at: 10.0 + i as f64 * 0.01,
        };
        let mut buf = [0.0f32; 4];
        for i in 0..2 * VOICE_CAPACITY {
            out.schedule(future(i)).unwrap();
            if i + 1 == VOICE_CAPACITY {
                render.render(&mut buf);
            }
        }
        render.render(&mut buf);
        assert!(render.voices.len() >= VOICE_CAPACITY);
        assert_eq!(render.voices.capacity(), capacity);

        let overflow = (0..=VOICE_CAPACITY).find_map(|i| out.schedule(future(i)).err());
        assert!(matches!(overflow, Some(VocaladError::AudioStream(_))));
        assert_eq!(render.voices.capacity(), capacity);
    }

    #[test]
    fn scheduler_over_device_output_is_gapless() {
        let (out, mut render) = CpalTimelineOutput::detached(1000);
        let mut scheduler = TimelineScheduler::new(out, Pcm16Decoder::new(1000, 1), 0.0);
        let chunk = crate::audio::pcm::encode_pcm16_le(&[-0.5; 10]);
        scheduler.enqueue(&chunk).unwrap();
        scheduler.enqueue(&chunk).unwrap();
        let mut buf = [0.0f32; 25];
        render.render(&mut buf);
        assert!(buf[..20].iter().all(|&s| s == -0.5));
        assert!(buf[20..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn ring_render_plays_in_order_then_silence() {
        let (mut sink, mut render) = CpalStreamSink::detached(8000, 8000).unwrap();
        sink.write(&[0.1, 0.2, 0.3]).unwrap();
        assert!(sink.is_playing());
        let mut buf = [9.0f32; 5];
        render.render(&mut buf);
        assert_eq!(buf, [0.1, 0.2, 0.3, 0.0, 0.0]);
        assert!(!sink.is_playing());
    }

    #[test]
    fn ring_flush_skips_unplayed_audio() {
        let (mut sink, mut render) = CpalStreamSink::detached(8000, 8000).unwrap();
        sink.write(&[0.1; 100]).unwrap();
        let mut buf = [0.0f32; 10];
        render.render(&mut buf);
        sink.flush();
        assert!(!sink.is_playing());
        sink.write(&[0.7; 4]).unwrap();
        assert!(sink.is_playing());
        render.render(&mut buf);
        assert_eq!(&buf[..4], &[0.7; 4]);
        assert!(buf[4..].iter().all(|&s| s == 0.0));
        assert!(!sink.is_playing());
    }
}
