//! Timeline strategy: every buffer gets an explicit start time.
//!
//! ## Scheduling rule
//!
//! ```text
//! start(n) = prev_end            if a burst is in progress (prev_end > now)
//!          = now + stabilization otherwise (first buffer of a burst)
//! prev_end = start(n) + duration(n)
//! ```
//!
//! The queue depth is never capped: chunks can arrive faster than real time
//! and dropping or re-timing them would reorder speech.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{PlaybackItem, PlaybackScheduler, PlaybackStats};
use crate::{audio::pcm::Pcm16Decoder, error::Result};

/// An output clock that plays buffers at explicit start times.
pub trait TimelineOutput: Send {
    /// Current position of the output clock in seconds.
    fn now(&self) -> f64;

    /// Play `item` starting at `item.start_at`.
    fn schedule(&mut self, item: PlaybackItem) -> Result<()>;

    /// Silence everything scheduled, including the buffer currently audible.
    fn cancel_all(&mut self);

    /// `true` while any scheduled buffer has not finished.
    fn is_busy(&self) -> bool;
}

/// Timeline-strategy scheduler.
pub struct TimelineScheduler<O: TimelineOutput> {
    output: O,
    decoder: Pcm16Decoder,
    stabilization_secs: f64,
    prev_end: Option<f64>,
    next_seq: u64,
    stats: PlaybackStats,
}

impl<O: TimelineOutput> TimelineScheduler<O> {
    pub fn new(output: O, decoder: Pcm16Decoder, stabilization_secs: f64) -> Self {
        Self {
            output,
            decoder,
            stabilization_secs: stabilization_secs.max(0.0),
            prev_end: None,
            next_seq: 0,
            stats: PlaybackStats::default(),
        }
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    /// End of the last scheduled buffer, if a burst is in progress.
    pub fn scheduled_until(&self) -> Option<f64> {
        self.prev_end
    }
}

impl<O: TimelineOutput> PlaybackScheduler for TimelineScheduler<O> {
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

        let now = self.output.now();
        let start_at = match self.prev_end {
            Some(end) if end > now => end,
            _ => now + self.stabilization_secs,
        };
        let item = PlaybackItem {
            seq: self.next_seq,
            samples,
            sample_rate: self.decoder.sample_rate,
            start_at,
        };
        let duration = item.duration_secs();
        let end_at = item.end_at();
        debug!(seq = item.seq, start_at, end_at, "scheduling buffer");

        self.output.schedule(item)?;
        self.prev_end = Some(end_at);
        self.next_seq += 1;
        self.stats.enqueued += 1;
        self.stats.enqueued_secs += duration;
        Ok(())
    }

    fn flush(&mut self) {
        self.output.cancel_all();
        self.prev_end = None;
        self.stats.flushes += 1;
        debug!(now = self.output.now(), "timeline flushed");
    }

    fn stop(&mut self) {
        if self.prev_end.is_some() || self.output.is_busy() {
            self.flush();
        }
    }

    fn finish_burst(&mut self) {}

    fn is_playing(&self) -> bool {
        self.output.is_busy()
    }

    fn stats(&self) -> PlaybackStats {
        self.stats
    }
}

// ---------------------------------------------------------------------------
// Virtual output
// ---------------------------------------------------------------------------

/// A buffer as placed on a virtual timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSpan {
    pub seq: u64,
    pub start_at: f64,
    pub end_at: f64,
    /// Clock time at which the span was cancelled, if it was.
    pub cancelled_at: Option<f64>,
}

impl ScheduledSpan {
    /// Seconds of this span that actually rendered.
    pub fn rendered_secs(&self) -> f64 {
        let stop = self.cancelled_at.map_or(self.end_at, |c| c.min(self.end_at));
        (stop - self.start_at).max(0.0)
    }
}

#[derive(Default)]
struct VirtualState {
    now: f64,
    spans: Vec<ScheduledSpan>,
    cancels: u32,
}

/// Manually clocked output timeline.
#[derive(Clone, Default)]
pub struct VirtualTimeline {
    state: Arc<Mutex<VirtualState>>,
}

/// Test-side handle onto a [`VirtualTimeline`].
#[derive(Clone)]
pub struct VirtualTimelineProbe {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualTimeline {
    pub fn new() -> (VirtualTimeline, VirtualTimelineProbe) {
        let timeline = VirtualTimeline::default();
        let probe = VirtualTimelineProbe {
            state: Arc::clone(&timeline.state),
        };
        (timeline, probe)
    }
}

impl TimelineOutput for VirtualTimeline {
    fn now(&self) -> f64 {
        self.state.lock().now
    }

    fn schedule(&mut self, item: PlaybackItem) -> Result<()> {
        self.state.lock().spans.push(ScheduledSpan {
            seq: item.seq,
            start_at: item.start_at,
            end_at: item.end_at(),
            cancelled_at: None,
        });
        Ok(())
    }

    fn cancel_all(&mut self) {
        let mut state = self.state.lock();
        let now = state.now;
        for span in state.spans.iter_mut() {
            if span.cancelled_at.is_none() && span.end_at > now {
                span.cancelled_at = Some(now);
            }
        }
        state.cancels += 1;
    }

    fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state
            .spans
            .iter()
            .any(|s| s.cancelled_at.is_none() && s.end_at > state.now)
    }
}

impl VirtualTimelineProbe {
    pub fn now(&self) -> f64 {
        self.state.lock().now
    }

    pub fn advance(&self, secs: f64) {
        self.state.lock().now += secs.max(0.0);
    }

    pub fn set_now(&self, now: f64) {
        self.state.lock().now = now;
    }

    /// Every span ever scheduled, in scheduling order.
    pub fn spans(&self) -> Vec<ScheduledSpan> {
        self.state.lock().spans.clone()
    }

    /// Spans not cancelled.
    pub fn live_spans(&self) -> Vec<ScheduledSpan> {
        self.spans()
            .into_iter()
            .filter(|s| s.cancelled_at.is_none())
            .collect()
    }

    pub fn cancel_count(&self) -> u32 {
        self.state.lock().cancels
    }

    /// Total seconds rendered or still to render.
    pub fn rendered_secs(&self) -> f64 {
        self.spans().iter().map(ScheduledSpan::rendered_secs).sum()
    }
}
