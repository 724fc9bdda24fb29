//! Gapless, interruption-aware playback of inbound remote audio.
//!
//! Two interchangeable strategies implement [`PlaybackScheduler`]:
//!
//! | Strategy | Ordering enforced by | Backends |
//! |----------|---------------------|----------|
//! | [`TimelineScheduler`] | explicit start times on an output clock | `CpalTimelineOutput`, `VirtualTimeline` |
//! | [`SequentialScheduler`] | the sink's FIFO | `CpalStreamSink`, `MemoryStreamSink` |
//!
//! Both render chunks in arrival order, never overlap them, and make `flush()`
//! effective immediately.

pub mod cpal_out;
pub mod sequential;
pub mod timeline;

pub use cpal_out::{CpalStreamSink, CpalTimelineOutput};
pub use sequential::{MemorySinkProbe, MemoryStreamSink, SequentialScheduler, StreamSink};
pub use timeline::{
    ScheduledSpan, TimelineOutput, TimelineScheduler, VirtualTimeline, VirtualTimelineProbe,
};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A decoded buffer with its intended start on the output clock.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackItem {
    pub seq: u64,
    /// Mono samples at `sample_rate`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Start offset in seconds on the output clock.
    pub start_at: f64,
}

impl PlaybackItem {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration_secs()
    }
}

/// Counters kept by every scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStats {
    /// Chunks accepted for playback.
    pub enqueued: u64,
    /// Chunks dropped because they failed to decode.
    pub dropped: u64,
    /// Flushes that discarded pending audio.
    pub flushes: u64,
    /// Seconds of audio accepted.
    pub enqueued_secs: f64,
}

/// Contract shared by both playback strategies.
pub trait PlaybackScheduler: Send {
    /// Decode and queue one inbound PCM16 chunk behind everything already queued.
    ///
    /// # Errors
    /// `Decode` for a malformed chunk. The chunk is dropped; later chunks
    /// still play.
    fn enqueue(&mut self, chunk: &[u8]) -> Result<()>;

    /// Halt pending and in-flight audio now and reset timing state.
    fn flush(&mut self);

    /// Flush if anything is pending. Safe to call repeatedly.
    fn stop(&mut self);

    /// The current burst has ended; let queued audio play out and push any
    /// buffered conversion tail.
    fn finish_burst(&mut self);

    /// `true` while audio is audible or queued.
    fn is_playing(&self) -> bool;

    fn stats(&self) -> PlaybackStats;
}
