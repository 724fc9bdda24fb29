//! # vocalad-core
//!
//! Real-time voice turn engine: microphone capture, per-frame acoustic
//! analysis, a turn-taking protocol with a remote speech model, and gapless
//! playback of the model's reply.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CaptureSource → SPSC RingBuffer → framing thread
//!                                                    │ AudioFrame (16 kHz)
//!                                                    ▼
//!                                          SessionCore (driver thread)
//!                                   ┌────────────────┼─────────────────┐
//!                           FeatureExtractor   TurnController    RemoteChannel
//!                           + TurnAggregator         │          (audio out, events in)
//!                                                    ▼
//!                                           PlaybackScheduler → output device
//!                                                    │
//!                              broadcast::Sender<SessionStatusEvent / …>
//! ```
//!
//! Audio callbacks never allocate or block: scratch buffers are reserved before
//! the stream starts and played-out voice buffers return to the session side.
//! All protocol work happens on the session driver thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod analysis;
pub mod audio;
pub mod buffering;
pub mod config;
pub mod error;
pub mod events;
pub mod inference;
pub mod playback;
pub mod remote;
pub mod session;
pub mod turn;
pub mod vad;

// Convenience re-exports for downstream crates
pub use analysis::{AcousticMetrics, FeatureExtractor};
pub use audio::{CaptureSettings, CaptureSource, CpalCapture, ReplayCapture};
pub use buffering::frame::AudioFrame;
pub use config::{PlaybackStrategy, SessionConfig};
pub use error::{Result, VocaladError};
pub use events::{AudioActivityEvent, SessionStatusEvent, TurnSummaryEvent};
pub use inference::{ModelHandle, PhonemeRecognizer, StubRecognizer};
pub use playback::{PlaybackScheduler, PlaybackStats};
pub use remote::{ControlSignal, MemoryChannel, MemoryRemote, RemoteChannel, RemoteEvent};
pub use session::{DiagnosticsSnapshot, SessionComponents, SessionOrchestrator};
pub use turn::{TurnAggregator, TurnController, TurnState, TurnSummary, WordRateStrategy};
