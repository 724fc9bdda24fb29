//! Remote streaming-session abstraction.
//!
//! A `RemoteChannel` carries outbound microphone audio, activity signals and
//! text annotations, and reports inbound session events on a crossbeam
//! `Sender<RemoteEvent>` handed over at `open`. The transport and the
//! authentication handshake stay behind the trait.

pub mod echo;
pub mod memory;
pub mod wire;

pub use echo::EchoTransport;
pub use memory::{MemoryChannel, MemoryRemote, OutboundMessage};
pub use wire::{TransportEvent, WireChannel, WireCodec, WireTransport};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Activity boundary markers sent to the remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlSignal {
    ActivityStart,
    ActivityEnd,
}

/// Inbound events from the remote session, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// Session is ready for input.
    Opened,
    /// Encoded PCM16 audio at the session's declared inbound rate.
    AudioChunk(Vec<u8>),
    /// The remote cut its own reply short.
    Interrupted,
    /// The remote finished its reply.
    TurnComplete,
    /// Transport or protocol failure.
    Error(String),
    /// The remote closed the session.
    Closed,
}

/// Bidirectional message channel to the remote speech model.
pub trait RemoteChannel: Send {
    /// Connect and start delivering inbound events to `events`.
    ///
    /// Completion is asynchronous: the channel is ready once
    /// `RemoteEvent::Opened` arrives.
    fn open(&mut self, events: Sender<RemoteEvent>) -> Result<()>;

    /// Send PCM16 little-endian microphone audio.
    fn send_audio(&mut self, pcm16: &[u8]) -> Result<()>;

    fn send_control(&mut self, signal: ControlSignal) -> Result<()>;

    /// Send contextual text, optionally marking the user turn complete.
    fn send_annotation(&mut self, text: &str, turn_complete: bool) -> Result<()>;

    /// Close the session. Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}
