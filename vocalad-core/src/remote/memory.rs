//! In-process remote session for tests and headless hosts.
//!
//! `MemoryChannel` is handed to the session; the paired `MemoryRemote` plays
//! the far side: it injects inbound events and inspects everything sent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{ControlSignal, RemoteChannel, RemoteEvent};
use crate::error::{Result, VocaladError};

/// One message the session sent to the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Audio(Vec<u8>),
    Control(ControlSignal),
    Annotation { text: String, turn_complete: bool },
}

#[derive(Default)]
struct Shared {
    outbound: Vec<OutboundMessage>,
    events: Option<Sender<RemoteEvent>>,
    open: bool,
    opened_count: u32,
    fail_open: Option<String>,
    auto_open: bool,
}

struct Inner {
    state: Mutex<Shared>,
    changed: Condvar,
}

/// Session-side half.
pub struct MemoryChannel {
    inner: Arc<Inner>,
}

/// Remote-side half.
#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

impl MemoryChannel {
    /// Create a connected pair. The remote reports `Opened` as soon as the
    /// session opens the channel unless `set_auto_open(false)` is called.
    pub fn pair() -> (MemoryChannel, MemoryRemote) {
        let inner = Arc::new(Inner {
            state: Mutex::new(Shared {
                auto_open: true,
                ..Shared::default()
            }),
            changed: Condvar::new(),
        });
        (
            MemoryChannel {
                inner: Arc::clone(&inner),
            },
            MemoryRemote { inner },
        )
    }

    fn record(&self, msg: OutboundMessage) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.open {
            return Err(VocaladError::ChannelNotOpen);
        }
        state.outbound.push(msg);
        self.inner.changed.notify_all();
        Ok(())
    }
}

impl RemoteChannel for MemoryChannel {
    fn open(&mut self, events: Sender<RemoteEvent>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if let Some(reason) = state.fail_open.clone() {
            return Err(VocaladError::Channel(reason));
        }
        if state.auto_open {
            let _ = events.send(RemoteEvent::Opened);
        }
        state.events = Some(events);
        state.open = true;
        state.opened_count += 1;
        debug!("memory channel opened");
        self.inner.changed.notify_all();
        Ok(())
    }

    fn send_audio(&mut self, pcm16: &[u8]) -> Result<()> {
        self.record(OutboundMessage::Audio(pcm16.to_vec()))
    }

    fn send_control(&mut self, signal: ControlSignal) -> Result<()> {
        self.record(OutboundMessage::Control(signal))
    }

    fn send_annotation(&mut self, text: &str, turn_complete: bool) -> Result<()> {
        self.record(OutboundMessage::Annotation {
            text: text.to_string(),
            turn_complete,
        })
    }

    fn close(&mut self) {
        let mut state = self.inner.state.lock();
        if state.open {
            debug!("memory channel closed");
        }
        state.open = false;
        state.events = None;
        self.inner.changed.notify_all();
    }

    fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }
}

impl MemoryRemote {
    /// Deliver an inbound event. Returns `false` when the session is not listening.
    pub fn emit(&self, event: RemoteEvent) -> bool {
        let state = self.inner.state.lock();
        match &state.events {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn send_audio_chunk(&self, pcm16: Vec<u8>) -> bool {
        self.emit(RemoteEvent::AudioChunk(pcm16))
    }

    pub fn interrupt(&self) -> bool {
        self.emit(RemoteEvent::Interrupted)
    }

    pub fn complete_turn(&self) -> bool {
        self.emit(RemoteEvent::TurnComplete)
    }

    pub fn fail(&self, message: &str) -> bool {
        self.emit(RemoteEvent::Error(message.to_string()))
    }

    /// Remote-initiated close.
    pub fn hang_up(&self) -> bool {
        self.emit(RemoteEvent::Closed)
    }

    /// Make the next `open` fail with a channel error.
    pub fn set_fail_open(&self, reason: Option<&str>) {
        self.inner.state.lock().fail_open = reason.map(str::to_owned);
    }

    /// When `false`, the test must call `emit(RemoteEvent::Opened)` itself.
    pub fn set_auto_open(&self, on: bool) {
        self.inner.state.lock().auto_open = on;
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    pub fn opened_count(&self) -> u32 {
        self.inner.state.lock().opened_count
    }

    pub fn outbound(&self) -> Vec<OutboundMessage> {
        self.inner.state.lock().outbound.clone()
    }

    pub fn clear_outbound(&self) {
        self.inner.state.lock().outbound.clear();
    }

    pub fn control_signals(&self) -> Vec<ControlSignal> {
        self.outbound()
            .into_iter()
            .filter_map(|m| match m {
                OutboundMessage::Control(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn annotations(&self) -> Vec<(String, bool)> {
        self.outbound()
            .into_iter()
            .filter_map(|m| match m {
                OutboundMessage::Annotation {
                    text,
                    turn_complete,
                } => Some((text, turn_complete)),
                _ => None,
            })
            .collect()
    }

    pub fn audio_message_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .outbound
            .iter()
            .filter(|m| matches!(m, OutboundMessage::Audio(_)))
            .count()
    }

    /// Block until `pred` holds for the outbound log, or `timeout` elapses.
    pub fn wait_until<F>(&self, timeout: Duration, mut pred: F) -> bool
    where
        F: FnMut(&[OutboundMessage]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if pred(&state.outbound) {
                return true;
            }
            if self
                .inner
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return pred(&state.outbound);
            }
        }
    }
}
