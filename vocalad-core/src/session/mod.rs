//! `SessionOrchestrator`: caller-facing lifecycle of one voice session.
//!
//! ## Lifecycle
//!
//! ```text
//! SessionOrchestrator::new(config, components)
//!     └─► start_session()  → capture started, channel opened, driver spawned
//!         │                  (Listening once the remote reports Opened)
//!         ├─► end_turn()   → activity end + turn summary, await the reply
//!         └─► stop_all()   → driver closes the channel, capture released,
//!                            components handed back for the next session
//! ```
//!
//! `start_session` blocks only until capture and channel `open` return; the
//! channel reports readiness asynchronously. `end_turn` and `stop_all` never
//! fail: calling them in the wrong state is a logged no-op.
//!
//! ## Threading
//!
//! The capture source delivers frames on its own thread into a crossbeam
//! channel. One driver thread owns the [`SessionCore`] and multiplexes frames,
//! remote events and caller commands. The orchestrator itself is `Send + Sync`
//! and can be shared behind an `Arc`.

pub mod driver;

pub use driver::{
    Command, DiagnosticsSnapshot, SessionCore, SessionDiagnostics, SessionSignals, BROADCAST_CAP,
};

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    audio::CaptureSource,
    config::SessionConfig,
    error::{Result, VocaladError},
    events::{AudioActivityEvent, SessionStatusEvent, TurnSummaryEvent},
    playback::PlaybackScheduler,
    remote::RemoteChannel,
    turn::{TurnState, WordRateStrategy},
};

/// Everything a session owns exclusively.
pub struct SessionComponents {
    pub capture: Box<dyn CaptureSource>,
    pub channel: Box<dyn RemoteChannel>,
    pub playback: Box<dyn PlaybackScheduler>,
    pub word_rate: WordRateStrategy,
}

impl SessionComponents {
    pub fn new<C, R, P>(capture: C, channel: R, playback: P, word_rate: WordRateStrategy) -> Self
    where
        C: CaptureSource + 'static,
        R: RemoteChannel + 'static,
        P: PlaybackScheduler + 'static,
    {
        Self {
            capture: Box::new(capture),
            channel: Box::new(channel),
            playback: Box::new(playback),
            word_rate,
        }
    }

    /// Microphone capture and the configured playback strategy on the default
    /// (or preferred) devices. The remote channel is supplied by the host.
    ///
    /// # Errors
    /// Output device errors.
    #[cfg(feature = "audio-cpal")]
    pub fn with_devices(config: &SessionConfig, channel: Box<dyn RemoteChannel>) -> Result<Self> {
        use crate::{
            audio::{pcm::Pcm16Decoder, CpalCapture},
            config::PlaybackStrategy,
            playback::{CpalStreamSink, CpalTimelineOutput, SequentialScheduler, TimelineScheduler},
        };

        let decoder = Pcm16Decoder::new(config.inbound_sample_rate, 1);
        let output = config.preferred_output_device.as_deref();
        let playback: Box<dyn PlaybackScheduler> = match config.playback {
            PlaybackStrategy::Timeline => Box::new(TimelineScheduler::new(
                CpalTimelineOutput::open(output)?,
                decoder,
                config.stabilization_secs(),
            )),
            PlaybackStrategy::Sequential => Box::new(SequentialScheduler::new(
                CpalStreamSink::open(output, config.inbound_sample_rate)?,
                decoder,
            )),
        };
        info!(playback = ?config.playback, "output backend ready");
        Ok(Self {
            capture: Box::new(CpalCapture::new(config.capture_settings())),
            channel,
            playback,
            word_rate: config.word_rate_strategy(),
        })
    }
}

struct Running {
    commands: Sender<Command>,
    driver: JoinHandle<Option<SessionCore>>,
    capture: Box<dyn CaptureSource>,
}

pub struct SessionOrchestrator {
    config: SessionConfig,
    components: Mutex<Option<SessionComponents>>,
    running: Mutex<Option<Running>>,
    signals: Arc<SessionSignals>,
}

impl SessionOrchestrator {
    pub fn new(mut config: SessionConfig, components: SessionComponents) -> Self {
        config.normalize();
        Self {
            config,
            components: Mutex::new(Some(components)),
            running: Mutex::new(None),
            signals: Arc::new(SessionSignals::default()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Acquire capture, open the remote channel and start the driver.
    ///
    /// # Errors
    /// - `AlreadyRunning` if a session is active.
    /// - `PermissionDenied` if capture cannot start.
    /// - `Channel` if the remote channel cannot be opened.
    pub fn start_session(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(VocaladError::AlreadyRunning);
        }
        let mut components = self
            .components
            .lock()
            .take()
            .ok_or_else(|| VocaladError::Other(anyhow::anyhow!("session components unavailable")))?;

        self.signals.diagnostics.reset();
        self.signals.set_state(TurnState::Idle, None);

        let (frame_tx, frame_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let (command_tx, command_rx) = crossbeam_channel::unbounded();

        if let Err(e) = components.capture.start(Box::new(move |frame| {
            let _ = frame_tx.send(frame);
        })) {
            let e = match e {
                VocaladError::PermissionDenied(_) => e,
                other => VocaladError::PermissionDenied(other.to_string()),
            };
            return Err(self.abort_start(components, e));
        }

        if let Err(e) = components.channel.open(event_tx) {
            let e = match e {
                VocaladError::Channel(_) => e,
                other => VocaladError::Channel(other.to_string()),
            };
            return Err(self.abort_start(components, e));
        }

        let SessionComponents {
            capture,
            channel,
            playback,
            word_rate,
        } = components;
        let core = SessionCore::new(
            &self.config,
            channel,
            playback,
            word_rate,
            Arc::clone(&self.signals),
        );
        // The core stays reachable here until the driver thread takes it.
        let slot = Arc::new(Mutex::new(Some(core)));
        let handoff = Arc::clone(&slot);
        let spawned = std::thread::Builder::new()
            .name("vocalad-session".into())
            .spawn(move || {
                let core = handoff.lock().take();
                core.map(|core| driver::run(core, frame_rx, event_rx, command_rx))
            });
        let driver = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let e = VocaladError::Other(anyhow::anyhow!("spawn session driver: {e}"));
                return match slot.lock().take() {
                    Some(core) => {
                        let (channel, playback, word_rate) = core.into_parts();
                        let components = SessionComponents {
                            capture,
                            channel,
                            playback,
                            word_rate,
                        };
                        Err(self.abort_start(components, e))
                    }
                    None => Err(e),
                };
            }
        };

        *running = Some(Running {
            commands: command_tx,
            driver,
            capture,
        });
        info!("session started");
        Ok(())
    }

    /// Release whatever a failed start acquired and keep the components for a retry.
    fn abort_start(&self, mut components: SessionComponents, e: VocaladError) -> VocaladError {
        components.channel.close();
        components.capture.stop();
        error!("session failed to start: {e}");
        self.signals.set_state(TurnState::Idle, Some(e.to_string()));
        *self.components.lock() = Some(components);
        e
    }

    /// Close the user's turn. A no-op outside `Listening`.
    pub fn end_turn(&self) {
        match self.running.lock().as_ref() {
            Some(run) => {
                if run.commands.send(Command::EndTurn).is_err() {
                    warn!("end_turn after the session closed");
                }
            }
            None => warn!("end_turn without an active session"),
        }
    }

    /// Tear the session down in reverse acquisition order. Safe in any state.
    pub fn stop_all(&self) {
        let Some(run) = self.running.lock().take() else {
            return;
        };
        let Running {
            commands,
            driver,
            mut capture,
        } = run;

        let _ = commands.send(Command::Stop);
        let parts = match driver.join() {
            Ok(Some(core)) => Some(core.into_parts()),
            Ok(None) => None,
            Err(_) => {
                error!("session driver panicked");
                None
            }
        };
        capture.stop();

        match parts {
            Some((channel, playback, word_rate)) => {
                *self.components.lock() = Some(SessionComponents {
                    capture,
                    channel,
                    playback,
                    word_rate,
                });
            }
            None => self.signals.set_state(TurnState::Closed, None),
        }
        info!("session stopped");
    }

    /// `true` while a session runs and has not closed.
    pub fn is_active(&self) -> bool {
        self.running.lock().is_some() && self.signals.state() != TurnState::Closed
    }

    /// `true` while the user holds the turn.
    pub fn turn_in_progress(&self) -> bool {
        self.signals.state() == TurnState::Listening
    }

    pub fn remote_is_speaking(&self) -> bool {
        self.signals.state() == TurnState::Responding
    }

    /// Meter level in [0, 1] of the latest captured frame.
    pub fn audio_level(&self) -> f32 {
        if self.running.lock().is_none() {
            return 0.0;
        }
        self.signals.audio_level()
    }

    pub fn state(&self) -> TurnState {
        self.signals.state()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.signals.subscribe_status()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.signals.subscribe_activity()
    }

    pub fn subscribe_summaries(&self) -> broadcast::Receiver<TurnSummaryEvent> {
        self.signals.subscribe_summaries()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.signals.diagnostics.snapshot()
    }

    /// Take the components back. `None` while a session runs.
    pub fn take_components(&self) -> Option<SessionComponents> {
        self.components.lock().take()
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.stop_all();
    }
}
