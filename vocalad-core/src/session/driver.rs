//! Single-threaded session core and its driver loop.
//!
//! ## Data flow (one thread)
//!
//! ```text
//! capture thread ──frames──▶ ┐
//! remote channel ──events──▶ ├─ select! ─▶ SessionCore ─▶ TurnController::apply
//! orchestrator  ──commands─▶ ┘                 │
//!                                              ├─▶ RemoteChannel (audio, control, annotation)
//!                                              └─▶ PlaybackScheduler (enqueue, flush)
//! ```
//!
//! Every side effect of a transition is executed here, in the order the
//! controller listed it. Each frame is handed as `&AudioFrame` to the
//! analyzer, the aggregator and the encoder; none of them mutate it.

use std::sync::{
    atomic::{AtomicU32, AtomicUsize, Ordering},
    Arc,
};

use crossbeam_channel::{never, select, Receiver};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::{
    analysis::FeatureExtractor,
    audio::pcm::encode_pcm16_le,
    buffering::frame::AudioFrame,
    config::SessionConfig,
    events::{AudioActivityEvent, SessionStatusEvent, TurnSummaryEvent},
    playback::PlaybackScheduler,
    remote::{ControlSignal, RemoteChannel, RemoteEvent},
    turn::{
        Transition, TurnAction, TurnAggregator, TurnController, TurnEvent, TurnState,
        WordRateStrategy,
    },
};

/// Broadcast channel capacity for every session event stream.
pub const BROADCAST_CAP: usize = 256;

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Atomic counters shared between the driver thread and the orchestrator.
#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub frames_in: AtomicUsize,
    pub frames_forwarded: AtomicUsize,
    pub speech_frames: AtomicUsize,
    pub inbound_chunks: AtomicUsize,
    pub chunks_ignored: AtomicUsize,
    pub protocol_violations: AtomicUsize,
    pub turns_completed: AtomicUsize,
    pub interruptions: AtomicUsize,
    pub channel_errors: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        for counter in [
            &self.frames_in,
            &self.frames_forwarded,
            &self.speech_frames,
            &self.inbound_chunks,
            &self.chunks_ignored,
            &self.protocol_violations,
            &self.turns_completed,
            &self.interruptions,
            &self.channel_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            speech_frames: self.speech_frames.load(Ordering::Relaxed),
            inbound_chunks: self.inbound_chunks.load(Ordering::Relaxed),
            chunks_ignored: self.chunks_ignored.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            channel_errors: self.channel_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_in: usize,
    pub frames_forwarded: usize,
    pub speech_frames: usize,
    pub inbound_chunks: usize,
    pub chunks_ignored: usize,
    pub protocol_violations: usize,
    pub turns_completed: usize,
    pub interruptions: usize,
    pub channel_errors: usize,
}

// ---------------------------------------------------------------------------
// Signals shared with the orchestrator
// ---------------------------------------------------------------------------

/// Observable session state: written by the core, read by the caller.
pub struct SessionSignals {
    state: Mutex<TurnState>,
    /// Meter level as `f32` bits.
    level: AtomicU32,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    activity_tx: broadcast::Sender<AudioActivityEvent>,
    summary_tx: broadcast::Sender<TurnSummaryEvent>,
    pub diagnostics: SessionDiagnostics,
}

impl Default for SessionSignals {
    fn default() -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (summary_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            state: Mutex::new(TurnState::Idle),
            level: AtomicU32::new(0),
            status_tx,
            activity_tx,
            summary_tx,
            diagnostics: SessionDiagnostics::default(),
        }
    }
}

impl SessionSignals {
    pub fn state(&self) -> TurnState {
        *self.state.lock()
    }

    pub fn audio_level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.activity_tx.subscribe()
    }

    pub fn subscribe_summaries(&self) -> broadcast::Receiver<TurnSummaryEvent> {
        self.summary_tx.subscribe()
    }

    pub(crate) fn set_state(&self, state: TurnState, detail: Option<String>) {
        *self.state.lock() = state;
        let _ = self.status_tx.send(SessionStatusEvent { state, detail });
    }

    fn set_level(&self, level: f32) {
        self.level.store(level.to_bits(), Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

/// Caller commands delivered to the driver thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    EndTurn,
    Stop,
}

/// Dispatch point owning the controller and everything its actions touch.
pub struct SessionCore {
    controller: TurnController,
    extractor: FeatureExtractor,
    aggregator: TurnAggregator,
    channel: Box<dyn RemoteChannel>,
    playback: Box<dyn PlaybackScheduler>,
    word_rate: WordRateStrategy,
    signals: Arc<SessionSignals>,
    annotation_prefix: String,
    meter_gain: f32,
    turn: u64,
    turn_span: Span,
}

impl SessionCore {
    pub fn new(
        config: &SessionConfig,
        channel: Box<dyn RemoteChannel>,
        playback: Box<dyn PlaybackScheduler>,
        word_rate: WordRateStrategy,
        signals: Arc<SessionSignals>,
    ) -> Self {
        Self {
            controller: TurnController::new(config.channel_error_policy),
            extractor: FeatureExtractor::new(
                config.analysis_settings(),
                config.capture_sample_rate,
            ),
            aggregator: TurnAggregator::new(config.capture_sample_rate),
            channel,
            playback,
            word_rate,
            signals,
            annotation_prefix: config.annotation_prefix.clone(),
            meter_gain: config.meter_gain,
            turn: 0,
            turn_span: Span::none(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.controller.state()
    }

    pub fn is_closed(&self) -> bool {
        self.controller.state() == TurnState::Closed
    }

    pub fn playback(&self) -> &dyn PlaybackScheduler {
        self.playback.as_ref()
    }

    /// Give back the exclusively owned components.
    pub fn into_parts(
        self,
    ) -> (
        Box<dyn RemoteChannel>,
        Box<dyn PlaybackScheduler>,
        WordRateStrategy,
    ) {
        (self.channel, self.playback, self.word_rate)
    }

    /// Analyse one captured frame and forward it if the user holds the turn.
    pub fn on_frame(&mut self, frame: AudioFrame) {
        let span = self.turn_span.clone();
        let _entered = span.enter();
        let diag = &self.signals.diagnostics;
        diag.frames_in.fetch_add(1, Ordering::Relaxed);

        let metrics = self.extractor.analyze(&frame);
        let level = (metrics.rms * self.meter_gain).clamp(0.0, 1.0);
        self.signals.set_level(level);
        let _ = self.signals.activity_tx.send(AudioActivityEvent {
            seq: frame.seq,
            rms: metrics.rms,
            level,
            is_speech: metrics.is_speech,
            pitch_hz: metrics.pitch_hz,
        });

        if !self.controller.should_forward_audio() {
            return;
        }
        if metrics.is_speech {
            diag.speech_frames.fetch_add(1, Ordering::Relaxed);
        }
        self.aggregator.push(metrics);
        self.aggregator.push_samples(&frame);
        match self.channel.send_audio(&encode_pcm16_le(&frame.samples)) {
            Ok(()) => {
                diag.frames_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(seq = frame.seq, "outbound audio not sent: {e}"),
        }
    }

    pub fn on_remote(&mut self, event: RemoteEvent) {
        let span = self.turn_span.clone();
        let _entered = span.enter();
        let diag = &self.signals.diagnostics;
        match event {
            RemoteEvent::Opened => {
                info!("remote session opened");
                let t = self.controller.apply(TurnEvent::ChannelOpened);
                self.execute(t, None);
            }
            RemoteEvent::AudioChunk(bytes) => {
                diag.inbound_chunks.fetch_add(1, Ordering::Relaxed);
                let t = self.controller.apply(TurnEvent::AudioChunk);
                if !t.actions.contains(&TurnAction::ForwardToPlayback) {
                    diag.chunks_ignored.fetch_add(1, Ordering::Relaxed);
                    debug!(bytes = bytes.len(), state = %t.from, "inbound chunk ignored");
                }
                self.execute(t, Some(&bytes));
            }
            RemoteEvent::Interrupted => {
                let t = self.controller.apply(TurnEvent::Interrupted);
                if t.via == Some(TurnState::Interrupted) {
                    diag.interruptions.fetch_add(1, Ordering::Relaxed);
                    info!("remote reply interrupted");
                }
                self.execute(t, None);
            }
            RemoteEvent::TurnComplete => {
                let t = self.controller.apply(TurnEvent::TurnComplete);
                if t.changed() {
                    diag.turns_completed.fetch_add(1, Ordering::Relaxed);
                    info!("remote turn complete");
                }
                self.execute(t, None);
            }
            RemoteEvent::Error(message) => {
                diag.channel_errors.fetch_add(1, Ordering::Relaxed);
                error!("remote channel error: {message}");
                let t = self.controller.apply(TurnEvent::ChannelError(message));
                self.execute(t, None);
            }
            RemoteEvent::Closed => {
                info!("remote session closed");
                let t = self.controller.apply(TurnEvent::ChannelClosed);
                self.execute(t, None);
            }
        }
    }

    /// The user's turn is over.
    pub fn end_turn(&mut self) {
        let span = self.turn_span.clone();
        let _entered = span.enter();
        let t = self.controller.apply(TurnEvent::EndTurn);
        self.execute(t, None);
    }

    /// Flush playback and close the channel. Idempotent.
    pub fn stop(&mut self) {
        let t = self.controller.apply(TurnEvent::Stop);
        self.execute(t, None);
        self.turn_span = Span::none();
    }

    fn execute(&mut self, t: Transition, chunk: Option<&[u8]>) {
        if t.violation.is_some() {
            self.signals
                .diagnostics
                .protocol_violations
                .fetch_add(1, Ordering::Relaxed);
        }

        let mut detail = None;
        for action in &t.actions {
            match action {
                TurnAction::StartActivity => {
                    self.turn += 1;
                    self.turn_span = info_span!("turn", turn = self.turn);
                    self.send_control(ControlSignal::ActivityStart);
                    self.turn_span.in_scope(|| info!("listening"));
                }
                TurnAction::EndActivity => self.send_control(ControlSignal::ActivityEnd),
                TurnAction::SendTurnSummary => self.send_summary(),
                TurnAction::ForwardToPlayback => {
                    if let Some(bytes) = chunk {
                        if let Err(e) = self.playback.enqueue(bytes) {
                            warn!(bytes = bytes.len(), "inbound chunk dropped: {e}");
                        }
                    }
                }
                TurnAction::FlushPlayback => {
                    if t.to == TurnState::Closed {
                        self.playback.stop();
                    } else {
                        self.playback.flush();
                    }
                }
                TurnAction::FinishPlaybackBurst => self.playback.finish_burst(),
                TurnAction::ResetTurn => {
                    self.aggregator.reset();
                    self.word_rate.reset();
                }
                TurnAction::CloseSession => {
                    self.channel.close();
                    let snap = self.signals.diagnostics.snapshot();
                    info!(
                        frames_in = snap.frames_in,
                        frames_forwarded = snap.frames_forwarded,
                        inbound_chunks = snap.inbound_chunks,
                        turns_completed = snap.turns_completed,
                        interruptions = snap.interruptions,
                        protocol_violations = snap.protocol_violations,
                        "session closed"
                    );
                }
                TurnAction::SurfaceError(message) => detail = Some(message.clone()),
            }
        }

        if let Some(via) = t.via {
            self.signals.set_state(via, None);
        }
        if t.changed() || t.via.is_some() || detail.is_some() {
            self.signals.set_state(t.to, detail);
        }
    }

    fn send_control(&mut self, signal: ControlSignal) {
        if let Err(e) = self.channel.send_control(signal) {
            warn!(?signal, "control signal not sent: {e}");
        }
    }

    fn send_summary(&mut self) {
        let duration = self.aggregator.captured_secs();
        let summary = self.aggregator.finalize(duration, &self.word_rate);
        info!(
            words = summary.word_count,
            wpm = summary.words_per_minute,
            duration_secs = summary.duration_secs,
            speech_frames = summary.speech_frames,
            source = ?summary.estimate_source,
            "turn summary"
        );
        match serde_json::to_string(&summary) {
            Ok(json) => {
                let text = format!("{}{json}", self.annotation_prefix);
                if let Err(e) = self.channel.send_annotation(&text, true) {
                    warn!("turn summary not sent: {e}");
                }
            }
            Err(e) => warn!("turn summary not serialized: {e}"),
        }
        let _ = self.signals.summary_tx.send(TurnSummaryEvent {
            seq: self.turn,
            summary,
        });
    }
}

/// Drive `core` until it closes or `Command::Stop` arrives, then return it.
pub fn run(
    mut core: SessionCore,
    frames: Receiver<AudioFrame>,
    remote: Receiver<RemoteEvent>,
    commands: Receiver<Command>,
) -> SessionCore {
    let mut frames = frames;
    let mut remote = remote;
    info!("session driver started");

    while !core.is_closed() {
        select! {
            recv(frames) -> msg => match msg {
                Ok(frame) => core.on_frame(frame),
                Err(_) => {
                    debug!("capture disconnected");
                    frames = never();
                }
            },
            recv(remote) -> msg => match msg {
                Ok(event) => core.on_remote(event),
                Err(_) => {
                    debug!("remote event stream disconnected");
                    remote = never();
                }
            },
            recv(commands) -> msg => match msg {
                Ok(Command::EndTurn) => {
                    // Frames captured before the call belong to this turn.
                    while let Ok(frame) = frames.try_recv() {
                        core.on_frame(frame);
                    }
                    core.end_turn();
                }
                Ok(Command::Stop) | Err(_) => {
                    core.stop();
                }
            },
        }
    }

    info!(state = %core.state(), "session driver stopped");
    core
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::N_MFCC,
        audio::pcm::{encode_pcm16_le, Pcm16Decoder},
        playback::{TimelineScheduler, VirtualTimeline, VirtualTimelineProbe},
        remote::{MemoryChannel, MemoryRemote, OutboundMessage},
        turn::TurnSummary,
    };
    use approx::assert_relative_eq;

    struct Harness {
        core: SessionCore,
        remote: MemoryRemote,
        timeline: VirtualTimelineProbe,
        signals: Arc<SessionSignals>,
        events: Receiver<RemoteEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let config = SessionConfig::default();
            let (mut channel, remote) = MemoryChannel::pair();
            let (tx, events) = crossbeam_channel::unbounded();
            channel.open(tx).unwrap();
            let (output, timeline) = VirtualTimeline::new();
            let playback = TimelineScheduler::new(
                output,
                Pcm16Decoder::new(config.inbound_sample_rate, 1),
                config.stabilization_secs(),
            );
            let signals = Arc::new(SessionSignals::default());
            let core = SessionCore::new(
                &config,
                Box::new(channel),
                Box::new(playback),
                WordRateStrategy::default(),
                Arc::clone(&signals),
            );
            Self {
                core,
                remote,
                timeline,
                signals,
                events,
            }
        }

        fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.core.on_remote(event);
            }
        }

        fn frame(seq: u64, value: f32) -> AudioFrame {
            AudioFrame::new(seq, vec![value; 2048], 16_000)
        }

        fn chunk_100ms() -> Vec<u8> {
            encode_pcm16_le(&vec![-0.25; 2400])
        }
    }

    fn summary_from(remote: &MemoryRemote) -> TurnSummary {
        let (text, complete) = remote.annotations().pop().expect("annotation sent");
        assert!(complete);
        let json = text.strip_prefix("SYSTEM_METRICS: ").expect("prefix");
        serde_json::from_str(json).expect("summary json")
    }

    #[test]
    fn opened_starts_listening_with_one_activity_start() {
        let mut h = Harness::new();
        h.pump();
        assert_eq!(h.core.state(), TurnState::Listening);
        assert_eq!(h.signals.state(), TurnState::Listening);
        assert_eq!(h.remote.control_signals(), vec![ControlSignal::ActivityStart]);
    }

    #[test]
    fn frames_are_forwarded_only_while_listening() {
        let mut h = Harness::new();
        h.core.on_frame(Harness::frame(0, 0.0));
        assert_eq!(h.remote.audio_message_count(), 0);

        h.pump();
        h.core.on_frame(Harness::frame(1, 0.0));
        h.core.end_turn();
        h.core.on_frame(Harness::frame(2, 0.0));
        assert_eq!(h.remote.audio_message_count(), 1);

        let snap = h.signals.diagnostics.snapshot();
        assert_eq!(snap.frames_in, 3);
        assert_eq!(snap.frames_forwarded, 1);
    }

    #[test]
    fn silent_turn_reports_zero_words() {
        let mut h = Harness::new();
        h.pump();
        for seq in 0..50 {
            h.core.on_frame(Harness::frame(seq, 0.001));
        }
        h.core.end_turn();
        assert_eq!(h.core.state(), TurnState::AwaitingReply);

        let summary = summary_from(&h.remote);
        assert_eq!(summary.word_count, 0);
        assert_eq!(summary.words_per_minute, 0.0);
        assert_eq!(summary.total_frames, 50);
        assert_eq!(summary.speech_frames, 0);
        assert_eq!(summary.avg_mfcc, [0.0; N_MFCC]);
        assert_relative_eq!(summary.duration_secs, 50.0 * 2048.0 / 16_000.0);
        assert_eq!(
            h.remote.control_signals(),
            vec![ControlSignal::ActivityStart, ControlSignal::ActivityEnd]
        );
    }

    #[test]
    fn reply_chunks_play_back_to_back() {
        let mut h = Harness::new();
        h.pump();
        h.core.end_turn();
        for _ in 0..3 {
            h.core.on_remote(RemoteEvent::AudioChunk(Harness::chunk_100ms()));
        }
        assert_eq!(h.core.state(), TurnState::Responding);
        let spans = h.timeline.live_spans();
        assert_eq!(spans.len(), 3);
        assert_relative_eq!(spans[0].start_at, 0.05, epsilon = 1e-9);
        assert_relative_eq!(spans[1].start_at, spans[0].end_at, epsilon = 1e-9);
        assert_relative_eq!(spans[2].start_at, spans[1].end_at, epsilon = 1e-9);
        assert_relative_eq!(spans[2].end_at - spans[0].start_at, 0.3, epsilon = 1e-9);
    }

    #[test]
    fn interruption_flushes_and_relistens() {
        let mut h = Harness::new();
        h.pump();
        h.core.end_turn();
        h.core.on_remote(RemoteEvent::AudioChunk(Harness::chunk_100ms()));
        h.core.on_remote(RemoteEvent::AudioChunk(Harness::chunk_100ms()));
        h.timeline.advance(0.1);
        let mut status = h.signals.subscribe_status();

        h.core.on_remote(RemoteEvent::Interrupted);
        assert_eq!(h.core.state(), TurnState::Listening);
        assert!(!h.core.playback().is_playing());
        assert_eq!(status.try_recv().unwrap().state, TurnState::Interrupted);
        assert_eq!(status.try_recv().unwrap().state, TurnState::Listening);
        assert_eq!(h.signals.diagnostics.snapshot().interruptions, 1);

        let starts = h
            .remote
            .control_signals()
            .into_iter()
            .filter(|c| *c == ControlSignal::ActivityStart)
            .count();
        assert_eq!(starts, 2);
    }

    #[test]
    fn audio_while_listening_is_ignored() {
        let mut h = Harness::new();
        h.pump();
        h.core.on_remote(RemoteEvent::AudioChunk(Harness::chunk_100ms()));
        assert_eq!(h.core.state(), TurnState::Listening);
        assert!(h.timeline.spans().is_empty());
        let snap = h.signals.diagnostics.snapshot();
        assert_eq!(snap.chunks_ignored, 1);
        assert_eq!(snap.protocol_violations, 1);
    }

    #[test]
    fn repeated_turn_complete_sends_one_activity_start() {
        let mut h = Harness::new();
        h.pump();
        h.core.end_turn();
        h.remote.clear_outbound();
        h.core.on_remote(RemoteEvent::TurnComplete);
        h.core.on_remote(RemoteEvent::TurnComplete);
        assert_eq!(h.remote.control_signals(), vec![ControlSignal::ActivityStart]);
        assert_eq!(h.signals.diagnostics.snapshot().turns_completed, 1);
    }

    #[test]
    fn channel_error_closes_and_surfaces_detail() {
        let mut h = Harness::new();
        h.pump();
        let mut status = h.signals.subscribe_status();
        h.core.on_remote(RemoteEvent::Error("token expired".into()));
        assert!(h.core.is_closed());
        assert!(!h.remote.is_open());
        let event = status.try_recv().unwrap();
        assert_eq!(event.state, TurnState::Closed);
        assert_eq!(event.detail.as_deref(), Some("token expired"));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut h = Harness::new();
        h.pump();
        h.core.stop();
        h.core.stop();
        assert!(h.core.is_closed());
        assert_eq!(h.signals.diagnostics.snapshot().protocol_violations, 0);
        assert!(!h
            .remote
            .outbound()
            .iter()
            .any(|m| matches!(m, OutboundMessage::Annotation { .. })));
    }

    #[test]
    fn driver_processes_pending_frames_before_end_turn() {
        let h = Harness::new();
        let (frame_tx, frame_rx) = crossbeam_channel::unbounded();
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let remote = h.remote.clone();
        let events = h.events.clone();
        let core = h.core;

        let driver = std::thread::spawn(move || run(core, frame_rx, events, cmd_rx));
        assert!(remote.wait_until(std::time::Duration::from_secs(2), |m| !m.is_empty()));
        for seq in 0..10 {
            frame_tx.send(Harness::frame(seq, 0.0)).unwrap();
        }
        cmd_tx.send(Command::EndTurn).unwrap();
        assert!(remote.wait_until(std::time::Duration::from_secs(2), |m| {
            m.iter()
                .any(|x| matches!(x, OutboundMessage::Annotation { .. }))
        }));
        cmd_tx.send(Command::Stop).unwrap();
        let core = driver.join().unwrap();
        assert!(core.is_closed());
        assert_eq!(summary_from(&remote).total_frames, 10);
        assert_eq!(remote.audio_message_count(), 10);
    }
}
