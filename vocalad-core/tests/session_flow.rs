use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use vocalad_core::audio::pcm::{encode_pcm16_le, Pcm16Decoder};
use vocalad_core::audio::FrameCallback;
use vocalad_core::playback::{TimelineScheduler, VirtualTimeline, VirtualTimelineProbe};
use vocalad_core::remote::{OutboundMessage, TransportEvent, WireChannel, WireCodec, WireTransport};
use vocalad_core::{
    CaptureSource, ControlSignal, MemoryChannel, MemoryRemote, ReplayCapture, SessionComponents,
    SessionConfig, SessionOrchestrator, SessionStatusEvent, TurnState, TurnSummary,
    VocaladError, WordRateStrategy,
};

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    session: SessionOrchestrator,
    remote: MemoryRemote,
    timeline: VirtualTimelineProbe,
}

fn config() -> SessionConfig {
    SessionConfig {
        frame_len: 512,
        ..SessionConfig::default()
    }
}

fn silent_capture(config: &SessionConfig) -> ReplayCapture {
    ReplayCapture::from_samples(vec![0.0; 8_000], 16_000, config.capture_settings())
        .pad_with_silence(true)
}

fn rig_with_capture<C: CaptureSource + 'static>(capture: C) -> Rig {
    let config = config();
    let (channel, remote) = MemoryChannel::pair();
    let (output, timeline) = VirtualTimeline::new();
    let playback = TimelineScheduler::new(
        output,
        Pcm16Decoder::new(config.inbound_sample_rate, 1),
        config.stabilization_secs(),
    );
    let components =
        SessionComponents::new(capture, channel, playback, WordRateStrategy::default());
    Rig {
        session: SessionOrchestrator::new(config, components),
        remote,
        timeline,
    }
}

fn rig() -> Rig {
    let capture = silent_capture(&config());
    rig_with_capture(capture)
}

fn eventually<F: FnMut() -> bool>(mut pred: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}

fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Receive until at least `n` events arrived or the wait times out.
fn collect<T: Clone>(rx: &mut broadcast::Receiver<T>, n: usize) -> Vec<T> {
    let mut out = Vec::new();
    eventually(|| {
        out.extend(drain(rx));
        out.len() >= n
    });
    out
}

/// 100 ms of 24 kHz reply audio.
fn reply_chunk() -> Vec<u8> {
    encode_pcm16_le(&vec![-0.25; 2_400])
}

fn last_summary(remote: &MemoryRemote) -> TurnSummary {
    let (text, complete) = remote.annotations().pop().expect("annotation sent");
    assert!(complete);
    let json = text.strip_prefix("SYSTEM_METRICS: ").expect("annotation prefix");
    serde_json::from_str(json).expect("summary json")
}

fn start_listening(rig: &Rig) {
    rig.session.start_session().expect("session starts");
    assert!(eventually(|| rig.session.turn_in_progress()));
}

fn hand_over_turn(rig: &Rig) {
    rig.session.end_turn();
    assert!(eventually(|| rig.session.state() == TurnState::AwaitingReply));
}

#[test]
fn silent_turn_reports_zero_words() {
    let rig = rig();
    start_listening(&rig);
    assert!(rig
        .remote
        .wait_until(WAIT, |out| out
            .iter()
            .filter(|m| matches!(m, OutboundMessage::Audio(_)))
            .count()
            >= 50));

    rig.session.end_turn();
    assert!(rig.remote.wait_until(WAIT, |out| out
        .iter()
        .any(|m| matches!(m, OutboundMessage::Annotation { .. }))));

    let summary = last_summary(&rig.remote);
    assert_eq!(summary.word_count, 0);
    assert_eq!(summary.words_per_minute, 0.0);
    assert_eq!(summary.speech_frames, 0);
    assert!(summary.total_frames >= 50);
    assert!(summary.avg_pitch_hz.is_none());

    assert_eq!(
        rig.remote.control_signals(),
        vec![ControlSignal::ActivityStart, ControlSignal::ActivityEnd]
    );
    assert!(eventually(|| rig.session.state() == TurnState::AwaitingReply));
    rig.session.stop_all();
}

#[test]
fn end_turn_publishes_summary_event() {
    let rig = rig();
    let mut summaries = rig.session.subscribe_summaries();
    start_listening(&rig);
    hand_over_turn(&rig);

    let events = collect(&mut summaries, 1);
    assert_eq!(events.len(), 1);
    let sent = last_summary(&rig.remote);
    assert_eq!(events[0].seq, 1);
    assert_eq!(events[0].summary.total_frames, sent.total_frames);
    assert_eq!(events[0].summary.word_count, sent.word_count);
    rig.session.stop_all();
}

#[test]
fn reply_chunks_play_gaplessly() {
    let rig = rig();
    start_listening(&rig);
    hand_over_turn(&rig);

    for _ in 0..3 {
        assert!(rig.remote.send_audio_chunk(reply_chunk()));
    }
    assert!(eventually(|| rig.timeline.spans().len() == 3));
    assert!(rig.session.remote_is_speaking());

    let spans = rig.timeline.spans();
    assert!((spans[0].start_at - 0.05).abs() < 1e-9);
    for pair in spans.windows(2) {
        assert!((pair[1].start_at - pair[0].end_at).abs() < 1e-9);
    }
    assert!((spans[2].end_at - 0.35).abs() < 1e-9);

    assert!(rig.remote.complete_turn());
    assert!(eventually(|| rig.session.turn_in_progress()));
    assert_eq!(rig.session.diagnostics_snapshot().turns_completed, 1);
    rig.session.stop_all();
}

#[test]
fn interruption_cuts_playback_and_next_reply_restarts() {
    let rig = rig();
    let mut status = rig.session.subscribe_status();
    start_listening(&rig);
    hand_over_turn(&rig);

    for _ in 0..3 {
        rig.remote.send_audio_chunk(reply_chunk());
    }
    assert!(eventually(|| rig.timeline.spans().len() == 3));

    rig.timeline.set_now(0.12);
    drain(&mut status);
    assert!(rig.remote.interrupt());
    assert!(eventually(|| rig.timeline.cancel_count() == 1));
    assert!(eventually(|| rig.session.turn_in_progress()));
    assert!(rig.timeline.live_spans().len() <= 1);
    assert!(rig.timeline.rendered_secs() < 0.3);

    let states: Vec<TurnState> = collect(&mut status, 2).into_iter().map(|e| e.state).collect();
    assert_eq!(states[..2], [TurnState::Interrupted, TurnState::Listening]);

    hand_over_turn(&rig);
    rig.timeline.set_now(2.0);
    rig.remote.send_audio_chunk(reply_chunk());
    assert!(eventually(|| rig.timeline.spans().len() == 4));
    let restarted = rig.timeline.spans()[3].clone();
    assert!((restarted.start_at - 2.05).abs() < 1e-9);
    assert_eq!(rig.session.diagnostics_snapshot().interruptions, 1);
    rig.session.stop_all();
}

#[test]
fn channel_open_failure_is_reported_and_recoverable() {
    let rig = rig();
    let mut status = rig.session.subscribe_status();
    rig.remote.set_fail_open(Some("handshake refused"));

    let err = rig.session.start_session().unwrap_err();
    assert!(matches!(err, VocaladError::Channel(ref m) if m.contains("handshake refused")));
    assert!(!rig.session.is_active());
    assert_eq!(rig.session.audio_level(), 0.0);
    let last: Option<SessionStatusEvent> = drain(&mut status).pop();
    assert!(last.and_then(|e| e.detail).is_some());

    rig.remote.set_fail_open(None);
    start_listening(&rig);
    assert!(rig.session.is_active());
    rig.session.stop_all();
}

struct BlockedMicrophone;

impl CaptureSource for BlockedMicrophone {
    fn start(&mut self, _on_frame: FrameCallback) -> vocalad_core::Result<()> {
        Err(VocaladError::PermissionDenied("microphone access blocked".into()))
    }

    fn stop(&mut self) {}

    fn is_running(&self) -> bool {
        false
    }
}

#[test]
fn capture_failure_is_permission_denied() {
    let rig = rig_with_capture(BlockedMicrophone);
    let err = rig.session.start_session().unwrap_err();
    assert!(matches!(err, VocaladError::PermissionDenied(_)));
    assert_eq!(rig.remote.opened_count(), 0);
    assert!(!rig.session.is_active());
    assert!(rig.session.take_components().is_some());
}

struct UnpluggedMicrophone;

impl CaptureSource for UnpluggedMicrophone {
    fn start(&mut self, _on_frame: FrameCallback) -> vocalad_core::Result<()> {
        Err(VocaladError::NoDefaultInputDevice)
    }

    fn stop(&mut self) {}

    fn is_running(&self) -> bool {
        false
    }
}

#[test]
fn missing_input_device_reaches_caller_as_actionable_permission_error() {
    let rig = rig_with_capture(UnpluggedMicrophone);
    let err = rig.session.start_session().unwrap_err();
    assert!(matches!(err, VocaladError::PermissionDenied(ref m) if m.contains("no default input")));
    assert!(err.is_actionable());
}

/// Text transport that fails its first `failing_sends` sends and answers
/// `setup` with `setupComplete`.
struct FlakyTransport {
    inbound: Option<crossbeam_channel::Sender<TransportEvent>>,
    failing_sends: usize,
}

impl WireTransport for FlakyTransport {
    fn connect(
        &mut self,
        inbound: crossbeam_channel::Sender<TransportEvent>,
    ) -> vocalad_core::Result<()> {
        self.inbound = Some(inbound);
        Ok(())
    }

    fn send_text(&mut self, frame: String) -> vocalad_core::Result<()> {
        if self.failing_sends > 0 {
            self.failing_sends -= 1;
            return Err(VocaladError::Channel("socket reset".into()));
        }
        if frame.contains("\"setup\"") {
            if let Some(tx) = &self.inbound {
                let _ = tx.send(TransportEvent::Text(r#"{"setupComplete":{}}"#.into()));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.inbound = None;
    }
}

#[test]
fn failed_setup_send_can_be_retried() {
    let config = config();
    let channel = WireChannel::new(
        FlakyTransport {
            inbound: None,
            failing_sends: 1,
        },
        WireCodec::new(config.capture_sample_rate, config.inbound_sample_rate),
    );
    let (output, _timeline) = VirtualTimeline::new();
    let playback = TimelineScheduler::new(
        output,
        Pcm16Decoder::new(config.inbound_sample_rate, 1),
        config.stabilization_secs(),
    );
    let components = SessionComponents::new(
        silent_capture(&config),
        channel,
        playback,
        WordRateStrategy::default(),
    );
    let session = SessionOrchestrator::new(config, components);

    let err = session.start_session().unwrap_err();
    assert!(matches!(err, VocaladError::Channel(ref m) if m.contains("socket reset")));
    assert!(!session.is_active());

    session.start_session().expect("retry starts");
    assert!(eventually(|| session.turn_in_progress()));
    session.stop_all();
    assert_eq!(session.state(), TurnState::Closed);
}

#[test]
fn second_start_is_rejected() {
    let rig = rig();
    start_listening(&rig);
    assert!(matches!(
        rig.session.start_session(),
        Err(VocaladError::AlreadyRunning)
    ));
    rig.session.stop_all();
}

#[test]
fn stop_all_is_safe_in_any_state_and_allows_restart() {
    let rig = rig();
    rig.session.stop_all();
    rig.session.end_turn();

    start_listening(&rig);
    hand_over_turn(&rig);
    rig.remote.send_audio_chunk(reply_chunk());
    assert!(eventually(|| rig.session.remote_is_speaking()));

    rig.session.stop_all();
    assert_eq!(rig.session.state(), TurnState::Closed);
    assert!(!rig.session.is_active());
    assert!(!rig.remote.is_open());
    assert_eq!(rig.timeline.cancel_count(), 1);
    rig.session.stop_all();

    start_listening(&rig);
    assert_eq!(rig.remote.opened_count(), 2);
    assert_eq!(rig.session.diagnostics_snapshot().turns_completed, 0);
    rig.session.stop_all();
}

#[test]
fn remote_hang_up_closes_session() {
    let rig = rig();
    start_listening(&rig);
    assert!(rig.remote.hang_up());
    assert!(eventually(|| rig.session.state() == TurnState::Closed));
    assert!(!rig.session.is_active());
    rig.session.stop_all();
    assert!(rig.session.take_components().is_some());
}

#[test]
fn meter_tracks_captured_level() {
    let config = config();
    let tone: Vec<f32> = (0..16_000)
        .map(|i| 0.1 * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / 16_000.0).sin())
        .collect();
    let capture = ReplayCapture::from_samples(tone, 16_000, config.capture_settings());
    let rig = rig_with_capture(capture);
    let mut activity = rig.session.subscribe_activity();
    start_listening(&rig);

    assert!(eventually(|| rig.session.audio_level() > 0.2));
    assert!(rig.session.audio_level() <= 1.0);
    let events = drain(&mut activity);
    assert!(events.iter().any(|e| e.is_speech));
    rig.session.stop_all();
    assert_eq!(rig.session.audio_level(), 0.0);
}
