//! JSON wire protocol for live speech sessions.
//!
//! ## Outbound frames
//!
//! ```json
//! {"setup": {"model": "...", "realtimeInputConfig": {"automaticActivityDetection": {"disabled": true}}}}
//! {"realtimeInput": {"audio": {"mimeType": "audio/pcm;rate=16000", "data": "<base64>"}}}
//! {"realtimeInput": {"activityStart": {}}}
//! {"realtimeInput": {"activityEnd": {}}}
//! {"clientContent": {"turns": [{"role": "user", "parts": [{"text": "..."}]}], "turnComplete": true}}
//! ```
//!
//! ## Inbound frames
//!
//! `setupComplete`, `serverContent` (`modelTurn.parts[].inlineData`,
//! `interrupted`, `turnComplete`), `error`, `goAway`.
//!
//! `WireChannel` runs this codec over any [`WireTransport`] that moves text
//! frames. Network transport and authentication live in the transport.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ControlSignal, RemoteChannel, RemoteEvent};
use crate::error::{Result, VocaladError};

// ---------------------------------------------------------------------------
// Message shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_start: Option<Empty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_end: Option<Empty>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default)]
    pub realtime_input_config: serde_json::Value,
}

/// Any frame the client sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<Setup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime_input: Option<RealtimeInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_content: Option<ClientContent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
    #[serde(default)]
    pub code: Option<i64>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Any frame the server sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<Empty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServerError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub go_away: Option<GoAway>,
}

/// `audio/pcm;rate=24000` → `Some(24000)`.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    let mut parts = mime_type.split(';').map(str::trim);
    let base = parts.next()?;
    if !base.eq_ignore_ascii_case("audio/pcm") {
        return None;
    }
    parts
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, v)| v.trim().parse().ok())
}

pub fn pcm_mime(rate: u32) -> String {
    format!("audio/pcm;rate={rate}")
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Encodes client frames and decodes server frames.
#[derive(Debug, Clone)]
pub struct WireCodec {
    /// Rate of outbound microphone audio.
    pub outbound_rate: u32,
    /// Rate the session declared for inbound audio.
    pub inbound_rate: u32,
}

impl WireCodec {
    pub fn new(outbound_rate: u32, inbound_rate: u32) -> Self {
        Self {
            outbound_rate,
            inbound_rate,
        }
    }

    pub fn encode_setup(&self, model: Option<&str>, system_instruction: Option<&str>) -> Result<String> {
        let frame = ClientFrame {
            setup: Some(Setup {
                model: model.map(str::to_owned),
                system_instruction: system_instruction.map(|text| Content {
                    role: None,
                    parts: vec![Part {
                        text: Some(text.to_owned()),
                        inline_data: None,
                    }],
                }),
                realtime_input_config: serde_json::json!({
                    "automaticActivityDetection": { "disabled": true }
                }),
            }),
            ..ClientFrame::default()
        };
        Ok(serde_json::to_string(&frame)?)
    }

    pub fn encode_audio(&self, pcm16: &[u8]) -> Result<String> {
        let frame = ClientFrame {
            realtime_input: Some(RealtimeInput {
                audio: Some(Blob {
                    mime_type: pcm_mime(self.outbound_rate),
                    data: BASE64.encode(pcm16),
                }),
                ..RealtimeInput::default()
            }),
            ..ClientFrame::default()
        };
        Ok(serde_json::to_string(&frame)?)
    }

    pub fn encode_control(&self, signal: ControlSignal) -> Result<String> {
        let input = match signal {
            ControlSignal::ActivityStart => RealtimeInput {
                activity_start: Some(Empty {}),
                ..RealtimeInput::default()
            },
            ControlSignal::ActivityEnd => RealtimeInput {
                activity_end: Some(Empty {}),
                ..RealtimeInput::default()
            },
        };
        let frame = ClientFrame {
            realtime_input: Some(input),
            ..ClientFrame::default()
        };
        Ok(serde_json::to_string(&frame)?)
    }

    pub fn encode_annotation(&self, text: &str, turn_complete: bool) -> Result<String> {
        let frame = ClientFrame {
            client_content: Some(ClientContent {
                turns: vec![Content {
                    role: Some("user".into()),
                    parts: vec![Part {
                        text: Some(text.to_owned()),
                        inline_data: None,
                    }],
                }],
                turn_complete,
            }),
            ..ClientFrame::default()
        };
        Ok(serde_json::to_string(&frame)?)
    }

    /// Decode one server frame into the events it carries, in order.
    ///
    /// An audio part with bad base64 is dropped on its own; the rest of the
    /// frame still decodes.
    ///
    /// # Errors
    /// `Json` for unparseable frames.
    pub fn decode(&self, text: &str) -> Result<Vec<RemoteEvent>> {
        let frame: ServerFrame = serde_json::from_str(text)?;
        let mut events = Vec::new();

        if frame.setup_complete.is_some() {
            events.push(RemoteEvent::Opened);
        }
        if let Some(content) = frame.server_content {
            let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();
            for blob in parts.into_iter().filter_map(|p| p.inline_data) {
                match parse_pcm_rate(&blob.mime_type) {
                    Some(rate) if rate != self.inbound_rate => warn!(
                        declared = rate,
                        session = self.inbound_rate,
                        "inbound audio rate differs from session rate"
                    ),
                    None => warn!(mime = blob.mime_type.as_str(), "inbound part is not PCM audio"),
                    _ => {}
                }
                match BASE64.decode(blob.data.as_bytes()) {
                    Ok(bytes) => events.push(RemoteEvent::AudioChunk(bytes)),
                    Err(e) => {
                        warn!(bytes = blob.data.len(), "dropping undecodable audio part: {e}")
                    }
                }
            }
            if content.interrupted {
                events.push(RemoteEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(RemoteEvent::TurnComplete);
            }
        }
        if let Some(err) = frame.error {
            events.push(RemoteEvent::Error(match err.code {
                Some(code) => format!("{code}: {}", err.message),
                None => err.message,
            }));
        }
        if let Some(go_away) = frame.go_away {
            warn!(time_left = ?go_away.time_left, "remote announced shutdown");
        }
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Transport-backed channel
// ---------------------------------------------------------------------------

/// Transport-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Error(String),
    Closed(Option<String>),
}

/// Moves text frames to and from the remote service.
pub trait WireTransport: Send + 'static {
    /// Connect and start delivering inbound frames to `inbound`.
    fn connect(&mut self, inbound: Sender<TransportEvent>) -> Result<()>;

    fn send_text(&mut self, frame: String) -> Result<()>;

    /// Disconnect and drop the inbound sender.
    fn close(&mut self);
}

/// `RemoteChannel` implemented over the JSON codec and a text transport.
pub struct WireChannel<T: WireTransport> {
    transport: T,
    codec: WireCodec,
    model: Option<String>,
    system_instruction: Option<String>,
    open: bool,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl<T: WireTransport> WireChannel<T> {
    pub fn new(transport: T, codec: WireCodec) -> Self {
        Self {
            transport,
            codec,
            model: None,
            system_instruction: None,
            open: false,
            running: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_instruction(mut self, text: impl Into<String>) -> Self {
        self.system_instruction = Some(text.into());
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn send(&mut self, frame: Result<String>) -> Result<()> {
        if !self.open {
            return Err(VocaladError::ChannelNotOpen);
        }
        self.transport.send_text(frame?)
    }
}

/// Pump transport frames through the codec until closed.
fn read_loop(
    rx: Receiver<TransportEvent>,
    events: Sender<RemoteEvent>,
    codec: WireCodec,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        let event = match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                if running.load(Ordering::Relaxed) {
                    let _ = events.send(RemoteEvent::Closed);
                }
                break;
            }
        };
        match event {
            TransportEvent::Text(text) => match codec.decode(&text) {
                Ok(decoded) => {
                    for e in decoded {
                        if events.send(e).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = events.send(RemoteEvent::Error(format!("protocol: {e}")));
                }
            },
            TransportEvent::Error(msg) => {
                let _ = events.send(RemoteEvent::Error(msg));
            }
            TransportEvent::Closed(reason) => {
                debug!(?reason, "transport closed");
                let _ = events.send(RemoteEvent::Closed);
                break;
            }
        }
    }
}

impl<T: WireTransport> RemoteChannel for WireChannel<T> {
    fn open(&mut self, events: Sender<RemoteEvent>) -> Result<()> {
        if self.open {
            return Err(VocaladError::AlreadyRunning);
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        self.transport.connect(tx)?;

        self.running.store(true, Ordering::SeqCst);
        let codec = self.codec.clone();
        let running = Arc::clone(&self.running);
        self.reader = Some(
            std::thread::Builder::new()
                .name("vocalad-wire-rx".into())
                .spawn(move || read_loop(rx, events, codec, running))
                .map_err(|e| VocaladError::Channel(format!("spawn reader: {e}")))?,
        );
        self.open = true;

        let setup = self
            .codec
            .encode_setup(self.model.as_deref(), self.system_instruction.as_deref());
        if let Err(e) = self.send(setup) {
            self.close();
            return Err(e);
        }
        info!("wire channel connected, setup sent");
        Ok(())
    }

    fn send_audio(&mut self, pcm16: &[u8]) -> Result<()> {
        let frame = self.codec.encode_audio(pcm16);
        self.send(frame)
    }

    fn send_control(&mut self, signal: ControlSignal) -> Result<()> {
        let frame = self.codec.encode_control(signal);
        self.send(frame)
    }

    fn send_annotation(&mut self, text: &str, turn_complete: bool) -> Result<()> {
        let frame = self.codec.encode_annotation(text, turn_complete);
        self.send(frame)
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.running.store(false, Ordering::SeqCst);
        self.transport.close();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                tracing::error!("wire reader thread panicked");
            }
        }
        info!("wire channel closed");
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl<T: WireTransport> Drop for WireChannel<T> {
    fn drop(&mut self) {
        self.close();
    }
}
