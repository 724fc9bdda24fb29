//! Local echo peer speaking the server side of the wire protocol.
//!
//! Everything the user says between `activityStart` and `activityEnd` is
//! replayed back, converted to the reply rate and cut into fixed chunks, when
//! the turn-complete annotation arrives. Used by the loopback binary and the
//! wire-level tests.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use super::wire::{
    parse_pcm_rate, pcm_mime, Blob, ClientFrame, Content, Part, ServerContent, ServerFrame,
    TransportEvent, WireTransport,
};
use crate::{
    audio::{
        pcm::{decode_pcm16_le, encode_pcm16_le},
        resample::RateConverter,
    },
    error::{Result, VocaladError},
};

pub struct EchoTransport {
    inbound: Option<Sender<TransportEvent>>,
    reply_rate: u32,
    chunk_ms: u32,
    max_reply_secs: f64,
    capturing: bool,
    input_rate: u32,
    heard: Vec<f32>,
    replies: u32,
}

impl EchoTransport {
    pub fn new(reply_rate: u32, chunk_ms: u32) -> Self {
        Self {
            inbound: None,
            reply_rate,
            chunk_ms: chunk_ms.max(1),
            max_reply_secs: 10.0,
            capturing: false,
            input_rate: 16_000,
            heard: Vec::new(),
            replies: 0,
        }
    }

    /// Cap the echoed reply length.
    pub fn with_max_reply_secs(mut self, secs: f64) -> Self {
        self.max_reply_secs = secs.max(0.0);
        self
    }

    pub fn replies(&self) -> u32 {
        self.replies
    }

    fn push(&self, frame: &ServerFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        match &self.inbound {
            Some(tx) => tx
                .send(TransportEvent::Text(text))
                .map_err(|_| VocaladError::Channel("echo peer disconnected".into())),
            None => Err(VocaladError::ChannelNotOpen),
        }
    }

    fn reply(&mut self) -> Result<()> {
        let heard = std::mem::take(&mut self.heard);
        let mut converter = RateConverter::new(self.input_rate, self.reply_rate, 1024)?;
        let mut samples = converter.process(&heard);
        samples.extend(converter.finish());
        samples.truncate((self.max_reply_secs * self.reply_rate as f64) as usize);

        let chunk_len = ((self.reply_rate as u64 * self.chunk_ms as u64 / 1000) as usize).max(1);
        let mut chunks = 0usize;
        for chunk in samples.chunks(chunk_len) {
            let content = ServerContent {
                model_turn: Some(Content {
                    role: Some("model".into()),
                    parts: vec![Part {
                        text: None,
                        inline_data: Some(Blob {
                            mime_type: pcm_mime(self.reply_rate),
                            data: BASE64.encode(encode_pcm16_le(chunk)),
                        }),
                    }],
                }),
                ..ServerContent::default()
            };
            self.push(&ServerFrame {
                server_content: Some(content),
                ..ServerFrame::default()
            })?;
            chunks += 1;
        }
        self.push(&ServerFrame {
            server_content: Some(ServerContent {
                turn_complete: true,
                ..ServerContent::default()
            }),
            ..ServerFrame::default()
        })?;
        self.replies += 1;
        info!(chunks, samples = samples.len(), "echo reply sent");
        Ok(())
    }
}

impl WireTransport for EchoTransport {
    fn connect(&mut self, inbound: Sender<TransportEvent>) -> Result<()> {
        self.inbound = Some(inbound);
        Ok(())
    }

    fn send_text(&mut self, frame: String) -> Result<()> {
        let frame: ClientFrame = serde_json::from_str(&frame)?;

        if frame.setup.is_some() {
            self.push(&ServerFrame {
                setup_complete: Some(Default::default()),
                ..ServerFrame::default()
            })?;
        }
        if let Some(input) = frame.realtime_input {
            if input.activity_start.is_some() {
                self.capturing = true;
                self.heard.clear();
            }
            if let Some(audio) = input.audio {
                if let Some(rate) = parse_pcm_rate(&audio.mime_type) {
                    self.input_rate = rate;
                }
                if self.capturing {
                    let bytes = BASE64
                        .decode(audio.data.as_bytes())
                        .map_err(|e| VocaladError::Decode(e.to_string()))?;
                    self.heard.extend(decode_pcm16_le(&bytes)?);
                } else {
                    warn!("echo peer got audio outside an activity window");
                }
            }
            if input.activity_end.is_some() {
                self.capturing = false;
            }
        }
        if let Some(content) = frame.client_content {
            for text in content
                .turns
                .iter()
                .flat_map(|t| t.parts.iter())
                .filter_map(|p| p.text.as_deref())
            {
                debug!(len = text.len(), "echo peer got annotation");
            }
            if content.turn_complete {
                self.reply()?;
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.inbound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{wire::WireCodec, ControlSignal};

    #[test]
    fn echoes_captured_turn_in_chunks() {
        let codec = WireCodec::new(16_000, 16_000);
        let mut peer = EchoTransport::new(16_000, 100);
        let (tx, rx) = crossbeam_channel::unbounded();
        peer.connect(tx).unwrap();

        peer.send_text(codec.encode_setup(None, None).unwrap()).unwrap();
        peer.send_text(codec.encode_control(ControlSignal::ActivityStart).unwrap())
            .unwrap();
        // 250 ms of audio at 16 kHz.
        peer.send_text(codec.encode_audio(&encode_pcm16_le(&[0.25; 4000])).unwrap())
            .unwrap();
        peer.send_text(codec.encode_control(ControlSignal::ActivityEnd).unwrap())
            .unwrap();
        peer.send_text(codec.encode_annotation("metrics", true).unwrap())
            .unwrap();

        let events: Vec<_> = rx
            .try_iter()
            .map(|e| match e {
                TransportEvent::Text(t) => codec.decode(&t).unwrap(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        let flat: Vec<_> = events.into_iter().flatten().collect();
        assert_eq!(flat.first(), Some(&crate::remote::RemoteEvent::Opened));
        let audio = flat
            .iter()
            .filter(|e| matches!(e, crate::remote::RemoteEvent::AudioChunk(_)))
            .count();
        assert_eq!(audio, 3);
        assert_eq!(flat.last(), Some(&crate::remote::RemoteEvent::TurnComplete));
        assert_eq!(peer.replies(), 1);
    }
}
