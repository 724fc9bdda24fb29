//! Events published by a running session.
//!
//! ## Channels
//!
//! | Event | Subscribe with |
//! |-------|----------------|
//! | `SessionStatusEvent` | `SessionOrchestrator::subscribe_status` |
//! | `AudioActivityEvent` | `SessionOrchestrator::subscribe_activity` |
//! | `TurnSummaryEvent` | `SessionOrchestrator::subscribe_summaries` |
//!
//! All events serialize in camelCase so hosts can forward them to a UI as-is.

use serde::{Deserialize, Serialize};

use crate::turn::{TurnState, TurnSummary};

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

/// Emitted whenever the turn state changes, and on surfaced errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub state: TurnState,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

impl SessionStatusEvent {
    pub fn new(state: TurnState) -> Self {
        Self {
            state,
            detail: None,
        }
    }

    pub fn with_detail(state: TurnState, detail: impl Into<String>) -> Self {
        Self {
            state,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Audio activity events
// ---------------------------------------------------------------------------

/// Emitted for every analysed capture frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    /// Capture frame sequence number.
    pub seq: u64,
    pub rms: f32,
    /// Meter level in [0.0, 1.0].
    pub level: f32,
    pub is_speech: bool,
    pub pitch_hz: Option<f32>,
}

// ---------------------------------------------------------------------------
// Turn summary events
// ---------------------------------------------------------------------------

/// Emitted once per ended user turn, after the summary was sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSummaryEvent {
    /// 1-based turn number within the session.
    pub seq: u64,
    pub summary: TurnSummary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{analysis::N_MFCC, turn::EstimateSource};

    #[test]
    fn status_event_serializes_state_in_camel_case() {
        let event = SessionStatusEvent::new(TurnState::AwaitingReply);
        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["state"], "awaitingReply");
        assert!(json["detail"].is_null());

        let err = SessionStatusEvent::with_detail(TurnState::Closed, "socket reset");
        let json = serde_json::to_value(&err).expect("serialize status event");
        assert_eq!(json["state"], "closed");
        assert_eq!(json["detail"], "socket reset");
    }

    #[test]
    fn activity_event_uses_camel_case_fields() {
        let event = AudioActivityEvent {
            seq: 3,
            rms: 0.25,
            level: 1.0,
            is_speech: true,
            pitch_hz: None,
        };
        let json = serde_json::to_value(&event).expect("serialize activity event");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["isSpeech"], true);
        assert!(json["pitchHz"].is_null());
        assert_eq!(json["level"], 1.0);
    }

    #[test]
    fn summary_event_round_trips() {
        let event = TurnSummaryEvent {
            seq: 1,
            summary: TurnSummary {
                avg_pitch_hz: Some(180.0),
                avg_pitch_confidence: 0.95,
                avg_rms: 0.1,
                avg_loudness: 10.0,
                avg_zcr: 0.05,
                avg_spectral_centroid: 900.0,
                avg_spectral_flatness: 0.2,
                avg_mfcc: [0.0; N_MFCC],
                word_count: 5,
                words_per_minute: 150.0,
                duration_secs: 2.0,
                speech_frames: 12,
                total_frames: 16,
                estimate_source: EstimateSource::EnergyHeuristic,
            },
        };
        let text = serde_json::to_string(&event).expect("serialize summary event");
        assert!(text.contains("\"wordsPerMinute\":150.0"));
        assert!(text.contains("\"estimateSource\":\"energyHeuristic\""));
        let back: TurnSummaryEvent = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, event);
    }
}
