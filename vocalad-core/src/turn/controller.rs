//! Turn-taking protocol state machine.
//!
//! ```text
//!            ChannelOpened            EndTurn               AudioChunk
//!   Idle ───────────────▶ Listening ─────────▶ AwaitingReply ─────────▶ Responding
//!                          ▲   ▲                    │                      │  │
//!                          │   └─── TurnComplete ───┴──────────────────────┘  │
//!                          └──────── (Interrupted, automatic) ◀── Interrupted ┘
//!
//!   any ── Stop / ChannelClosed ──▶ Closed        any ── ChannelError ──▶ Closed | Idle
//! ```
//!
//! `apply` is the single transition function. It never performs side effects:
//! it returns the actions the session core must execute, in order. Events that
//! the protocol does not allow in the current state are no-ops reported as a
//! [`Violation`].

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Protocol state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnState {
    Idle,
    Listening,
    AwaitingReply,
    Responding,
    Interrupted,
    Closed,
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::AwaitingReply => "awaitingReply",
            TurnState::Responding => "responding",
            TurnState::Interrupted => "interrupted",
            TurnState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Inputs to the state machine: caller commands and remote events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    ChannelOpened,
    EndTurn,
    AudioChunk,
    Interrupted,
    TurnComplete,
    ChannelError(String),
    ChannelClosed,
    Stop,
}

impl TurnEvent {
    fn name(&self) -> &'static str {
        match self {
            TurnEvent::ChannelOpened => "channelOpened",
            TurnEvent::EndTurn => "endTurn",
            TurnEvent::AudioChunk => "audioChunk",
            TurnEvent::Interrupted => "interrupted",
            TurnEvent::TurnComplete => "turnComplete",
            TurnEvent::ChannelError(_) => "channelError",
            TurnEvent::ChannelClosed => "channelClosed",
            TurnEvent::Stop => "stop",
        }
    }
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnAction {
    /// Send the activity-start control signal.
    StartActivity,
    /// Send the activity-end control signal.
    EndActivity,
    /// Finalize the turn and send its summary as a turn-complete annotation.
    SendTurnSummary,
    /// Hand the inbound chunk to the playback scheduler.
    ForwardToPlayback,
    /// Cut all pending and in-flight playback now.
    FlushPlayback,
    /// Let queued playback finish; flush any partial conversion tail.
    FinishPlaybackBurst,
    /// Clear turn aggregation for a fresh user turn.
    ResetTurn,
    /// Close the remote channel and release capture.
    CloseSession,
    /// Report an actionable error to the caller.
    SurfaceError(String),
}

/// An event the protocol does not allow in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Remote audio before the user's turn was closed.
    AudioWhileListening,
    /// `endTurn()` outside `Listening`.
    EndTurnOutsideListening,
    /// Any other event with no row for the current state.
    Unexpected,
    /// Event after the session closed.
    AfterClose,
}

/// What to do when the remote channel reports an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelErrorPolicy {
    /// Terminal: tear the session down.
    #[default]
    Close,
    /// Return to `Idle` and wait for the channel to reopen.
    Idle,
}

/// Result of one `apply` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: TurnState,
    pub to: TurnState,
    /// Transient state passed through on the way to `to`.
    pub via: Option<TurnState>,
    pub actions: Vec<TurnAction>,
    pub violation: Option<Violation>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Owner of the single source of truth for [`TurnState`].
#[derive(Debug)]
pub struct TurnController {
    state: TurnState,
    policy: ChannelErrorPolicy,
    violations: u64,
    turns_started: u64,
}

impl TurnController {
    pub fn new(policy: ChannelErrorPolicy) -> Self {
        Self {
            state: TurnState::Idle,
            policy,
            violations: 0,
            turns_started: 0,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Outbound audio is forwarded only while the user holds the turn.
    pub fn should_forward_audio(&self) -> bool {
        self.state == TurnState::Listening
    }

    /// Number of times `Listening` has been entered.
    pub fn turns_started(&self) -> u64 {
        self.turns_started
    }

    pub fn violations(&self) -> u64 {
        self.violations
    }

    pub fn apply(&mut self, event: TurnEvent) -> Transition {
        use TurnAction as A;
        use TurnState as S;

        let from = self.state;
        let listen_again = |mut pre: Vec<TurnAction>| {
            pre.push(A::ResetTurn);
            pre.push(A::StartActivity);
            pre
        };

        let (to, via, actions, violation) = match (from, event.clone()) {
            (S::Closed, TurnEvent::Stop) => (S::Closed, None, vec![], None),
            (S::Closed, _) => (S::Closed, None, vec![], Some(Violation::AfterClose)),

            (_, TurnEvent::Stop) => (S::Closed, None, vec![A::FlushPlayback, A::CloseSession], None),
            (_, TurnEvent::ChannelClosed) => {
                (S::Closed, None, vec![A::FlushPlayback, A::CloseSession], None)
            }
            (_, TurnEvent::ChannelError(msg)) => match self.policy {
                ChannelErrorPolicy::Close => (
                    S::Closed,
                    None,
                    vec![A::FlushPlayback, A::SurfaceError(msg), A::CloseSession],
                    None,
                ),
                ChannelErrorPolicy::Idle => {
                    (S::Idle, None, vec![A::FlushPlayback, A::SurfaceError(msg)], None)
                }
            },

            (S::Idle, TurnEvent::ChannelOpened) => (S::Listening, None, listen_again(vec![]), None),

            (S::Listening, TurnEvent::EndTurn) => (
                S::AwaitingReply,
                None,
                vec![A::EndActivity, A::SendTurnSummary],
                None,
            ),
            (S::Listening, TurnEvent::AudioChunk) => {
                (S::Listening, None, vec![], Some(Violation::AudioWhileListening))
            }

            (S::AwaitingReply | S::Responding, TurnEvent::AudioChunk) => {
                (S::Responding, None, vec![A::ForwardToPlayback], None)
            }
            (S::AwaitingReply | S::Responding, TurnEvent::TurnComplete) => (
                S::Listening,
                None,
                listen_again(vec![A::FinishPlaybackBurst]),
                None,
            ),
            (S::Responding, TurnEvent::Interrupted) => (
                S::Listening,
                Some(S::Interrupted),
                listen_again(vec![A::FlushPlayback]),
                None,
            ),

            (_, TurnEvent::EndTurn) => (from, None, vec![], Some(Violation::EndTurnOutsideListening)),
            (_, _) => (from, None, vec![], Some(Violation::Unexpected)),
        };

        if let Some(v) = violation {
            self.violations += 1;
            warn!(state = %from, event = event.name(), violation = ?v, "protocol violation ignored");
        } else if from != to {
            debug!(from = %from, to = %to, event = event.name(), "turn transition");
        }
        if to == S::Listening && actions.contains(&A::StartActivity) {
            self.turns_started += 1;
        }
        self.state = to;

        Transition {
            from,
            to,
            via,
            actions,
            violation,
        }
    }
}
