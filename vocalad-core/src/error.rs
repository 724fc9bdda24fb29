use thiserror::Error;

/// All errors produced by vocalad-core.
#[derive(Debug, Error)]
pub enum VocaladError {
    /// Capture device unavailable or access refused. Fatal to `start_session`.
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    /// Transport or protocol error reported by the remote session.
    #[error("remote channel error: {0}")]
    Channel(String),

    #[error("remote channel is not open")]
    ChannelNotOpen,

    /// Malformed inbound audio chunk. Absorbed by the playback path.
    #[error("audio decode error: {0}")]
    Decode(String),

    #[error("phoneme model error: {0}")]
    Inference(String),

    #[error("session is already running")]
    AlreadyRunning,

    #[error("session is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VocaladError {
    /// Whether the caller should act on this error: ask for capture permission
    /// or reopen the remote channel. Device lookup failures reach the caller as
    /// `PermissionDenied`; everything else is absorbed inside the real-time path.
    pub fn is_actionable(&self) -> bool {
        matches!(self, VocaladError::PermissionDenied(_) | VocaladError::Channel(_))
    }
}

pub type Result<T> = std::result::Result<T, VocaladError>;
