use thiserror::Error;

/// Everything that can go wrong in a voice session.
///
/// Per-frame codec errors (`Encode`, `Decode`) are recovered by dropping the
/// frame. Device and channel errors end the session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("agent channel error: {0}")]
    Channel(String),

    #[error("resampling error: {0}")]
    Resampling(String),
}

impl SessionError {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::PermissionDenied(_) => "permission_denied",
            Self::DeviceUnavailable(_) => "device_unavailable",
            Self::Encode(_) => "encode_error",
            Self::Decode(_) => "decode_error",
            Self::Channel(_) => "channel_error",
            Self::Resampling(_) => "resampling_error",
        }
    }

    /// Whether the session can keep running after this error.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, Self::Encode(_) | Self::Decode(_))
    }
}
