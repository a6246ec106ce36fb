use crate::error::SessionError;

/// Session lifecycle.
///
/// ```text
/// Idle → Starting → Active → Stopping → Idle
///          ↓          ↓
///        Error  →   Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Active,
    Stopping,
    Error,
}

impl SessionState {
    /// Whether `start()` may begin a new session from here.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Snapshot published to observers after every transition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionStatus {
    pub state: SessionState,
    pub speaking: bool,
    /// Kept until the next successful start or an explicit dismissal.
    pub last_error: Option<SessionError>,
}

impl SessionStatus {
    pub fn is_session_active(&self) -> bool {
        self.state.is_active()
    }
}
