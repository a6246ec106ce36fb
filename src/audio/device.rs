//! Host audio device boundary.
//!
//! The session never talks to a sound API directly; it goes through an
//! [`AudioHost`], which hands out one input and one output device per session.

use tokio::sync::mpsc;

use crate::error::SessionError;

/// Identifies one scheduled buffer on an output device.
pub type SourceId = u64;

/// Live microphone stream. Samples are pushed as mono `f32` chunks on the
/// sender passed to [`AudioHost::open_input`].
pub trait InputDevice: Send {
    fn sample_rate(&self) -> u32;

    /// Stop the stream and release the device. Must tolerate repeated calls.
    fn close(&mut self) -> anyhow::Result<()>;
}

/// Speaker with its own monotonic clock.
///
/// Every scheduled buffer reports its [`SourceId`] on the completion sender
/// passed to [`AudioHost::open_output`] once it has fully played. Cancelled
/// buffers report nothing.
pub trait OutputDevice: Send {
    fn sample_rate(&self) -> u32;

    /// Device clock in seconds.
    fn current_time(&self) -> f64;

    /// Queue `samples` to begin at `start_at` on the device clock.
    fn schedule(&mut self, samples: Vec<f32>, start_at: f64) -> Result<SourceId, SessionError>;

    /// Stop a scheduled buffer. Unknown ids are ignored.
    fn cancel(&mut self, id: SourceId);

    /// Release the device. Must tolerate repeated calls.
    fn close(&mut self) -> anyhow::Result<()>;
}

pub trait AudioHost: Send + Sync {
    fn open_input(
        &self,
        device: &str,
        sample_rate: u32,
        chunk_tx: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn InputDevice>, SessionError>;

    fn open_output(
        &self,
        device: &str,
        sample_rate: u32,
        period_size: usize,
        ended_tx: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputDevice>, SessionError>;
}

/// Map an OS-level open failure onto the session taxonomy.
pub fn classify_open_error(errno: i32, detail: String) -> SessionError {
    match std::io::Error::from_raw_os_error(errno).kind() {
        std::io::ErrorKind::PermissionDenied => SessionError::PermissionDenied(detail),
        _ => SessionError::DeviceUnavailable(detail),
    }
}
