//! audio - capture, playback scheduling and the PCM frame codec
//!
//! Uses ALSA for device I/O behind the [`AudioHost`] boundary so the
//! session logic can run against any backend.

mod alsa_device;
pub mod capture;
pub mod codec;
pub mod device;
pub mod frame;
pub mod playback;

pub use alsa_device::AlsaHost;
pub use capture::{CaptureHandle, CapturePipeline};
pub use codec::WireMessage;
pub use device::{AudioHost, InputDevice, OutputDevice, SourceId};
pub use frame::AudioFrame;
pub use playback::PlaybackScheduler;

/// Audio device configuration for one session.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Microphone rate; outbound frames are tagged with it
    pub capture_sample_rate: u32,
    /// Samples per outbound frame
    pub capture_window_size: usize,
    /// Speaker rate; inbound frames are resampled to it when they differ
    pub playback_sample_rate: u32,
    /// Desired ALSA playback period size (0 = let ALSA decide)
    pub playback_period_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            capture_sample_rate: 16000,
            capture_window_size: 4096,
            playback_sample_rate: 24000,
            playback_period_size: 480,
        }
    }
}
