//! Gapless playback scheduling on the output device's own clock.

use std::collections::HashSet;

use tokio::sync::mpsc;

use super::device::{AudioHost, OutputDevice, SourceId};
use super::AudioConfig;
use crate::error::SessionError;

/// Where a buffer landed on the device timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start_at: f64,
    pub duration: f64,
}

impl ScheduledSource {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Owns the speaker, the scheduling cursor and the set of active sources.
///
/// "Agent is speaking" is derived from the active set and never stored.
pub struct PlaybackScheduler {
    device: Option<Box<dyn OutputDevice>>,
    sample_rate: u32,
    next_start_time: f64,
    active: HashSet<SourceId>,
}

impl PlaybackScheduler {
    /// Open the speaker. Completion notifications arrive on `ended_tx`.
    pub fn open(
        host: &dyn AudioHost,
        config: &AudioConfig,
        ended_tx: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Self, SessionError> {
        let device = host.open_output(
            &config.playback_device,
            config.playback_sample_rate,
            config.playback_period_size,
            ended_tx,
        )?;
        if device.sample_rate() != config.playback_sample_rate {
            log::warn!(
                "Playback device negotiated {} Hz instead of {} Hz, inbound audio will be resampled",
                device.sample_rate(),
                config.playback_sample_rate
            );
        }
        Ok(Self::new(device))
    }

    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        let sample_rate = device.sample_rate();
        Self {
            device: Some(device),
            sample_rate,
            next_start_time: 0.0,
            active: HashSet::new(),
        }
    }

    /// Native rate of the speaker; inbound audio is decoded to this rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[cfg(test)]
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn is_speaking(&self) -> bool {
        !self.active.is_empty()
    }

    /// Queue `samples` right after everything already scheduled, or at the
    /// device's current time if playback has fallen behind.
    ///
    /// Returns `Ok(None)` for an empty buffer.
    pub fn schedule_playback(
        &mut self,
        samples: Vec<f32>,
    ) -> Result<Option<ScheduledSource>, SessionError> {
        if samples.is_empty() {
            return Ok(None);
        }
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| SessionError::DeviceUnavailable("playback device closed".into()))?;

        let duration = samples.len() as f64 / self.sample_rate as f64;
        let start_at = self.next_start_time.max(device.current_time());
        let id = device.schedule(samples, start_at)?;
        let source = ScheduledSource {
            id,
            start_at,
            duration,
        };

        self.next_start_time = source.end_at();
        self.active.insert(id);

        log::debug!(
            "Scheduled source {} at {:.3}s for {:.3}s ({} active)",
            id,
            start_at,
            duration,
            self.active.len()
        );
        Ok(Some(source))
    }

    /// Completion notification from the device. Returns true when this was
    /// the last active source, i.e. the agent has finished speaking.
    pub fn on_source_ended(&mut self, id: SourceId) -> bool {
        self.active.remove(&id) && self.active.is_empty()
    }

    /// Stop everything in flight and rewind the cursor.
    pub fn reset(&mut self) {
        if let Some(device) = self.device.as_mut() {
            for id in self.active.drain() {
                device.cancel(id);
            }
        }
        self.active.clear();
        self.next_start_time = 0.0;
    }

    /// Reset, then release the speaker. Safe to call more than once.
    pub fn close(&mut self) -> anyhow::Result<()> {
        self.reset();
        match self.device.take() {
            Some(mut device) => device.close(),
            None => Ok(()),
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Failed to close playback device: {:#}", e);
        }
    }
}
