//! Microphone capture: device chunks → fixed-size windows → callback.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::device::{AudioHost, InputDevice};
use super::frame::AudioFrame;
use super::AudioConfig;
use crate::error::SessionError;

const CHUNK_QUEUE_DEPTH: usize = 64;

/// Re-slices arbitrarily sized device chunks into windows of exactly
/// `window_size` samples, preserving order.
pub struct FrameSlicer {
    window_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameSlicer {
    pub fn new(window_size: usize, sample_rate: u32) -> Self {
        Self {
            window_size,
            sample_rate,
            pending: Vec::with_capacity(window_size * 2),
        }
    }

    pub fn push(&mut self, chunk: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while self.pending.len() >= self.window_size {
            let window: Vec<f32> = self.pending.drain(..self.window_size).collect();
            frames.push(AudioFrame::new(window, self.sample_rate));
        }
        frames
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

pub struct CapturePipeline;

impl CapturePipeline {
    /// Open the microphone and call `on_frame` for every complete window.
    ///
    /// `on_lost` fires once if the device stream ends without [`CaptureHandle::stop`]
    /// having been called. Must be called from inside a tokio runtime.
    pub fn start<F, L>(
        host: &dyn AudioHost,
        config: &AudioConfig,
        mut on_frame: F,
        on_lost: L,
    ) -> Result<CaptureHandle, SessionError>
    where
        F: FnMut(AudioFrame) + Send + 'static,
        L: FnOnce(SessionError) + Send + 'static,
    {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<f32>>(CHUNK_QUEUE_DEPTH);
        let device = host.open_input(
            &config.capture_device,
            config.capture_sample_rate,
            chunk_tx,
        )?;

        let mut slicer = FrameSlicer::new(config.capture_window_size, device.sample_rate());
        log::info!(
            "Capture pipeline started: rate={}, window={}",
            device.sample_rate(),
            config.capture_window_size
        );

        let task = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                for frame in slicer.push(&chunk) {
                    on_frame(frame);
                }
            }
            // stop() aborts this task first, so reaching here means the device died
            log::warn!("Microphone stream ended unexpectedly");
            on_lost(SessionError::DeviceUnavailable("microphone stream ended".into()));
        });

        Ok(CaptureHandle {
            device: Some(device),
            task: Some(task),
        })
    }
}

/// A running capture. Dropping it stops capture.
pub struct CaptureHandle {
    device: Option<Box<dyn InputDevice>>,
    task: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.device.is_some()
    }

    /// Stop forwarding frames and release the microphone. Idempotent.
    pub fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        match self.device.take() {
            Some(mut device) => {
                log::info!("Capture pipeline stopped");
                device.close()
            }
            None => Ok(()),
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Failed to stop capture: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn audio_config(window: usize) -> AudioConfig {
        AudioConfig {
            capture_window_size: window,
            ..AudioConfig::default()
        }
    }

    #[test]
    fn slicer_emits_exact_windows_in_order() {
        let mut slicer = FrameSlicer::new(4, 16000);
        assert!(slicer.push(&[0.0, 1.0, 2.0]).is_empty());

        let frames = slicer.push(&[3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(frames[1].samples, vec![4.0, 5.0, 6.0, 7.0]);
        assert_eq!(frames[0].sample_rate, 16000);
        assert_eq!(slicer.pending(), 1);
    }

    #[tokio::test]
    async fn forwards_windows_in_capture_order() {
        let host = FakeHost::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();

        let on_frame = move |frame: AudioFrame| sink.lock().unwrap().push(frame.samples);
        let mut handle = CapturePipeline::start(&host, &audio_config(3), on_frame, |_| {}).unwrap();

        let mic = host.input().expect("microphone opened");
        for i in 0..4 {
            let base = i as f32 * 2.0;
            mic.push(vec![base, base + 1.0]).await;
        }

        for _ in 0..100 {
            if received.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            *received.lock().unwrap(),
            vec![vec![0.0, 1.0, 2.0], vec![3.0, 4.0, 5.0]]
        );

        handle.stop().unwrap();
        assert!(mic.is_closed());
    }

    #[tokio::test]
    async fn permission_denied_is_reported() {
        let host = FakeHost::new();
        host.deny_microphone(true);
        let err = CapturePipeline::start(&host, &audio_config(4096), |_| {}, |_| {}).err().unwrap();
        assert_eq!(err.reason(), "permission_denied");
    }

    #[tokio::test]
    async fn dead_device_stream_is_reported_once() {
        let host = FakeHost::new();
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        let _handle = CapturePipeline::start(&host, &audio_config(4), |_| {}, move |e| {
            let _ = lost_tx.send(e);
        })
        .unwrap();

        host.input().unwrap().fail();
        let err = tokio::time::timeout(Duration::from_secs(5), lost_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err.reason(), "device_unavailable");
        assert!(lost_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stop_does_not_report_device_loss() {
        let host = FakeHost::new();
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel::<SessionError>();
        let mut handle = CapturePipeline::start(&host, &audio_config(4), |_| {}, move |e| {
            let _ = lost_tx.send(e);
        })
        .unwrap();

        handle.stop().unwrap();
        assert!(lost_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let host = FakeHost::new();
        let mut handle = CapturePipeline::start(&host, &audio_config(4096), |_| {}, |_| {}).unwrap();
        handle.stop().unwrap();
        handle.stop().unwrap();
        assert!(!handle.is_running());
    }
}
