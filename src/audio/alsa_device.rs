//! ALSA backend for the device boundary.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with async network tasks.
//!
//! - Capture thread: ALSA capture → i16 → f32 chunks → `chunk_tx`
//! - Output thread: mixes scheduled buffers onto a frame timeline and writes
//!   one period at a time; the device clock is the number of frames written.
//!
//! A thread that exits on an unrecoverable error drops its sender, which the
//! session sees as the device going away.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::codec::{dequantize, quantize};
use super::device::{classify_open_error, AudioHost, InputDevice, OutputDevice, SourceId};
use crate::error::SessionError;

const CHANNELS: u32 = 1;
const MAX_WRITE_RETRIES: u32 = 3;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
struct AlsaParams {
    sample_rate: u32,
    period_size: usize,
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams), SessionError> {
    let dir_name = match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    };
    let pcm = PCM::new(device, direction, false).map_err(|e| {
        classify_open_error(
            e.errno(),
            format!("failed to open PCM device '{}' for {}: {}", device, dir_name, e),
        )
    })?;

    let params = configure_pcm(&pcm, sample_rate, period_size)
        .map_err(|e| SessionError::DeviceUnavailable(format!("{:#}", e)))?;

    log::info!(
        "ALSA {}: device={}, rate={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.period_size,
    );
    Ok((pcm, params))
}

fn configure_pcm(pcm: &PCM, sample_rate: u32, period_size: Option<usize>) -> Result<AlsaParams> {
    {
        let hwp = HwParams::any(pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(CHANNELS)?;
        hwp.set_rate(sample_rate, ValueOr::Nearest)
            .with_context(|| format!("Device does not support {} Hz", sample_rate))?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let hwp = pcm.hw_params_current()?;
    Ok(AlsaParams {
        sample_rate: hwp.get_rate()?,
        period_size: hwp.get_period_size()? as usize,
    })
}

pub struct AlsaHost;

impl AudioHost for AlsaHost {
    fn open_input(
        &self,
        device: &str,
        sample_rate: u32,
        chunk_tx: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn InputDevice>, SessionError> {
        let (pcm, params) = open_pcm(device, Direction::Capture, sample_rate, None)?;
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    if let Err(e) = capture_thread(pcm, params.period_size, chunk_tx, &running) {
                        log::error!("Capture thread error: {:#}", e);
                    }
                })
                .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?
        };

        Ok(Box::new(AlsaInput {
            sample_rate: params.sample_rate,
            running,
            handle: Some(handle),
        }))
    }

    fn open_output(
        &self,
        device: &str,
        sample_rate: u32,
        period_size: usize,
        ended_tx: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputDevice>, SessionError> {
        let period = (period_size > 0).then_some(period_size);
        let (pcm, params) = open_pcm(device, Direction::Playback, sample_rate, period)?;

        let shared = Arc::new(OutputShared {
            running: AtomicBool::new(true),
            frames_written: AtomicU64::new(0),
            sources: Mutex::new(Vec::new()),
        });

        let handle = {
            let shared = shared.clone();
            let period_size = params.period_size;
            thread::Builder::new()
                .name("audio-output".into())
                .spawn(move || {
                    if let Err(e) = output_thread(pcm, period_size, &shared, ended_tx) {
                        log::error!("Output thread error: {:#}", e);
                    }
                })
                .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?
        };

        Ok(Box::new(AlsaOutput {
            sample_rate: params.sample_rate,
            shared,
            next_id: 0,
            handle: Some(handle),
        }))
    }
}

/// Wait for a device thread to exit. The wait can last up to one ALSA
/// period, so on a multi-thread runtime the worker hands its other tasks
/// off first.
fn join_device_thread(handle: JoinHandle<()>, name: &str) -> Result<()> {
    let join = move || handle.join();
    let joined = match Handle::try_current() {
        Ok(rt) if rt.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(join)
        }
        _ => join(),
    };
    joined.map_err(|_| anyhow::anyhow!("{} thread panicked", name))
}

// ======================== Capture ========================

struct AlsaInput {
    sample_rate: u32,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InputDevice for AlsaInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn close(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            join_device_thread(h, "capture")?;
        }
        Ok(())
    }
}

impl Drop for AlsaInput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Failed to close capture device: {:#}", e);
        }
    }
}

fn capture_thread(
    pcm: PCM,
    period_size: usize,
    chunk_tx: mpsc::Sender<Vec<f32>>,
    running: &AtomicBool,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let mut read_buf = vec![0i16; period_size * CHANNELS as usize];

    log::info!("Capture started: period={}", period_size);

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                let chunk: Vec<f32> = read_buf[..frames].iter().map(|&s| dequantize(s)).collect();
                if !forward_chunk(&chunk_tx, chunk, running) {
                    log::debug!("Capture receiver dropped");
                    break;
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    let _ = pcm.drop();
    log::info!("Capture stopped");
    Ok(())
}

/// Hand a chunk to the pipeline without blocking past a stop request, so
/// `close()` can always join this thread. Returns false once the receiver
/// is gone or capture was stopped.
fn forward_chunk(chunk_tx: &mpsc::Sender<Vec<f32>>, mut chunk: Vec<f32>, running: &AtomicBool) -> bool {
    loop {
        match chunk_tx.try_send(chunk) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(c)) => {
                if !running.load(Ordering::Relaxed) {
                    return false;
                }
                chunk = c;
                thread::sleep(Duration::from_millis(2));
            }
        }
    }
}

// ======================== Output ========================

struct ScheduledBuffer {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl ScheduledBuffer {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

struct OutputShared {
    running: AtomicBool,
    frames_written: AtomicU64,
    sources: Mutex<Vec<ScheduledBuffer>>,
}

struct AlsaOutput {
    sample_rate: u32,
    shared: Arc<OutputShared>,
    next_id: SourceId,
    handle: Option<JoinHandle<()>>,
}

impl OutputDevice for AlsaOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.shared.frames_written.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn schedule(&mut self, samples: Vec<f32>, start_at: f64) -> Result<SourceId, SessionError> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(SessionError::DeviceUnavailable("output device closed".into()));
        }
        let id = self.next_id;
        self.next_id += 1;
        let start_frame = (start_at * self.sample_rate as f64).round().max(0.0) as u64;
        let mut sources = self
            .shared
            .sources
            .lock()
            .map_err(|_| SessionError::DeviceUnavailable("output mixer poisoned".into()))?;
        sources.push(ScheduledBuffer {
            id,
            start_frame,
            samples,
        });
        Ok(id)
    }

    fn cancel(&mut self, id: SourceId) {
        if let Ok(mut sources) = self.shared.sources.lock() {
            sources.retain(|s| s.id != id);
        }
    }

    fn close(&mut self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Ok(mut sources) = self.shared.sources.lock() {
            sources.clear();
        }
        if let Some(h) = self.handle.take() {
            join_device_thread(h, "output")?;
        }
        Ok(())
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Failed to close output device: {:#}", e);
        }
    }
}

/// Mix every buffer overlapping `[pos, pos + out.len())` into `out` and
/// return the ids of buffers that end inside this period.
fn mix_period(sources: &mut Vec<ScheduledBuffer>, pos: u64, out: &mut [f32]) -> Vec<SourceId> {
    let period_end = pos + out.len() as u64;
    let mut finished = Vec::new();

    for src in sources.iter() {
        if src.start_frame >= period_end {
            continue;
        }
        let from = src.start_frame.max(pos);
        let to = src.end_frame().min(period_end);
        for frame in from..to {
            out[(frame - pos) as usize] += src.samples[(frame - src.start_frame) as usize];
        }
        if src.end_frame() <= period_end {
            finished.push(src.id);
        }
    }

    sources.retain(|s| s.end_frame() > period_end);
    finished
}

fn output_thread(
    pcm: PCM,
    period_size: usize,
    shared: &OutputShared,
    ended_tx: mpsc::UnboundedSender<SourceId>,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let mut mix_buf = vec![0f32; period_size];
    let mut pcm_buf = vec![0i16; period_size];

    log::info!("Output started: period={}", period_size);

    while shared.running.load(Ordering::Relaxed) {
        mix_buf.iter_mut().for_each(|s| *s = 0.0);
        let pos = shared.frames_written.load(Ordering::Acquire);
        let finished = {
            let mut sources = shared
                .sources
                .lock()
                .map_err(|_| anyhow::anyhow!("output mixer poisoned"))?;
            mix_period(&mut sources, pos, &mut mix_buf)
        };

        for (dst, src) in pcm_buf.iter_mut().zip(mix_buf.iter()) {
            *dst = quantize(*src);
        }

        // Retry short writes and XRUNs without losing frames.
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < period_size {
            match io.writei(&pcm_buf[frames_written..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    pcm.prepare().context("Failed to recover PCM playback")?;
                    if retry_count >= MAX_WRITE_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            period_size - frames_written
                        );
                        break;
                    }
                }
            }
        }

        // The clock advances by a whole period even when frames were dropped,
        // so scheduled start times stay on the same timeline.
        shared
            .frames_written
            .fetch_add(period_size as u64, Ordering::Release);

        for id in finished {
            if ended_tx.send(id).is_err() {
                log::debug!("Completion receiver dropped");
            }
        }
    }

    let _ = pcm.drop();
    log::info!("Output stopped");
    Ok(())
}
