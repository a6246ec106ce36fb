//! In-memory audio host and agent channel for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::{AudioHost, InputDevice, OutputDevice, SourceId, WireMessage};
use crate::error::SessionError;
use crate::net_link::{AgentChannel, AgentChannelFactory, ChannelEvent, ChannelOptions};

// ======================== audio ========================

struct InputState {
    sample_rate: u32,
    chunk_tx: Option<mpsc::Sender<Vec<f32>>>,
    closed: bool,
}

/// Microphone fed by the test.
#[derive(Clone)]
pub struct FakeInput {
    inner: Arc<Mutex<InputState>>,
}

impl FakeInput {
    fn new(sample_rate: u32, chunk_tx: mpsc::Sender<Vec<f32>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(InputState {
                sample_rate,
                chunk_tx: Some(chunk_tx),
                closed: false,
            })),
        }
    }

    /// Deliver a chunk as if the hardware had captured it. No-op once closed.
    pub async fn push(&self, chunk: Vec<f32>) {
        let tx = self.inner.lock().unwrap().chunk_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(chunk).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// The hardware stream dies: chunks stop and the stream ends, but the
    /// device was never closed.
    pub fn fail(&self) {
        self.inner.lock().unwrap().chunk_tx = None;
    }
}

impl InputDevice for FakeInput {
    fn sample_rate(&self) -> u32 {
        self.inner.lock().unwrap().sample_rate
    }

    fn close(&mut self) -> anyhow::Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.chunk_tx = None;
        state.closed = true;
        Ok(())
    }
}

struct OutputState {
    sample_rate: u32,
    time: f64,
    next_id: SourceId,
    scheduled: Vec<(SourceId, f64, usize)>,
    cancelled: Vec<SourceId>,
    closed: bool,
    ended_tx: Option<mpsc::UnboundedSender<SourceId>>,
}

/// Speaker with a hand-driven clock. Nothing finishes until the test says so.
#[derive(Clone)]
pub struct FakeOutput {
    inner: Arc<Mutex<OutputState>>,
}

impl FakeOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OutputState {
                sample_rate,
                time: 0.0,
                next_id: 1,
                scheduled: Vec::new(),
                cancelled: Vec::new(),
                closed: false,
                ended_tx: None,
            })),
        }
    }

    fn with_completions(sample_rate: u32, ended_tx: mpsc::UnboundedSender<SourceId>) -> Self {
        let output = Self::new(sample_rate);
        output.inner.lock().unwrap().ended_tx = Some(ended_tx);
        output
    }

    pub fn set_time(&self, seconds: f64) {
        self.inner.lock().unwrap().time = seconds;
    }

    /// `(id, start_at, sample count)` in scheduling order.
    pub fn scheduled(&self) -> Vec<(SourceId, f64, usize)> {
        self.inner.lock().unwrap().scheduled.clone()
    }

    pub fn cancelled(&self) -> Vec<SourceId> {
        self.inner.lock().unwrap().cancelled.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Report `id` as fully played.
    pub fn finish(&self, id: SourceId) {
        if let Some(tx) = self.inner.lock().unwrap().ended_tx.as_ref() {
            let _ = tx.send(id);
        }
    }

    /// The output stream dies and drops its completion sender.
    pub fn fail(&self) {
        self.inner.lock().unwrap().ended_tx = None;
    }
}

impl OutputDevice for FakeOutput {
    fn sample_rate(&self) -> u32 {
        self.inner.lock().unwrap().sample_rate
    }

    fn current_time(&self) -> f64 {
        self.inner.lock().unwrap().time
    }

    fn schedule(&mut self, samples: Vec<f32>, start_at: f64) -> Result<SourceId, SessionError> {
        let mut state = self.inner.lock().unwrap();
        if state.closed {
            return Err(SessionError::DeviceUnavailable("fake speaker closed".into()));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.scheduled.push((id, start_at, samples.len()));
        Ok(id)
    }

    fn cancel(&mut self, id: SourceId) {
        self.inner.lock().unwrap().cancelled.push(id);
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.inner.lock().unwrap().closed = true;
        Ok(())
    }
}

#[derive(Default)]
struct HostState {
    deny_microphone: bool,
    inputs: Vec<FakeInput>,
    outputs: Vec<FakeOutput>,
}

/// Hands out fake devices and remembers every one it opened.
#[derive(Clone, Default)]
pub struct FakeHost {
    inner: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next microphone opens fail with `PermissionDenied`.
    pub fn deny_microphone(&self, deny: bool) {
        self.inner.lock().unwrap().deny_microphone = deny;
    }

    /// Most recently opened microphone.
    pub fn input(&self) -> Option<FakeInput> {
        self.inner.lock().unwrap().inputs.last().cloned()
    }

    /// Most recently opened speaker.
    pub fn output(&self) -> Option<FakeOutput> {
        self.inner.lock().unwrap().outputs.last().cloned()
    }

    pub fn inputs_opened(&self) -> usize {
        self.inner.lock().unwrap().inputs.len()
    }
}

impl AudioHost for FakeHost {
    fn open_input(
        &self,
        _device: &str,
        sample_rate: u32,
        chunk_tx: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn InputDevice>, SessionError> {
        let mut state = self.inner.lock().unwrap();
        if state.deny_microphone {
            return Err(SessionError::PermissionDenied("microphone access denied".into()));
        }
        let input = FakeInput::new(sample_rate, chunk_tx);
        state.inputs.push(input.clone());
        Ok(Box::new(input))
    }

    fn open_output(
        &self,
        _device: &str,
        sample_rate: u32,
        _period_size: usize,
        ended_tx: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputDevice>, SessionError> {
        let output = FakeOutput::with_completions(sample_rate, ended_tx);
        self.inner.lock().unwrap().outputs.push(output.clone());
        Ok(Box::new(output))
    }
}

// ======================== agent channel ========================

struct ChannelState {
    sent: Vec<WireMessage>,
    closed: bool,
    event_tx: mpsc::Sender<ChannelEvent>,
}

/// Test-side view of one connection.
#[derive(Clone)]
pub struct FakeChannel {
    inner: Arc<Mutex<ChannelState>>,
}

impl FakeChannel {
    pub fn sent(&self) -> Vec<WireMessage> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Push an inbound event as if the agent had sent it.
    pub async fn deliver(&self, event: ChannelEvent) {
        let tx = self.inner.lock().unwrap().event_tx.clone();
        let _ = tx.send(event).await;
    }
}

/// The half handed to the session; dropping it closes the connection.
struct FakeConnection(FakeChannel);

impl AgentChannel for FakeConnection {
    fn send(&mut self, message: WireMessage) -> Result<(), SessionError> {
        let mut state = self.0.inner.lock().unwrap();
        if state.closed {
            return Err(SessionError::Channel("fake channel closed".into()));
        }
        state.sent.push(message);
        Ok(())
    }

    fn close(&mut self) {
        self.0.inner.lock().unwrap().closed = true;
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
struct FactoryState {
    fail_next: Option<SessionError>,
    hang: bool,
    channels: Vec<FakeChannel>,
    connections: usize,
}

#[derive(Clone, Default)]
pub struct FakeChannelFactory {
    inner: Arc<Mutex<FactoryState>>,
}

impl FakeChannelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_connect(&self, error: SessionError) {
        self.inner.lock().unwrap().fail_next = Some(error);
    }

    /// Make every later connect wait forever, like a stalled handshake.
    pub fn hang_on_connect(&self, hang: bool) {
        self.inner.lock().unwrap().hang = hang;
    }

    /// Most recent successful connection.
    pub fn channel(&self) -> Option<FakeChannel> {
        self.inner.lock().unwrap().channels.last().cloned()
    }

    /// Number of connection attempts, failed ones included.
    pub fn connections(&self) -> usize {
        self.inner.lock().unwrap().connections
    }
}

#[async_trait]
impl AgentChannelFactory for FakeChannelFactory {
    async fn connect(
        &self,
        options: &ChannelOptions,
    ) -> Result<(Box<dyn AgentChannel>, mpsc::Receiver<ChannelEvent>), SessionError> {
        let hang = {
            let mut state = self.inner.lock().unwrap();
            state.connections += 1;
            state.hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.inner.lock().unwrap();
        if let Some(error) = state.fail_next.take() {
            return Err(error);
        }
        let (event_tx, event_rx) = mpsc::channel(options.queue_capacity);
        let channel = FakeChannel {
            inner: Arc::new(Mutex::new(ChannelState {
                sent: Vec::new(),
                closed: false,
                event_tx,
            })),
        };
        state.channels.push(channel.clone());
        Ok((Box::new(FakeConnection(channel)), event_rx))
    }
}
