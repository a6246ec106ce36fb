use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{
    codec, AudioFrame, AudioHost, CaptureHandle, CapturePipeline, PlaybackScheduler, SourceId,
};
use crate::config::Config;
use crate::error::SessionError;
use crate::net_link::{AgentChannel, AgentChannelFactory, ChannelEvent, ChannelOptions};
use crate::state_machine::{SessionState, SessionStatus};

const ERROR_CHANNEL_CAPACITY: usize = 16;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum Command {
    Start,
    Stop,
    DismissError,
}

/// Device and network callbacks, tagged with the session that produced them.
#[derive(Debug)]
enum SessionEvent {
    Captured { session: Uuid, frame: AudioFrame },
    Inbound { session: Uuid, event: ChannelEvent },
    SourceEnded { session: Uuid, id: SourceId },
    DeviceLost { session: Uuid, error: SessionError },
}

impl SessionEvent {
    fn session(&self) -> Uuid {
        match self {
            Self::Captured { session, .. }
            | Self::Inbound { session, .. }
            | Self::SourceEnded { session, .. }
            | Self::DeviceLost { session, .. } => *session,
        }
    }
}

/// Aborts a forwarding task when dropped.
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Everything one running session owns. Dropping it releases all of it.
struct ActiveSession {
    id: Uuid,
    capture: CaptureHandle,
    playback: PlaybackScheduler,
    channel: Box<dyn AgentChannel>,
    _forwarders: Vec<TaskGuard>,
}

/// Caller-facing side of the controller: two operations, two status signals
/// and an error feed.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<SessionStatus>,
    error_tx: broadcast::Sender<SessionError>,
}

impl SessionHandle {
    /// Request a new session. Returns before devices or network are ready;
    /// watch [`status`](Self::status) for the outcome.
    pub fn start(&self) {
        self.command(Command::Start);
    }

    /// Request teardown. Safe from any state and idempotent.
    pub fn stop(&self) {
        self.command(Command::Stop);
    }

    /// Clear the last reported error.
    pub fn dismiss_error(&self) {
        self.command(Command::DismissError);
    }

    pub fn is_session_active(&self) -> bool {
        self.status_rx.borrow().is_session_active()
    }

    pub fn is_agent_speaking(&self) -> bool {
        self.status_rx.borrow().speaking
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Every error the controller reports, including dropped frames.
    pub fn errors(&self) -> broadcast::Receiver<SessionError> {
        self.error_tx.subscribe()
    }

    fn command(&self, cmd: Command) {
        if let Err(e) = self.cmd_tx.send(cmd) {
            log::warn!("Session controller has shut down, ignoring {:?}", e.0);
        }
    }
}

/// Owns the session lifecycle and every resource a session holds.
///
/// Runs as a single task: commands and device/network events are handled one
/// at a time, so playback state is never touched concurrently.
pub struct SessionController {
    config: Config,
    host: Arc<dyn AudioHost>,
    factory: Arc<dyn AgentChannelFactory>,
    state: SessionState,
    last_error: Option<SessionError>,
    active: Option<ActiveSession>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    status_tx: watch::Sender<SessionStatus>,
    error_tx: broadcast::Sender<SessionError>,
}

impl SessionController {
    pub fn new(
        config: Config,
        host: Arc<dyn AudioHost>,
        factory: Arc<dyn AgentChannelFactory>,
    ) -> (Self, SessionHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (error_tx, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        let handle = SessionHandle {
            cmd_tx,
            status_rx,
            error_tx: error_tx.clone(),
        };
        let controller = Self {
            config,
            host,
            factory,
            state: SessionState::Idle,
            last_error: None,
            active: None,
            cmd_rx,
            event_tx,
            event_rx,
            status_tx,
            error_tx,
        };
        (controller, handle)
    }

    /// Build a controller and run it on the current tokio runtime.
    pub fn spawn(
        config: Config,
        host: Arc<dyn AudioHost>,
        factory: Arc<dyn AgentChannelFactory>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (controller, handle) = Self::new(config, host, factory);
        (handle, tokio::spawn(controller.run()))
    }

    /// Process commands and events until every [`SessionHandle`] is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Start) => self.start_session().await,
                        Some(Command::Stop) => self.stop_session(None),
                        Some(Command::DismissError) => {
                            self.last_error = None;
                            self.publish();
                        }
                        None => {
                            log::info!("All session handles dropped, shutting down");
                            self.stop_session(None);
                            break;
                        }
                    }
                }
                Some(event) = self.event_rx.recv() => self.handle_event(event),
            }
        }
    }

    async fn start_session(&mut self) {
        if !self.state.can_start() {
            log::warn!("start() ignored: session is {:?}", self.state);
            return;
        }
        if let Err(e) = self.config.validate() {
            log::error!("Cannot start session: {}", e);
            self.report(e);
            self.publish();
            return;
        }

        self.set_state(SessionState::Starting);
        let session = Uuid::new_v4();
        log::info!("Starting session {}", session);

        let mut acquisition = Box::pin(acquire(
            session,
            self.config.clone(),
            self.host.clone(),
            self.factory.clone(),
            self.event_tx.clone(),
        ));

        // Commands stay live while devices and the channel come up.
        let result = loop {
            tokio::select! {
                result = &mut acquisition => break Some(result),
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Start) => log::warn!("start() ignored: session is Starting"),
                        Some(Command::DismissError) => {
                            self.last_error = None;
                            self.publish();
                        }
                        Some(Command::Stop) | None => break None,
                    }
                }
            }
        };

        match result {
            Some(Ok(active)) => {
                self.active = Some(active);
                self.last_error = None;
                self.set_state(SessionState::Active);
                log::info!("Session {} active", session);
            }
            Some(Err(e)) => {
                log::error!("Failed to start session {}: {}", session, e);
                self.fail(e);
            }
            None => {
                log::info!("Session {} stopped while starting", session);
                // releases whatever was acquired so far
                drop(acquisition);
                self.set_state(SessionState::Idle);
            }
        }
    }

    /// Ordered, unconditional teardown. Every step runs even if an earlier
    /// one failed.
    fn stop_session(&mut self, error: Option<SessionError>) {
        if let Some(mut active) = self.active.take() {
            self.set_state(SessionState::Stopping);
            log::info!("Stopping session {}", active.id);

            if let Err(e) = active.capture.stop() {
                log::warn!("Failed to stop capture: {:#}", e);
            }
            active.playback.reset();
            if let Err(e) = active.playback.close() {
                log::warn!("Failed to close playback device: {:#}", e);
            }
            active.channel.close();
            drop(active);
        }

        match error {
            Some(e) => self.fail(e),
            None => {
                if self.state != SessionState::Idle {
                    self.set_state(SessionState::Idle);
                }
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        let current = self.active.as_ref().map(|a| a.id);
        if current != Some(event.session()) {
            log::debug!("Dropping event from stale session {}", event.session());
            return;
        }

        match event {
            SessionEvent::Captured { frame, .. } => self.forward_capture(frame),
            SessionEvent::Inbound { event, .. } => self.handle_inbound(event),
            SessionEvent::SourceEnded { id, .. } => {
                if let Some(active) = self.active.as_mut() {
                    if active.playback.on_source_ended(id) {
                        log::debug!("Agent finished speaking");
                    }
                }
                self.publish();
            }
            SessionEvent::DeviceLost { error, .. } => {
                log::error!("Audio device lost: {}", error);
                self.stop_session(Some(error));
            }
        }
    }

    fn forward_capture(&mut self, frame: AudioFrame) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        // 回声抑制：播放期间丢弃麦克风数据
        if self.config.mute_mic_while_speaking && active.playback.is_speaking() {
            return;
        }
        log::trace!("Sending {:.3}s of microphone audio", frame.duration());
        let result = codec::encode(&frame.samples, frame.sample_rate)
            .and_then(|wire| active.channel.send(wire));
        if let Err(e) = result {
            self.handle_error(e);
        }
    }

    fn handle_inbound(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Audio(wire) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                let was_speaking = active.playback.is_speaking();
                let result = codec::decode(&wire, active.playback.sample_rate())
                    .and_then(|samples| active.playback.schedule_playback(samples));
                match result {
                    Ok(source) => {
                        if let Some(source) = source {
                            log::trace!("Source {} plays until {:.3}s", source.id, source.end_at());
                        }
                        if !was_speaking && active.playback.is_speaking() {
                            log::debug!("Agent started speaking");
                        }
                        self.publish();
                    }
                    Err(e) => self.handle_error(e),
                }
            }
            ChannelEvent::Closed(reason) => {
                log::info!("Agent closed the session: {}", reason);
                self.stop_session(None);
            }
            ChannelEvent::Failed(reason) => {
                self.stop_session(Some(SessionError::Channel(reason)));
            }
        }
    }

    fn handle_error(&mut self, error: SessionError) {
        if error.is_frame_local() {
            log::warn!("Dropping frame: {}", error);
            let _ = self.error_tx.send(error);
        } else {
            log::error!("Session error: {}", error);
            self.stop_session(Some(error));
        }
    }

    /// Surface a session-level error, pass through `Error`, land in `Idle`.
    fn fail(&mut self, error: SessionError) {
        self.report(error);
        self.set_state(SessionState::Error);
        self.set_state(SessionState::Idle);
    }

    fn report(&mut self, error: SessionError) {
        self.last_error = Some(error.clone());
        let _ = self.error_tx.send(error);
    }

    fn set_state(&mut self, state: SessionState) {
        log::debug!("Session state: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        let speaking = self
            .active
            .as_ref()
            .is_some_and(|a| a.playback.is_speaking());
        self.status_tx.send_replace(SessionStatus {
            state: self.state,
            speaking,
            last_error: self.last_error.clone(),
        });
    }
}

/// Acquire speaker, agent channel and microphone for `session`, wiring their
/// callbacks into the controller's event queue. On failure, or when the
/// returned future is dropped, everything acquired so far is released.
async fn acquire(
    session: Uuid,
    config: Config,
    host: Arc<dyn AudioHost>,
    factory: Arc<dyn AgentChannelFactory>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
) -> Result<ActiveSession, SessionError> {
    let audio = config.audio();
    let mut forwarders = Vec::new();

    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<SourceId>();
    let playback = PlaybackScheduler::open(host.as_ref(), &audio, ended_tx)?;
    let events = event_tx.clone();
    forwarders.push(TaskGuard(tokio::spawn(async move {
        while let Some(id) = ended_rx.recv().await {
            if events.send(SessionEvent::SourceEnded { session, id }).is_err() {
                return;
            }
        }
        // the output stream dropped its completion sender
        let error = SessionError::DeviceUnavailable("speaker stream ended".into());
        let _ = events.send(SessionEvent::DeviceLost { session, error });
    })));

    let options = ChannelOptions::from_config(&config);
    let (channel, mut inbound_rx) = tokio::time::timeout(CONNECT_TIMEOUT, factory.connect(&options))
        .await
        .map_err(|_| {
            SessionError::Channel(format!(
                "agent did not answer within {}s",
                CONNECT_TIMEOUT.as_secs()
            ))
        })??;
    let events = event_tx.clone();
    forwarders.push(TaskGuard(tokio::spawn(async move {
        while let Some(event) = inbound_rx.recv().await {
            if events.send(SessionEvent::Inbound { session, event }).is_err() {
                break;
            }
        }
    })));

    let frames = event_tx.clone();
    let capture = CapturePipeline::start(
        host.as_ref(),
        &audio,
        move |frame| {
            let _ = frames.send(SessionEvent::Captured { session, frame });
        },
        move |error| {
            let _ = event_tx.send(SessionEvent::DeviceLost { session, error });
        },
    )?;

    Ok(ActiveSession {
        id: session,
        capture,
        playback,
        channel,
        _forwarders: forwarders,
    })
}
