//! Bidirectional message channel to the remote conversational agent.
//!
//! The session only relies on [`AgentChannel`] and [`AgentChannelFactory`];
//! [`WsChannelFactory`] is the WebSocket transport used by the binary.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::audio::WireMessage;
use crate::config::Config;
use crate::error::SessionError;
use crate::protocol::{AudioParams, HelloMessage, ResponseModality, ServerMessage};

/// Inbound traffic from the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Audio(WireMessage),
    /// The agent ended the conversation.
    Closed(String),
    /// The link failed or the agent reported an error.
    Failed(String),
}

/// Everything needed to open a conversation with the agent.
#[derive(Clone)]
pub struct ChannelOptions {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub response_modality: ResponseModality,
    pub system_instruction: Option<String>,
    pub voice_name: Option<String>,
    /// Rate of the audio we send
    pub input_sample_rate: u32,
    /// Rate assumed for inbound audio until the agent announces its own
    pub output_sample_rate: u32,
    pub queue_capacity: usize,
}

impl ChannelOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint: config.ws_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            response_modality: ResponseModality::Audio,
            system_instruction: config.system_instruction.clone(),
            voice_name: config.voice_name.clone(),
            input_sample_rate: config.capture_sample_rate,
            output_sample_rate: config.playback_sample_rate,
            queue_capacity: config.event_channel_capacity.max(1),
        }
    }

    fn hello(&self) -> HelloMessage {
        HelloMessage {
            msg_type: "hello".to_string(),
            version: 1,
            model: self.model.clone(),
            response_modalities: vec![self.response_modality],
            system_instruction: self.system_instruction.clone(),
            voice_name: self.voice_name.clone(),
            audio_params: AudioParams {
                format: "pcm16".to_string(),
                sample_rate: self.input_sample_rate,
                channels: 1,
            },
        }
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("response_modality", &self.response_modality)
            .field("voice_name", &self.voice_name)
            .field("input_sample_rate", &self.input_sample_rate)
            .field("output_sample_rate", &self.output_sample_rate)
            .finish()
    }
}

/// Outbound half of an open conversation.
pub trait AgentChannel: Send {
    /// Queue a frame for transmission. Fire-and-forget: there is no
    /// per-frame acknowledgment.
    fn send(&mut self, message: WireMessage) -> Result<(), SessionError>;

    /// Release the channel. Must tolerate repeated calls.
    fn close(&mut self);
}

#[async_trait]
pub trait AgentChannelFactory: Send + Sync {
    async fn connect(
        &self,
        options: &ChannelOptions,
    ) -> Result<(Box<dyn AgentChannel>, mpsc::Receiver<ChannelEvent>), SessionError>;
}

// ======================== WebSocket transport ========================

#[derive(Debug)]
enum NetCommand {
    SendBinary(Bytes),
}

enum LinkExit {
    LocalClose,
    RemoteClose(String),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsChannelFactory;

#[async_trait]
impl AgentChannelFactory for WsChannelFactory {
    async fn connect(
        &self,
        options: &ChannelOptions,
    ) -> Result<(Box<dyn AgentChannel>, mpsc::Receiver<ChannelEvent>), SessionError> {
        let mut ws_stream = open_socket(options)
            .await
            .map_err(|e| SessionError::Channel(format!("{:#}", e)))?;

        let hello_json = serde_json::to_string(&options.hello())
            .map_err(|e| SessionError::Channel(e.to_string()))?;
        log::debug!("Sending Hello: {}", hello_json);
        ws_stream
            .send(Message::Text(hello_json.into()))
            .await
            .map_err(|e| SessionError::Channel(e.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<NetCommand>(options.queue_capacity);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(options.queue_capacity);
        let output_rate = options.output_sample_rate;

        tokio::spawn(async move {
            let exit = link_loop(ws_stream, cmd_rx, &event_tx, output_rate).await;
            let event = match exit {
                Ok(LinkExit::LocalClose) => None,
                Ok(LinkExit::RemoteClose(reason)) => Some(ChannelEvent::Closed(reason)),
                Err(e) => Some(ChannelEvent::Failed(format!("{:#}", e))),
            };
            if let Some(event) = event {
                log::info!("Agent link ended: {:?}", event);
                let _ = event_tx.send(event).await;
            }
        });

        Ok((Box::new(WsChannel { cmd_tx: Some(cmd_tx) }), event_rx))
    }
}

async fn open_socket(options: &ChannelOptions) -> anyhow::Result<WsStream> {
    let url = Url::parse(&options.endpoint)?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("endpoint '{}' has no host", options.endpoint))?;
    let host = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let request = tokio_tungstenite::tungstenite::http::Request::builder()
        .method("GET")
        .uri(url.as_str())
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .header("Authorization", format!("Bearer {}", options.api_key))
        .header("Protocol-Version", "1")
        .body(())?;

    log::info!("Connecting to {}...", options.endpoint);
    let (ws_stream, _) = connect_async(request).await?;
    log::info!("Connected to agent");
    Ok(ws_stream)
}

async fn link_loop(
    ws_stream: WsStream,
    mut cmd_rx: mpsc::Receiver<NetCommand>,
    event_tx: &mpsc::Sender<ChannelEvent>,
    mut output_rate: u32,
) -> anyhow::Result<LinkExit> {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let wire = WireMessage::pcm(data, output_rate);
                        if event_tx.send(ChannelEvent::Audio(wire)).await.is_err() {
                            // session gone, nobody left to listen
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(LinkExit::LocalClose);
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_server_text(text.as_str(), &mut output_rate)?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .unwrap_or_else(|| "closed by agent".to_string());
                        return Ok(LinkExit::RemoteClose(reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(LinkExit::RemoteClose("connection closed".to_string())),
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(NetCommand::SendBinary(data)) => {
                        write.send(Message::Binary(data)).await?;
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(LinkExit::LocalClose);
                    }
                }
            }
        }
    }
}

/// Control traffic from the agent. A server `hello` may announce the rate of
/// the audio that follows; an `error` message ends the link.
fn handle_server_text(text: &str, output_rate: &mut u32) -> anyhow::Result<()> {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(_) => {
            log::debug!("Ignoring non-JSON text from agent: {}", text);
            return Ok(());
        }
    };

    match msg.msg_type.as_str() {
        "hello" => {
            if let Some(params) = msg.audio_params.filter(|p| p.sample_rate > 0) {
                log::info!("Agent output rate: {} Hz", params.sample_rate);
                *output_rate = params.sample_rate;
            }
            if let Some(sid) = msg.session_id {
                log::info!("Agent session: {}", sid);
            }
        }
        "error" => {
            let reason = msg
                .message
                .or(msg.text)
                .unwrap_or_else(|| "unspecified agent error".to_string());
            anyhow::bail!("agent error: {}", reason);
        }
        other => {
            if let Some(t) = msg.text {
                log::info!("Agent {}: {}", other, t);
            } else {
                log::debug!("Unhandled message type: {}", other);
            }
        }
    }
    Ok(())
}

struct WsChannel {
    cmd_tx: Option<mpsc::Sender<NetCommand>>,
}

impl AgentChannel for WsChannel {
    fn send(&mut self, message: WireMessage) -> Result<(), SessionError> {
        let tx = self
            .cmd_tx
            .as_ref()
            .ok_or_else(|| SessionError::Channel("channel closed".into()))?;
        match tx.try_send(NetCommand::SendBinary(message.data)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::warn!("Outbound queue full, dropping frame");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(SessionError::Channel("agent link closed".into())),
        }
    }

    fn close(&mut self) {
        // dropping the sender makes the link task send a Close frame and exit
        if self.cmd_tx.take().is_some() {
            log::info!("Closing agent channel");
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.close();
    }
}
