use std::fmt;

use crate::audio::AudioConfig;
use crate::error::SessionError;

/// Runtime configuration.
///
/// Defaults are baked in at compile time from `config.toml` (see `build.rs`);
/// a few values can be overridden from the environment at startup.
#[derive(Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 音频配置
    pub capture_device: String,
    pub playback_device: String,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub capture_window_size: usize,
    pub playback_period_size: usize,

    // Agent 配置
    pub ws_url: String,
    pub api_key: String,
    pub model: String,
    pub voice_name: Option<String>,
    pub system_instruction: Option<String>,

    // 会话配置
    pub mute_mic_while_speaking: bool,
    pub event_channel_capacity: usize,
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            capture_device: env!("AUDIO_CAPTURE_DEVICE").to_string(),
            playback_device: env!("AUDIO_PLAYBACK_DEVICE").to_string(),
            capture_sample_rate: env!("AUDIO_CAPTURE_SAMPLE_RATE")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_CAPTURE_SAMPLE_RATE")?,
            playback_sample_rate: env!("AUDIO_PLAYBACK_SAMPLE_RATE")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_PLAYBACK_SAMPLE_RATE")?,
            capture_window_size: env!("AUDIO_CAPTURE_WINDOW_SIZE")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_CAPTURE_WINDOW_SIZE")?,
            playback_period_size: env!("AUDIO_PLAYBACK_PERIOD_SIZE")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_PLAYBACK_PERIOD_SIZE")?,

            ws_url: env!("AGENT_WS_URL").to_string(),
            api_key: env!("AGENT_API_KEY").to_string(),
            model: env!("AGENT_MODEL").to_string(),
            voice_name: non_empty(env!("AGENT_VOICE_NAME")),
            system_instruction: non_empty(env!("AGENT_SYSTEM_INSTRUCTION")),

            mute_mic_while_speaking: env!("SESSION_MUTE_MIC_WHILE_SPEAKING")
                .parse()
                .map_err(|_| "Failed to parse SESSION_MUTE_MIC_WHILE_SPEAKING")?,
            event_channel_capacity: env!("SESSION_EVENT_CHANNEL_CAPACITY")
                .parse()
                .map_err(|_| "Failed to parse SESSION_EVENT_CHANNEL_CAPACITY")?,
        })
    }

    /// Apply `VOICE_*` environment overrides on top of the compiled defaults.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("VOICE_API_KEY") {
            self.api_key = key;
        }
        if let Ok(url) = std::env::var("VOICE_WS_URL") {
            self.ws_url = url;
        }
        if let Ok(device) = std::env::var("VOICE_CAPTURE_DEVICE") {
            self.capture_device = device;
        }
        if let Ok(device) = std::env::var("VOICE_PLAYBACK_DEVICE") {
            self.playback_device = device;
        }
        self
    }

    /// Checks the prerequisites for starting a session.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.api_key.trim().is_empty() {
            return Err(SessionError::Config("missing API key".into()));
        }
        if self.ws_url.trim().is_empty() {
            return Err(SessionError::Config("missing agent endpoint".into()));
        }
        if self.capture_sample_rate == 0 || self.playback_sample_rate == 0 {
            return Err(SessionError::Config("sample rates must be non-zero".into()));
        }
        if self.capture_window_size == 0 {
            return Err(SessionError::Config("capture window size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn audio(&self) -> AudioConfig {
        AudioConfig {
            capture_device: self.capture_device.clone(),
            playback_device: self.playback_device.clone(),
            capture_sample_rate: self.capture_sample_rate,
            playback_sample_rate: self.playback_sample_rate,
            capture_window_size: self.capture_window_size,
            playback_period_size: self.playback_period_size,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("capture_device", &self.capture_device)
            .field("playback_device", &self.playback_device)
            .field("capture_sample_rate", &self.capture_sample_rate)
            .field("playback_sample_rate", &self.playback_sample_rate)
            .field("capture_window_size", &self.capture_window_size)
            .field("ws_url", &self.ws_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("voice_name", &self.voice_name)
            .field("mute_mic_while_speaking", &self.mute_mic_while_speaking)
            .finish()
    }
}
