use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    audio: Audio,
    agent: Agent,
    session: Session,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    capture_sample_rate: u32,
    playback_sample_rate: u32,
    capture_window_size: usize,
    playback_period_size: usize,
}

#[derive(Deserialize)]
struct Agent {
    ws_url: String,
    api_key: String,
    model: String,
    voice_name: String,
    system_instruction: String,
}

#[derive(Deserialize)]
struct Session {
    mute_mic_while_speaking: bool,
    event_channel_capacity: usize,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 音频配置
    println!("cargo:rustc-env=AUDIO_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_CAPTURE_SAMPLE_RATE={}", config.audio.capture_sample_rate);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_SAMPLE_RATE={}", config.audio.playback_sample_rate);
    println!("cargo:rustc-env=AUDIO_CAPTURE_WINDOW_SIZE={}", config.audio.capture_window_size);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_PERIOD_SIZE={}", config.audio.playback_period_size);

    // Agent 配置
    println!("cargo:rustc-env=AGENT_WS_URL={}", config.agent.ws_url);
    println!("cargo:rustc-env=AGENT_API_KEY={}", config.agent.api_key);
    println!("cargo:rustc-env=AGENT_MODEL={}", config.agent.model);
    println!("cargo:rustc-env=AGENT_VOICE_NAME={}", config.agent.voice_name);
    println!("cargo:rustc-env=AGENT_SYSTEM_INSTRUCTION={}", config.agent.system_instruction);

    // 会话配置
    println!("cargo:rustc-env=SESSION_MUTE_MIC_WHILE_SPEAKING={}", config.session.mute_mic_while_speaking);
    println!("cargo:rustc-env=SESSION_EVENT_CHANNEL_CAPACITY={}", config.session.event_channel_capacity);
}
