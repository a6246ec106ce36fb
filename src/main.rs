mod audio;
mod config;
mod controller;
mod error;
mod net_link;
mod protocol;
mod state_machine;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Context;
use audio::AlsaHost;
use config::Config;
use controller::SessionController;
use net_link::WsChannelFactory;
use state_machine::SessionState;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new()
        .map_err(anyhow::Error::msg)?
        .with_env_overrides();
    log::info!("{} v{} starting", config.app_name, config.app_version);
    log::debug!("{:?}", config);
    config.validate().context("Invalid configuration")?;

    let (session, controller) =
        SessionController::spawn(config, Arc::new(AlsaHost), Arc::new(WsChannelFactory));
    let mut status = session.status();
    let mut errors = session.errors();

    session.start();

    let mut started = false;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, stopping session");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    log::warn!("Session controller exited");
                    break;
                }
                let current = status.borrow_and_update().clone();
                log::info!(
                    "Session: {:?}{}",
                    current.state,
                    if current.speaking { " (agent speaking)" } else { "" }
                );
                if current.state != SessionState::Idle {
                    started = true;
                } else if started {
                    if let Some(e) = current.last_error {
                        // 配置错误直接退出
                        if e.reason() == "config_error" {
                            return Err(e).context("Session could not start");
                        }
                        log::error!("Session ended: {}", e);
                    } else {
                        log::info!("Session ended");
                    }
                    break;
                }
            }
            Ok(e) = errors.recv() => {
                if e.is_frame_local() {
                    log::debug!("Frame dropped: {}", e);
                }
            }
        }
    }

    session.stop();
    let _ = status
        .wait_for(|s| s.state == SessionState::Idle)
        .await;
    drop(session);
    if let Err(e) = controller.await {
        log::warn!("Session controller task failed: {}", e);
    }
    Ok(())
}
