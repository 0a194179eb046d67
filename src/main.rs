/* src/main.rs */

use fancy_log::{LogLevel, log, set_log_level};
use lazy_motd::lazy_motd;
use std::sync::Arc;

mod config;
mod event_log;
mod failover;
mod gateway;
mod handlers;
mod init;
mod observer;
mod relay;
mod response;
mod server;
mod session;
mod state;
mod storage;
mod tasks;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // --- Initialization ---
    let config = config::AppConfig::load();
    set_log_level(config.log_level);
    lazy_motd!();

    if init::initialize_app(&config).await? {
        log(
            LogLevel::Info,
            &format!(
                "Wrote a default collector list to {:?}. Edit it to use your own servers.",
                config.config_toml_path()
            ),
        );
    }

    let collector = config::load_collector_config(&config.config_toml_path()).await?;
    log(
        LogLevel::Info,
        &format!(
            "Collector servers: {} (preferred: {})",
            collector.servers.join(", "),
            collector.preferred_host()
        ),
    );
    log(
        LogLevel::Info,
        &format!("Using relay at {}", config.relay_base),
    );

    let store = Arc::new(storage::FileStore::new(config.state_dir()));
    let listener = server::bind(config.bind_port).await?;
    let log_observer = Arc::new(observer::LogObserver);
    let app_state = state::AppState::new(config, collector, store, log_observer)?;

    let relay_sessions = app_state.relay.restore().await;
    log(
        LogLevel::Debug,
        &format!("Relay knows {} registered sessions.", relay_sessions),
    );

    // --- Start Application Logic ---
    tasks::spawn_startup_task(app_state.clone());

    // Serve until shutdown.
    server::run_server(listener, app_state).await?;

    log(LogLevel::Info, "Application has shut down gracefully.");
    Ok(())
}
