/* src/init.rs */

use crate::config::AppConfig;
use fancy_log::{LogLevel, log};
use std::path::Path;
use tokio::fs;

const DEFAULT_CONFIG_TOML: &str = r#"
# Collector servers tried when generating a new interaction domain.
# Registration starts at `preferred` and walks the list in order until one
# server hands out a domain. After every success `preferred` is updated
# to the server that answered.

[collector]
servers = ["oast.fun", "oast.pro", "oast.live", "oast.site", "oast.online", "oast.me", "interact.sh"]
preferred = "oast.fun"

# Port and TLS used by the relay when it talks to the collector.
port = 443
tls = true
"#;

/// Creates the data directory and a default config.toml.
/// Returns true when the config file had to be created.
pub async fn initialize_app(config: &AppConfig) -> Result<bool, std::io::Error> {
    let mut is_first_run = false;

    fs::create_dir_all(&config.dir_path).await?;
    log(
        LogLevel::Debug,
        &format!("Data directory is at: {:?}", config.dir_path),
    );

    fs::create_dir_all(config.state_dir()).await?;

    let config_toml_path = config.config_toml_path();
    if !path_exists(&config_toml_path).await {
        log(
            LogLevel::Warn,
            &format!("Creating default config: {:?}", config_toml_path),
        );
        fs::write(&config_toml_path, DEFAULT_CONFIG_TOML).await?;
        is_first_run = true;
    }

    Ok(is_first_run)
}

async fn path_exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}
