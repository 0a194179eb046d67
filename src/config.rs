/* src/config.rs */

use fancy_log::LogLevel;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use toml_edit::{DocumentMut, value};

pub const DEFAULT_SERVERS: [&str; 7] = [
    "oast.fun",
    "oast.pro",
    "oast.live",
    "oast.site",
    "oast.online",
    "oast.me",
    "interact.sh",
];

// --- Main Application Configuration ---
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: LogLevel,
    pub dir_path: PathBuf,
    pub bind_port: u16,
    pub relay_base: String,
    pub polling_interval: Duration,
    pub max_logs: usize,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn load() -> Self {
        dotenvy::dotenv().ok();

        let log_level_str = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_level = match log_level_str.to_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        };

        let dir_path_str = env::var("DIR_PATH").unwrap_or_else(|_| "~/lazy-oast".to_string());
        let dir_path = PathBuf::from(shellexpand::tilde(&dir_path_str).into_owned());

        let bind_port = env_or("BIND_PORT", 33302u16);

        // Without an explicit relay we talk to our own.
        let relay_base = env::var("RELAY_BASE")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", bind_port));

        Self {
            log_level,
            dir_path,
            bind_port,
            relay_base,
            polling_interval: Duration::from_millis(
                env_or("POLLING_INTERVAL_MS", 5000u64).max(100),
            ),
            max_logs: env_or("MAX_LOGS", 100usize).max(1),
            retry_delay: Duration::from_millis(env_or("RETRY_DELAY_MS", 1000u64)),
            request_timeout: Duration::from_secs(env_or("REQUEST_TIMEOUT_SECS", 10u64).max(1)),
        }
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.dir_path.join("config.toml")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir_path.join("state")
    }
}

// --- TOML Configuration Structs ---

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,
    #[serde(default)]
    pub preferred: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_tls")]
    pub tls: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            preferred: None,
            port: default_port(),
            tls: default_tls(),
        }
    }
}

impl CollectorConfig {
    /// The host a registration cycle starts from.
    pub fn preferred_host(&self) -> String {
        self.preferred
            .clone()
            .filter(|p| !p.trim().is_empty())
            .or_else(|| self.servers.first().cloned())
            .unwrap_or_else(|| DEFAULT_SERVERS[0].to_string())
    }
}

fn default_servers() -> Vec<String> {
    DEFAULT_SERVERS.iter().map(ToString::to_string).collect()
}

fn default_port() -> u16 {
    443
}

fn default_tls() -> bool {
    true
}

#[derive(Deserialize, Debug, Default)]
struct ConfigFile {
    #[serde(default)]
    collector: CollectorConfig,
}

/// Reads the `[collector]` table of config.toml.
pub async fn load_collector_config(
    path: &Path,
) -> Result<CollectorConfig, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path).await?;
    parse_collector_config(&content)
}

fn parse_collector_config(content: &str) -> Result<CollectorConfig, Box<dyn std::error::Error>> {
    let file: ConfigFile = toml::from_str(content)?;
    let mut collector = file.collector;
    collector.servers.retain(|s| !s.trim().is_empty());
    if collector.servers.is_empty() {
        return Err("collector.servers must list at least one host".into());
    }
    Ok(collector)
}

/// Rewrites `collector.preferred` in place, keeping comments and layout.
pub async fn save_preferred_server(
    path: &Path,
    host: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let content = fs::read_to_string(path).await?;
    let mut doc = content.parse::<DocumentMut>()?;

    if !doc.contains_table("collector") {
        doc["collector"] = toml_edit::table();
    }
    let current = doc
        .get("collector")
        .and_then(|c| c.get("preferred"))
        .and_then(|p| p.as_str());
    if current == Some(host) {
        return Ok(());
    }
    doc["collector"]["preferred"] = value(host);

    fs::write(path, doc.to_string()).await?;
    Ok(())
}
