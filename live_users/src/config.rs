use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use crate::engine::EngineSettings;

/// Command line options for the server.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Liveness timing and engine sizing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Interval clients are expected to heartbeat at.
    pub heartbeat: Duration,
    /// Idle time after which an online user is considered gone.
    pub stale_after: Duration,
    /// Period of each connection's staleness sweep.
    pub sweep_every: Duration,
    /// Number of engine partitions.
    pub partitions: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            sweep_every: Duration::from_secs(30),
            partitions: 4,
        }
    }
}

impl PresenceConfig {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            partitions: self.partitions,
            stale_after: self.stale_after,
        }
    }
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Directory holding the user database.
    pub data_dir: PathBuf,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    pub presence: PresenceConfig,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    presence: FilePresence,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FilePresence {
    heartbeat_secs: Option<u64>,
    stale_after_secs: Option<u64>,
    sweep_every_secs: Option<u64>,
    partitions: Option<usize>,
}

fn default_port() -> u16 {
    3000
}

fn default_logging() -> bool {
    true
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // built-in defaults
        let mut port = default_port();
        let mut logging = default_logging();
        let mut presence = PresenceConfig::default();

        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("LIVE_USERS_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/live_users.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents).context("invalid config file")?;
            port = file_cfg.server.port;
            logging = file_cfg.logging.enabled;
            let p = file_cfg.presence;
            if let Some(s) = p.heartbeat_secs {
                presence.heartbeat = Duration::from_secs(s);
            }
            if let Some(s) = p.stale_after_secs {
                presence.stale_after = Duration::from_secs(s);
            }
            if let Some(s) = p.sweep_every_secs {
                presence.sweep_every = Duration::from_secs(s);
            }
            if let Some(n) = p.partitions {
                presence.partitions = n;
            }
        }

        // environment overrides
        if let Ok(p) = std::env::var("LIVE_USERS_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("LIVE_USERS_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        validate_presence(&presence)?;

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./live_users_data"));

        Ok(Self {
            bind,
            data_dir,
            logging_enabled: logging,
            presence,
        })
    }

    /// Path of the SQLite user database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("live_users.db")
    }
}

fn validate_presence(p: &PresenceConfig) -> Result<()> {
    if p.heartbeat.is_zero() || p.sweep_every.is_zero() || p.partitions == 0 {
        anyhow::bail!("invalid_presence_settings");
    }
    // a threshold at or below the heartbeat interval expires healthy clients
    if p.stale_after <= p.heartbeat {
        anyhow::bail!("stale_after_must_exceed_heartbeat");
    }
    Ok(())
}
