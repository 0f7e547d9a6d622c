use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the messaging service.
#[derive(Parser, Debug, Default)]
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
    /// Base directory for the message database and secrets.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Base directory for the database and the persisted signing secret.
    pub data_dir: PathBuf,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    /// Base64 signing secret shared with the identity service; generated
    /// and persisted on first run when absent.
    pub jwt_secret: Option<String>,
    /// Seconds a connection may stay unauthenticated.
    pub auth_grace_secs: u64,
    /// Expected client heartbeat cadence.
    pub heartbeat_interval_secs: u64,
    /// Heartbeats a connection may miss before it is declared dead.
    pub heartbeat_missed_allowance: u32,
    /// Live connections allowed per user before the oldest is evicted.
    pub device_limit: usize,
    /// Malformed frames tolerated before the connection is closed.
    pub malformed_frame_threshold: u32,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Seconds a sender may still edit, or see their own deleted, message.
    pub edit_grace_secs: i64,
    /// Minimum seconds between typing broadcasts per user and conversation.
    pub typing_debounce_secs: u64,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    auth: FileAuth,
    #[serde(default)]
    realtime: FileRealtime,
    #[serde(default)]
    messages: FileMessages,
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

#[derive(Deserialize)]
struct FileAuth {
    #[serde(default)]
    jwt_secret: Option<String>,
    #[serde(default = "default_auth_grace")]
    grace_secs: u64,
}

impl Default for FileAuth {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            grace_secs: default_auth_grace(),
        }
    }
}

#[derive(Deserialize)]
struct FileRealtime {
    #[serde(default = "default_heartbeat")]
    heartbeat_interval_secs: u64,
    #[serde(default = "default_missed")]
    heartbeat_missed_allowance: u32,
    #[serde(default = "default_devices")]
    device_limit: usize,
    #[serde(default = "default_malformed")]
    malformed_frame_threshold: u32,
    #[serde(default = "default_queue")]
    send_queue_capacity: usize,
}

#[derive(Deserialize)]
struct FileMessages {
    #[serde(default = "default_edit_grace")]
    edit_grace_secs: i64,
    #[serde(default = "default_typing")]
    typing_debounce_secs: u64,
}

fn default_port() -> u16 {
    8787
}

fn default_logging() -> bool {
    true
}

fn default_auth_grace() -> u64 {
    10
}

fn default_heartbeat() -> u64 {
    20
}

fn default_missed() -> u32 {
    2
}

fn default_devices() -> usize {
    5
}

fn default_malformed() -> u32 {
    25
}

fn default_queue() -> usize {
    64
}

fn default_edit_grace() -> i64 {
    300
}

fn default_typing() -> u64 {
    2
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

impl Default for FileRealtime {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat(),
            heartbeat_missed_allowance: default_missed(),
            device_limit: default_devices(),
            malformed_frame_threshold: default_malformed(),
            send_queue_capacity: default_queue(),
        }
    }
}

impl Default for FileMessages {
    fn default() -> Self {
        Self {
            edit_grace_secs: default_edit_grace(),
            typing_debounce_secs: default_typing(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file
    /// and defaults, in that order of precedence.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut file_cfg = FileConfig::default();

        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("SCHOOL_CHAT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/school_chat.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            file_cfg = toml::from_str(&contents).context("invalid config file")?;
        }

        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;

        // environment overrides
        if let Ok(p) = std::env::var("SCHOOL_CHAT_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("SCHOOL_CHAT_LOGGING") {
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

        // validate port range
        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }

        // bind address precedence for host override
        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| std::env::var("DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        Ok(Self {
            bind,
            data_dir,
            logging_enabled: logging,
            jwt_secret: file_cfg.auth.jwt_secret,
            auth_grace_secs: file_cfg.auth.grace_secs,
            heartbeat_interval_secs: file_cfg.realtime.heartbeat_interval_secs,
            heartbeat_missed_allowance: file_cfg.realtime.heartbeat_missed_allowance,
            device_limit: file_cfg.realtime.device_limit,
            malformed_frame_threshold: file_cfg.realtime.malformed_frame_threshold,
            send_queue_capacity: file_cfg.realtime.send_queue_capacity,
            edit_grace_secs: file_cfg.messages.edit_grace_secs,
            typing_debounce_secs: file_cfg.messages.typing_debounce_secs,
        })
    }

    pub fn auth_grace(&self) -> Duration {
        Duration::from_secs(self.auth_grace_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Idle time after which a silent connection counts as dead.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_missed_allowance
    }

    pub fn typing_debounce(&self) -> Duration {
        Duration::from_secs(self.typing_debounce_secs)
    }
}

/// Determine the default data directory for the service.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/school_chat");
        p
    } else {
        PathBuf::from("./school_chat_data")
    }
}
