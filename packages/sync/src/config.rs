use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_PERSISTENCE_PATH: &str = "./data";
pub const DEFAULT_SAVE_INTERVAL_MS: u64 = 5000;

/// Grove room server - hosts shared documents over websockets
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "grove-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Interface to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Directory holding one snapshot file per room
    #[arg(long, env = "PERSISTENCE_PATH", default_value = DEFAULT_PERSISTENCE_PATH)]
    pub persistence_path: PathBuf,

    /// Milliseconds between saves of changed rooms
    #[arg(
        long = "save-interval",
        env = "SAVE_INTERVAL",
        default_value_t = DEFAULT_SAVE_INTERVAL_MS
    )]
    pub save_interval_ms: u64,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms.max(1))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: "0.0.0.0".to_string(),
            persistence_path: PathBuf::from(DEFAULT_PERSISTENCE_PATH),
            save_interval_ms: DEFAULT_SAVE_INTERVAL_MS,
        }
    }
}

/// Keep-alive and reconnect tuning for [`crate::SyncClient`]
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub ping_interval: Duration,
    /// A ping unanswered for this long counts as a dropped connection
    pub pong_timeout: Duration,
    /// Give up reconnecting after this long and report the connection lost
    pub reconnect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}
