use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ws::SessionSettings;

// Only flags given on the command line (or through their env var) are
// serialized, so unset flags never mask values from the TOML file.

/// Huddle realtime server
#[derive(Parser, Serialize, Clone, Debug)]
#[command(name = "huddle-server", version, about = "Huddle realtime chat server")]
pub struct Cli {
    /// Port to listen on [default: 8080]
    #[arg(long, env = "HUDDLE_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "HUDDLE_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./huddle.toml")]
    #[serde(skip)]
    pub config: String,

    /// Enable structured JSON logging
    #[arg(long, env = "HUDDLE_JSON_LOGS")]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub generate_config: bool,

    /// SQLite database shared with the REST backend. Without it the server
    /// runs on an in-memory demo store.
    #[arg(long, env = "HUDDLE_DATABASE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

/// Effective configuration after layering.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,

    pub bind_address: String,

    #[serde(default)]
    pub json_logs: bool,

    #[serde(default)]
    pub generate_config: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Queue sizes and timeouts (loaded from [realtime] section in TOML)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime: Option<RealtimeConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Inbound frames buffered before readers block (default: 100)
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,

    /// Outbound frames buffered per session before delivery drops (default: 64)
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Upper bound on one socket write, in milliseconds (default: 1000)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            intake_capacity: default_intake_capacity(),
            outbound_capacity: default_outbound_capacity(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

fn default_intake_capacity() -> usize {
    100
}

fn default_outbound_capacity() -> usize {
    64
}

fn default_write_timeout_ms() -> u64 {
    1000
}

impl RealtimeConfig {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            outbound_capacity: self.outbound_capacity,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            generate_config: false,
            database: None,
            realtime: Some(RealtimeConfig::default()),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (HUDDLE_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::from_cli(Cli::parse())
    }

    fn from_cli(cli: Cli) -> Result<Self, figment::Error> {
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("HUDDLE_").split("__"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    pub fn realtime(&self) -> RealtimeConfig {
        self.realtime.clone().unwrap_or_default()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Huddle Realtime Server Configuration
# Place this file at ./huddle.toml or specify with --config <path>
# Settings can be overridden via environment variables (HUDDLE_PORT,
# HUDDLE_REALTIME__INTAKE_CAPACITY, etc.) or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging
# json_logs = false

# SQLite database owned by the REST backend. Must already exist.
# When unset the server starts with an in-memory demo store.
# database = "./chat.db"

# ---- Realtime delivery ----
# [realtime]

# Inbound frames buffered before connection readers wait (default: 100)
# intake_capacity = 100

# Outbound frames buffered per connection; further messages are dropped
# for that connection until it catches up (default: 64)
# outbound_capacity = 64

# Maximum time for a single socket write before the connection is closed
# write_timeout_ms = 1000
"#
    .to_string()
}
