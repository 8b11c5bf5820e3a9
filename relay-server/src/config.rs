//! Startup configuration: CLI flags layered over an optional TOML file (spec.md §6).
//!
//! Modeled on `gamecore::config::GameConfig` (`examples/SleepingPills-bushhammer/server/game/core/src/config.rs`):
//! a `Default` impl carrying the spec's stated defaults, a `serdeconv`-backed `load`, and a
//! thin `clap` layer in `main` that overrides individual fields when flags are present.

use std::path::Path;

use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_MAX_CLIENTS: usize = 1024;
pub const DEFAULT_MAX_CHANNELS: usize = 256;
pub const DEFAULT_WORKERS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,
    pub max_clients: usize,
    pub max_channels: usize,
    pub workers: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            max_channels: DEFAULT_MAX_CHANNELS,
            workers: DEFAULT_WORKERS,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads a TOML config file. Fields absent from the file fall back to `Default`'s
    /// values by virtue of `#[serde(default)]` on each field at the call site — here we
    /// instead parse into a full `Config`, so a partial file is an error; `main` only calls
    /// this when `--config` was actually supplied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
