//! Configuration management
//!
//! TOML file with built-in defaults. Lookup order: the `--config` path,
//! `~/.config/usbip-tcp/config.toml`, `/etc/usbip-tcp/config.toml`,
//! defaults. CLI flags override whatever the file says.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default log level when RUST_LOG and --log-level are absent.
    pub log_level: String,
    pub network: NetworkSettings,
    pub usb: UsbSettings,
    pub limits: LimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Exporter bind address.
    pub listen_addr: String,
    /// Importer default server address.
    pub connect_addr: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbSettings {
    /// Device classes eligible for export; empty exports everything.
    pub allowed_classes: Vec<u8>,
    /// Per-transfer timeout handed to the device backend.
    pub transfer_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Concurrently active exporter sessions.
    pub max_sessions: usize,
    /// Steady accept rate (and burst) before connections are refused.
    pub accepts_per_second: u32,
    /// URB queue depth per session; bounds memory and applies backpressure.
    pub queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            network: NetworkSettings::default(),
            usb: UsbSettings::default(),
            limits: LimitSettings::default(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            connect_addr: "127.0.0.1".to_string(),
            port: protocol::DEFAULT_PORT,
        }
    }
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            // Mass storage only, unless configured otherwise.
            allowed_classes: vec![0x08],
            transfer_timeout_ms: 1000,
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            accepts_per_second: 8,
            queue_depth: 64,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Resolve the configuration: an explicit path must load, the default
    /// locations are optional.
    pub fn load_or_default(explicit: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(&path);
        }
        for candidate in Self::default_paths() {
            if candidate.exists() {
                return Self::load(&candidate);
            }
        }
        Ok(Self::default())
    }

    fn default_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("usbip-tcp").join("config.toml"));
        }
        paths.push(PathBuf::from("/etc/usbip-tcp/config.toml"));
        paths
    }
}
