//! Session tunables, persisted at `~/.config/sget/config.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";

/// Tunables for a download session. CLI flags override individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgetConfig {
    /// Number of parallel worker slots (connections) per download.
    pub thread_count: usize,
    /// Smallest byte window worth a dedicated connection; also the hash-audit
    /// resolution. Splits never produce windows under this size.
    pub min_chunk_bytes: u64,
    /// Seconds without progress on a slot before its transfer is restarted.
    pub read_timeout_secs: u64,
    /// Seconds allowed for TCP/TLS connection establishment.
    pub connect_timeout_secs: u64,
}

impl Default for SgetConfig {
    fn default() -> Self {
        Self {
            thread_count: 16,
            min_chunk_bytes: 256 * 1024,
            read_timeout_secs: 20,
            connect_timeout_secs: 15,
        }
    }
}

impl SgetConfig {
    /// Load the config file, writing the defaults there on first run.
    ///
    /// A malformed file is an error; zero values are replaced by their
    /// defaults with a warning.
    pub fn load_or_create() -> Result<SgetConfig> {
        let path = config_path()?;
        let cfg: SgetConfig = match fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text)
                .with_context(|| format!("malformed config {}", path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let cfg = SgetConfig::default();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, toml::to_string_pretty(&cfg)?)
                    .with_context(|| format!("write default config {}", path.display()))?;
                tracing::info!("wrote default config to {}", path.display());
                cfg
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read config {}", path.display()))
            }
        };
        Ok(cfg.normalized())
    }

    /// Replace zero values (unusable for a session) by their defaults.
    fn normalized(mut self) -> SgetConfig {
        let defaults = SgetConfig::default();
        if self.thread_count == 0 {
            tracing::warn!("thread_count 0 in config, using {}", defaults.thread_count);
            self.thread_count = defaults.thread_count;
        }
        if self.min_chunk_bytes == 0 {
            tracing::warn!("min_chunk_bytes 0 in config, using {}", defaults.min_chunk_bytes);
            self.min_chunk_bytes = defaults.min_chunk_bytes;
        }
        if self.read_timeout_secs == 0 {
            tracing::warn!("read_timeout_secs 0 in config, using {}", defaults.read_timeout_secs);
            self.read_timeout_secs = defaults.read_timeout_secs;
        }
        if self.connect_timeout_secs == 0 {
            tracing::warn!(
                "connect_timeout_secs 0 in config, using {}",
                defaults.connect_timeout_secs
            );
            self.connect_timeout_secs = defaults.connect_timeout_secs;
        }
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

fn config_path() -> Result<PathBuf> {
    let dirs = xdg::BaseDirectories::with_prefix("sget")
        .context("XDG config directory unavailable")?;
    dirs.place_config_file(CONFIG_FILE)
        .context("create sget config directory")
}
