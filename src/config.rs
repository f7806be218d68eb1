//! Node configuration (config.json).
//!
//! Every field has a default, so an empty or missing file describes a
//! single node listening on `127.0.0.1:7420` with no locator directory, so
//! IsEnabled reports `false` until a shared backend is configured. The
//! default location is the platform config directory
//! (e.g. `~/.config/resumer/config.json`).

use crate::locator::DirectoryKind;
use crate::paths;
use crate::registry::{
    DEFAULT_LOCATOR_REFRESH, DEFAULT_LOCATOR_TTL, DEFAULT_RETENTION, RecordingOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7420";
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Node settings (persisted to config.json).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Socket address the server binds
    pub listen: String,
    /// `host:port` published in the locator directory
    pub advertised_address: Option<String>,
    /// Where spool files live
    pub spool_dir: Option<PathBuf>,
    pub locator_ttl_secs: u64,
    pub locator_refresh_secs: u64,
    /// How long finished recordings stay replayable
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    pub directory: DirectoryConfig,
}

/// Locator directory backend selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub kind: DirectoryKind,
    /// Shared directory for the `file` backend
    pub path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            advertised_address: None,
            spool_dir: None,
            locator_ttl_secs: DEFAULT_LOCATOR_TTL.as_secs(),
            locator_refresh_secs: DEFAULT_LOCATOR_REFRESH.as_secs(),
            retention_secs: DEFAULT_RETENTION.as_secs(),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            directory: DirectoryConfig::default(),
        }
    }
}

impl Config {
    /// Spool directory, falling back to the platform data dir.
    pub fn spool_dir(&self) -> PathBuf {
        self.spool_dir
            .clone()
            .unwrap_or_else(paths::default_spool_dir)
    }

    /// Recording timings. A refresh period that would let the locator lapse
    /// is clamped to half the TTL.
    pub fn recording_options(&self) -> RecordingOptions {
        let locator_ttl = Duration::from_secs(self.locator_ttl_secs.max(1));
        let mut locator_refresh = Duration::from_secs(self.locator_refresh_secs);
        if locator_refresh.is_zero() || locator_refresh >= locator_ttl {
            let clamped = locator_ttl / 2;
            warn!(
                refresh_secs = self.locator_refresh_secs,
                ttl_secs = self.locator_ttl_secs,
                "locator refresh must be shorter than its TTL; using {:?}",
                clamped
            );
            locator_refresh = clamped;
        }
        RecordingOptions {
            locator_ttl,
            locator_refresh,
            retention: Duration::from_secs(self.retention_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Default config file path (e.g. `~/.config/resumer/config.json`).
pub fn default_config_path() -> Option<PathBuf> {
    paths::config_dir().map(|d| d.join("config.json"))
}

/// Load config from the default location, returning defaults if the file is
/// missing or invalid.
pub fn load_config() -> Config {
    let Some(path) = default_config_path() else {
        return Config::default();
    };
    load_config_from(&path)
}

/// Save config to the default location.
pub fn save_config(config: &Config) -> Result<(), std::io::Error> {
    let path = default_config_path().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "config dir not found")
    })?;
    save_config_to(config, &path)
}

// ---------------------------------------------------------------------------
// Path-parameterised helpers (used by public API and tests)
// ---------------------------------------------------------------------------

pub fn load_config_from(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "invalid config; using defaults");
            Config::default()
        }),
        Err(_) => Config::default(),
    }
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Write bytes to a file atomically: write to a temp file in the same
/// directory, then rename over the target. Prevents partial JSON on crash.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
