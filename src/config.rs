//! Server configuration: bind port, history directory, and the
//! inactivity/sweeper timings.
//!
//! Grounded on the teacher's `config.rs`: a `Default` impl providing
//! sane out-of-the-box values, `serde_json`-based persistence
//! (`Config::load`/`save`), and an environment-variable override read at
//! `config_dir()` resolution time.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_INACTIVITY_THRESHOLD_SECS: u64 = 25;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;

/// Server-wide configuration, loaded from an optional JSON file and
/// overridden by environment variables or CLI flags.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// TCP port the server binds to.
    pub port: u16,
    /// Directory holding `general.txt` (public history) and the
    /// `private/` subdirectory (per-pair private history).
    pub history_dir: PathBuf,
    /// Seconds of inactivity after which an `Active` user is demoted to
    /// `Inactive` by the sweeper.
    pub inactivity_threshold_secs: u64,
    /// Sweeper tick interval in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            history_dir: default_history_dir(),
            inactivity_threshold_secs: DEFAULT_INACTIVITY_THRESHOLD_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

fn default_history_dir() -> PathBuf {
    if cfg!(test) {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/yappuchino-test-history")
    } else {
        dirs_history_dir()
    }
}

fn dirs_history_dir() -> PathBuf {
    std::env::var("YAPPUCHINO_HISTORY_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("history"))
}

impl Config {
    /// Path to the optional JSON config file, overridable via
    /// `YAPPUCHINO_CONFIG_PATH`.
    #[must_use]
    pub fn config_path() -> PathBuf {
        std::env::var("YAPPUCHINO_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("yappuchino.json"))
    }

    /// Load configuration from the config file if it exists, falling back
    /// to [`Config::default`] otherwise. Environment variables
    /// (`YAPPUCHINO_PORT`, `YAPPUCHINO_HISTORY_DIR`) override whichever
    /// source wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(port) = std::env::var("YAPPUCHINO_PORT") {
            config.port = port
                .parse()
                .with_context(|| format!("YAPPUCHINO_PORT is not a valid port: {port}"))?;
        }
        if let Ok(dir) = std::env::var("YAPPUCHINO_HISTORY_DIR") {
            config.history_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Persist configuration to [`Config::config_path`] as pretty-printed
    /// JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the file write fails.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(self).context("serializing config")?;
        std::fs::write(&path, contents).with_context(|| format!("writing config file {}", path.display()))
    }

    #[must_use]
    pub fn public_history_path(&self) -> PathBuf {
        self.history_dir.join("general.txt")
    }

    #[must_use]
    pub fn private_history_dir(&self) -> PathBuf {
        self.history_dir.join("private")
    }
}
