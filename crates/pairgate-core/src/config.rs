//! Configuration management for PairGate.
//!
//! Loads configuration from ${PAIRGATE_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::transport::TransportStep;

/// Identity-provider origin used when nothing is configured.
pub const DEFAULT_IDP_URL: &str = "https://id.pairgate.app";

/// Environment variable overriding `frame.base_url`.
pub const IDP_URL_ENV: &str = "PAIRGATE_IDP_URL";

/// Returns the default config template with comments.
///
/// This is embedded from default_config.toml at compile time.
/// To update, run `cargo xtask update-default-config`.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! Path resolution for PairGate configuration and data directories.
    //!
    //! PAIRGATE_HOME resolution order:
    //! 1. PAIRGATE_HOME environment variable (if set)
    //! 2. ~/.config/pairgate (default)

    use std::path::PathBuf;

    /// Returns the PairGate home directory.
    pub fn pairgate_home() -> PathBuf {
        if let Ok(home) = std::env::var("PAIRGATE_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".pairgate"),
            |h| h.join(".config").join("pairgate"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        pairgate_home().join("config.toml")
    }

    /// Returns the path to the persisted session file.
    pub fn session_path() -> PathBuf {
        pairgate_home().join("session.json")
    }

    /// Returns the directory log files are written to.
    pub fn logs_dir() -> PathBuf {
        pairgate_home().join("logs")
    }
}

/// Identity-provider frame settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Base URL of the identity-provider frame (falls back to the default origin)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Frame width while interactive authentication is visible
    pub visible_width: u32,
    /// Frame height while interactive authentication is visible
    pub visible_height: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            visible_width: 480,
            visible_height: 640,
        }
    }
}

impl FrameConfig {
    /// Returns the validated frame origin.
    ///
    /// An unset or blank `base_url` resolves to [`DEFAULT_IDP_URL`].
    pub fn effective_base_url(&self) -> Result<Url> {
        let raw = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_IDP_URL);
        Url::parse(raw).with_context(|| format!("Invalid identity provider URL '{raw}'"))
    }
}

/// Handshake timing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Delay between frame mount checks, in milliseconds
    pub mount_poll_interval_ms: u64,
    /// Number of mount polls before giving up
    pub mount_poll_attempts: u32,
    /// Wall-clock budget for the frame document to load, in seconds
    pub load_timeout_secs: u64,
    /// Pause after the load signal so the frame's scripts can initialise, in milliseconds
    pub settle_delay_ms: u64,
    /// Pause between reaching success and notifying the caller, in milliseconds
    pub success_display_delay_ms: u64,
    /// Bound on each transport call, in seconds (0 disables)
    pub transport_timeout_secs: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            mount_poll_interval_ms: 500,
            mount_poll_attempts: 40,
            load_timeout_secs: 30,
            settle_delay_ms: 2_000,
            success_display_delay_ms: 500,
            transport_timeout_secs: 0,
        }
    }
}

impl HandshakeConfig {
    pub fn transport_timeout(&self) -> Option<Duration> {
        if self.transport_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.transport_timeout_secs))
        }
    }
}

/// Local simulation used in mock mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Delay before the simulated frame mounts, in milliseconds
    pub mount_delay_ms: u64,
    /// Delay between mount and the simulated load signal, in milliseconds
    pub load_delay_ms: u64,
    /// When set, the simulated frame raises a load error with this message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_error: Option<String>,
    /// Latency of every simulated transport call, in milliseconds
    pub latency_ms: u64,
    /// Transport step the simulation rejects ("readiness", "link" or "pairing")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_step: Option<TransportStep>,
    /// Message attached to the simulated rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_message: Option<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            mount_delay_ms: 300,
            load_delay_ms: 400,
            load_error: None,
            latency_ms: 100,
            reject_step: None,
            reject_message: None,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity-provider frame settings.
    pub frame: FrameConfig,

    /// Handshake timing policy.
    pub handshake: HandshakeConfig,

    /// Mock-mode simulation settings.
    pub simulation: SimulationConfig,
}

impl Config {
    /// Loads configuration from the default config path.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&paths::config_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Applies environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(IDP_URL_ENV)
            && !url.trim().is_empty()
        {
            self.frame.base_url = Some(url);
        }
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Generates a fresh config TOML from Rust defaults.
    ///
    /// This is used by `xtask update-default-config` to keep
    /// `default_config.toml` in sync with Rust default values.
    pub fn generate() -> Result<String> {
        use toml_edit::{DocumentMut, Item};

        fn merge(target: &mut toml_edit::Table, source: &toml_edit::Table) {
            for (key, value) in source.iter() {
                match value {
                    Item::Value(v) => {
                        target[key] = Item::Value(v.clone());
                    }
                    Item::Table(src_table) => {
                        if let Some(Item::Table(target_table)) = target.get_mut(key) {
                            merge(target_table, src_table);
                        } else {
                            target[key] = Item::Table(src_table.clone());
                        }
                    }
                    Item::ArrayOfTables(arr) => {
                        target[key] = Item::ArrayOfTables(arr.clone());
                    }
                    Item::None => {}
                }
            }
        }

        let config = Config::default();
        let generated_toml =
            toml::to_string(&config).context("Failed to serialize default config to TOML")?;

        // Template keeps the comments, generated values win
        let mut doc: DocumentMut = default_config_template()
            .parse()
            .context("Failed to parse default config template")?;
        let generated_doc: DocumentMut = generated_toml
            .parse()
            .context("Failed to parse generated config")?;

        merge(doc.as_table_mut(), generated_doc.as_table());

        Ok(doc.to_string())
    }

    /// Writes config content to a file, creating parent directories as needed.
    /// Uses atomic write (temp file + rename) to prevent corruption.
    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}
