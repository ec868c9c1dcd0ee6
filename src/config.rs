//! # Configuration Module
//!
//! Handles loading and validating program configuration from TOML files.
//!
//! Every section and field is optional; an empty file yields the defaults.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Which family of assignments wins when a control offers several.
///
/// Generic assignments (momentary, linear, toggle) always stay eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PreferredControlMode {
    /// One-shot values sent over the transport
    #[default]
    DirectControl,
    /// Closed-loop convergence through simulated key presses
    SyncControl,
    /// Values written through the remote API
    ApiControl,
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProgramConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sequencer: SequencerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine-wide settings
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub preferred_control_mode: PreferredControlMode,

    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    #[serde(default = "default_fanout_timeout_ms")]
    pub fanout_timeout_ms: u64,
}

/// Key sequencer settings
#[derive(Debug, Deserialize, Clone)]
pub struct SequencerConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,

    #[serde(default = "default_key_group_delay_ms")]
    pub key_group_delay_ms: u64,

    #[serde(default = "default_keyboard_name")]
    pub keyboard_name: String,
}

/// Sync convergence settings
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_margin_of_error")]
    pub margin_of_error: f64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_subscription_id")]
    pub subscription_id: u32,

    /// Poll the remote API subscription for feedback in addition to
    /// `sync_control` transport messages
    #[serde(default)]
    pub poll_subscription: bool,
}

/// Input device settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ControllerConfig {
    /// Explicit `/dev/input/event*` paths. Empty means auto-detect.
    #[serde(default)]
    pub device_paths: Vec<PathBuf>,
}

/// JSON documents loaded at startup
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilesConfig {
    #[serde(default)]
    pub sdl_mappings: Vec<PathBuf>,

    #[serde(default)]
    pub calibrations: Vec<PathBuf>,

    #[serde(default)]
    pub profiles: Vec<PathBuf>,
}

/// Logging settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for the daily rolling log file. Unset logs to stdout only.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
}

// Default value functions
fn default_event_queue_capacity() -> usize { 64 }
fn default_fanout_timeout_ms() -> u64 { 1000 }

fn default_queue_capacity() -> usize { 32 }
fn default_enqueue_timeout_ms() -> u64 { 1000 }
fn default_key_group_delay_ms() -> u64 { 30 }
fn default_keyboard_name() -> String { "TSW Controller Virtual Keyboard".to_string() }

fn default_margin_of_error() -> f64 { 0.005 }
fn default_poll_interval_ms() -> u64 { 333 }
fn default_subscription_id() -> u32 { 83211 }

fn default_log_file_prefix() -> String { "tsw-controller.log".to_string() }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preferred_control_mode: PreferredControlMode::default(),
            event_queue_capacity: default_event_queue_capacity(),
            fanout_timeout_ms: default_fanout_timeout_ms(),
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            key_group_delay_ms: default_key_group_delay_ms(),
            keyboard_name: default_keyboard_name(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            margin_of_error: default_margin_of_error(),
            poll_interval_ms: default_poll_interval_ms(),
            subscription_id: default_subscription_id(),
            poll_subscription: false,
        }
    }
}

impl ProgramConfig {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<ProgramConfig>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use tsw_controller::config::ProgramConfig;
    ///
    /// let config = ProgramConfig::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: ProgramConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        if self.engine.event_queue_capacity == 0 || self.engine.event_queue_capacity > 4096 {
            return Err(crate::error::TswControllerError::Config(
                toml::de::Error::custom("event_queue_capacity must be between 1 and 4096")
            ));
        }

        if self.engine.fanout_timeout_ms == 0 || self.engine.fanout_timeout_ms > 60000 {
            return Err(crate::error::TswControllerError::Config(
                toml::de::Error::custom("fanout_timeout_ms must be between 1 and 60000")
            ));
        }

        if self.sequencer.queue_capacity == 0 || self.sequencer.queue_capacity > 1024 {
            return Err(crate::error::TswControllerError::Config(
                toml::de::Error::custom("queue_capacity must be between 1 and 1024")
            ));
        }

        if self.sequencer.enqueue_timeout_ms == 0 || self.sequencer.enqueue_timeout_ms > 60000 {
            return Err(crate::error::TswControllerError::Config(
                toml::de::Error::custom("enqueue_timeout_ms must be between 1 and 60000")
            ));
        }

        if self.sequencer.key_group_delay_ms > 1000 {
            return Err(crate::error::TswControllerError::Config(
                toml::de::Error::custom("key_group_delay_ms must be at most 1000")
            ));
        }

        if self.sequencer.keyboard_name.is_empty() {
            return Err(crate::error::TswControllerError::Config(
                toml::de::Error::custom("keyboard_name cannot be empty")
            ));
        }

        if !(self.sync.margin_of_error > 0.0 && self.sync.margin_of_error < 0.5) {
            return Err(crate::error::TswControllerError::Config(
                toml::de::Error::custom("margin_of_error must be between 0.0 and 0.5 (exclusive)")
            ));
        }

        if self.sync.poll_interval_ms < 10 || self.sync.poll_interval_ms > 60000 {
            return Err(crate::error::TswControllerError::Config(
                toml::de::Error::custom("poll_interval_ms must be between 10 and 60000")
            ));
        }

        if self.logging.log_dir.is_some() && self.logging.file_prefix.is_empty() {
            return Err(crate::error::TswControllerError::Config(
                toml::de::Error::custom("logging file_prefix cannot be empty when log_dir is set")
            ));
        }

        Ok(())
    }
}
