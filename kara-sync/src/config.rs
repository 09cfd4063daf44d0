//! Configuration management for kara-sync
//!
//! A single TOML file carries logging, sync tuning, attachment and retry
//! settings. Every value has a built-in default so the file (and every table in
//! it) is optional.
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments (--config)
//! 2. Environment variable (KARA_CONFIG)
//! 3. Platform configuration directory
//! 4. Built-in defaults (code constants)

use crate::error::{Error, Result};
use crate::playback::retry::RetryPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Root configuration loaded from TOML
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Timing and threshold constants for loop and drift handling
    #[serde(default)]
    pub sync: SyncTuning,

    /// Stream attachment settings
    #[serde(default)]
    pub attach: AttachConfig,

    /// Retry policies for follower start sequences
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Empirically tuned timing and threshold constants
///
/// Times in seconds are `f64`; periods are milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncTuning {
    /// Drift correction and loop checks are suppressed this long after a seek
    pub settle_window_ms: u64,
    /// Loop boundary check period
    pub loop_tick_ms: u64,
    /// Drift correction period
    pub sync_tick_ms: u64,
    /// Position broadcast period
    pub position_tick_ms: u64,
    /// Follower drift beyond which it is snapped back to the primary
    pub drift_threshold: f64,
    /// Forward bias applied when snapping the follower
    pub drift_bias: f64,
    /// Jump fires once the position is within this distance of the loop end
    pub loop_end_epsilon: f64,
    /// Landing offset past the loop start after a jump
    pub jump_offset: f64,
    /// Minimum spacing between two loop jumps
    pub jump_cooldown_ms: u64,
    /// Resume offset past the loop end after clearing mid-region
    pub clear_resume_offset: f64,
    /// Distance kept from the end of the track when resuming after a clear
    pub clear_tail_margin: f64,
    /// Positions this close before the loop start also count as inside it
    pub clear_start_proximity: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    /// How long to wait for the follower after the primary has ended
    pub end_grace_ms: u64,
    /// Follower within this distance of its duration counts as finished
    pub end_epsilon: f64,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            settle_window_ms: 120,
            loop_tick_ms: 50,
            sync_tick_ms: 200,
            position_tick_ms: 50,
            drift_threshold: 0.09,
            drift_bias: 0.01,
            loop_end_epsilon: 0.01,
            jump_offset: 0.005,
            jump_cooldown_ms: 120,
            clear_resume_offset: 0.03,
            clear_tail_margin: 0.02,
            clear_start_proximity: 0.15,
            min_rate: 0.25,
            max_rate: 4.0,
            end_grace_ms: 1500,
            end_epsilon: 0.25,
        }
    }
}

impl SyncTuning {
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn loop_tick(&self) -> Duration {
        Duration::from_millis(self.loop_tick_ms)
    }

    pub fn sync_tick(&self) -> Duration {
        Duration::from_millis(self.sync_tick_ms)
    }

    pub fn position_tick(&self) -> Duration {
        Duration::from_millis(self.position_tick_ms)
    }

    pub fn jump_cooldown(&self) -> Duration {
        Duration::from_millis(self.jump_cooldown_ms)
    }

    pub fn end_grace(&self) -> Duration {
        Duration::from_millis(self.end_grace_ms)
    }

    /// Clamp a requested playback rate into the supported range
    pub fn clamp_rate(&self, rate: f64) -> f64 {
        if rate.is_finite() {
            rate.clamp(self.min_rate, self.max_rate)
        } else {
            1.0
        }
    }

    fn validate(&self) -> Result<()> {
        let periods = [
            ("loop_tick_ms", self.loop_tick_ms),
            ("sync_tick_ms", self.sync_tick_ms),
            ("position_tick_ms", self.position_tick_ms),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be greater than zero", name)));
            }
        }
        if !(self.min_rate > 0.0 && self.min_rate <= self.max_rate) {
            return Err(Error::InvalidConfig(format!(
                "rate range [{}, {}] is empty",
                self.min_rate, self.max_rate
            )));
        }
        if self.drift_threshold <= self.drift_bias {
            warn!(
                "drift_threshold {} <= drift_bias {}; corrections may oscillate",
                self.drift_threshold, self.drift_bias
            );
        }
        Ok(())
    }
}

/// Stream attachment settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Upper bound for primary metadata to arrive
    pub primary_ready_timeout_ms: u64,
    /// Upper bound for the follower to buffer enough data
    pub follower_ready_timeout_ms: u64,
    /// Location of the host itself; a stream pointing here points at nothing
    pub self_location: Option<String>,
    /// URI schemes whose handles are volatile and must be fetched into memory
    pub materialize_schemes: Vec<String>,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            primary_ready_timeout_ms: 10_000,
            follower_ready_timeout_ms: 15_000,
            self_location: None,
            materialize_schemes: vec!["blob".to_string()],
        }
    }
}

impl AttachConfig {
    pub fn primary_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.primary_ready_timeout_ms)
    }

    pub fn follower_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.follower_ready_timeout_ms)
    }
}

/// Retry policies for the follower start sequence
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Used by play() when starting the follower
    pub follower_start: RetryPolicy,
    /// Used by the drift corrector when the follower stalls
    pub reattach: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            follower_start: RetryPolicy::follower_start(),
            reattach: RetryPolicy::single(),
        }
    }
}

impl TomlConfig {
    /// Load and validate configuration; `None` yields built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: TomlConfig = kara_common::config::load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        if self.retry.follower_start.max_attempts == 0 || self.retry.reattach.max_attempts == 0 {
            return Err(Error::InvalidConfig("retry max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}
