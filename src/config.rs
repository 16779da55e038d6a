// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Configuration file handling.
//!
//! Declarative TOML describing which sensors and fans the daemon
//! controls and the curves that drive them. Default path:
//! `/etc/fancurved/config.toml`

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fancurved/config.toml";

/// Default directory for persisted fan characterization data.
pub const DEFAULT_DB_PATH: &str = "/etc/fancurved/fancurved.db";

pub const DEFAULT_TEMP_POLLING_RATE_MS: u64 = 200;
pub const DEFAULT_RPM_POLLING_RATE_MS: u64 = 1000;
pub const DEFAULT_RPM_ROLLING_WINDOW_SIZE: usize = 10;
pub const DEFAULT_ADJUSTMENT_TICK_RATE_MS: u64 = 200;
pub const DEFAULT_CHARACTERIZATION_DWELL_MS: u64 = 2000;
pub const DEFAULT_CHARACTERIZATION_STEP: u8 = 10;
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 5000;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding persisted per-fan characterization data.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Temperature sensor poll interval, in milliseconds.
    #[serde(default = "default_temp_polling_rate")]
    pub temp_sensor_polling_rate_ms: u64,

    /// RPM sampler poll interval, in milliseconds.
    #[serde(default = "default_rpm_polling_rate")]
    pub rpm_polling_rate_ms: u64,

    /// Window size for per-PWM RPM observations and the RPM moving average.
    #[serde(default = "default_rpm_window_size")]
    pub rpm_rolling_window_size: usize,

    /// Fan controller adjustment tick, in milliseconds.
    #[serde(default = "default_adjustment_tick_rate")]
    pub controller_adjustment_tick_rate_ms: u64,

    /// Dwell time at each PWM step of the characterization sweep.
    #[serde(default = "default_characterization_dwell")]
    pub characterization_dwell_ms: u64,

    /// PWM decrement between characterization steps.
    #[serde(default = "default_characterization_step")]
    pub characterization_step: u8,

    /// How long a fan may read 0 RPM at a duty cycle that should spin it
    /// before it is declared stuck.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_ms: u64,

    #[serde(default)]
    pub sensors: Vec<SensorConfig>,

    #[serde(default)]
    pub fans: Vec<FanConfig>,

    #[serde(default)]
    pub curves: Vec<CurveConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            temp_sensor_polling_rate_ms: DEFAULT_TEMP_POLLING_RATE_MS,
            rpm_polling_rate_ms: DEFAULT_RPM_POLLING_RATE_MS,
            rpm_rolling_window_size: DEFAULT_RPM_ROLLING_WINDOW_SIZE,
            controller_adjustment_tick_rate_ms: DEFAULT_ADJUSTMENT_TICK_RATE_MS,
            characterization_dwell_ms: DEFAULT_CHARACTERIZATION_DWELL_MS,
            characterization_step: DEFAULT_CHARACTERIZATION_STEP,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT_MS,
            sensors: Vec::new(),
            fans: Vec::new(),
            curves: Vec::new(),
        }
    }
}

impl Config {
    pub fn temp_polling_rate(&self) -> Duration {
        Duration::from_millis(self.temp_sensor_polling_rate_ms)
    }

    pub fn rpm_polling_rate(&self) -> Duration {
        Duration::from_millis(self.rpm_polling_rate_ms)
    }

    pub fn adjustment_tick_rate(&self) -> Duration {
        Duration::from_millis(self.controller_adjustment_tick_rate_ms)
    }

    pub fn characterization_dwell(&self) -> Duration {
        Duration::from_millis(self.characterization_dwell_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

/// A temperature sensor bound to a hwmon controller by (platform, index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: String,
    pub platform: String,
    pub index: u8,
    /// Lowest plausible reading, millidegrees C.
    pub min: i64,
    /// Highest plausible reading, millidegrees C.
    pub max: i64,
}

/// A PWM fan bound to a hwmon controller by (platform, index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanConfig {
    pub id: String,
    pub platform: String,
    pub index: u8,
    /// Curve that drives this fan.
    pub curve: String,
    /// Keep the fan spinning even when the curve says 0.
    #[serde(default)]
    pub never_stop: bool,
}

/// A named curve definition. The variant payload is flattened into the
/// curve's TOML table, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: CurveKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CurveKind {
    /// Single sensor mapped linearly to PWM, either through a
    /// `(min_temp, max_temp)` window or an explicit step table.
    Linear {
        sensor: String,
        /// Window low end, millidegrees C.
        #[serde(default)]
        min_temp: Option<i64>,
        /// Window high end, millidegrees C.
        #[serde(default)]
        max_temp: Option<i64>,
        /// Explicit temperature -> PWM points, interpolated between.
        #[serde(default)]
        steps: Option<Vec<CurveStep>>,
    },

    /// PID loop holding a temperature setpoint.
    Pid {
        sensor: String,
        p: f64,
        i: f64,
        d: f64,
        /// Target temperature, millidegrees C.
        setpoint: i64,
    },

    /// Combine the outputs of other curves.
    Function {
        function: CurveFunction,
        curves: Vec<String>,
    },
}

/// A single point of a linear step table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CurveStep {
    /// Temperature in millidegrees C.
    pub temp: i64,
    /// PWM duty value (0-255).
    pub pwm: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CurveFunction {
    Min,
    Max,
    Average,
    /// Spread between the hottest and coldest member, `max - min`.
    Delta,
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load config from a TOML file, or return the default if the file
/// doesn't exist. A present-but-invalid file is a fatal error.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        log::info!("No config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| Error::config(format!("cannot parse {}: {e}", path.display())))?;

    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Resolve the config file path from CLI arg or default.
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    cli_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

fn default_temp_polling_rate() -> u64 {
    DEFAULT_TEMP_POLLING_RATE_MS
}

fn default_rpm_polling_rate() -> u64 {
    DEFAULT_RPM_POLLING_RATE_MS
}

fn default_rpm_window_size() -> usize {
    DEFAULT_RPM_ROLLING_WINDOW_SIZE
}

fn default_adjustment_tick_rate() -> u64 {
    DEFAULT_ADJUSTMENT_TICK_RATE_MS
}

fn default_characterization_dwell() -> u64 {
    DEFAULT_CHARACTERIZATION_DWELL_MS
}

fn default_characterization_step() -> u8 {
    DEFAULT_CHARACTERIZATION_STEP
}

fn default_stall_timeout() -> u64 {
    DEFAULT_STALL_TIMEOUT_MS
}
