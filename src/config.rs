//! Configuration system using Figment.
//!
//! Strongly-typed settings for the three logic loops. Configuration is
//! loaded from:
//! 1. a TOML file (base configuration, see `config/default.toml`)
//! 2. environment variables (prefixed with `RUSTPHOTONICS_`)
//!
//! # Environment Variable Overrides
//!
//! Environment variables with the `RUSTPHOTONICS_` prefix can override
//! configuration values, using `__` as the section separator:
//!
//! ```text
//! RUSTPHOTONICS_POWER_LOCK__PHOTODIODE_FACTOR=30.0
//! RUSTPHOTONICS_MOTION__DEAD_ZONE=0.25
//! ```
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working simulated-rig configuration. After loading, configuration is
//! validated; semantic errors surface as
//! [`LabError::ConfigValidation`](crate::error::LabError).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::control::PidGains;
use crate::error::{AppResult, LabError};
use crate::hardware::Axis;

/// Top-level application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// AOM power-lock loop settings.
    #[serde(default)]
    pub power_lock: PowerLockSettings,
    /// Stage motion-coordination settings.
    #[serde(default)]
    pub motion: MotionSettings,
    /// Z count-optimization settings.
    #[serde(default)]
    pub optimizer: OptimizerSettings,
}

/// Settings for the AOM power-lock loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerLockSettings {
    /// Analog input channel wired to the photodiode.
    #[serde(default = "default_photodiode_channel")]
    pub photodiode_channel: String,
    /// Analog output channel driving the AOM, if wired.
    #[serde(default = "default_aom_channel")]
    pub aom_channel: Option<String>,
    /// Linear calibration from photodiode volts to optical power in uW
    /// (measured after the objective).
    #[serde(default = "default_photodiode_factor")]
    pub photodiode_factor: f64,
    /// Photodiode sampling interval.
    #[serde(with = "humantime_serde", default = "default_query_interval")]
    pub query_interval: Duration,
    /// Minimum interval between published status events.
    #[serde(with = "humantime_serde", default = "default_ui_update_interval")]
    pub ui_update_interval: Duration,
    /// Allowed AOM drive voltage range `[min, max]`.
    #[serde(default = "default_volt_range")]
    pub volt_range: [f64; 2],
    /// PID gains, in volts of output per volt of error.
    #[serde(default = "default_pid_gains")]
    pub pid_gains: PidGains,
    /// Kalman filter tuning for the photodiode reading.
    #[serde(default)]
    pub kalman: KalmanSettings,
}

impl Default for PowerLockSettings {
    fn default() -> Self {
        Self {
            photodiode_channel: default_photodiode_channel(),
            aom_channel: default_aom_channel(),
            photodiode_factor: default_photodiode_factor(),
            query_interval: default_query_interval(),
            ui_update_interval: default_ui_update_interval(),
            volt_range: default_volt_range(),
            pid_gains: default_pid_gains(),
            kalman: KalmanSettings::default(),
        }
    }
}

/// Kalman filter tuning parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KalmanSettings {
    #[serde(default = "default_process_variance")]
    pub process_variance: f64,
    #[serde(default = "default_measurement_variance")]
    pub measurement_variance: f64,
    #[serde(default = "default_initial_covariance")]
    pub initial_covariance: f64,
}

impl Default for KalmanSettings {
    fn default() -> Self {
        Self {
            process_variance: default_process_variance(),
            measurement_variance: default_measurement_variance(),
            initial_covariance: default_initial_covariance(),
        }
    }
}

/// Settings for the motion coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionSettings {
    /// Stage position polling interval.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Axes whose jog/step direction is inverted relative to the gamepad/GUI
    /// sense.
    #[serde(default)]
    pub jog_invert_axes: Vec<Axis>,
    /// Joystick dead-zone radius (normalized stick units).
    #[serde(default = "default_dead_zone")]
    pub dead_zone: f64,
    /// Named velocity presets applied by the gamepad face buttons.
    #[serde(default)]
    pub preset_velocities: PresetVelocities,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            jog_invert_axes: Vec::new(),
            dead_zone: default_dead_zone(),
            preset_velocities: PresetVelocities::default(),
        }
    }
}

/// Per-axis velocities for the slow/medium/fast presets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetVelocities {
    #[serde(default = "default_slow_preset")]
    pub slow: HashMap<Axis, f64>,
    #[serde(default = "default_medium_preset")]
    pub medium: HashMap<Axis, f64>,
    #[serde(default = "default_fast_preset")]
    pub fast: HashMap<Axis, f64>,
}

impl Default for PresetVelocities {
    fn default() -> Self {
        Self {
            slow: default_slow_preset(),
            medium: default_medium_preset(),
            fast: default_fast_preset(),
        }
    }
}

/// Settings for the z count-optimization sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// Half-width of the sweep, in steps (open loop) or stage units
    /// (closed loop). The sweep covers `-sweep_length ..= +sweep_length`.
    #[serde(default = "default_sweep_length")]
    pub sweep_length: u32,
    /// Dwell time between sweep samples.
    #[serde(with = "humantime_serde", default = "default_step_delay")]
    pub step_delay: Duration,
    /// Upper bound on a single blocking counter read.
    #[serde(with = "humantime_serde", default = "default_counter_timeout")]
    pub counter_timeout: Duration,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            sweep_length: default_sweep_length(),
            step_delay: default_step_delay(),
            counter_timeout: default_counter_timeout(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_photodiode_channel() -> String {
    "ai0".to_string()
}

fn default_aom_channel() -> Option<String> {
    Some("ao0".to_string())
}

fn default_photodiode_factor() -> f64 {
    // Two-stage linear calibration: volts -> uW before the scanning mirror,
    // then the objective transmission.
    81.571 * 0.3525
}

fn default_query_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_ui_update_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_volt_range() -> [f64; 2] {
    [0.0, 5.0]
}

fn default_pid_gains() -> PidGains {
    PidGains {
        kp: 0.8,
        ki: 5.0,
        kd: 0.0,
    }
}

fn default_process_variance() -> f64 {
    1e-5
}

fn default_measurement_variance() -> f64 {
    1e-3
}

fn default_initial_covariance() -> f64 {
    1.0
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_dead_zone() -> f64 {
    0.3
}

fn default_slow_preset() -> HashMap<Axis, f64> {
    HashMap::from([(Axis::X, 0.01), (Axis::Y, 0.01), (Axis::Z, 0.005)])
}

fn default_medium_preset() -> HashMap<Axis, f64> {
    HashMap::from([(Axis::X, 0.05), (Axis::Y, 0.05), (Axis::Z, 0.005)])
}

fn default_fast_preset() -> HashMap<Axis, f64> {
    HashMap::from([(Axis::X, 0.5), (Axis::Y, 0.5), (Axis::Z, 0.5)])
}

fn default_sweep_length() -> u32 {
    10
}

fn default_step_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_counter_timeout() -> Duration {
    Duration::from_secs(1)
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from `config/default.toml` and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/default.toml")
    }

    /// Load configuration from a specific file path plus the environment.
    ///
    /// Precedence, highest first: environment variables, the TOML file,
    /// built-in defaults. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUSTPHOTONICS_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let [vmin, vmax] = self.power_lock.volt_range;
        if vmin >= vmax {
            return Err(LabError::ConfigValidation(format!(
                "volt_range [{vmin}, {vmax}] must satisfy min < max"
            )));
        }

        if self.power_lock.photodiode_factor <= 0.0 {
            return Err(LabError::ConfigValidation(format!(
                "photodiode_factor must be positive, got {}",
                self.power_lock.photodiode_factor
            )));
        }

        if self.power_lock.query_interval.is_zero() {
            return Err(LabError::ConfigValidation(
                "query_interval must be non-zero".to_string(),
            ));
        }

        if self.power_lock.ui_update_interval < self.power_lock.query_interval {
            return Err(LabError::ConfigValidation(
                "ui_update_interval must not be shorter than query_interval".to_string(),
            ));
        }

        if self.motion.poll_interval.is_zero() {
            return Err(LabError::ConfigValidation(
                "poll_interval must be non-zero".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.motion.dead_zone) {
            return Err(LabError::ConfigValidation(format!(
                "dead_zone {} must be in [0, 1)",
                self.motion.dead_zone
            )));
        }

        if self.optimizer.sweep_length == 0 {
            return Err(LabError::ConfigValidation(
                "sweep_length must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
