//! Hardware capability traits.
//!
//! The logic layer never talks to a concrete device driver; it is handed
//! `Arc<dyn Trait>` handles for the capabilities it needs:
//!
//! - [`AnalogIo`]: an analog I/O card reading/writing voltages on named
//!   channels (photodiode input, AOM drive output).
//! - [`Positioner`]: a multi-axis stage supporting open-loop steps and
//!   continuous motion as well as closed-loop absolute moves.
//! - [`CountSource`]: a photon count-rate source used as the feedback signal
//!   for focus optimization.
//!
//! Axis configuration and status queries use closed enums rather than
//! stringly-typed keys, so an unsupported option is a typed error
//! ([`LabError::UnsupportedAxisOption`]) instead of a silent no-op.
//!
//! All traits require `Send + Sync` so handles can be shared across tokio
//! tasks. Implementations own any per-device locking needed to serialize
//! request/response transactions on the wire; callers may issue calls from
//! multiple tasks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppResult, LabError};

pub mod mock;

/// A stage axis identifier.
///
/// The logic layer only ever names axes that the positioner itself reports
/// via [`Positioner::axes`]; hardware state for an axis lives entirely in the
/// capability implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    /// All axes, in canonical order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
            Axis::Z => write!(f, "z"),
        }
    }
}

impl FromStr for Axis {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x" | "X" => Ok(Axis::X),
            "y" | "Y" => Ok(Axis::Y),
            "z" | "Z" => Ok(Axis::Z),
            other => Err(LabError::UnknownAxis(other.to_string())),
        }
    }
}

/// Recognized per-axis configuration options.
///
/// These are the standard option names shared by the supported stage
/// controllers (step frequency and voltage for open-loop piezo steppers,
/// offset voltage for fine positioning, velocity for closed-loop stages).
/// A controller that does not implement an option must return
/// [`LabError::UnsupportedAxisOption`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AxisConfigKey {
    /// Step frequency in Hz.
    Frequency,
    /// Step voltage in volts.
    StepVoltage,
    /// DC offset voltage in volts.
    OffsetVoltage,
    /// Closed-loop velocity in units/s.
    Velocity,
}

impl fmt::Display for AxisConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisConfigKey::Frequency => write!(f, "frequency"),
            AxisConfigKey::StepVoltage => write!(f, "step_voltage"),
            AxisConfigKey::OffsetVoltage => write!(f, "offset_voltage"),
            AxisConfigKey::Velocity => write!(f, "velocity"),
        }
    }
}

/// Recognized per-axis status flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AxisStatusKey {
    /// Axis is currently moving.
    Moving,
    /// Closed-loop axis has settled within its target window.
    OnTarget,
    /// Axis has reached an end-of-travel limit.
    EndOfTravel,
}

/// Capability for analog I/O cards (e.g. a NI X-series DAQ).
#[async_trait]
pub trait AnalogIo: Send + Sync {
    /// Read a voltage from the named input channel.
    ///
    /// Implementations may average several raw samples per call; the returned
    /// value is the mean over whatever was acquired.
    async fn read_channel(&self, channel: &str) -> AppResult<f64>;

    /// Write a voltage to the named output channel.
    async fn write_channel(&self, channel: &str, value: f64) -> AppResult<()>;
}

/// Capability for multi-axis positioner hardware.
///
/// Covers both open-loop stepper operation (`move_steps`,
/// `start_continuous_motion`) and closed-loop operation (`set_position`,
/// on-target status). Every call may fail with [`LabError::Hardware`]
/// carrying a device-specific message.
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Axes configured on this positioner.
    fn axes(&self) -> Vec<Axis>;

    /// Human-readable hardware identification (manufacturer, model).
    fn hw_info(&self) -> String;

    /// Move a signed number of open-loop steps.
    async fn move_steps(&self, axis: Axis, steps: i32) -> AppResult<()>;

    /// Start continuous motion; runs until `stop_axis`/`stop_all`.
    async fn start_continuous_motion(&self, axis: Axis, reverse: bool) -> AppResult<()>;

    /// Closed-loop move to `position` (absolute, or relative to the current
    /// position when `relative` is set).
    async fn set_position(&self, axis: Axis, position: f64, relative: bool) -> AppResult<()>;

    /// Current closed-loop position of `axis`.
    async fn get_position(&self, axis: Axis) -> AppResult<f64>;

    /// Home the given axis, or all axes when `None`.
    async fn reference_axis(&self, axis: Option<Axis>) -> AppResult<()>;

    /// Read a single axis config option.
    async fn get_axis_config(&self, axis: Axis, key: AxisConfigKey) -> AppResult<f64>;

    /// Set a single axis config option.
    async fn set_axis_config(&self, axis: Axis, key: AxisConfigKey, value: f64) -> AppResult<()>;

    /// Query a single axis status flag.
    async fn get_axis_status(&self, axis: Axis, key: AxisStatusKey) -> AppResult<bool>;

    /// Stop all motion on one axis.
    async fn stop_axis(&self, axis: Axis) -> AppResult<()>;

    /// Stop motion on all axes.
    async fn stop_all(&self) -> AppResult<()>;
}

/// Capability for a photon count-rate source.
///
/// `latest_count` may block the calling task until fresh data arrives or the
/// device's internal timeout elapses; callers that cannot tolerate an
/// unbounded wait should wrap the call in `tokio::time::timeout`.
#[async_trait]
pub trait CountSource: Send + Sync {
    /// Begin counting.
    async fn start(&self) -> AppResult<()>;

    /// Stop counting.
    async fn stop(&self) -> AppResult<()>;

    /// Latest (smoothed) count rate in counts/s.
    async fn latest_count(&self) -> AppResult<f64>;
}
