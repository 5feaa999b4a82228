//! PID controller for servo-locking laser power.
//!
//! The controller works entirely in raw sensor units (photodiode volts); the
//! physical-unit conversion happens at the power-lock API boundary. Time
//! deltas are measured from the timestamps passed to [`PidController::compute`],
//! so irregular polling intervals integrate correctly.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Gain triple for a [`PidController`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

/// PID controller with output clamping and integral anti-windup.
///
/// # Enable / disable semantics
///
/// The controller starts disabled. [`PidController::enable`] seeds the
/// internal state from the last manually-commanded output so that the first
/// `compute` call after enabling returns that output when the measurement is
/// on setpoint - resuming closed-loop control must not kick the actuator.
/// While disabled, `compute` is a no-op returning the pinned output.
///
/// The integral accumulator is clamped to the output range, so output
/// saturation cannot wind the integral up without bound.
#[derive(Clone, Debug)]
pub struct PidController {
    gains: PidGains,
    setpoint: f64,
    out_min: f64,
    out_max: f64,
    enabled: bool,
    integral: f64,
    last_error: Option<f64>,
    last_time: Option<Instant>,
    last_output: f64,
}

impl PidController {
    pub fn new(gains: PidGains, output_range: (f64, f64)) -> Self {
        Self {
            gains,
            setpoint: 0.0,
            out_min: output_range.0,
            out_max: output_range.1,
            enabled: false,
            integral: 0.0,
            last_error: None,
            last_time: None,
            last_output: output_range.0,
        }
    }

    /// Target value in sensor units.
    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Resume closed-loop control, pinning the output to `last_output`.
    ///
    /// The integral term is seeded with the (clamped) last output and the
    /// derivative history is cleared, so the first `compute` with the
    /// measurement on setpoint returns `last_output` exactly.
    pub fn enable(&mut self, last_output: f64) {
        let pinned = last_output.clamp(self.out_min, self.out_max);
        self.enabled = true;
        self.integral = pinned;
        self.last_error = None;
        self.last_time = None;
        self.last_output = pinned;
    }

    /// Suspend closed-loop control. The integral term is frozen, not reset,
    /// so a later `enable` resumes smoothly.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Run one control cycle and return the clamped output.
    pub fn compute(&mut self, measurement: f64, now: Instant) -> f64 {
        if !self.enabled {
            return self.last_output;
        }

        let error = self.setpoint - measurement;

        let mut derivative = 0.0;
        if let (Some(last_time), Some(last_error)) = (self.last_time, self.last_error) {
            let dt = now.saturating_duration_since(last_time).as_secs_f64();
            if dt > 0.0 {
                self.integral += self.gains.ki * error * dt;
                self.integral = self.integral.clamp(self.out_min, self.out_max);
                derivative = self.gains.kd * (error - last_error) / dt;
            }
        }

        let output = (self.gains.kp * error + self.integral + derivative)
            .clamp(self.out_min, self.out_max);

        self.last_error = Some(error);
        self.last_time = Some(now);
        self.last_output = output;
        output
    }
}
