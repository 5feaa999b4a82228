//! Custom error types for the application.
//!
//! This module defines the primary error type, `LabError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of errors that can occur,
//! from configuration issues to instrument-specific problems.
//!
//! ## Error Hierarchy
//!
//! `LabError` is an enum that consolidates various error sources:
//!
//! - **`Config`**: Wraps errors from the `figment` crate, typically related to
//!   file parsing or format issues in the configuration files.
//! - **`ConfigValidation`**: Represents semantic errors in the configuration,
//!   such as values that parse fine but are logically invalid (e.g. an
//!   inverted voltage range). These are caught during the validation step.
//! - **`Io`**: Wraps standard `std::io::Error`, covering file I/O issues.
//! - **`Hardware`**: A general category for errors originating from hardware
//!   capability implementations. This could be anything from a communication
//!   failure to an invalid command sent to the device.
//! - **`OutOfRange` / `NoChannelConfigured`**: Synchronous rejections of
//!   user- or automation-supplied commands; the rejected operation has no
//!   side effect on hardware.
//! - **`Timeout`**: A blocking hardware read exceeded its configured timeout.
//!   Surfaced to the caller of that specific operation only.
//!
//! By using `#[from]`, `LabError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the application with
//! the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, LabError>;

#[derive(Error, Debug)]
pub enum LabError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Value {value} out of range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    #[error("No output channel configured")]
    NoChannelConfigured,

    #[error("Axis '{0}' is not configured on this positioner")]
    UnknownAxis(String),

    #[error("Axis config option '{0}' not supported by this positioner")]
    UnsupportedAxisOption(String),

    #[error("Axis is not referenced; home the axis before closed-loop moves")]
    NotReferenced,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("An optimization sweep is already running")]
    OptimizationBusy,
}

impl LabError {
    /// True for transient hardware faults that a polling loop may skip over.
    pub fn is_hardware(&self) -> bool {
        matches!(self, LabError::Hardware(_) | LabError::Timeout(_))
    }
}
