//! Scalar signal filtering for noisy photodiode readings.

/// One-dimensional Kalman filter for a steady parameter (no control input,
/// no state transition beyond identity).
///
/// Used to smooth raw photodiode voltage samples before they reach the PID
/// controller, so the servo does not chase shot-to-shot sampling noise.
/// `process_variance` (Q) sets how quickly the filter tracks genuine drift;
/// `measurement_variance` (R) sets how much each raw sample is trusted.
#[derive(Clone, Debug)]
pub struct KalmanFilter1D {
    process_variance: f64,
    measurement_variance: f64,
    estimate: f64,
    covariance: f64,
}

impl KalmanFilter1D {
    /// Create a filter with estimate 0 and the given initial error covariance.
    pub fn new(process_variance: f64, measurement_variance: f64, initial_covariance: f64) -> Self {
        Self {
            process_variance,
            measurement_variance,
            estimate: 0.0,
            covariance: initial_covariance,
        }
    }

    /// Fold in one measurement and return the updated estimate.
    pub fn update(&mut self, measurement: f64) -> f64 {
        let predicted_covariance = self.covariance + self.process_variance;
        let gain = predicted_covariance / (predicted_covariance + self.measurement_variance);
        self.estimate += gain * (measurement - self.estimate);
        self.covariance = (1.0 - gain) * predicted_covariance;
        self.estimate
    }

    /// Current estimate without folding in a new measurement.
    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    /// Current error covariance.
    pub fn covariance(&self) -> f64 {
        self.covariance
    }
}
