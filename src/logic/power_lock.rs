//! Closed-loop AOM power stabilization.
//!
//! Periodically samples the photodiode voltage, smooths it with a Kalman
//! filter, and (when closed-loop control is enabled) drives the AOM control
//! voltage through a PID controller to hold the optical power at setpoint.
//! Status events are published at a bounded rate independent of the faster
//! sampling rate.
//!
//! The public setpoint is in physical units (uW); internally the PID runs on
//! raw photodiode volts. The conversion happens at this API boundary via the
//! configured linear `photodiode_factor`.
//!
//! # Failure policy
//!
//! A hardware read/write error aborts the current cycle, publishes a
//! [`PowerEvent::Fault`], and stops the loop. A bad voltage write is
//! dangerous to retry blindly, so the loop requires an explicit restart.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::PowerLockSettings;
use crate::control::PidController;
use crate::error::{AppResult, LabError};
use crate::hardware::AnalogIo;
use crate::logic::EVENT_CHANNEL_CAPACITY;
use crate::signal::KalmanFilter1D;

/// One published power reading.
#[derive(Clone, Copy, Debug)]
pub struct PowerStatus {
    pub timestamp: DateTime<Utc>,
    /// Raw photodiode voltage in V.
    pub pd_voltage: f64,
    /// Raw optical power in uW (`pd_voltage * photodiode_factor`).
    pub pd_power: f64,
    /// Kalman-filtered optical power in uW.
    pub filtered_power: f64,
    /// Current AOM drive voltage in V.
    pub aom_volts: f64,
}

/// Events published by the power-lock loop.
#[derive(Clone, Debug)]
pub enum PowerEvent {
    Status(PowerStatus),
    /// The loop hit a hardware fault and stopped; restart explicitly.
    Fault(String),
}

struct LockState {
    filter: KalmanFilter1D,
    pid: PidController,
    pid_enabled: bool,
    current_volts: f64,
    last_publish: Option<Instant>,
}

/// Periodic photodiode sampling loop with optional PID power lock.
pub struct PowerLockLoop {
    daq: Arc<dyn AnalogIo>,
    settings: PowerLockSettings,
    state: Arc<Mutex<LockState>>,
    event_tx: broadcast::Sender<PowerEvent>,
    task: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl PowerLockLoop {
    pub fn new(daq: Arc<dyn AnalogIo>, settings: PowerLockSettings) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = LockState {
            filter: KalmanFilter1D::new(
                settings.kalman.process_variance,
                settings.kalman.measurement_variance,
                settings.kalman.initial_covariance,
            ),
            pid: PidController::new(
                settings.pid_gains,
                (settings.volt_range[0], settings.volt_range[1]),
            ),
            pid_enabled: false,
            current_volts: 0.0,
            last_publish: None,
        };

        Self {
            daq,
            settings,
            state: Arc::new(Mutex::new(state)),
            event_tx,
            task: None,
            shutdown: None,
        }
    }

    /// Subscribe to status/fault events.
    pub fn subscribe(&self) -> broadcast::Receiver<PowerEvent> {
        self.event_tx.subscribe()
    }

    /// Manually command the AOM drive voltage.
    ///
    /// Rejected synchronously, with no hardware side effect, when `volts` is
    /// outside the configured range or no output channel is configured. On
    /// success the value is recorded as the PID resume point.
    pub async fn set_aom_volts(&self, volts: f64) -> AppResult<()> {
        let [min, max] = self.settings.volt_range;
        if !(min..=max).contains(&volts) {
            return Err(LabError::OutOfRange {
                value: volts,
                min,
                max,
            });
        }
        let channel = self
            .settings
            .aom_channel
            .as_deref()
            .ok_or(LabError::NoChannelConfigured)?;

        self.daq.write_channel(channel, volts).await?;
        self.state.lock().await.current_volts = volts;
        Ok(())
    }

    /// Toggle closed-loop control.
    ///
    /// Enabling seeds the PID from the last commanded voltage so the lock
    /// engages without an output jump; disabling freezes (does not reset)
    /// the controller state.
    pub async fn enable_pid(&self, enable: bool) {
        let mut state = self.state.lock().await;
        if enable {
            let resume = state.current_volts;
            state.pid.enable(resume);
            info!("power lock engaged at {resume:.3} V");
        } else {
            state.pid.disable();
            info!("power lock disengaged");
        }
        state.pid_enabled = enable;
    }

    pub async fn pid_enabled(&self) -> bool {
        self.state.lock().await.pid_enabled
    }

    /// Set the power setpoint in uW.
    ///
    /// Setpoints that convert to a photodiode voltage outside the configured
    /// range are ignored (with a warning), matching the interactive-GUI
    /// behavior of rejecting the edit without disturbing the running lock.
    pub async fn set_setpoint_physical(&self, power_uw: f64) {
        let volts = power_uw / self.settings.photodiode_factor;
        let [min, max] = self.settings.volt_range;
        if !(min..=max).contains(&volts) {
            warn!("ignoring setpoint {power_uw} uW: {volts:.3} V outside [{min}, {max}] V");
            return;
        }
        self.state.lock().await.pid.set_setpoint(volts);
    }

    /// Current power setpoint in uW.
    pub async fn setpoint_physical(&self) -> f64 {
        self.state.lock().await.pid.setpoint() * self.settings.photodiode_factor
    }

    /// Last commanded AOM drive voltage.
    pub async fn current_volts(&self) -> f64 {
        self.state.lock().await.current_volts
    }

    /// Begin periodic sampling. Idempotent while the loop is running.
    pub fn start(&mut self) {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let daq = Arc::clone(&self.daq);
        let settings = self.settings.clone();
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = sleep(settings.query_interval) => {
                        if let Err(e) = sample_cycle(&daq, &settings, &state, &event_tx).await {
                            error!("power lock stopped: {e}");
                            let _ = event_tx.send(PowerEvent::Fault(e.to_string()));
                            break;
                        }
                    }
                }
            }
        });

        self.task = Some(handle);
        self.shutdown = Some(shutdown_tx);
    }

    /// Stop periodic sampling. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.task.take() {
            let _ = handle.await;
        }
    }

    /// Run a single sampling cycle (exposed for tests).
    pub async fn run_cycle_once(&self) -> AppResult<()> {
        sample_cycle(&self.daq, &self.settings, &self.state, &self.event_tx).await
    }
}

/// One sampling cycle: read, filter, servo, publish.
async fn sample_cycle(
    daq: &Arc<dyn AnalogIo>,
    settings: &PowerLockSettings,
    state: &Mutex<LockState>,
    event_tx: &broadcast::Sender<PowerEvent>,
) -> AppResult<()> {
    let raw = daq.read_channel(&settings.photodiode_channel).await?;

    let mut state = state.lock().await;
    let filtered = state.filter.update(raw);

    if state.pid_enabled {
        let correction = state.pid.compute(filtered, Instant::now());
        let channel = settings
            .aom_channel
            .as_deref()
            .ok_or(LabError::NoChannelConfigured)?;
        daq.write_channel(channel, correction).await?;
        state.current_volts = correction;
    }

    // Publish at most once per ui_update_interval. Publishing up to half a
    // sample early keeps the effective rate bounded without skipping a whole
    // extra sample period when the timer lands just short of the deadline.
    let now = Instant::now();
    let due = match state.last_publish {
        None => true,
        Some(last) => {
            now.saturating_duration_since(last) + settings.query_interval / 2
                >= settings.ui_update_interval
        }
    };
    if due {
        state.last_publish = Some(now);
        let _ = event_tx.send(PowerEvent::Status(PowerStatus {
            timestamp: Utc::now(),
            pd_voltage: raw,
            pd_power: raw * settings.photodiode_factor,
            filtered_power: filtered * settings.photodiode_factor,
            aom_volts: state.current_volts,
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockAnalogIo;
    use std::time::Duration;

    fn settings() -> PowerLockSettings {
        PowerLockSettings {
            photodiode_factor: 2.0,
            query_interval: Duration::from_millis(5),
            ui_update_interval: Duration::from_millis(50),
            ..PowerLockSettings::default()
        }
    }

    fn rig() -> (Arc<MockAnalogIo>, PowerLockLoop) {
        let daq = Arc::new(MockAnalogIo::new());
        daq.set_level("ai0", 1.0);
        let lock = PowerLockLoop::new(Arc::clone(&daq) as Arc<dyn AnalogIo>, settings());
        (daq, lock)
    }

    #[tokio::test]
    async fn setpoint_converts_physical_to_sensor_units() {
        let (_daq, lock) = rig();
        lock.set_setpoint_physical(4.0).await;
        assert!((lock.setpoint_physical().await - 4.0).abs() < 1e-12);
        assert!((lock.state.lock().await.pid.setpoint() - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn out_of_range_setpoint_is_ignored() {
        let (_daq, lock) = rig();
        lock.set_setpoint_physical(4.0).await;
        // 20 uW / 2.0 = 10 V, outside [0, 5]: silently dropped.
        lock.set_setpoint_physical(20.0).await;
        assert!((lock.setpoint_physical().await - 4.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn manual_volts_out_of_range_is_rejected_without_side_effect() {
        let (daq, lock) = rig();
        let result = lock.set_aom_volts(10.0).await;
        assert!(matches!(result, Err(LabError::OutOfRange { .. })));
        assert!(daq.writes().is_empty());
        assert_eq!(lock.current_volts().await, 0.0);
    }

    #[tokio::test]
    async fn manual_volts_requires_output_channel() {
        let daq = Arc::new(MockAnalogIo::new());
        let mut cfg = settings();
        cfg.aom_channel = None;
        let lock = PowerLockLoop::new(daq as Arc<dyn AnalogIo>, cfg);
        assert!(matches!(
            lock.set_aom_volts(1.0).await,
            Err(LabError::NoChannelConfigured)
        ));
    }

    #[tokio::test]
    async fn open_loop_cycle_never_writes_output() {
        let (daq, lock) = rig();
        for _ in 0..5 {
            lock.run_cycle_once().await.unwrap();
        }
        assert!(daq.writes().is_empty());
    }

    #[tokio::test]
    async fn closed_loop_cycle_writes_clamped_correction() {
        let (daq, lock) = rig();
        lock.set_setpoint_physical(4.0).await;
        lock.set_aom_volts(1.5).await.unwrap();
        lock.enable_pid(true).await;

        for _ in 0..10 {
            lock.run_cycle_once().await.unwrap();
        }

        let written = daq.last_write("ao0").unwrap();
        assert!((0.0..=5.0).contains(&written));
        assert_eq!(lock.current_volts().await, written);
    }

    #[tokio::test]
    async fn pid_resume_does_not_kick_output() {
        let (daq, lock) = rig();
        // Filter converged at the setpoint measurement.
        lock.set_setpoint_physical(2.0).await; // 1.0 V
        for _ in 0..200 {
            lock.run_cycle_once().await.unwrap();
        }

        lock.set_aom_volts(2.5).await.unwrap();
        lock.enable_pid(true).await;
        lock.run_cycle_once().await.unwrap();

        let written = daq.last_write("ao0").unwrap();
        assert!(
            (written - 2.5).abs() < 0.05,
            "resume output jumped to {written}"
        );
    }

    #[tokio::test]
    async fn status_publish_rate_is_bounded() {
        let (_daq, lock) = rig();
        let mut events = lock.subscribe();

        // 20 cycles at 5 ms vs a 50 ms UI interval: far fewer than 20
        // publishes. Cycles run back-to-back here, so only the first
        // publish's window elapses.
        for _ in 0..20 {
            lock.run_cycle_once().await.unwrap();
        }

        let mut published = 0;
        while events.try_recv().is_ok() {
            published += 1;
        }
        assert!(published >= 1);
        assert!(published < 20, "published {published} of 20 cycles");
    }

    #[tokio::test]
    async fn cycle_propagates_read_failure() {
        let (daq, lock) = rig();
        daq.set_fail_reads(true);
        assert!(lock.run_cycle_once().await.is_err());
    }
}
