//! Mock Hardware Implementations
//!
//! Provides simulated hardware devices for testing without physical hardware.
//! The mocks record every call they receive so tests can assert on command
//! traffic (e.g. that a redundant jog issued no second hardware command), and
//! they support scripted readings and fault injection for error-policy tests.
//!
//! # Available Mocks
//!
//! - `MockAnalogIo` - Simulated analog I/O card with scripted/steady readings
//! - `MockPositioner` - Simulated 3-axis stage with call recording
//! - `MockCounter` - Simulated count-rate source with scripted samples or a
//!   position-dependent profile

use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{AppResult, LabError};
use crate::hardware::{AnalogIo, Axis, AxisConfigKey, AxisStatusKey, CountSource, Positioner};

/// Lock a mutex, recovering the data if a test thread panicked while holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// =============================================================================
// MockAnalogIo - Simulated Analog I/O Card
// =============================================================================

/// Mock analog I/O card.
///
/// Reads return, in order of precedence: a scripted sample queued with
/// [`MockAnalogIo::push_readings`], then the channel's steady level (with
/// optional uniform noise). Writes are recorded and can be inspected with
/// [`MockAnalogIo::writes`] / [`MockAnalogIo::last_write`].
#[derive(Default)]
pub struct MockAnalogIo {
    scripted: Mutex<HashMap<String, VecDeque<f64>>>,
    levels: Mutex<HashMap<String, f64>>,
    writes: Mutex<Vec<(String, f64)>>,
    noise_amplitude: Mutex<f64>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MockAnalogIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the steady voltage returned by reads of `channel`.
    pub fn set_level(&self, channel: &str, volts: f64) {
        lock(&self.levels).insert(channel.to_string(), volts);
    }

    /// Queue scripted readings consumed (FIFO) before the steady level.
    pub fn push_readings(&self, channel: &str, samples: &[f64]) {
        lock(&self.scripted)
            .entry(channel.to_string())
            .or_default()
            .extend(samples.iter().copied());
    }

    /// Add uniform noise of the given amplitude to steady-level reads.
    pub fn set_noise_amplitude(&self, amplitude: f64) {
        *lock(&self.noise_amplitude) = amplitude;
    }

    /// Make every subsequent read fail with a hardware error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail with a hardware error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// All recorded writes, in order.
    pub fn writes(&self) -> Vec<(String, f64)> {
        lock(&self.writes).clone()
    }

    /// Most recent write to `channel`, if any.
    pub fn last_write(&self, channel: &str) -> Option<f64> {
        self.writes()
            .iter()
            .rev()
            .find(|(ch, _)| ch == channel)
            .map(|(_, v)| *v)
    }
}

#[async_trait]
impl AnalogIo for MockAnalogIo {
    async fn read_channel(&self, channel: &str) -> AppResult<f64> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LabError::Hardware(format!(
                "simulated read failure on '{channel}'"
            )));
        }

        if let Some(sample) = lock(&self.scripted)
            .get_mut(channel)
            .and_then(VecDeque::pop_front)
        {
            return Ok(sample);
        }

        let level = lock(&self.levels).get(channel).copied().ok_or_else(|| {
            LabError::Hardware(format!("no such analog input channel '{channel}'"))
        })?;

        let amplitude = *lock(&self.noise_amplitude);
        if amplitude > 0.0 {
            let noise = rand::thread_rng().gen_range(-amplitude..=amplitude);
            Ok(level + noise)
        } else {
            Ok(level)
        }
    }

    async fn write_channel(&self, channel: &str, value: f64) -> AppResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LabError::Hardware(format!(
                "simulated write failure on '{channel}'"
            )));
        }
        lock(&self.writes).push((channel.to_string(), value));
        Ok(())
    }
}

// =============================================================================
// MockPositioner - Simulated 3-Axis Stage
// =============================================================================

/// A hardware call recorded by [`MockPositioner`].
#[derive(Clone, Debug, PartialEq)]
pub enum StageCall {
    MoveSteps(Axis, i32),
    StartContinuousMotion(Axis, bool),
    SetPosition(Axis, f64, bool),
    Reference(Option<Axis>),
    SetConfig(Axis, AxisConfigKey, f64),
    StopAxis(Axis),
    StopAll,
}

/// Mock 3-axis positioner.
///
/// Open-loop steps advance the simulated position by one unit per step so
/// sweep logic can be tested end to end. On-target flags are fully
/// test-controlled via [`MockPositioner::set_on_target`].
pub struct MockPositioner {
    axes: Vec<Axis>,
    positions: Mutex<HashMap<Axis, f64>>,
    on_target: Mutex<HashMap<Axis, bool>>,
    config: Mutex<HashMap<(Axis, AxisConfigKey), f64>>,
    calls: Mutex<Vec<StageCall>>,
    supports_offset_voltage: bool,
    fail_all: AtomicBool,
}

impl MockPositioner {
    /// Create a stage with x, y and z axes.
    pub fn new() -> Self {
        Self::with_axes(&Axis::ALL)
    }

    pub fn with_axes(axes: &[Axis]) -> Self {
        Self {
            axes: axes.to_vec(),
            positions: Mutex::new(axes.iter().map(|&a| (a, 0.0)).collect()),
            on_target: Mutex::new(axes.iter().map(|&a| (a, true)).collect()),
            config: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            supports_offset_voltage: true,
            fail_all: AtomicBool::new(false),
        }
    }

    /// Disable the offset-voltage config option (closed-loop stages).
    pub fn without_offset_voltage(mut self) -> Self {
        self.supports_offset_voltage = false;
        self
    }

    pub fn set_on_target(&self, axis: Axis, on_target: bool) {
        lock(&self.on_target).insert(axis, on_target);
    }

    pub fn set_sim_position(&self, axis: Axis, position: f64) {
        lock(&self.positions).insert(axis, position);
    }

    /// Simulated position (sync accessor for test assertions and profiles).
    pub fn sim_position(&self, axis: Axis) -> f64 {
        lock(&self.positions).get(&axis).copied().unwrap_or(0.0)
    }

    /// Make every subsequent call fail with a hardware error.
    pub fn set_fail(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<StageCall> {
        lock(&self.calls).clone()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count_calls(&self, pred: impl Fn(&StageCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: StageCall) {
        lock(&self.calls).push(call);
    }

    fn check(&self, axis: Axis) -> AppResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(LabError::Hardware("simulated stage fault".to_string()));
        }
        if !self.axes.contains(&axis) {
            return Err(LabError::UnknownAxis(axis.to_string()));
        }
        Ok(())
    }
}

impl Default for MockPositioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Positioner for MockPositioner {
    fn axes(&self) -> Vec<Axis> {
        self.axes.clone()
    }

    fn hw_info(&self) -> String {
        "MockPositioner (simulated)".to_string()
    }

    async fn move_steps(&self, axis: Axis, steps: i32) -> AppResult<()> {
        self.check(axis)?;
        self.record(StageCall::MoveSteps(axis, steps));
        *lock(&self.positions).entry(axis).or_insert(0.0) += f64::from(steps);
        Ok(())
    }

    async fn start_continuous_motion(&self, axis: Axis, reverse: bool) -> AppResult<()> {
        self.check(axis)?;
        self.record(StageCall::StartContinuousMotion(axis, reverse));
        self.set_on_target(axis, false);
        Ok(())
    }

    async fn set_position(&self, axis: Axis, position: f64, relative: bool) -> AppResult<()> {
        self.check(axis)?;
        self.record(StageCall::SetPosition(axis, position, relative));
        let mut positions = lock(&self.positions);
        let entry = positions.entry(axis).or_insert(0.0);
        if relative {
            *entry += position;
        } else {
            *entry = position;
        }
        Ok(())
    }

    async fn get_position(&self, axis: Axis) -> AppResult<f64> {
        self.check(axis)?;
        Ok(self.sim_position(axis))
    }

    async fn reference_axis(&self, axis: Option<Axis>) -> AppResult<()> {
        if let Some(axis) = axis {
            self.check(axis)?;
        } else if self.fail_all.load(Ordering::SeqCst) {
            return Err(LabError::Hardware("simulated stage fault".to_string()));
        }
        self.record(StageCall::Reference(axis));
        for a in axis.map_or_else(|| self.axes.clone(), |a| vec![a]) {
            self.set_sim_position(a, 0.0);
        }
        Ok(())
    }

    async fn get_axis_config(&self, axis: Axis, key: AxisConfigKey) -> AppResult<f64> {
        self.check(axis)?;
        if key == AxisConfigKey::OffsetVoltage && !self.supports_offset_voltage {
            return Err(LabError::UnsupportedAxisOption(key.to_string()));
        }
        Ok(lock(&self.config).get(&(axis, key)).copied().unwrap_or(0.0))
    }

    async fn set_axis_config(&self, axis: Axis, key: AxisConfigKey, value: f64) -> AppResult<()> {
        self.check(axis)?;
        if key == AxisConfigKey::OffsetVoltage && !self.supports_offset_voltage {
            return Err(LabError::UnsupportedAxisOption(key.to_string()));
        }
        self.record(StageCall::SetConfig(axis, key, value));
        lock(&self.config).insert((axis, key), value);
        Ok(())
    }

    async fn get_axis_status(&self, axis: Axis, key: AxisStatusKey) -> AppResult<bool> {
        self.check(axis)?;
        let on_target = lock(&self.on_target).get(&axis).copied().unwrap_or(true);
        Ok(match key {
            AxisStatusKey::OnTarget => on_target,
            AxisStatusKey::Moving => !on_target,
            AxisStatusKey::EndOfTravel => false,
        })
    }

    async fn stop_axis(&self, axis: Axis) -> AppResult<()> {
        self.check(axis)?;
        self.record(StageCall::StopAxis(axis));
        Ok(())
    }

    async fn stop_all(&self) -> AppResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(LabError::Hardware("simulated stage fault".to_string()));
        }
        self.record(StageCall::StopAll);
        Ok(())
    }
}

// =============================================================================
// MockCounter - Simulated Count-Rate Source
// =============================================================================

type CountProfile = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Mock count-rate source.
///
/// Samples come, in order of precedence, from a scripted FIFO queue, then
/// from an optional profile closure (e.g. a Gaussian of the current stage z
/// position), then from a constant fallback. An optional per-read delay
/// simulates the blocking hardware read of a real timestamp unit.
pub struct MockCounter {
    running: AtomicBool,
    scripted: Mutex<VecDeque<f64>>,
    profile: Mutex<Option<CountProfile>>,
    fallback: Mutex<f64>,
    read_delay: Mutex<Duration>,
    fail_reads: AtomicBool,
}

impl MockCounter {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            scripted: Mutex::new(VecDeque::new()),
            profile: Mutex::new(None),
            fallback: Mutex::new(0.0),
            read_delay: Mutex::new(Duration::ZERO),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Counter whose samples are computed by `profile` on each read.
    pub fn with_profile(profile: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        let counter = Self::new();
        *lock(&counter.profile) = Some(Arc::new(profile));
        counter
    }

    /// Queue scripted samples consumed (FIFO) before the profile/fallback.
    pub fn push_samples(&self, samples: &[f64]) {
        lock(&self.scripted).extend(samples.iter().copied());
    }

    pub fn set_fallback(&self, counts: f64) {
        *lock(&self.fallback) = counts;
    }

    /// Simulate a blocking hardware read of the given duration.
    pub fn set_read_delay(&self, delay: Duration) {
        *lock(&self.read_delay) = delay;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for MockCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CountSource for MockCounter {
    async fn start(&self) -> AppResult<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn latest_count(&self) -> AppResult<f64> {
        let delay = *lock(&self.read_delay);
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if let Some(sample) = lock(&self.scripted).pop_front() {
            return Ok(sample);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LabError::Hardware("simulated counter fault".to_string()));
        }
        let profile = lock(&self.profile).clone();
        if let Some(profile) = profile {
            return Ok(profile());
        }
        Ok(*lock(&self.fallback))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
