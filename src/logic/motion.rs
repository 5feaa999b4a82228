//! Stage motion coordination.
//!
//! Translates GUI/automation/gamepad motion requests into positioner calls
//! while avoiding redundant commands to the controller, and polls the stage
//! position to detect on-target transitions for UI feedback.
//!
//! Continuous (jog) motion is tracked per axis in a tri-state
//! [`MotionIntent`]; re-requesting the direction an axis is already running
//! in is a no-op, which keeps a held joystick from flooding the controller
//! with duplicate commands.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::{MotionSettings, PresetVelocities};
use crate::error::{AppResult, LabError};
use crate::hardware::{Axis, AxisConfigKey, AxisStatusKey, Positioner};
use crate::logic::gamepad::{quantize_8way, GamepadButton, JoystickState};
use crate::logic::EVENT_CHANNEL_CAPACITY;

/// Per-axis continuous-motion state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MotionIntent {
    #[default]
    Stopped,
    Forward,
    Backward,
}

impl MotionIntent {
    fn sign(self) -> i8 {
        match self {
            MotionIntent::Stopped => 0,
            MotionIntent::Forward => 1,
            MotionIntent::Backward => -1,
        }
    }

    fn from_forward(forward: bool) -> Self {
        if forward {
            MotionIntent::Forward
        } else {
            MotionIntent::Backward
        }
    }
}

/// Events published by the motion coordinator.
#[derive(Clone, Debug)]
pub enum MotionEvent {
    /// Fresh positions for all configured axes, once per poll cycle.
    PositionUpdate {
        timestamp: DateTime<Utc>,
        positions: HashMap<Axis, f64>,
    },
    /// All axes settled on target (fires on the transition only).
    HitTarget,
    /// Velocity preset applied; carries the per-axis velocities.
    VelocityChanged(HashMap<Axis, f64>),
}

/// Named velocity preset selected from the gamepad face buttons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VelocityPreset {
    Slow,
    Medium,
    Fast,
}

#[derive(Debug, Default)]
struct MotionState {
    intents: HashMap<Axis, MotionIntent>,
    on_target: bool,
}

/// Coordinates stage motion requests against a [`Positioner`] capability.
pub struct MotionCoordinator {
    stage: Arc<dyn Positioner>,
    settings: MotionSettings,
    axes: Vec<Axis>,
    state: Arc<Mutex<MotionState>>,
    presets: Arc<Mutex<PresetVelocities>>,
    event_tx: broadcast::Sender<MotionEvent>,
    poll_task: Option<JoinHandle<()>>,
    poll_shutdown: Option<oneshot::Sender<()>>,
}

impl MotionCoordinator {
    /// Create a coordinator for the axes reported by `stage`.
    ///
    /// Fails if the configuration names an axis the hardware does not have.
    pub fn new(stage: Arc<dyn Positioner>, settings: MotionSettings) -> AppResult<Self> {
        let axes = stage.axes();
        for axis in &settings.jog_invert_axes {
            if !axes.contains(axis) {
                return Err(LabError::UnknownAxis(axis.to_string()));
            }
        }

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let presets = settings.preset_velocities.clone();

        Ok(Self {
            stage,
            settings,
            axes,
            state: Arc::new(Mutex::new(MotionState::default())),
            presets: Arc::new(Mutex::new(presets)),
            event_tx,
            poll_task: None,
            poll_shutdown: None,
        })
    }

    /// Subscribe to motion events.
    pub fn subscribe(&self) -> broadcast::Receiver<MotionEvent> {
        self.event_tx.subscribe()
    }

    /// Hardware identification from the stage controller.
    pub fn hw_info(&self) -> String {
        self.stage.hw_info()
    }

    // ========================================================================
    // Stage control
    // ========================================================================

    /// Move the listed axes to absolute positions; axes omitted from the map
    /// are left untouched.
    pub async fn move_absolute(&self, targets: &HashMap<Axis, f64>) -> AppResult<()> {
        self.do_move(targets, false).await
    }

    /// Move the listed axes by relative distances.
    pub async fn move_relative(&self, targets: &HashMap<Axis, f64>) -> AppResult<()> {
        self.do_move(targets, true).await
    }

    async fn do_move(&self, targets: &HashMap<Axis, f64>, relative: bool) -> AppResult<()> {
        self.state.lock().await.on_target = false;
        for (&axis, &position) in targets {
            self.stage.set_position(axis, position, relative).await?;
        }
        Ok(())
    }

    /// True while any axis has not settled on target.
    pub async fn is_moving(&self) -> AppResult<bool> {
        for &axis in &self.axes {
            if !self
                .stage
                .get_axis_status(axis, AxisStatusKey::OnTarget)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Start continuous motion on `axis` in the given direction.
    ///
    /// A jog in the direction the axis is already running in is a no-op; no
    /// duplicate hardware command is issued.
    pub async fn jog(&self, axis: Axis, forward: bool) -> AppResult<()> {
        let forward = forward != self.settings.jog_invert_axes.contains(&axis);
        let desired = MotionIntent::from_forward(forward);

        let mut state = self.state.lock().await;
        if state.intents.get(&axis).copied().unwrap_or_default() == desired {
            return Ok(());
        }
        state.on_target = false;

        self.zero_offset_voltage(axis).await?;
        self.stage.start_continuous_motion(axis, !forward).await?;
        state.intents.insert(axis, desired);
        Ok(())
    }

    /// Move `axis` by a signed number of open-loop steps.
    pub async fn step(&self, axis: Axis, steps: i32) -> AppResult<()> {
        let steps = if self.settings.jog_invert_axes.contains(&axis) {
            -steps
        } else {
            steps
        };
        self.state.lock().await.on_target = false;
        self.stage.move_steps(axis, steps).await
    }

    /// Stop one axis and clear its jog intent.
    pub async fn stop_axis(&self, axis: Axis) -> AppResult<()> {
        let mut state = self.state.lock().await;
        self.stage.stop_axis(axis).await?;
        self.zero_offset_voltage(axis).await?;
        state.intents.insert(axis, MotionIntent::Stopped);
        Ok(())
    }

    /// Stop all axes immediately.
    pub async fn stop_all(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        self.stage.stop_all().await?;
        state.intents.clear();
        Ok(())
    }

    /// Home one axis, or all axes when `None`.
    pub async fn home_axis(&self, axis: Option<Axis>) -> AppResult<()> {
        self.state.lock().await.on_target = false;
        self.stage.reference_axis(axis).await
    }

    /// Reset the stepper offset voltage, where the controller supports it.
    async fn zero_offset_voltage(&self, axis: Axis) -> AppResult<()> {
        match self
            .stage
            .set_axis_config(axis, AxisConfigKey::OffsetVoltage, 0.0)
            .await
        {
            Ok(()) | Err(LabError::UnsupportedAxisOption(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Velocity presets
    // ========================================================================

    /// Apply a named velocity preset to all axes it covers.
    pub async fn set_velocity_to_preset(&self, preset: VelocityPreset) -> AppResult<()> {
        let velocities = {
            let presets = self.presets.lock().await;
            match preset {
                VelocityPreset::Slow => presets.slow.clone(),
                VelocityPreset::Medium => presets.medium.clone(),
                VelocityPreset::Fast => presets.fast.clone(),
            }
        };

        for (&axis, &velocity) in &velocities {
            self.stage
                .set_axis_config(axis, AxisConfigKey::Velocity, velocity)
                .await?;
        }

        let _ = self.event_tx.send(MotionEvent::VelocityChanged(velocities));
        Ok(())
    }

    /// Replace preset velocity tables; `None` entries are left unchanged.
    pub async fn set_preset_values(
        &self,
        slow: Option<HashMap<Axis, f64>>,
        medium: Option<HashMap<Axis, f64>>,
        fast: Option<HashMap<Axis, f64>>,
    ) {
        let mut presets = self.presets.lock().await;
        if let Some(slow) = slow {
            presets.slow = slow;
        }
        if let Some(medium) = medium {
            presets.medium = medium;
        }
        if let Some(fast) = fast {
            presets.fast = fast;
        }
    }

    // ========================================================================
    // Gamepad interface
    // ========================================================================

    /// Translate a joystick state change into the minimal set of jog/stop
    /// commands.
    ///
    /// The left stick is quantized into 8 compass directions driving x/y; the
    /// right stick's vertical axis drives z. Only axes whose required
    /// direction changed get a command.
    pub async fn handle_joystick(&self, stick: JoystickState) -> AppResult<()> {
        let dead_zone = self.settings.dead_zone;
        let (required_x, required_y) = quantize_8way(stick.left_x, stick.left_y, dead_zone);
        let required_z = if stick.right_x.hypot(stick.right_y) < dead_zone {
            0
        } else if stick.right_y > 0.0 {
            1
        } else {
            -1
        };

        let current: HashMap<Axis, i8> = {
            let state = self.state.lock().await;
            [Axis::X, Axis::Y, Axis::Z]
                .into_iter()
                .map(|a| (a, state.intents.get(&a).copied().unwrap_or_default().sign()))
                .collect()
        };

        for (axis, required) in [
            (Axis::X, required_x),
            (Axis::Y, required_y),
            (Axis::Z, required_z),
        ] {
            let running = current.get(&axis).copied().unwrap_or(0);
            if required == 0 {
                if running != 0 {
                    self.stop_axis(axis).await?;
                }
            } else if required != running {
                self.jog(axis, required > 0).await?;
            }
        }
        Ok(())
    }

    /// Execute the stage binding of one gamepad button press.
    pub async fn handle_button(&self, button: GamepadButton) -> AppResult<()> {
        match button {
            GamepadButton::DpadDown => self.step(Axis::Y, -1).await,
            GamepadButton::DpadUp => self.step(Axis::Y, 1).await,
            GamepadButton::DpadLeft => self.step(Axis::X, -1).await,
            GamepadButton::DpadRight => self.step(Axis::X, 1).await,
            GamepadButton::LeftShoulder => self.step(Axis::Z, -1).await,
            GamepadButton::RightShoulder => self.step(Axis::Z, 1).await,
            GamepadButton::FaceA => self.set_velocity_to_preset(VelocityPreset::Slow).await,
            GamepadButton::FaceX => self.set_velocity_to_preset(VelocityPreset::Medium).await,
            GamepadButton::FaceY => self.set_velocity_to_preset(VelocityPreset::Fast).await,
            GamepadButton::FaceB => self.stop_all().await,
        }
    }

    // ========================================================================
    // Position polling
    // ========================================================================

    /// Run one poll cycle: read positions, aggregate on-target status, emit
    /// events. A transient hardware error skips this cycle's events.
    pub async fn poll_once(&self) {
        poll_cycle(&self.stage, &self.axes, &self.state, &self.event_tx).await;
    }

    /// Start the periodic position poll. Idempotent.
    pub fn start_poll(&mut self) {
        if self.poll_task.is_some() {
            return;
        }

        let stage = Arc::clone(&self.stage);
        let axes = self.axes.clone();
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let interval = self.settings.poll_interval;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = sleep(interval) => {
                        poll_cycle(&stage, &axes, &state, &event_tx).await;
                    }
                }
            }
            debug!("position poll stopped");
        });

        self.poll_task = Some(handle);
        self.poll_shutdown = Some(shutdown_tx);
    }

    /// Stop the periodic position poll. Idempotent.
    pub async fn stop_poll(&mut self) {
        if let Some(shutdown) = self.poll_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.poll_task.take() {
            let _ = handle.await;
        }
    }
}

async fn poll_cycle(
    stage: &Arc<dyn Positioner>,
    axes: &[Axis],
    state: &Mutex<MotionState>,
    event_tx: &broadcast::Sender<MotionEvent>,
) {
    let mut positions = HashMap::new();
    let mut all_on_target = true;

    for &axis in axes {
        let position = match stage.get_position(axis).await {
            Ok(p) => p,
            Err(e) => {
                skip_cycle(&e);
                return;
            }
        };
        positions.insert(axis, position);

        match stage.get_axis_status(axis, AxisStatusKey::OnTarget).await {
            Ok(on_target) => all_on_target &= on_target,
            Err(e) => {
                skip_cycle(&e);
                return;
            }
        }
    }

    {
        let mut state = state.lock().await;
        if all_on_target {
            if !state.on_target {
                state.on_target = true;
                if event_tx.send(MotionEvent::HitTarget).is_err() {
                    warn!("hit-target event dropped: no subscribers");
                }
            }
        } else {
            state.on_target = false;
        }
    }

    let _ = event_tx.send(MotionEvent::PositionUpdate {
        timestamp: Utc::now(),
        positions,
    });
}

/// A failed poll read drops this cycle's events; transient hardware faults
/// are routine during long moves, anything else deserves a louder log.
fn skip_cycle(err: &LabError) {
    if err.is_hardware() {
        debug!("skipping poll cycle: {err}");
    } else {
        warn!("skipping poll cycle: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockPositioner, StageCall};

    fn coordinator(stage: Arc<MockPositioner>) -> MotionCoordinator {
        MotionCoordinator::new(stage, MotionSettings::default()).unwrap()
    }

    fn jog_count(stage: &MockPositioner) -> usize {
        stage.count_calls(|c| matches!(c, StageCall::StartContinuousMotion(..)))
    }

    #[tokio::test]
    async fn repeated_jog_issues_one_hardware_command() {
        let stage = Arc::new(MockPositioner::new());
        let coord = coordinator(Arc::clone(&stage));

        coord.jog(Axis::X, true).await.unwrap();
        coord.jog(Axis::X, true).await.unwrap();

        assert_eq!(jog_count(&stage), 1);
    }

    #[tokio::test]
    async fn direction_change_issues_new_command() {
        let stage = Arc::new(MockPositioner::new());
        let coord = coordinator(Arc::clone(&stage));

        coord.jog(Axis::X, true).await.unwrap();
        coord.jog(Axis::X, false).await.unwrap();

        assert_eq!(jog_count(&stage), 2);
        let calls = stage.calls();
        assert!(calls.contains(&StageCall::StartContinuousMotion(Axis::X, false)));
        assert!(calls.contains(&StageCall::StartContinuousMotion(Axis::X, true)));
    }

    #[tokio::test]
    async fn stop_resets_intent_so_jog_reissues() {
        let stage = Arc::new(MockPositioner::new());
        let coord = coordinator(Arc::clone(&stage));

        coord.jog(Axis::Y, true).await.unwrap();
        coord.stop_axis(Axis::Y).await.unwrap();
        coord.jog(Axis::Y, true).await.unwrap();

        assert_eq!(jog_count(&stage), 2);
        assert_eq!(
            stage.count_calls(|c| matches!(c, StageCall::StopAxis(Axis::Y))),
            1
        );
    }

    #[tokio::test]
    async fn jog_respects_inverted_axes() {
        let stage = Arc::new(MockPositioner::new());
        let mut settings = MotionSettings::default();
        settings.jog_invert_axes = vec![Axis::Z];
        let coord = MotionCoordinator::new(stage.clone(), settings).unwrap();

        coord.jog(Axis::Z, true).await.unwrap();
        // Forward jog on an inverted axis runs the hardware in reverse.
        assert!(stage
            .calls()
            .contains(&StageCall::StartContinuousMotion(Axis::Z, true)));

        coord.step(Axis::Z, 3).await.unwrap();
        assert!(stage.calls().contains(&StageCall::MoveSteps(Axis::Z, -3)));
    }

    #[tokio::test]
    async fn unknown_invert_axis_is_rejected() {
        let stage = Arc::new(MockPositioner::with_axes(&[Axis::X, Axis::Y]));
        let mut settings = MotionSettings::default();
        settings.jog_invert_axes = vec![Axis::Z];
        assert!(MotionCoordinator::new(stage, settings).is_err());
    }

    #[tokio::test]
    async fn jog_zeroes_offset_voltage_when_supported() {
        let stage = Arc::new(MockPositioner::new());
        let coord = coordinator(Arc::clone(&stage));
        coord.jog(Axis::X, true).await.unwrap();
        assert!(stage.calls().contains(&StageCall::SetConfig(
            Axis::X,
            AxisConfigKey::OffsetVoltage,
            0.0
        )));
    }

    #[tokio::test]
    async fn jog_tolerates_unsupported_offset_voltage() {
        let stage = Arc::new(MockPositioner::new().without_offset_voltage());
        let coord = coordinator(Arc::clone(&stage));
        coord.jog(Axis::X, true).await.unwrap();
        assert_eq!(jog_count(&stage), 1);
    }

    #[tokio::test]
    async fn move_absolute_touches_only_listed_axes() {
        let stage = Arc::new(MockPositioner::new());
        let coord = coordinator(Arc::clone(&stage));

        let targets = HashMap::from([(Axis::X, 1.0), (Axis::Z, -2.0)]);
        coord.move_absolute(&targets).await.unwrap();

        assert_eq!(
            stage.count_calls(|c| matches!(c, StageCall::SetPosition(..))),
            2
        );
        assert!(stage
            .calls()
            .contains(&StageCall::SetPosition(Axis::X, 1.0, false)));
        assert!(stage
            .calls()
            .contains(&StageCall::SetPosition(Axis::Z, -2.0, false)));
    }

    #[tokio::test]
    async fn hit_target_fires_on_rising_edge_only() {
        let stage = Arc::new(MockPositioner::new());
        let coord = coordinator(Arc::clone(&stage));
        let mut events = coord.subscribe();

        // Scripted on-target sequence: F F T T F T -> exactly two edges.
        let sequence = [false, false, true, true, false, true];
        for all_on_target in sequence {
            for axis in Axis::ALL {
                stage.set_on_target(axis, all_on_target);
            }
            coord.poll_once().await;
        }

        let mut hits = 0;
        let mut updates = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                MotionEvent::HitTarget => hits += 1,
                MotionEvent::PositionUpdate { .. } => updates += 1,
                MotionEvent::VelocityChanged(_) => {}
            }
        }
        assert_eq!(hits, 2);
        assert_eq!(updates, sequence.len());
    }

    #[tokio::test]
    async fn poll_skips_cycle_on_hardware_error() {
        let stage = Arc::new(MockPositioner::new());
        let coord = coordinator(Arc::clone(&stage));
        let mut events = coord.subscribe();

        stage.set_fail(true);
        coord.poll_once().await;
        assert!(events.try_recv().is_err());

        // Recovery: next cycle emits again.
        stage.set_fail(false);
        coord.poll_once().await;
        assert!(matches!(
            events.try_recv(),
            Ok(MotionEvent::PositionUpdate { .. })
        ));
    }

    #[tokio::test]
    async fn velocity_preset_applies_and_notifies() {
        let stage = Arc::new(MockPositioner::new());
        let coord = coordinator(Arc::clone(&stage));
        let mut events = coord.subscribe();

        coord
            .set_velocity_to_preset(VelocityPreset::Fast)
            .await
            .unwrap();

        assert_eq!(
            stage.count_calls(
                |c| matches!(c, StageCall::SetConfig(_, AxisConfigKey::Velocity, _))
            ),
            3
        );
        assert!(stage.calls().contains(&StageCall::SetConfig(
            Axis::Z,
            AxisConfigKey::Velocity,
            0.5
        )));
        assert!(matches!(
            events.try_recv(),
            Ok(MotionEvent::VelocityChanged(_))
        ));
    }

    #[tokio::test]
    async fn preset_values_can_be_replaced_selectively() {
        let stage = Arc::new(MockPositioner::new());
        let coord = coordinator(Arc::clone(&stage));

        coord
            .set_preset_values(Some(HashMap::from([(Axis::X, 0.02)])), None, None)
            .await;
        coord
            .set_velocity_to_preset(VelocityPreset::Slow)
            .await
            .unwrap();

        assert!(stage.calls().contains(&StageCall::SetConfig(
            Axis::X,
            AxisConfigKey::Velocity,
            0.02
        )));
        // Fast preset untouched.
        coord
            .set_velocity_to_preset(VelocityPreset::Fast)
            .await
            .unwrap();
        assert!(stage.calls().contains(&StageCall::SetConfig(
            Axis::X,
            AxisConfigKey::Velocity,
            0.5
        )));
    }

    #[tokio::test]
    async fn button_bindings() {
        let stage = Arc::new(MockPositioner::new());
        let coord = coordinator(Arc::clone(&stage));

        coord.handle_button(GamepadButton::DpadUp).await.unwrap();
        coord
            .handle_button(GamepadButton::LeftShoulder)
            .await
            .unwrap();
        coord.handle_button(GamepadButton::FaceB).await.unwrap();

        let calls = stage.calls();
        assert!(calls.contains(&StageCall::MoveSteps(Axis::Y, 1)));
        assert!(calls.contains(&StageCall::MoveSteps(Axis::Z, -1)));
        assert!(calls.contains(&StageCall::StopAll));
    }

    #[tokio::test]
    async fn joystick_commands_only_changed_axes() {
        let stage = Arc::new(MockPositioner::new());
        let coord = coordinator(Arc::clone(&stage));

        // Full deflection east: x forward only.
        coord
            .handle_joystick(JoystickState {
                left_x: 1.0,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(jog_count(&stage), 1);

        // Same deflection again: nothing new.
        coord
            .handle_joystick(JoystickState {
                left_x: 1.0,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(jog_count(&stage), 1);

        // Northeast: y starts, x untouched.
        coord
            .handle_joystick(JoystickState {
                left_x: 0.8,
                left_y: 0.8,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(jog_count(&stage), 2);

        // Back to rest: both stopped.
        coord
            .handle_joystick(JoystickState::default())
            .await
            .unwrap();
        assert_eq!(
            stage.count_calls(|c| matches!(c, StageCall::StopAxis(_))),
            2
        );
    }

    #[tokio::test]
    async fn right_stick_drives_z() {
        let stage = Arc::new(MockPositioner::new());
        let coord = coordinator(Arc::clone(&stage));

        coord
            .handle_joystick(JoystickState {
                right_y: 1.0,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(stage
            .calls()
            .contains(&StageCall::StartContinuousMotion(Axis::Z, false)));

        coord
            .handle_joystick(JoystickState::default())
            .await
            .unwrap();
        assert!(stage.calls().contains(&StageCall::StopAxis(Axis::Z)));
    }

    #[tokio::test]
    async fn is_moving_aggregates_axis_status() {
        let stage = Arc::new(MockPositioner::new());
        let coord = coordinator(Arc::clone(&stage));

        assert!(!coord.is_moving().await.unwrap());
        stage.set_on_target(Axis::Y, false);
        assert!(coord.is_moving().await.unwrap());
    }

    #[tokio::test]
    async fn poll_task_start_stop_is_idempotent() {
        let stage = Arc::new(MockPositioner::new());
        let mut settings = MotionSettings::default();
        settings.poll_interval = std::time::Duration::from_millis(5);
        let mut coord = MotionCoordinator::new(stage.clone(), settings).unwrap();
        let mut events = coord.subscribe();

        coord.start_poll();
        coord.start_poll();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        coord.stop_poll().await;
        coord.stop_poll().await;

        let mut updates = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, MotionEvent::PositionUpdate { .. }) {
                updates += 1;
            }
        }
        assert!(updates >= 2, "expected several poll cycles, got {updates}");
    }
}
