//! Z-axis count-rate optimization.
//!
//! Drives the z axis through a bounded sweep while sampling a count-rate
//! source, then returns to the coordinate of maximum observed signal. Two
//! variants share the same state machine:
//!
//! - **Open loop**: unit steps over `-sweep_length ..= +sweep_length`; the
//!   return move is computed in steps from the winning sample index.
//! - **Closed loop**: distance increments of `sweep_length / 10` over the
//!   same span, restoring the absolute *position* of the winning sample.
//!
//! Phases: `Idle -> MovingToStart -> Sampling -> ReturningToOptimum -> Idle`,
//! with abort reachable from any non-idle phase. Abort stops the counter and
//! leaves the axis where it is; collected samples are kept for inspection.
//! A hardware error mid-sweep also leaves the axis in place, but the partial
//! sweep data is discarded - it cannot be trusted for a return move.
//!
//! When several samples tie for the maximum, the first occurrence wins
//! (plain argmax). For noisy count data that is not necessarily the best
//! choice of optimum, but it is the established behavior the rest of the
//! tooling expects.

use log::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::config::OptimizerSettings;
use crate::error::{AppResult, LabError};
use crate::hardware::{Axis, CountSource, Positioner};
use crate::logic::EVENT_CHANNEL_CAPACITY;

/// Sweep state-machine phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SweepPhase {
    #[default]
    Idle,
    MovingToStart,
    Sampling,
    ReturningToOptimum,
}

/// One sweep sample: the sweep coordinate (sample index for open-loop
/// sweeps, absolute position for closed-loop sweeps) and the counts seen
/// there.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepSample {
    pub coordinate: f64,
    pub counts: f64,
}

/// Record of the current (or last) sweep.
#[derive(Clone, Debug, Default)]
pub struct SweepRecord {
    pub phase: SweepPhase,
    pub samples: Vec<SweepSample>,
}

/// Events published during a sweep.
#[derive(Clone, Debug)]
pub enum SweepEvent {
    /// A sample was appended to the sweep record.
    DataUpdated(SweepSample),
    /// Sweep finished; the axis sits at the winning coordinate.
    Done { best: SweepSample },
    /// Sweep aborted on request; the axis stays where it was.
    Aborted,
    /// Sweep failed on a hardware error; the axis stays where it was.
    Fault(String),
}

/// Index of the first sample holding the maximum count.
fn best_sample_index(samples: &[SweepSample]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, sample) in samples.iter().enumerate() {
        match best {
            Some(b) if samples[b].counts >= sample.counts => {}
            _ => best = Some(i),
        }
    }
    best
}

/// Steps from the sweep end back to the winning sample index.
fn return_steps(sweep_length: i32, best_index: usize) -> i32 {
    2 * sweep_length - best_index as i32
}

/// Bounded hill-climbing search for the z position of maximum count rate.
pub struct ZOptimizer {
    stage: Arc<dyn Positioner>,
    counter: Arc<dyn CountSource>,
    settings: OptimizerSettings,
    record: Arc<Mutex<SweepRecord>>,
    abort: Arc<AtomicBool>,
    event_tx: broadcast::Sender<SweepEvent>,
    task: Option<JoinHandle<()>>,
}

impl ZOptimizer {
    pub fn new(
        stage: Arc<dyn Positioner>,
        counter: Arc<dyn CountSource>,
        settings: OptimizerSettings,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            stage,
            counter,
            settings,
            record: Arc::new(Mutex::new(SweepRecord::default())),
            abort: Arc::new(AtomicBool::new(false)),
            event_tx,
            task: None,
        }
    }

    /// Subscribe to sweep events.
    pub fn subscribe(&self) -> broadcast::Receiver<SweepEvent> {
        self.event_tx.subscribe()
    }

    /// Snapshot of the current sweep record.
    pub async fn record(&self) -> SweepRecord {
        self.record.lock().await.clone()
    }

    /// Current sweep phase.
    pub async fn phase(&self) -> SweepPhase {
        self.record.lock().await.phase
    }

    /// Request an abort; takes effect at the next scheduled sweep step.
    pub fn abort_optimisation(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Start an open-loop (step-count) optimization sweep.
    pub fn optimise_z(&mut self) -> AppResult<()> {
        self.spawn(SweepVariant::OpenLoop)
    }

    /// Start a closed-loop (absolute-position) optimization sweep.
    pub fn optimise_z_closed_loop(&mut self) -> AppResult<()> {
        self.spawn(SweepVariant::ClosedLoop)
    }

    /// Wait for a running sweep to finish.
    pub async fn join(&mut self) {
        if let Some(handle) = self.task.take() {
            let _ = handle.await;
        }
    }

    fn spawn(&mut self, variant: SweepVariant) -> AppResult<()> {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(LabError::OptimizationBusy);
        }

        self.abort.store(false, Ordering::SeqCst);
        let stage = Arc::clone(&self.stage);
        let counter = Arc::clone(&self.counter);
        let settings = self.settings.clone();
        let record = Arc::clone(&self.record);
        let abort = Arc::clone(&self.abort);
        let event_tx = self.event_tx.clone();

        self.task = Some(tokio::spawn(async move {
            let sweep = Sweep {
                stage,
                counter,
                settings,
                record,
                abort,
                event_tx,
            };
            match variant {
                SweepVariant::OpenLoop => sweep.run_open_loop().await,
                SweepVariant::ClosedLoop => sweep.run_closed_loop().await,
            }
        }));
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum SweepVariant {
    OpenLoop,
    ClosedLoop,
}

/// Outcome of one sampling pass.
enum PassOutcome {
    Completed,
    Aborted,
}

struct Sweep {
    stage: Arc<dyn Positioner>,
    counter: Arc<dyn CountSource>,
    settings: OptimizerSettings,
    record: Arc<Mutex<SweepRecord>>,
    abort: Arc<AtomicBool>,
    event_tx: broadcast::Sender<SweepEvent>,
}

impl Sweep {
    async fn run_open_loop(&self) {
        let sweep_length = self.settings.sweep_length as i32;

        self.set_phase(SweepPhase::MovingToStart).await;
        self.record.lock().await.samples.clear();
        if let Err(e) = self.stage.move_steps(Axis::Z, -sweep_length).await {
            self.fail(e, false).await;
            return;
        }
        if let Err(e) = self.counter.start().await {
            self.fail(e, false).await;
            return;
        }

        self.set_phase(SweepPhase::Sampling).await;
        let mut current_step = -sweep_length;
        loop {
            sleep(self.settings.step_delay).await;

            match self.sample_step((current_step + sweep_length) as f64).await {
                Ok(PassOutcome::Aborted) => return,
                Ok(PassOutcome::Completed) => {}
                Err(e) => {
                    self.fail(e, true).await;
                    return;
                }
            }

            if current_step < sweep_length {
                current_step += 1;
                if let Err(e) = self.stage.move_steps(Axis::Z, 1).await {
                    self.fail(e, true).await;
                    return;
                }
            } else {
                break;
            }
        }

        if let Err(e) = self.counter.stop().await {
            self.fail(e, true).await;
            return;
        }

        self.set_phase(SweepPhase::ReturningToOptimum).await;
        let best = {
            let record = self.record.lock().await;
            best_sample_index(&record.samples).map(|i| (i, record.samples[i]))
        };
        if let Some((best_index, best_sample)) = best {
            let steps_back = return_steps(sweep_length, best_index);
            if steps_back > 0 {
                if let Err(e) = self.stage.move_steps(Axis::Z, -steps_back).await {
                    self.fail(e, false).await;
                    return;
                }
            }
            info!(
                "z sweep done: {} counts at step index {best_index}",
                best_sample.counts
            );
            let _ = self.event_tx.send(SweepEvent::Done { best: best_sample });
        }
        self.set_phase(SweepPhase::Idle).await;
    }

    async fn run_closed_loop(&self) {
        let half_span = self.settings.sweep_length as f64;
        let increment = half_span / 10.0;
        let sample_count = 21; // -half_span ..= +half_span in increments

        self.set_phase(SweepPhase::MovingToStart).await;
        self.record.lock().await.samples.clear();
        let center = match self.stage.get_position(Axis::Z).await {
            Ok(z) => z,
            Err(e) => {
                self.fail(e, false).await;
                return;
            }
        };
        if let Err(e) = self
            .stage
            .set_position(Axis::Z, center - half_span, false)
            .await
        {
            self.fail(e, false).await;
            return;
        }
        if let Err(e) = self.counter.start().await {
            self.fail(e, false).await;
            return;
        }

        self.set_phase(SweepPhase::Sampling).await;
        let mut position = center - half_span;
        for index in 0..sample_count {
            sleep(self.settings.step_delay).await;

            match self.sample_step(position).await {
                Ok(PassOutcome::Aborted) => return,
                Ok(PassOutcome::Completed) => {}
                Err(e) => {
                    self.fail(e, true).await;
                    return;
                }
            }

            if index + 1 < sample_count {
                if let Err(e) = self.stage.set_position(Axis::Z, increment, true).await {
                    self.fail(e, true).await;
                    return;
                }
                position += increment;
            }
        }

        if let Err(e) = self.counter.stop().await {
            self.fail(e, true).await;
            return;
        }

        self.set_phase(SweepPhase::ReturningToOptimum).await;
        let best = {
            let record = self.record.lock().await;
            best_sample_index(&record.samples).map(|i| record.samples[i])
        };
        if let Some(best_sample) = best {
            if let Err(e) = self
                .stage
                .set_position(Axis::Z, best_sample.coordinate, false)
                .await
            {
                self.fail(e, false).await;
                return;
            }
            info!(
                "z sweep done: {} counts at z = {:.4}",
                best_sample.counts, best_sample.coordinate
            );
            let _ = self.event_tx.send(SweepEvent::Done { best: best_sample });
        }
        self.set_phase(SweepPhase::Idle).await;
    }

    /// One sampling step: honor a pending abort, then read the counter and
    /// append to the record. Holding the record lock across the step keeps
    /// snapshot readers from observing a half-applied step.
    async fn sample_step(&self, coordinate: f64) -> AppResult<PassOutcome> {
        if self.abort.load(Ordering::SeqCst) {
            if let Err(e) = self.counter.stop().await {
                error!("counter stop after abort failed: {e}");
            }
            self.set_phase(SweepPhase::Idle).await;
            let _ = self.event_tx.send(SweepEvent::Aborted);
            info!("z sweep aborted");
            return Ok(PassOutcome::Aborted);
        }

        let mut record = self.record.lock().await;
        let counts = match timeout(self.settings.counter_timeout, self.counter.latest_count()).await
        {
            Ok(result) => result?,
            Err(_) => return Err(LabError::Timeout("counter read".to_string())),
        };
        let sample = SweepSample { coordinate, counts };
        record.samples.push(sample);
        let _ = self.event_tx.send(SweepEvent::DataUpdated(sample));
        Ok(PassOutcome::Completed)
    }

    /// Hardware-error exit: stop the counter (best effort), optionally drop
    /// the partial data, publish a fault, return to idle. No return move is
    /// attempted - the axis stays wherever the error left it.
    async fn fail(&self, err: LabError, discard_samples: bool) {
        error!("z sweep failed: {err}");
        if let Err(stop_err) = self.counter.stop().await {
            error!("counter stop after sweep failure failed: {stop_err}");
        }
        let mut record = self.record.lock().await;
        if discard_samples {
            record.samples.clear();
        }
        record.phase = SweepPhase::Idle;
        drop(record);
        let _ = self.event_tx.send(SweepEvent::Fault(err.to_string()));
    }

    async fn set_phase(&self, phase: SweepPhase) {
        self.record.lock().await.phase = phase;
    }
}
