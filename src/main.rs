//! Simulated-rig entry point.
//!
//! Wires the control loops to mock hardware: a photodiode that tracks the
//! commanded AOM voltage (so the power lock has a plant to act on) and a
//! count-rate source peaked a few steps away in z (so the optimizer has
//! something to find). Useful for exercising the full stack without a lab.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use rust_photonics::config::Settings;
use rust_photonics::hardware::mock::{MockAnalogIo, MockCounter, MockPositioner};
use rust_photonics::hardware::{AnalogIo, Axis, CountSource, Positioner};
use rust_photonics::logic::{
    MotionCoordinator, MotionEvent, PowerEvent, PowerLockLoop, SweepEvent, ZOptimizer,
};

#[derive(Parser, Debug)]
#[command(name = "rust_photonics")]
#[command(about = "Photonics instrument-control loops on a simulated rig")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config/default.toml")]
    config: PathBuf,

    /// Run for this many seconds, then exit (default: until Ctrl-C).
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Engage the power lock with this setpoint in uW.
    #[arg(long)]
    setpoint: Option<f64>,

    /// Run a z-optimization sweep at startup.
    #[arg(long)]
    optimise: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config).context("loading configuration")?;
    info!("configuration loaded from {}", cli.config.display());

    // Simulated hardware rig.
    let daq = Arc::new(MockAnalogIo::new());
    daq.set_level(&settings.power_lock.photodiode_channel, 1.0);
    daq.set_noise_amplitude(0.02);

    let stage = Arc::new(MockPositioner::new());

    // Count rate peaked 3 steps above the starting z position.
    let counter_stage = Arc::clone(&stage);
    let counter = Arc::new(MockCounter::with_profile(move || {
        let z = counter_stage.sim_position(Axis::Z);
        20_000.0 * (-((z - 3.0) / 4.0).powi(2)).exp() + 500.0
    }));

    // Crude plant model: the photodiode voltage follows the commanded AOM
    // voltage, so the PID has something to lock against.
    if let Some(aom_channel) = settings.power_lock.aom_channel.clone() {
        let plant_daq = Arc::clone(&daq);
        let pd_channel = settings.power_lock.photodiode_channel.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_millis(20)).await;
                if let Some(volts) = plant_daq.last_write(&aom_channel) {
                    plant_daq.set_level(&pd_channel, 0.45 * volts);
                }
            }
        });
    }

    let mut power = PowerLockLoop::new(
        Arc::clone(&daq) as Arc<dyn AnalogIo>,
        settings.power_lock.clone(),
    );
    let mut motion = MotionCoordinator::new(
        Arc::clone(&stage) as Arc<dyn Positioner>,
        settings.motion.clone(),
    )?;
    let mut optimizer = ZOptimizer::new(
        Arc::clone(&stage) as Arc<dyn Positioner>,
        Arc::clone(&counter) as Arc<dyn CountSource>,
        settings.optimizer.clone(),
    );

    info!("stage: {}", motion.hw_info());

    spawn_event_loggers(&power, &motion, &optimizer);

    power.start();
    motion.start_poll();

    if let Some(setpoint) = cli.setpoint {
        power.set_setpoint_physical(setpoint).await;
        power.enable_pid(true).await;
        info!("power lock engaged, setpoint {setpoint} uW");
    }

    if cli.optimise {
        optimizer.optimise_z()?;
        info!("z optimization started");
    }

    match cli.duration_secs {
        Some(secs) => sleep(Duration::from_secs(secs)).await,
        None => tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl-C")?,
    }

    info!("shutting down");
    optimizer.abort_optimisation();
    optimizer.join().await;
    motion.stop_poll().await;
    power.stop().await;
    Ok(())
}

/// Forward coordinator events to the log at a human-readable level.
fn spawn_event_loggers(power: &PowerLockLoop, motion: &MotionCoordinator, optimizer: &ZOptimizer) {
    let mut power_events = power.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = power_events.recv().await {
            match event {
                PowerEvent::Status(status) => info!(
                    "pd {:.3} V | raw {:.2} uW | filtered {:.2} uW | aom {:.3} V",
                    status.pd_voltage, status.pd_power, status.filtered_power, status.aom_volts
                ),
                PowerEvent::Fault(message) => error!("power lock fault: {message}"),
            }
        }
    });

    let mut motion_events = motion.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = motion_events.recv().await {
            match event {
                MotionEvent::PositionUpdate { positions, .. } => {
                    let mut entries: Vec<_> = positions.iter().collect();
                    entries.sort_by_key(|(axis, _)| **axis);
                    let formatted: Vec<String> = entries
                        .iter()
                        .map(|(axis, pos)| format!("{axis}={pos:.3}"))
                        .collect();
                    info!("stage position: {}", formatted.join(" "));
                }
                MotionEvent::HitTarget => info!("stage on target"),
                MotionEvent::VelocityChanged(velocities) => {
                    info!("velocities changed: {velocities:?}");
                }
            }
        }
    });

    let mut sweep_events = optimizer.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = sweep_events.recv().await {
            match event {
                SweepEvent::DataUpdated(sample) => info!(
                    "sweep sample: {:.0} counts at {:.2}",
                    sample.counts, sample.coordinate
                ),
                SweepEvent::Done { best } => info!(
                    "sweep done: best {:.0} counts at {:.2}",
                    best.counts, best.coordinate
                ),
                SweepEvent::Aborted => info!("sweep aborted"),
                SweepEvent::Fault(message) => error!("sweep fault: {message}"),
            }
        }
    });
}
