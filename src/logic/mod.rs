//! Logic layer: hardware-facing coordinators driven by periodic tasks.
//!
//! Each coordinator owns no hardware lifecycle - capability handles are
//! injected at construction and the coordinator only uses them. Periodic
//! work (sampling, polling, sweep stepping) runs on a dedicated tokio task
//! that does bounded work per lap and shuts down via a oneshot signal;
//! results reach the UI/automation layers through broadcast event channels.

pub mod gamepad;
pub mod motion;
pub mod optimizer;
pub mod power_lock;

/// Capacity of the per-coordinator broadcast event channels. Slow consumers
/// lag (dropping oldest events) rather than backpressuring the control loops.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

pub use motion::{MotionCoordinator, MotionEvent, VelocityPreset};
pub use optimizer::{SweepEvent, SweepPhase, SweepRecord, ZOptimizer};
pub use power_lock::{PowerEvent, PowerLockLoop, PowerStatus};
