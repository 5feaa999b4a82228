//! Gamepad input shaping for stage control.
//!
//! Raw controller state is reduced to a small command vocabulary before it
//! reaches the motion coordinator: analog sticks get a circular dead zone and
//! an 8-way compass quantization, buttons get edge detection so holding a
//! button does not repeat its action.

use std::collections::HashSet;

/// Normalized analog stick positions, each component in `[-1, 1]`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct JoystickState {
    pub left_x: f64,
    pub left_y: f64,
    pub right_x: f64,
    pub right_y: f64,
}

/// Gamepad buttons with a stage-control binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GamepadButton {
    DpadUp,
    DpadDown,
    DpadLeft,
    DpadRight,
    LeftShoulder,
    RightShoulder,
    FaceA,
    FaceB,
    FaceX,
    FaceY,
}

/// Apply a circular dead zone around the stick center, rescaling the
/// remaining travel so full deflection still maps to magnitude ~1.
pub fn apply_dead_zone(x: f64, y: f64, dead_zone: f64) -> (f64, f64) {
    let magnitude = x.hypot(y);
    if magnitude < dead_zone {
        return (0.0, 0.0);
    }
    let corrected = magnitude - dead_zone;
    let scale = (corrected / magnitude) * (1.0 + dead_zone);
    (x * scale, y * scale)
}

/// Quantize a stick vector into one of 8 compass directions plus rest.
///
/// Returns the required motion sign per axis, each in `{-1, 0, +1}`.
/// Sticks inside the dead zone map to `(0, 0)`. Sectors are 45 degrees wide
/// and centered on the compass directions, so the boundary lines sit 22.5
/// degrees either side of each cardinal/diagonal.
pub fn quantize_8way(x: f64, y: f64, dead_zone: f64) -> (i8, i8) {
    if x.hypot(y) < dead_zone {
        return (0, 0);
    }
    let angle = y.atan2(x).to_degrees();
    let sector = ((angle + 22.5).rem_euclid(360.0) / 45.0) as usize % 8;
    const DIRECTIONS: [(i8, i8); 8] = [
        (1, 0),   // E
        (1, 1),   // NE
        (0, 1),   // N
        (-1, 1),  // NW
        (-1, 0),  // W
        (-1, -1), // SW
        (0, -1),  // S
        (1, -1),  // SE
    ];
    DIRECTIONS[sector]
}

/// Tracks held buttons and reports only fresh presses.
#[derive(Debug, Default)]
pub struct ButtonEdgeDetector {
    held: HashSet<GamepadButton>,
}

impl ButtonEdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update from the currently-held button set; returns buttons that were
    /// not held on the previous update.
    pub fn update(&mut self, current: &[GamepadButton]) -> Vec<GamepadButton> {
        let current: HashSet<GamepadButton> = current.iter().copied().collect();
        let pressed = current.difference(&self.held).copied().collect();
        self.held = current;
        pressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_zone_suppresses_small_deflections() {
        assert_eq!(apply_dead_zone(0.1, 0.1, 0.3), (0.0, 0.0));
        assert_eq!(quantize_8way(0.2, 0.1, 0.3), (0, 0));
    }

    #[test]
    fn dead_zone_rescales_remaining_travel() {
        let (x, y) = apply_dead_zone(1.0, 0.0, 0.3);
        assert!((x - (1.0 - 0.3) * 1.3).abs() < 1e-12);
        assert_eq!(y, 0.0);
    }

    #[test]
    fn quantizes_cardinals() {
        assert_eq!(quantize_8way(1.0, 0.0, 0.3), (1, 0));
        assert_eq!(quantize_8way(0.0, 1.0, 0.3), (0, 1));
        assert_eq!(quantize_8way(-1.0, 0.0, 0.3), (-1, 0));
        assert_eq!(quantize_8way(0.0, -1.0, 0.3), (0, -1));
    }

    #[test]
    fn quantizes_diagonals() {
        assert_eq!(quantize_8way(0.7, 0.7, 0.3), (1, 1));
        assert_eq!(quantize_8way(-0.7, -0.7, 0.3), (-1, -1));
    }

    #[test]
    fn sector_boundaries_sit_at_22_5_degrees() {
        let just_below = 22.4_f64.to_radians();
        let just_above = 22.6_f64.to_radians();
        assert_eq!(
            quantize_8way(just_below.cos(), just_below.sin(), 0.3),
            (1, 0)
        );
        assert_eq!(
            quantize_8way(just_above.cos(), just_above.sin(), 0.3),
            (1, 1)
        );
    }

    #[test]
    fn edge_detector_reports_only_fresh_presses() {
        let mut detector = ButtonEdgeDetector::new();
        let first = detector.update(&[GamepadButton::FaceA]);
        assert_eq!(first, vec![GamepadButton::FaceA]);

        // Held: no repeat.
        assert!(detector.update(&[GamepadButton::FaceA]).is_empty());

        // Released then pressed again: reported again.
        assert!(detector.update(&[]).is_empty());
        assert_eq!(
            detector.update(&[GamepadButton::FaceA]),
            vec![GamepadButton::FaceA]
        );
    }
}
