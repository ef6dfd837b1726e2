// Differential drive mixing for the two-wheel base
// Converts a normalized (x, y) intent into left/right wheel commands.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Normalized wheel commands, positive = forward
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WheelPair {
    pub left: f32,
    pub right: f32,
}

impl WheelPair {
    pub fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Apply the speed multiplier. Not clamped: the controller saturates.
    pub fn scaled(self, speed: f32) -> Self {
        Self {
            left: self.left * speed,
            right: self.right * speed,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.left == 0.0 && self.right == 0.0
    }
}

/// Mix lateral `x` and forward `y` into wheel commands
///
/// ```text
/// left  = clamp(y + x, -1, 1)
/// right = clamp(y - x, -1, 1)
/// ```
///
/// Pure turn (`y = 0`) spins the wheels in opposite directions, pure forward
/// drives both equally.
pub fn mix(x: f32, y: f32) -> WheelPair {
    WheelPair {
        left: (y + x).clamp(-1.0, 1.0),
        right: (y - x).clamp(-1.0, 1.0),
    }
}

/// Allowed range for the speed multiplier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedRange {
    pub min: f32,
    pub max: f32,
}

impl SpeedRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Clamp into range; non-finite input falls back to the lower bound
    pub fn clamp(&self, speed: f32) -> f32 {
        if speed.is_finite() {
            speed.clamp(self.min, self.max)
        } else {
            self.min
        }
    }
}

/// Process-wide speed multiplier, last writer wins
#[derive(Debug)]
pub struct SpeedMultiplier {
    bits: AtomicU32,
    range: SpeedRange,
}

impl SpeedMultiplier {
    pub fn new(initial: f32, range: SpeedRange) -> Self {
        Self {
            bits: AtomicU32::new(range.clamp(initial).to_bits()),
            range,
        }
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Store a new multiplier, returning the clamped value actually stored
    pub fn set(&self, speed: f32) -> f32 {
        let speed = self.range.clamp(speed);
        self.bits.store(speed.to_bits(), Ordering::Relaxed);
        speed
    }

    /// Nudge the multiplier by `delta`, returning the new value
    pub fn adjust(&self, delta: f32) -> f32 {
        self.set(self.get() + delta)
    }

    pub fn range(&self) -> SpeedRange {
        self.range
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> impl Iterator<Item = (f32, f32)> {
        let steps = (0..=20).map(|i| -1.0 + i as f32 * 0.1);
        steps.flat_map(|x| (0..=20).map(move |j| (x, -1.0 + j as f32 * 0.1)))
    }

    #[test]
    fn test_zero_intent() {
        assert_eq!(mix(0.0, 0.0), WheelPair::zero());
    }

    #[test]
    fn test_turn_in_place() {
        assert_eq!(mix(1.0, 0.0), WheelPair::new(1.0, -1.0));
        assert_eq!(mix(-1.0, 0.0), WheelPair::new(-1.0, 1.0));
    }

    #[test]
    fn test_straight_motion() {
        assert_eq!(mix(0.0, 1.0), WheelPair::new(1.0, 1.0));
        assert_eq!(mix(0.0, -1.0), WheelPair::new(-1.0, -1.0));
    }

    #[test]
    fn test_outputs_stay_in_range() {
        for (x, y) in grid() {
            let wheels = mix(x, y);
            assert!(
                (-1.0..=1.0).contains(&wheels.left),
                "left {} out of range for ({}, {})",
                wheels.left,
                x,
                y
            );
            assert!(
                (-1.0..=1.0).contains(&wheels.right),
                "right {} out of range for ({}, {})",
                wheels.right,
                x,
                y
            );
        }
    }

    #[test]
    fn test_curve_right() {
        // Forward with a right bias: left wheel faster than right
        let wheels = mix(0.3, 0.5);
        assert!((wheels.left - 0.8).abs() < 1e-6);
        assert!((wheels.right - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_speed_scaling_is_linear() {
        for (x, y) in grid() {
            let unit = mix(x, y);
            for s in [0.1f32, 0.5, 1.0, 2.5, 3.0] {
                let scaled = mix(x, y).scaled(s);
                assert!((scaled.left - unit.left * s).abs() < 1e-6);
                assert!((scaled.right - unit.right * s).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_multiplier_exceeds_wheel_range() {
        let wheels = mix(0.0, 1.0).scaled(3.0);
        assert_eq!(wheels, WheelPair::new(3.0, 3.0));
    }

    #[test]
    fn test_speed_multiplier_clamps() {
        let speed = SpeedMultiplier::new(1.0, SpeedRange::new(0.1, 3.0));
        assert_eq!(speed.get(), 1.0);
        assert_eq!(speed.set(10.0), 3.0);
        assert_eq!(speed.set(0.0), 0.1);
        assert_eq!(speed.set(f32::NAN), 0.1);
        speed.set(1.0);
        assert!((speed.adjust(0.1) - 1.1).abs() < 1e-6);
        assert_eq!(speed.get(), speed.range().clamp(speed.get()));
    }
}
