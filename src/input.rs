//! Pilot input normalization
//!
//! Every input device (on-screen joystick, held keys, D-pad buttons) is reduced
//! to an [`Intent`]: a lateral `x` and forward `y`, each in `[-1, 1]`.
//! A [`Throttle`] spaces out non-zero intents while always letting a stop
//! through.

use std::f32::consts::FRAC_1_SQRT_2;
use std::time::{Duration, Instant};

/// Normalized pilot intent. `x` positive = right, `y` positive = forward.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Intent {
    pub x: f32,
    pub y: f32,
}

/// Directions contributed by keys and buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
}

impl Direction {
    pub fn unit(self) -> Intent {
        match self {
            Direction::Forward => Intent { x: 0.0, y: 1.0 },
            Direction::Backward => Intent { x: 0.0, y: -1.0 },
            Direction::Left => Intent { x: -1.0, y: 0.0 },
            Direction::Right => Intent { x: 1.0, y: 0.0 },
        }
    }
}

/// D-pad style button
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Move(Direction),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    Press(Button),
    Release,
}

fn sanitize(v: f32) -> f32 {
    if v.is_finite() { v.clamp(-1.0, 1.0) } else { 0.0 }
}

impl Intent {
    pub const ZERO: Intent = Intent { x: 0.0, y: 0.0 };

    /// Clamp each component to `[-1, 1]`; NaN and infinities become 0
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x: sanitize(x),
            y: sanitize(y),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }

    /// Joystick offset from its centre (y up), capped at `radius`
    ///
    /// Offsets longer than the radius keep their direction and are shortened
    /// to the radius, so the result has magnitude at most 1.
    pub fn from_pointer(dx: f32, dy: f32, radius: f32) -> Self {
        if radius.is_nan() || radius <= 0.0 {
            return Self::ZERO;
        }

        let dist = dx.hypot(dy);
        let (dx, dy) = if dist > radius {
            (dx * radius / dist, dy * radius / dist)
        } else {
            (dx, dy)
        };

        Self::new(dx / radius, dy / radius)
    }

    /// Sum of held directions; diagonals are scaled so they are not faster
    pub fn from_keys<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = Direction>,
    {
        let (mut x, mut y) = (0.0f32, 0.0f32);
        for key in keys {
            let unit = key.unit();
            x += unit.x;
            y += unit.y;
        }

        if x != 0.0 && y != 0.0 {
            x *= FRAC_1_SQRT_2;
            y *= FRAC_1_SQRT_2;
        }

        Self::new(x, y)
    }

    pub fn from_button(event: ButtonEvent) -> Self {
        match event {
            ButtonEvent::Press(Button::Move(direction)) => direction.unit(),
            ButtonEvent::Press(Button::Stop) | ButtonEvent::Release => Self::ZERO,
        }
    }
}

/// Rate limiter for non-zero intents
#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
        }
    }

    /// Admit or drop an intent observed at `now`
    ///
    /// Stops are always admitted and restart the interval.
    pub fn admit(&mut self, intent: Intent, now: Instant) -> Option<Intent> {
        if !intent.is_zero() {
            if let Some(last) = self.last_emit {
                if now.saturating_duration_since(last) < self.min_interval {
                    return None;
                }
            }
        }

        self.last_emit = Some(now);
        Some(intent)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}
