// Keyboard teleop: WASD/arrows move, Space stop, R/F speed, Q quit
//
// Runs the same normalizer, throttle and mixer as the HTTP endpoint against a
// locally owned drive. Blocking; call from a plain thread.

use std::collections::HashMap;
use std::io::stdout;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use crossterm::event::{
    self, Event, KeyCode, KeyEvent, KeyEventKind, KeyboardEnhancementFlags,
    PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, supports_keyboard_enhancement};
use tracing::info;

use crate::config::{ControllerSettings, INPUT_THROTTLE, SPEED_STEP};
use crate::control::CommandPipeline;
use crate::input::{Direction, Intent};
use crate::motor::{ControlMode, DriveBase};
use crate::runtime::{default_speed, open_controller, BoxError};

const POLL_INTERVAL: Duration = Duration::from_millis(20); // 50Hz
/// A key without release events counts as held this long after its last repeat
pub const HOLD_EXPIRY: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Move(Direction),
    Stop,
    Faster,
    Slower,
    Quit,
}

pub fn action_for(code: KeyCode) -> Option<Action> {
    let action = match code {
        KeyCode::Up => Action::Move(Direction::Forward),
        KeyCode::Down => Action::Move(Direction::Backward),
        KeyCode::Left => Action::Move(Direction::Left),
        KeyCode::Right => Action::Move(Direction::Right),
        KeyCode::Esc => Action::Quit,
        KeyCode::Char(c) => match c.to_ascii_lowercase() {
            'w' => Action::Move(Direction::Forward),
            's' => Action::Move(Direction::Backward),
            'a' => Action::Move(Direction::Left),
            'd' => Action::Move(Direction::Right),
            ' ' => Action::Stop,
            'r' => Action::Faster,
            'f' => Action::Slower,
            'q' => Action::Quit,
            _ => return None,
        },
        _ => return None,
    };
    Some(action)
}

/// Set of direction keys currently held down
#[derive(Debug)]
pub struct HeldKeys {
    last_seen: HashMap<Direction, Instant>,
    /// `None` when the terminal reports key releases
    expiry: Option<Duration>,
}

impl HeldKeys {
    pub fn new(expiry: Option<Duration>) -> Self {
        Self {
            last_seen: HashMap::new(),
            expiry,
        }
    }

    pub fn press(&mut self, dir: Direction, now: Instant) {
        self.last_seen.insert(dir, now);
    }

    pub fn release(&mut self, dir: Direction) {
        self.last_seen.remove(&dir);
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }

    /// Drop expired keys and return the combined intent
    pub fn intent(&mut self, now: Instant) -> Intent {
        if let Some(expiry) = self.expiry {
            self.last_seen
                .retain(|_, seen| now.saturating_duration_since(*seen) <= expiry);
        }
        Intent::from_keys(self.last_seen.keys().copied())
    }
}

pub fn run(controller: &ControllerSettings, mode: ControlMode) -> Result<(), BoxError> {
    let mut drive = DriveBase::new(open_controller(controller)?);
    drive.engage(mode)?;
    let drive = drive.shared();
    let pipeline = CommandPipeline::new(drive.clone(), Arc::new(default_speed()), INPUT_THROTTLE);

    info!("Controls: WASD/arrows=move, Space=stop, R/F=speed, Q=quit");
    let range = pipeline.speed().range();
    info!(
        "Speed: {:.1} (R/F step {} within {}..{})",
        pipeline.speed().get(),
        SPEED_STEP,
        range.min,
        range.max
    );

    enable_raw_mode()?;
    let releases = supports_keyboard_enhancement().unwrap_or(false)
        && execute!(
            stdout(),
            PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
        )
        .is_ok();

    let result = run_teleop(&pipeline, releases);

    if releases {
        let _ = execute!(stdout(), PopKeyboardEnhancementFlags);
    }
    disable_raw_mode()?;

    pipeline.stop(Instant::now());
    drive
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .idle()?;
    result
}

fn run_teleop(pipeline: &CommandPipeline, releases: bool) -> Result<(), BoxError> {
    let mut held = HeldKeys::new((!releases).then_some(HOLD_EXPIRY));
    let mut last_intent = Intent::ZERO;

    loop {
        if event::poll(POLL_INTERVAL)? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let now = Instant::now();
                match (action_for(code), kind) {
                    (Some(Action::Move(dir)), KeyEventKind::Release) => held.release(dir),
                    (_, KeyEventKind::Release) => {}
                    (Some(Action::Move(dir)), _) => held.press(dir, now),
                    (Some(Action::Stop), _) => {
                        held.clear();
                        last_intent = Intent::ZERO;
                        pipeline.stop(now);
                    }
                    (Some(Action::Faster), _) => {
                        info!("Speed: {:.1}", pipeline.speed().adjust(SPEED_STEP));
                    }
                    (Some(Action::Slower), _) => {
                        info!("Speed: {:.1}", pipeline.speed().adjust(-SPEED_STEP));
                    }
                    (Some(Action::Quit), _) => break,
                    (None, _) => {}
                }
            }
        }

        let now = Instant::now();
        let intent = held.intent(now);
        // Keep refreshing while moving (throttled), send a stop only once
        if !intent.is_zero() || intent != last_intent {
            let issued = pipeline.submit_intent(intent, now);
            if intent != last_intent {
                info!("left={:.2} right={:.2}", issued.left, issued.right);
            }
        }
        last_intent = intent;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_mapping() {
        assert_eq!(
            action_for(KeyCode::Char('W')),
            Some(Action::Move(Direction::Forward))
        );
        assert_eq!(
            action_for(KeyCode::Left),
            Some(Action::Move(Direction::Left))
        );
        assert_eq!(action_for(KeyCode::Char(' ')), Some(Action::Stop));
        assert_eq!(action_for(KeyCode::Char('r')), Some(Action::Faster));
        assert_eq!(action_for(KeyCode::Esc), Some(Action::Quit));
        assert_eq!(action_for(KeyCode::Char('z')), None);
    }

    #[test]
    fn test_held_keys_expire_without_releases() {
        let t0 = Instant::now();
        let mut held = HeldKeys::new(Some(HOLD_EXPIRY));
        held.press(Direction::Forward, t0);
        held.press(Direction::Right, t0 + Duration::from_millis(100));

        let both = held.intent(t0 + Duration::from_millis(120));
        assert!(both.x > 0.0 && both.y > 0.0);

        // Forward expired, right still held
        let right = held.intent(t0 + Duration::from_millis(200));
        assert_eq!((right.x, right.y), (1.0, 0.0));

        assert!(held.intent(t0 + Duration::from_secs(1)).is_zero());
    }

    #[test]
    fn test_held_keys_wait_for_release() {
        let t0 = Instant::now();
        let mut held = HeldKeys::new(None);
        held.press(Direction::Backward, t0);
        assert_eq!(held.intent(t0 + Duration::from_secs(5)).y, -1.0);

        held.release(Direction::Backward);
        assert!(held.intent(t0 + Duration::from_secs(5)).is_zero());
    }

    #[test]
    fn test_opposite_keys_cancel() {
        let t0 = Instant::now();
        let mut held = HeldKeys::new(None);
        held.press(Direction::Left, t0);
        held.press(Direction::Right, t0);
        assert!(held.intent(t0).is_zero());
    }
}
