// Command path: request -> intent -> throttle -> mixer -> drive
//
// Runs synchronously on the caller's thread. Controller errors are logged and
// the command is skipped; they never reach the sampler or crash the caller.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::input::{Intent, Throttle};
use crate::messages::{CommandRequest, CommandResponse};
use crate::motor::{mix, SharedDrive, SpeedMultiplier};

struct PipelineState {
    throttle: Throttle,
    last_issued: CommandResponse,
}

pub struct CommandPipeline {
    drive: SharedDrive,
    speed: Arc<SpeedMultiplier>,
    state: Mutex<PipelineState>,
}

impl CommandPipeline {
    pub fn new(drive: SharedDrive, speed: Arc<SpeedMultiplier>, throttle: Duration) -> Self {
        let idle = CommandResponse {
            speed: speed.get(),
            ..Default::default()
        };
        Self {
            drive,
            speed,
            state: Mutex::new(PipelineState {
                throttle: Throttle::new(throttle),
                last_issued: idle,
            }),
        }
    }

    pub fn speed(&self) -> &SpeedMultiplier {
        &self.speed
    }

    /// Handle one command request observed at `now`
    pub fn submit(&self, request: &CommandRequest, now: Instant) -> CommandResponse {
        self.speed.set(request.speed);
        self.submit_intent(request.intent(), now)
    }

    /// Mix and dispatch an already-normalized intent
    ///
    /// A throttled or failed command issues nothing and answers with the last
    /// issued command.
    pub fn submit_intent(&self, intent: Intent, now: Instant) -> CommandResponse {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(intent) = state.throttle.admit(intent, now) else {
            debug!("Throttled intent {:?}", intent);
            return state.last_issued;
        };

        let speed = self.speed.get();
        let wheels = mix(intent.x, intent.y).scaled(speed);
        let response = CommandResponse::new(wheels, speed);

        let mut drive = self.drive.lock().unwrap_or_else(PoisonError::into_inner);
        match drive.drive(wheels) {
            Ok(()) => {
                debug!("Issued {:?}", response);
                state.last_issued = response;
            }
            Err(e) => warn!("Failed to send wheel command: {}", e),
        }

        state.last_issued
    }

    /// Command a stop, bypassing the throttle
    pub fn stop(&self, now: Instant) -> CommandResponse {
        self.submit_intent(Intent::ZERO, now)
    }

    pub fn last_issued(&self) -> CommandResponse {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_issued
    }
}
