// Timeouts, ports, drive and battery configuration
use std::time::Duration;

use crate::motor::{Axis, ControlMode};

// HTTP listen address for the teleop server
pub const HTTP_ADDR: &str = "0.0.0.0:5000";

// Status sampler period
pub const STATUS_PERIOD: Duration = Duration::from_secs(1);

// Minimum spacing between accepted non-zero intents (stop always passes)
pub const INPUT_THROTTLE: Duration = Duration::from_millis(100);

// Bounded wait for each shutdown step (sampler stop, idle command)
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// Motor controller
// Serial port exposed by the controller's USB CDC interface
pub const MOTOR_PORT: &str = "/dev/ttyACM0";
pub const MOTOR_BAUDRATE: u32 = 115_200;
pub const MOTOR_READ_TIMEOUT: Duration = Duration::from_secs(1);

// Enable hardware motor control (set to false for simulation/testing)
pub const MOTOR_ENABLED: bool = true;

// Wheel to axis assignment
pub const LEFT_AXIS: Axis = Axis::Axis0;
pub const RIGHT_AXIS: Axis = Axis::Axis1;

/// Sign applied to the left wheel command before it reaches the controller.
pub const LEFT_WHEEL_POLARITY: f32 = 1.0;

/// Sign applied to the right wheel command before it reaches the controller.
///
/// The two hub motors are mounted mirrored on the chassis, so "forward" on the
/// right axis is the opposite rotation of "forward" on the left axis.
pub const RIGHT_WHEEL_POLARITY: f32 = -1.0;

// Speed multiplier bounds and step for keyboard adjustments
pub const SPEED_MIN: f32 = 0.1;
pub const SPEED_MAX: f32 = 3.0;
pub const SPEED_DEFAULT: f32 = 1.0;
pub const SPEED_STEP: f32 = 0.1;

// 4S pack: 3.15 V/cell empty, 4.2 V/cell full
pub const BATTERY_EMPTY_VOLTS: f32 = 12.6;
pub const BATTERY_FULL_VOLTS: f32 = 16.8;

// Camera: any command writing concatenated JPEG frames to stdout
pub const CAMERA_COMMAND: &str =
    "ffmpeg -loglevel error -f v4l2 -i /dev/video0 -f mjpeg -q:v 5 -";
pub const CAMERA_FRAME_BACKLOG: usize = 4;

// Bring-up
pub const CALIBRATION_POLL: Duration = Duration::from_millis(100);
pub const CALIBRATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const ENGAGE_SETTLE: Duration = Duration::from_secs(1);

// Spin test defaults (matches the bench wiring check)
pub const SPIN_SPEED: f32 = 0.3;
pub const SPIN_DURATION: Duration = Duration::from_secs(2);

/// Motor controller connection, shared by every subcommand
#[derive(Debug, Clone, clap::Args)]
pub struct ControllerSettings {
    /// Serial port of the motor controller
    #[arg(long, global = true, default_value = MOTOR_PORT)]
    pub port: String,

    #[arg(long, global = true, default_value_t = MOTOR_BAUDRATE)]
    pub baud: u32,

    /// Use the in-memory controller instead of the serial port
    #[arg(long, global = true, default_value_t = !MOTOR_ENABLED)]
    pub simulate: bool,
}

#[derive(Debug, Clone, clap::Args)]
pub struct ServeSettings {
    /// Listen address for the HTTP server
    #[arg(long, default_value = HTTP_ADDR)]
    pub addr: String,

    #[arg(long, value_enum, default_value_t = ControlMode::ClosedLoop)]
    pub mode: ControlMode,

    /// Minimum spacing between accepted non-zero commands
    #[arg(long, default_value_t = INPUT_THROTTLE.as_millis() as u64)]
    pub throttle_ms: u64,

    /// Serve without a camera (video endpoint answers 503)
    #[arg(long)]
    pub no_camera: bool,

    /// Command writing concatenated JPEG frames to stdout
    #[arg(long, default_value = CAMERA_COMMAND)]
    pub camera_command: String,
}

impl Default for ServeSettings {
    fn default() -> Self {
        Self {
            addr: HTTP_ADDR.to_string(),
            mode: ControlMode::ClosedLoop,
            throttle_ms: INPUT_THROTTLE.as_millis() as u64,
            no_camera: false,
            camera_command: CAMERA_COMMAND.to_string(),
        }
    }
}

impl ServeSettings {
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}
