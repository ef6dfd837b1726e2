// Motor controller abstraction
//
// The controller is treated as a bag of named fields: configuration is written
// field by field, state transitions are requested by writing
// `<axis>.requested_state`, and progress is observed by polling
// `<axis>.current_state`.

use std::fmt;

/// One motor channel on the controller board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Axis0,
    Axis1,
}

impl Axis {
    pub const ALL: [Axis; 2] = [Axis::Axis0, Axis::Axis1];

    /// Numeric index used by the velocity shorthand command
    pub fn index(self) -> u8 {
        match self {
            Axis::Axis0 => 0,
            Axis::Axis1 => 1,
        }
    }

    /// Fully-qualified field path under this axis, e.g. `axis0.motor.error`
    pub fn field(self, suffix: &str) -> String {
        format!("{}.{}", self, suffix)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "axis{}", self.index())
    }
}

/// Axis states as numbered by the controller firmware
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisState {
    Undefined = 0,
    Idle = 1,
    StartupSequence = 2,
    FullCalibrationSequence = 3,
    MotorCalibration = 4,
    SensorlessControl = 5,
    EncoderIndexSearch = 6,
    EncoderOffsetCalibration = 7,
    ClosedLoopControl = 8,
}

impl TryFrom<u8> for AxisState {
    type Error = u8;

    fn try_from(raw: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match raw {
            0 => AxisState::Undefined,
            1 => AxisState::Idle,
            2 => AxisState::StartupSequence,
            3 => AxisState::FullCalibrationSequence,
            4 => AxisState::MotorCalibration,
            5 => AxisState::SensorlessControl,
            6 => AxisState::EncoderIndexSearch,
            7 => AxisState::EncoderOffsetCalibration,
            8 => AxisState::ClosedLoopControl,
            other => return Err(other),
        })
    }
}

/// A value written to a controller field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f32),
    Bool(bool),
}

impl Value {
    /// Numeric view, as the controller stores it
    pub fn as_f32(self) -> f32 {
        match self {
            Value::Int(v) => v as f32,
            Value::Float(v) => v,
            Value::Bool(v) => u8::from(v) as f32,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", u8::from(*v)),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<AxisState> for Value {
    fn from(state: AxisState) -> Self {
        Value::Int(state as i64)
    }
}

/// Error types for controller communication
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for reply to `{command}`")]
    Timeout { command: String },

    #[error("Invalid reply to `{command}`: {reply:?}")]
    InvalidResponse { command: String, reply: String },

    #[error("Axis {axis} reported unknown state {raw}")]
    UnknownState { axis: Axis, raw: u8 },
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Field-level access to a two-axis motor controller
pub trait MotorController: Send {
    /// Read a numeric field
    fn read(&mut self, field: &str) -> Result<f32>;

    /// Write a configuration or state field
    fn write(&mut self, field: &str, value: Value) -> Result<()>;

    /// Set the velocity setpoint of an axis (turns/s)
    fn set_velocity(&mut self, axis: Axis, velocity: f32) -> Result<()>;

    /// Persist the current configuration to the board's flash
    fn save_configuration(&mut self) -> Result<()>;

    fn request_state(&mut self, axis: Axis, state: AxisState) -> Result<()> {
        self.write(&axis.field("requested_state"), state.into())
    }

    fn current_state(&mut self, axis: Axis) -> Result<AxisState> {
        let raw = self.read(&axis.field("current_state"))?;
        let raw = raw.round().clamp(0.0, u8::MAX as f32) as u8;
        AxisState::try_from(raw).map_err(|raw| ControllerError::UnknownState { axis, raw })
    }

    /// Zero every error register of an axis
    fn clear_errors(&mut self, axis: Axis) -> Result<()> {
        for register in ERROR_REGISTERS {
            self.write(&axis.field(register), Value::Int(0))?;
        }
        Ok(())
    }

    /// Read every error register of an axis, in `ERROR_REGISTERS` order
    fn axis_errors(&mut self, axis: Axis) -> Result<AxisErrors> {
        let mut codes = [0u32; 4];
        for (code, register) in codes.iter_mut().zip(ERROR_REGISTERS) {
            *code = self.read(&axis.field(register))?.max(0.0) as u32;
        }
        Ok(AxisErrors {
            axis: codes[0],
            motor: codes[1],
            encoder: codes[2],
            controller: codes[3],
        })
    }
}

/// Error registers of an axis and its sub-objects
pub const ERROR_REGISTERS: [&str; 4] = [
    "error",
    "motor.error",
    "encoder.error",
    "controller.error",
];

/// Error codes reported by an axis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisErrors {
    pub axis: u32,
    pub motor: u32,
    pub encoder: u32,
    pub controller: u32,
}

impl AxisErrors {
    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for AxisErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "axis=0x{:X} motor=0x{:X} encoder=0x{:X} controller=0x{:X}",
            self.axis, self.motor, self.encoder, self.controller
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_field_paths() {
        assert_eq!(Axis::Axis0.field("requested_state"), "axis0.requested_state");
        assert_eq!(Axis::Axis1.field("motor.error"), "axis1.motor.error");
        assert_eq!(Axis::Axis1.index(), 1);
    }

    #[test]
    fn test_axis_state_from_raw() {
        assert_eq!(AxisState::try_from(1u8), Ok(AxisState::Idle));
        assert_eq!(AxisState::try_from(8u8), Ok(AxisState::ClosedLoopControl));
        assert_eq!(AxisState::try_from(42u8), Err(42));
    }

    #[test]
    fn test_value_formatting() {
        assert_eq!(Value::Int(10).to_string(), "10");
        assert_eq!(Value::Float(0.15).to_string(), "0.15");
        assert_eq!(Value::Bool(true).to_string(), "1");
        assert_eq!(Value::from(AxisState::ClosedLoopControl).to_string(), "8");
    }
}
