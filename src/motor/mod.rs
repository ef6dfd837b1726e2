// Motor control module for the two-wheel hoverboard base
//
// Provides:
// - Field-level motor controller abstraction
// - ASCII serial protocol implementation and an in-memory simulator
// - Differential drive mixing
// - High-level drive base API

pub mod ascii;
mod controller;
mod driver;
pub mod mixer;
mod sim;

pub use ascii::AsciiBus;
pub use controller::{
    Axis, AxisErrors, AxisState, ControllerError, MotorController, Value, ERROR_REGISTERS,
};
pub use driver::{ControlMode, DriveBase, SharedDrive, WheelMapping};
pub use mixer::{mix, SpeedMultiplier, SpeedRange, WheelPair};
pub use sim::{CalibrationOutcome, SimController};
