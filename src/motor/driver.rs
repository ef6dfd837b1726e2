// High-level drive base for the two-wheel robot
//
// Combines the mixer output with the wheel/axis mapping and mounting polarity
// to provide a simple API over any motor controller.

use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::controller::{Axis, AxisState, MotorController, Result};
use super::mixer::WheelPair;
use crate::config::{LEFT_AXIS, LEFT_WHEEL_POLARITY, RIGHT_AXIS, RIGHT_WHEEL_POLARITY};

/// Drive base shared between command handling and telemetry sampling
pub type SharedDrive = Arc<Mutex<DriveBase>>;

/// Axis state used while driving
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ControlMode {
    /// Velocity loop closed on the hall sensors
    ClosedLoop,
    /// Rotor position estimated from back-EMF
    Sensorless,
}

impl ControlMode {
    pub fn axis_state(self) -> AxisState {
        match self {
            ControlMode::ClosedLoop => AxisState::ClosedLoopControl,
            ControlMode::Sensorless => AxisState::SensorlessControl,
        }
    }
}

/// Which axis drives which wheel, and with what sign
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WheelMapping {
    pub left_axis: Axis,
    pub right_axis: Axis,
    pub left_polarity: f32,
    pub right_polarity: f32,
}

impl Default for WheelMapping {
    fn default() -> Self {
        Self {
            left_axis: LEFT_AXIS,
            right_axis: RIGHT_AXIS,
            left_polarity: LEFT_WHEEL_POLARITY,
            right_polarity: RIGHT_WHEEL_POLARITY,
        }
    }
}

pub struct DriveBase {
    controller: Box<dyn MotorController>,
    mapping: WheelMapping,
}

impl DriveBase {
    pub fn new(controller: Box<dyn MotorController>) -> Self {
        Self::with_mapping(controller, WheelMapping::default())
    }

    pub fn with_mapping(controller: Box<dyn MotorController>, mapping: WheelMapping) -> Self {
        Self {
            controller,
            mapping,
        }
    }

    /// Wrap for sharing across tasks
    pub fn shared(self) -> SharedDrive {
        Arc::new(Mutex::new(self))
    }

    /// Put both axes into the given control state
    pub fn engage(&mut self, mode: ControlMode) -> Result<()> {
        info!("Engaging both axes in {:?} mode", mode);
        for axis in Axis::ALL {
            self.controller.request_state(axis, mode.axis_state())?;
        }
        Ok(())
    }

    /// Send wheel commands, with mounting polarity applied
    pub fn drive(&mut self, wheels: WheelPair) -> Result<()> {
        let left = wheels.left * self.mapping.left_polarity;
        let right = wheels.right * self.mapping.right_polarity;
        debug!(
            "Wheel velocities: {}={}, {}={}",
            self.mapping.left_axis, left, self.mapping.right_axis, right
        );

        self.controller.set_velocity(self.mapping.left_axis, left)?;
        self.controller.set_velocity(self.mapping.right_axis, right)
    }

    /// Zero both velocity setpoints
    pub fn stop(&mut self) -> Result<()> {
        self.drive(WheelPair::zero())
    }

    /// Stop, then return both axes to idle
    pub fn idle(&mut self) -> Result<()> {
        info!("Returning to idle state");
        self.stop()?;
        for axis in Axis::ALL {
            self.controller.request_state(axis, AxisState::Idle)?;
        }
        Ok(())
    }

    /// Direct access for telemetry and bring-up
    pub fn controller_mut(&mut self) -> &mut dyn MotorController {
        self.controller.as_mut()
    }
}

impl Drop for DriveBase {
    fn drop(&mut self) {
        // Try to stop motors when the drive is dropped (safety measure)
        if let Err(e) = self.stop() {
            warn!("Failed to stop motors on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::SimController;

    fn simulated_drive() -> (DriveBase, SimController) {
        let sim = SimController::new();
        (DriveBase::new(Box::new(sim.clone())), sim)
    }

    #[test]
    fn test_forward_applies_mounting_polarity() {
        let (mut drive, sim) = simulated_drive();
        drive.drive(WheelPair::new(0.5, 0.5)).unwrap();

        assert_eq!(sim.velocity(LEFT_AXIS), 0.5 * LEFT_WHEEL_POLARITY);
        assert_eq!(sim.velocity(RIGHT_AXIS), 0.5 * RIGHT_WHEEL_POLARITY);
    }

    #[test]
    fn test_engage_and_idle() {
        let (mut drive, sim) = simulated_drive();
        drive.engage(ControlMode::Sensorless).unwrap();
        for axis in Axis::ALL {
            let state = sim.clone().current_state(axis).unwrap();
            assert_eq!(state, AxisState::SensorlessControl);
        }

        drive.drive(WheelPair::new(1.0, -1.0)).unwrap();
        drive.idle().unwrap();

        let mut sim = sim;
        for axis in Axis::ALL {
            assert_eq!(sim.velocity(axis), 0.0);
            assert_eq!(sim.current_state(axis).unwrap(), AxisState::Idle);
        }
    }

    #[test]
    fn test_swapped_mapping() {
        let sim = SimController::new();
        let mapping = WheelMapping {
            left_axis: Axis::Axis1,
            right_axis: Axis::Axis0,
            left_polarity: -1.0,
            right_polarity: 1.0,
        };
        let mut drive = DriveBase::with_mapping(Box::new(sim.clone()), mapping);
        drive.drive(WheelPair::new(0.25, 0.75)).unwrap();

        assert_eq!(sim.velocity(Axis::Axis1), -0.25);
        assert_eq!(sim.velocity(Axis::Axis0), 0.75);
    }

    #[test]
    fn test_drop_stops_motors() {
        let (mut drive, sim) = simulated_drive();
        drive.drive(WheelPair::new(1.0, 1.0)).unwrap();
        drop(drive);

        assert_eq!(sim.velocity(LEFT_AXIS), 0.0);
        assert_eq!(sim.velocity(RIGHT_AXIS), 0.0);
    }
}
