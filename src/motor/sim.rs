// In-memory motor controller for dry runs and tests
//
// Fields live in a table. Requesting a calibration state completes instantly
// and drops the axis back to idle, entering a control state sticks.
// Clones are handles to the same simulated board.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::controller::{Axis, AxisState, ControllerError, MotorController, Result, Value};

/// Nominal readings for a freshly powered board
const NOMINAL_BUS_VOLTAGE: f32 = 15.2;
const NOMINAL_FET_TEMPERATURE: f32 = 28.0;
/// Commands kept in the log, oldest dropped first
pub const LOG_CAPACITY: usize = 256;

/// How a requested calibration sequence ends on a simulated axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationOutcome {
    Complete,
    /// Back to idle with this code in the axis and encoder error registers
    Fault(u32),
    /// Never leaves the calibration state
    Stall,
}

#[derive(Debug, Default)]
struct Board {
    fields: HashMap<String, f32>,
    calibration: HashMap<String, CalibrationOutcome>,
    velocities: [f32; 2],
    fail_io: bool,
    saves: usize,
    log: VecDeque<String>,
}

impl Board {
    fn on_requested_state(&mut self, field: &str, raw: f32) {
        let Some(axis) = field.strip_suffix(".requested_state") else {
            return;
        };
        let requested = AxisState::try_from(raw as u8).unwrap_or(AxisState::Undefined);
        let next = match requested {
            AxisState::ClosedLoopControl | AxisState::SensorlessControl => requested,
            AxisState::MotorCalibration
            | AxisState::EncoderOffsetCalibration
            | AxisState::FullCalibrationSequence => {
                let outcome = self
                    .calibration
                    .get(axis)
                    .copied()
                    .unwrap_or(CalibrationOutcome::Complete);
                match outcome {
                    // Calibration sequences run to completion instantly
                    CalibrationOutcome::Complete => AxisState::Idle,
                    CalibrationOutcome::Fault(code) => {
                        self.fields.insert(format!("{}.error", axis), code as f32);
                        self.fields
                            .insert(format!("{}.encoder.error", axis), code as f32);
                        AxisState::Idle
                    }
                    CalibrationOutcome::Stall => requested,
                }
            }
            _ => AxisState::Idle,
        };
        self.fields
            .insert(format!("{}.current_state", axis), next as u8 as f32);
    }

    fn record(&mut self, command: String) {
        if self.log.len() == LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(command);
    }

    fn check_link(&self) -> Result<()> {
        if self.fail_io {
            return Err(ControllerError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated link failure",
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimController {
    board: Arc<Mutex<Board>>,
}

impl SimController {
    pub fn new() -> Self {
        let sim = Self::default();
        sim.set_field("vbus_voltage", NOMINAL_BUS_VOLTAGE);
        for axis in Axis::ALL {
            sim.set_field(&axis.field("current_state"), AxisState::Idle as u8 as f32);
            sim.set_field(&axis.field("fet_thermistor.temperature"), NOMINAL_FET_TEMPERATURE);
            sim.set_field(&axis.field("motor.current_control.Iq_measured"), 0.0);
        }
        sim
    }

    fn board(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set a field directly, bypassing the command log
    pub fn set_field(&self, field: &str, value: f32) {
        self.board().fields.insert(field.to_string(), value);
    }

    pub fn field(&self, field: &str) -> Option<f32> {
        self.board().fields.get(field).copied()
    }

    /// Script how the next calibration requests on `axis` end
    pub fn script_calibration(&self, axis: Axis, outcome: CalibrationOutcome) {
        self.board().calibration.insert(axis.to_string(), outcome);
    }

    /// Make every subsequent operation fail with an I/O error
    pub fn set_failing(&self, failing: bool) {
        self.board().fail_io = failing;
    }

    /// Last velocity setpoint per axis
    pub fn velocity(&self, axis: Axis) -> f32 {
        self.board().velocities[axis.index() as usize]
    }

    pub fn saves(&self) -> usize {
        self.board().saves
    }

    /// The last `LOG_CAPACITY` commands received, formatted like the ASCII protocol
    pub fn log(&self) -> Vec<String> {
        self.board().log.iter().cloned().collect()
    }
}

impl MotorController for SimController {
    fn read(&mut self, field: &str) -> Result<f32> {
        let mut board = self.board();
        board.check_link()?;
        board.record(format!("r {}", field));
        // Unset registers read as zero, like freshly cleared error fields
        Ok(board.fields.get(field).copied().unwrap_or(0.0))
    }

    fn write(&mut self, field: &str, value: Value) -> Result<()> {
        let mut board = self.board();
        board.check_link()?;
        debug!("sim write {} = {}", field, value);
        board.record(format!("w {} {}", field, value));
        board.fields.insert(field.to_string(), value.as_f32());
        board.on_requested_state(field, value.as_f32());
        Ok(())
    }

    fn set_velocity(&mut self, axis: Axis, velocity: f32) -> Result<()> {
        let mut board = self.board();
        board.check_link()?;
        board.record(format!("v {} {}", axis.index(), velocity));
        board.velocities[axis.index() as usize] = velocity;
        Ok(())
    }

    fn save_configuration(&mut self) -> Result<()> {
        let mut board = self.board();
        board.check_link()?;
        board.record("ss".to_string());
        board.saves += 1;
        Ok(())
    }
}
