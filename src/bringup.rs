// One-shot bring-up commands for the hub-motor controller
//
// Each command writes configuration fields, requests an axis state and polls
// until the controller settles. The controller's own state machines are opaque:
// we only watch `current_state` and the error registers.

use std::thread::sleep;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::motor::{
    Axis, AxisErrors, AxisState, ControlMode, ControllerError, DriveBase, MotorController, Value,
    WheelPair,
};

#[derive(Error, Debug)]
pub enum BringupError {
    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("{axis} calibration failed ({errors})")]
    CalibrationFailed { axis: Axis, errors: AxisErrors },

    #[error("{axis} still in {state:?} after {waited:?}")]
    Timeout {
        axis: Axis,
        state: AxisState,
        waited: Duration,
    },

    #[error("{axis} is in {state:?}, expected {expected:?} ({errors})")]
    NotEngaged {
        axis: Axis,
        state: AxisState,
        expected: AxisState,
        errors: AxisErrors,
    },
}

pub type Result<T> = std::result::Result<T, BringupError>;

// 6.5" hoverboard hub motors: 10 pole pairs, 6 hall states per electrical turn.
// Motor type 2 is gimbal/voltage control, control mode 2 is velocity.
const HUB_MOTOR_PROFILE: &[(&str, Value)] = &[
    ("motor.config.pole_pairs", Value::Int(10)),
    ("motor.config.motor_type", Value::Int(2)),
    ("motor.config.current_lim", Value::Float(10.0)),
    ("motor.config.requested_current_range", Value::Float(20.0)),
    ("motor.config.calibration_current", Value::Float(5.0)),
    ("motor.config.phase_resistance", Value::Float(0.15)),
    ("motor.config.phase_inductance", Value::Float(0.00015)),
    ("motor.config.pre_calibrated", Value::Bool(true)),
    ("encoder.config.mode", Value::Int(1)),
    ("encoder.config.cpr", Value::Int(60)),
    ("encoder.config.bandwidth", Value::Float(1000.0)),
    ("controller.config.control_mode", Value::Int(2)),
    ("controller.config.vel_limit", Value::Float(15.0)),
    ("controller.config.vel_limit_tolerance", Value::Float(1.2)),
    ("controller.config.vel_gain", Value::Float(0.16)),
    ("controller.config.vel_integrator_gain", Value::Float(0.32)),
    ("config.startup_motor_calibration", Value::Bool(false)),
    ("config.startup_encoder_offset_calibration", Value::Bool(false)),
    ("config.startup_closed_loop_control", Value::Bool(false)),
    ("config.startup_sensorless_control", Value::Bool(false)),
];

const ENCODER_PRE_CALIBRATED: &str = "encoder.config.pre_calibrated";

/// Polling cadence and bound for waiting on a calibration sequence
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub poll: Duration,
    pub timeout: Duration,
}

/// Write the hub-motor profile to one axis
pub fn apply_profile(
    ctrl: &mut dyn MotorController,
    axis: Axis,
    encoder_calibrated: bool,
) -> std::result::Result<(), ControllerError> {
    info!("Configuring {} for hub motors", axis);
    for (suffix, value) in HUB_MOTOR_PROFILE {
        ctrl.write(&axis.field(suffix), *value)?;
    }
    ctrl.write(&axis.field(ENCODER_PRE_CALIBRATED), encoder_calibrated.into())
}

/// Poll until the axis reports idle, or give up after `timing.timeout`
pub fn wait_for_idle(ctrl: &mut dyn MotorController, axis: Axis, timing: Timing) -> Result<()> {
    let started = Instant::now();
    loop {
        let state = ctrl.current_state(axis)?;
        if state == AxisState::Idle {
            return Ok(());
        }
        let waited = started.elapsed();
        if waited >= timing.timeout {
            return Err(BringupError::Timeout {
                axis,
                state,
                waited,
            });
        }
        sleep(timing.poll);
    }
}

/// Run the hall-sensor offset calibration on one axis
///
/// On failure the errors are cleared and the axis is left idle. Never retries.
pub fn calibrate_axis(ctrl: &mut dyn MotorController, axis: Axis, timing: Timing) -> Result<()> {
    let result = run_calibration(ctrl, axis, timing);
    if let Err(e) = &result {
        error!("{}", e);
        if let Err(e) = ctrl.clear_errors(axis) {
            warn!("Failed to clear {} errors: {}", axis, e);
        }
        if let Err(e) = ctrl.request_state(axis, AxisState::Idle) {
            warn!("Failed to idle {}: {}", axis, e);
        }
    }
    result
}

fn run_calibration(ctrl: &mut dyn MotorController, axis: Axis, timing: Timing) -> Result<()> {
    ctrl.clear_errors(axis)?;
    apply_profile(ctrl, axis, false)?;

    info!("Starting hall sensor calibration on {}", axis);
    ctrl.request_state(axis, AxisState::EncoderOffsetCalibration)?;
    wait_for_idle(ctrl, axis, timing)?;

    let errors = ctrl.axis_errors(axis)?;
    if !errors.is_clear() {
        return Err(BringupError::CalibrationFailed { axis, errors });
    }
    info!("{} calibration complete", axis);
    Ok(())
}

/// Per-axis outcome of a calibration run
#[derive(Debug)]
pub struct CalibrationReport {
    pub results: Vec<(Axis, Result<()>)>,
    pub saved: bool,
}

impl CalibrationReport {
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }
}

/// Calibrate both axes, saving the configuration only if every axis passed
pub fn calibrate(
    ctrl: &mut dyn MotorController,
    timing: Timing,
) -> std::result::Result<CalibrationReport, ControllerError> {
    let results: Vec<_> = Axis::ALL
        .into_iter()
        .map(|axis| (axis, calibrate_axis(ctrl, axis, timing)))
        .collect();

    let mut report = CalibrationReport {
        results,
        saved: false,
    };
    if report.all_passed() {
        info!("Saving configuration");
        ctrl.save_configuration()?;
        report.saved = true;
    } else {
        warn!("Calibration incomplete, configuration not saved");
    }
    Ok(report)
}

/// Configure both axes for sensorless control (no calibration run)
pub fn setup_sensorless(ctrl: &mut dyn MotorController) -> Result<()> {
    for axis in Axis::ALL {
        ctrl.clear_errors(axis)?;
        apply_profile(ctrl, axis, true)?;
    }
    info!("Both axes configured for sensorless control");
    Ok(())
}

/// Timed open-loop spin used to check wiring and direction
#[derive(Debug, Clone, Copy)]
pub struct SpinPlan {
    pub mode: ControlMode,
    pub wheels: WheelPair,
    pub settle: Duration,
    pub duration: Duration,
}

/// Engage, drive the wheels for a while, then stop and idle
///
/// Any failure triggers a best-effort idle before the error is returned.
pub fn spin(drive: &mut DriveBase, plan: SpinPlan) -> Result<()> {
    let result = run_spin(drive, plan);
    if let Err(e) = &result {
        error!("Spin aborted: {}", e);
        if let Err(e) = drive.idle() {
            warn!("Failed to idle after abort: {}", e);
        }
    }
    result
}

fn run_spin(drive: &mut DriveBase, plan: SpinPlan) -> Result<()> {
    drive.engage(plan.mode)?;
    sleep(plan.settle);

    let expected = plan.mode.axis_state();
    for axis in Axis::ALL {
        let ctrl = drive.controller_mut();
        let state = ctrl.current_state(axis)?;
        if state != expected {
            let errors = ctrl.axis_errors(axis)?;
            return Err(BringupError::NotEngaged {
                axis,
                state,
                expected,
                errors,
            });
        }
    }

    info!(
        "Spinning left={} right={} for {:?}",
        plan.wheels.left, plan.wheels.right, plan.duration
    );
    drive.drive(plan.wheels)?;
    sleep(plan.duration);

    drive.idle()?;
    Ok(())
}

/// Read the bus voltage, confirming the link works
pub fn probe(ctrl: &mut dyn MotorController) -> std::result::Result<f32, ControllerError> {
    let volts = ctrl.read("vbus_voltage")?;
    info!("Bus voltage: {:.2} V", volts);
    Ok(volts)
}
