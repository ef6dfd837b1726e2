use std::time::Duration;

use clap::{Parser, Subcommand};
use hoverbot_runtime::bringup::{self, SpinPlan, Timing};
use hoverbot_runtime::config::{
    CALIBRATION_POLL, CALIBRATION_TIMEOUT, ControllerSettings, ENGAGE_SETTLE, SPIN_DURATION,
    SPIN_SPEED, ServeSettings,
};
use hoverbot_runtime::motor::{ControlMode, DriveBase, WheelPair};
use hoverbot_runtime::runtime::{self, BoxError, open_controller};
use hoverbot_runtime::teleop;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(version, about = "Hoverboard robot teleop runtime")]
struct Cli {
    #[command(flatten)]
    controller: ControllerSettings,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the joystick page, control, status and video endpoints (default)
    Serve(ServeSettings),
    /// Drive from the keyboard in this terminal
    Teleop {
        #[arg(long, value_enum, default_value_t = ControlMode::ClosedLoop)]
        mode: ControlMode,
    },
    /// Calibrate the hall sensors on both axes and save on success
    Calibrate,
    /// Configure both axes for sensorless control
    Sensorless,
    /// Spin the wheels for a few seconds to check wiring and direction
    Spin {
        /// Left wheel command in [-1, 1]
        #[arg(long, default_value_t = 1.0, allow_negative_numbers = true)]
        left: f32,
        /// Right wheel command in [-1, 1]
        #[arg(long, default_value_t = 1.0, allow_negative_numbers = true)]
        right: f32,
        #[arg(long, default_value_t = SPIN_SPEED)]
        speed: f32,
        #[arg(long, default_value_t = SPIN_DURATION.as_secs_f32())]
        seconds: f32,
        #[arg(long, value_enum, default_value_t = ControlMode::ClosedLoop)]
        mode: ControlMode,
    },
    /// Read the bus voltage to check the link
    Probe,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init(); // installs the subscriber globally

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        error!("{}", e);
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), BoxError> {
    let controller = cli.controller;
    match cli.command.unwrap_or_else(|| Command::Serve(ServeSettings::default())) {
        Command::Serve(settings) => runtime::serve(&controller, &settings).await,
        Command::Teleop { mode } => blocking(move || teleop::run(&controller, mode)).await,
        Command::Calibrate => {
            blocking(move || {
                let mut ctrl = open_controller(&controller)?;
                let timing = Timing {
                    poll: CALIBRATION_POLL,
                    timeout: CALIBRATION_TIMEOUT,
                };
                let report = bringup::calibrate(ctrl.as_mut(), timing)?;
                if !report.all_passed() {
                    return Err("calibration failed, configuration not saved".into());
                }
                info!("Calibration saved");
                Ok(())
            })
            .await
        }
        Command::Sensorless => {
            blocking(move || {
                let mut ctrl = open_controller(&controller)?;
                bringup::setup_sensorless(ctrl.as_mut())?;
                Ok(())
            })
            .await
        }
        Command::Spin {
            left,
            right,
            speed,
            seconds,
            mode,
        } => {
            blocking(move || {
                let mut drive = DriveBase::new(open_controller(&controller)?);
                let plan = SpinPlan {
                    mode,
                    wheels: WheelPair::new(left.clamp(-1.0, 1.0), right.clamp(-1.0, 1.0))
                        .scaled(speed),
                    settle: ENGAGE_SETTLE,
                    duration: Duration::try_from_secs_f32(seconds)?,
                };
                bringup::spin(&mut drive, plan)?;
                Ok(())
            })
            .await
        }
        Command::Probe => {
            blocking(move || {
                let mut ctrl = open_controller(&controller)?;
                bringup::probe(ctrl.as_mut())?;
                Ok(())
            })
            .await
        }
    }
}

/// Run serial-bound work off the async workers
async fn blocking<F>(work: F) -> Result<(), BoxError>
where
    F: FnOnce() -> Result<(), BoxError> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}
