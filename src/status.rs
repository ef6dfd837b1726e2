//! Periodic telemetry sampling
//!
//! A [`StatusSampler`] owns a background task that polls the motor controller
//! once per period and publishes a whole [`TelemetrySnapshot`] through a
//! `watch` channel. Readers never wait for the next sample; a failed sample
//! leaves the previous snapshot in place.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::messages::StatusReport;
use crate::motor::{Axis, ControllerError, MotorController, SharedDrive};

const FIELD_BUS_VOLTAGE: &str = "vbus_voltage";
const FIELD_PHASE_CURRENT: &str = "motor.current_control.Iq_measured";
const FIELD_FET_TEMPERATURE: &str = "fet_thermistor.temperature";

/// Pack voltage bounds used for the charge estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryProfile {
    pub empty_volts: f32,
    pub full_volts: f32,
}

impl BatteryProfile {
    /// Linear charge estimate in percent, clamped to 0..=100
    pub fn percentage(&self, volts: f32) -> u8 {
        let span = self.full_volts - self.empty_volts;
        if !volts.is_finite() || span <= 0.0 {
            return 0;
        }
        let fraction = ((volts - self.empty_volts) / span).clamp(0.0, 1.0);
        (fraction * 100.0).round() as u8
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub bus_voltage: f32,
    /// Measured phase current per axis, amps (signed)
    pub axis_current: [f32; 2],
    pub battery_percentage: u8,
    /// Hotter of the two inverter thermistors, used as a motor temperature proxy
    pub temperature: f32,
    pub uptime: Duration,
}

impl TelemetrySnapshot {
    /// Total current magnitude across both axes
    pub fn motor_current(&self) -> f32 {
        self.axis_current.iter().map(|i| i.abs()).sum()
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            battery_voltage: self.bus_voltage,
            battery_percentage: self.battery_percentage,
            motor_current: self.motor_current(),
            motor_temp: self.temperature,
            uptime: self.uptime.as_secs(),
        }
    }
}

/// Read one full snapshot from the controller
pub fn sample(
    controller: &mut dyn MotorController,
    battery: &BatteryProfile,
    uptime: Duration,
) -> Result<TelemetrySnapshot, ControllerError> {
    let bus_voltage = controller.read(FIELD_BUS_VOLTAGE)?;

    let mut axis_current = [0.0f32; 2];
    let mut temperature = f32::MIN;
    for axis in Axis::ALL {
        axis_current[axis.index() as usize] = controller.read(&axis.field(FIELD_PHASE_CURRENT))?;
        temperature = temperature.max(controller.read(&axis.field(FIELD_FET_TEMPERATURE))?);
    }

    Ok(TelemetrySnapshot {
        bus_voltage,
        axis_current,
        battery_percentage: battery.percentage(bus_voltage),
        temperature,
        uptime,
    })
}

/// Cheap, cloneable read side of the sampler
#[derive(Debug, Clone)]
pub struct TelemetryReader {
    rx: watch::Receiver<TelemetrySnapshot>,
}

impl TelemetryReader {
    pub fn latest(&self) -> TelemetrySnapshot {
        *self.rx.borrow()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub period: Duration,
    pub battery: BatteryProfile,
}

pub struct StatusSampler {
    drive: SharedDrive,
    config: SamplerConfig,
    snapshot: watch::Sender<TelemetrySnapshot>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl StatusSampler {
    pub fn new(drive: SharedDrive, config: SamplerConfig) -> Self {
        let (snapshot, _) = watch::channel(TelemetrySnapshot::default());
        Self {
            drive,
            config,
            snapshot,
            shutdown: None,
            task: None,
        }
    }

    pub fn reader(&self) -> TelemetryReader {
        TelemetryReader {
            rx: self.snapshot.subscribe(),
        }
    }

    pub fn state(&self) -> SamplerState {
        match &self.task {
            Some(task) if !task.is_finished() => SamplerState::Running,
            _ => SamplerState::Stopped,
        }
    }

    /// Spawn the sampling task. Must be called inside a tokio runtime.
    pub fn start(&mut self) {
        if self.state() == SamplerState::Running {
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sampling_loop(
            self.drive.clone(),
            self.config,
            self.snapshot.clone(),
            stop_rx,
        ));

        info!("Status sampler started: every {:?}", self.config.period);
        self.shutdown = Some(stop_tx);
        self.task = Some(task);
    }

    /// Signal the task to finish, waiting at most `timeout`
    pub async fn stop(&mut self, timeout: Duration) {
        if let Some(stop) = self.shutdown.take() {
            let _ = stop.send(true);
        }
        let Some(mut task) = self.task.take() else {
            return;
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => info!("Status sampler stopped"),
            Err(_) => {
                warn!("Status sampler did not stop within {:?}, aborting", timeout);
                task.abort();
            }
        }
    }
}

async fn sampling_loop(
    drive: SharedDrive,
    config: SamplerConfig,
    snapshot: watch::Sender<TelemetrySnapshot>,
    mut stop: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut tick = interval(config.period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = stop.changed() => break,
        }

        let drive = drive.clone();
        let battery = config.battery;
        let uptime = started.elapsed();
        let result = tokio::task::spawn_blocking(move || {
            let mut drive = drive.lock().unwrap_or_else(|e| e.into_inner());
            sample(drive.controller_mut(), &battery, uptime)
        })
        .await;

        match result {
            Ok(Ok(sampled)) => {
                debug!("Telemetry: {:?}", sampled);
                snapshot.send_replace(sampled);
            }
            // Stale-but-available: keep serving the previous snapshot
            Ok(Err(e)) => warn!("Telemetry read failed: {}", e),
            Err(e) => warn!("Telemetry task failed: {}", e),
        }
    }
}
