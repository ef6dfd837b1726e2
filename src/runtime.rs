// Server lifecycle: open the drive, start sampling and capture, serve HTTP,
// then shut down in order when a signal arrives.
//
// Shutdown: flip the shutdown watch (ends video streams and capture), drain
// HTTP for a bounded time, stop the sampler, send one bounded idle command,
// drop the drive (its Drop zeroes the setpoints as a last resort).

use std::error::Error;
use std::future::{Future, IntoFuture};
use std::io;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::camera::{spawn_capture, FrameFeed};
use crate::config::{
    ControllerSettings, ServeSettings, BATTERY_EMPTY_VOLTS, BATTERY_FULL_VOLTS,
    CAMERA_FRAME_BACKLOG, MOTOR_READ_TIMEOUT, SHUTDOWN_TIMEOUT, SPEED_DEFAULT, SPEED_MAX,
    SPEED_MIN, STATUS_PERIOD,
};
use crate::control::CommandPipeline;
use crate::motor::{
    AsciiBus, ControllerError, DriveBase, MotorController, SharedDrive, SimController,
    SpeedMultiplier, SpeedRange,
};
use crate::server::{router, AppState};
use crate::status::{BatteryProfile, SamplerConfig, StatusSampler};

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Open the serial controller, or the simulator with `--simulate`
pub fn open_controller(
    settings: &ControllerSettings,
) -> Result<Box<dyn MotorController>, ControllerError> {
    if settings.simulate {
        info!("Using simulated motor controller");
        return Ok(Box::new(SimController::new()));
    }
    info!(
        "Opening motor controller on {} @ {} baud",
        settings.port, settings.baud
    );
    let bus = AsciiBus::open_with(&settings.port, settings.baud, MOTOR_READ_TIMEOUT)?;
    Ok(Box::new(bus))
}

/// Speed multiplier with the configured bounds and start value
pub fn default_speed() -> SpeedMultiplier {
    SpeedMultiplier::new(SPEED_DEFAULT, SpeedRange::new(SPEED_MIN, SPEED_MAX))
}

pub async fn serve(
    controller: &ControllerSettings,
    settings: &ServeSettings,
) -> Result<(), BoxError> {
    let mut drive = DriveBase::new(open_controller(controller)?);
    if let Err(e) = drive.engage(settings.mode) {
        // Keep serving: status still works and a later restart may recover
        warn!("Failed to engage motors: {}", e);
    }
    let drive = drive.shared();

    let mut sampler = StatusSampler::new(
        drive.clone(),
        SamplerConfig {
            period: STATUS_PERIOD,
            battery: BatteryProfile {
                empty_volts: BATTERY_EMPTY_VOLTS,
                full_volts: BATTERY_FULL_VOLTS,
            },
        },
    );
    sampler.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown = Arc::new(shutdown_tx);
    let (frames, capture) = start_camera(settings, shutdown_rx);

    let state = AppState {
        pipeline: Arc::new(CommandPipeline::new(
            drive.clone(),
            Arc::new(default_speed()),
            settings.throttle(),
        )),
        telemetry: sampler.reader(),
        frames,
    };

    let served = run_http(&settings.addr, state, shutdown.clone()).await;
    if let Err(e) = &served {
        warn!("HTTP server failed: {}", e);
    }

    info!("Shutting down");
    shutdown.send_replace(true);
    sampler.stop(SHUTDOWN_TIMEOUT).await;
    if let Some(capture) = capture {
        if timeout(SHUTDOWN_TIMEOUT, capture).await.is_err() {
            warn!("Camera capture did not stop within {:?}", SHUTDOWN_TIMEOUT);
        }
    }
    park(drive, SHUTDOWN_TIMEOUT).await;

    info!("Runtime stopped");
    served
}

fn start_camera(
    settings: &ServeSettings,
    shutdown: watch::Receiver<bool>,
) -> (Option<Arc<FrameFeed>>, Option<JoinHandle<()>>) {
    if settings.no_camera {
        info!("Camera disabled");
        return (None, None);
    }

    let (tx, feed) = FrameFeed::channel(CAMERA_FRAME_BACKLOG, shutdown.clone());
    match spawn_capture(&settings.camera_command, tx, shutdown) {
        Ok(task) => (Some(Arc::new(feed)), Some(task)),
        Err(e) => {
            warn!("Failed to start camera ({}), video disabled", e);
            (None, None)
        }
    }
}

async fn run_http(
    addr: &str,
    state: AppState,
    shutdown: Arc<watch::Sender<bool>>,
) -> Result<(), BoxError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Serving on http://{}", listener.local_addr()?);

    serve_until(listener, state, shutdown, shutdown_signal(), SHUTDOWN_TIMEOUT).await?;
    Ok(())
}

/// Serve until `signal` resolves, then flip `shutdown` and give open
/// connections at most `drain` to finish
pub async fn serve_until<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: Arc<watch::Sender<bool>>,
    signal: F,
    drain: Duration,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut stopping = shutdown.subscribe();
    let server = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            signal.await;
            // Streaming responses end on this, so the drain can finish
            shutdown.send_replace(true);
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return result,
        _ = async { let _ = stopping.wait_for(|stop| *stop).await; } => {}
    }

    match timeout(drain, server).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Connections still open after {:?}, closing them", drain);
            Ok(())
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

/// Best-effort idle, bounded so a dead controller cannot hang shutdown
async fn park(drive: SharedDrive, limit: Duration) {
    let task = tokio::task::spawn_blocking(move || {
        let mut drive = drive.lock().unwrap_or_else(PoisonError::into_inner);
        drive.idle()
    });

    match timeout(limit, task).await {
        Ok(Ok(Ok(()))) => info!("Motors idle"),
        Ok(Ok(Err(e))) => warn!("Failed to idle motors: {}", e),
        Ok(Err(e)) => warn!("Idle task failed: {}", e),
        Err(_) => warn!("Controller did not confirm idle within {:?}", limit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{Axis, AxisState};
    use axum::body::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::{broadcast, oneshot};

    fn camera_state(shutdown: &watch::Sender<bool>) -> (AppState, broadcast::Sender<Bytes>) {
        let drive = DriveBase::new(Box::new(SimController::new())).shared();
        let sampler = StatusSampler::new(
            drive.clone(),
            SamplerConfig {
                period: STATUS_PERIOD,
                battery: BatteryProfile {
                    empty_volts: BATTERY_EMPTY_VOLTS,
                    full_volts: BATTERY_FULL_VOLTS,
                },
            },
        );
        let (frames, feed) = FrameFeed::channel(4, shutdown.subscribe());
        let state = AppState {
            pipeline: Arc::new(CommandPipeline::new(
                drive,
                Arc::new(default_speed()),
                Duration::from_millis(100),
            )),
            telemetry: sampler.reader(),
            frames: Some(Arc::new(feed)),
        };
        (state, frames)
    }

    #[tokio::test]
    async fn test_shutdown_with_open_video_viewer() {
        let (tx, _) = watch::channel(false);
        let shutdown = Arc::new(tx);
        let (state, frames) = camera_state(&shutdown);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (trigger, signal) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_until(
            listener,
            state,
            shutdown.clone(),
            async move {
                let _ = signal.await;
            },
            Duration::from_secs(5),
        ));

        let mut viewer = TcpStream::connect(addr).await.unwrap();
        viewer
            .write_all(b"GET /video_feed HTTP/1.1\r\nHost: robot\r\n\r\n")
            .await
            .unwrap();
        let mut head = vec![0u8; 1024];
        let n = viewer.read(&mut head).await.unwrap();
        assert!(String::from_utf8_lossy(&head[..n]).starts_with("HTTP/1.1 200 OK"));

        // Capture is still publishing; the open stream must not hold shutdown up
        trigger.send(()).unwrap();
        let finished = timeout(Duration::from_secs(2), server).await;
        assert!(matches!(finished, Ok(Ok(Ok(())))));
        assert!(*shutdown.borrow());
        drop(frames);
    }

    fn simulated() -> ControllerSettings {
        ControllerSettings {
            port: String::new(),
            baud: 0,
            simulate: true,
        }
    }

    #[test]
    fn test_simulate_opens_without_hardware() {
        let mut ctrl = open_controller(&simulated()).unwrap();
        assert!(ctrl.read("vbus_voltage").unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_park_idles_both_axes() {
        let sim = SimController::new();
        let mut drive = DriveBase::new(Box::new(sim.clone()));
        drive.engage(crate::motor::ControlMode::ClosedLoop).unwrap();

        park(drive.shared(), Duration::from_secs(1)).await;

        let mut board = sim.clone();
        for axis in Axis::ALL {
            assert_eq!(board.current_state(axis).unwrap(), AxisState::Idle);
        }
    }

    #[test]
    fn test_default_speed_bounds() {
        let speed = default_speed();
        assert_eq!(speed.get(), SPEED_DEFAULT);
        assert_eq!(speed.set(100.0), SPEED_MAX);
    }
}
