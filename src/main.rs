//! Process entry point
//!
//! Constructs every component explicitly and wires them together: no
//! process-wide registries. Shutdown order on the first signal: stop the
//! broker session (which closes the intake queue), let the batch coordinator
//! drain and flush, then stop the health server. A second signal aborts
//! whatever flush work is still in flight.

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use virta_ingestor::api::{ApiClient, ControlPlane};
use virta_ingestor::batch::BatchCoordinator;
use virta_ingestor::config::Config;
use virta_ingestor::error::VirtaError;
use virta_ingestor::health::{self, HealthState};
use virta_ingestor::ingress::Ingress;
use virta_ingestor::publisher::{DiagnosticSink, ErrorPublisher};
use virta_ingestor::{intake, session};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), VirtaError> {
    let config = Config::from_env()?;
    info!(
        broker = %config.broker.host,
        port = config.broker.port,
        control_plane = %config.control_plane.base_url,
        "starting virta ingestor"
    );

    // First signal: graceful shutdown. Second signal: abort in-flight work.
    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();
    spawn_signal_listener(shutdown.clone(), abort.clone());

    let api = Arc::new(ApiClient::new(&config.control_plane, &config.resilience)?);

    let (session_handle, driver) = session::connect(&config.broker).await?;
    let diagnostics: Arc<dyn DiagnosticSink> = Arc::new(ErrorPublisher::new(session_handle.clone()));

    let (intake_tx, intake_rx) = intake::channel(config.intake_capacity);
    let ingress = Ingress::new(
        config.broker.sensor_prefix.clone(),
        intake_tx,
        diagnostics.clone(),
    );

    // The ingress (and with it the intake sender) lives inside the session
    // task; when the session stops, the queue closes and the coordinator
    // drains to completion.
    let session_task = tokio::spawn(driver.run(ingress, shutdown.clone()));

    let coordinator = BatchCoordinator::new(
        intake_rx,
        api.clone() as Arc<dyn ControlPlane>,
        diagnostics,
        config.batch.clone(),
        abort.clone(),
    );
    let coordinator_task = tokio::spawn(coordinator.run());

    let health_task = health::start(
        config.health_port,
        HealthState {
            session: session_handle,
            api: api.clone(),
        },
        shutdown.clone(),
    )
    .await?;

    info!("ingestor running");
    shutdown.cancelled().await;
    info!("shutdown requested, stopping broker session");

    let _ = session_task.await;
    let _ = coordinator_task.await;
    let _ = health_task.await;

    info!("shutdown complete");
    Ok(())
}

fn spawn_signal_listener(shutdown: CancellationToken, abort: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("interrupt received, shutting down gracefully (interrupt again to abort)");
        shutdown.cancel();

        wait_for_signal().await;
        warn!("second interrupt, aborting in-flight work");
        abort.cancel();
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
