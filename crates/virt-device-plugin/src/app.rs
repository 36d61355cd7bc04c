use std::io;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tokio::signal::unix::signal;
use tokio::signal::unix::Signal;
use tokio::signal::unix::SignalKind;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Cli;
use crate::device::DeviceDiscoverer;
use crate::device::DeviceRegistry;
use crate::device::HealthMonitor;
use crate::lifecycle::LifecycleManager;
use crate::plugin::DevicePluginService;
use crate::plugin::DrainReason;
use crate::plugin::Session;
use crate::registrar::ActiveRegistrar;
use crate::registrar::PassiveRegistrar;
use crate::registrar::Registrar;
use crate::registrar::RegistrationMode;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to install signal handlers")]
    Signals,
    #[error("device discovery failed")]
    Discovery,
    #[error("failed to start the device plugin server")]
    Start,
    #[error("failed to register with the kubelet")]
    Registration,
}

/// Termination signals that drain the session.
struct ShutdownSignals {
    hangup: Signal,
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

impl ShutdownSignals {
    fn install() -> io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.hangup.recv() => "SIGHUP",
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}

/// Application core structure, wiring discovery, the plugin server and
/// registration for one session.
pub struct Application {
    cli: Cli,
}

impl Application {
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Runs the session until it drains and returns why it drained.
    ///
    /// Startup failures are returned as errors; the endpoint is removed
    /// before returning in every case.
    pub async fn run(self) -> Result<DrainReason, Report<AppError>> {
        let cli = &self.cli;
        let mut signals = ShutdownSignals::install().change_context(AppError::Signals)?;

        let mut discoverer = DeviceDiscoverer::new(&cli.net_dir, cli.driver.clone());
        if cli.exclude_default_route {
            discoverer = discoverer.with_default_route_exclusion(&cli.route_table);
        }
        let devices = discoverer.discover().change_context(AppError::Discovery)?;
        tracing::info!(
            "discovered {} devices: {:?}",
            devices.len(),
            devices.bus_addresses().collect::<Vec<_>>()
        );

        let registry = Arc::new(DeviceRegistry::new());
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            &cli.net_dir,
            &devices,
            cli.health_policy,
            cli.notify_policy,
            cli.health_interval(),
        ));
        // initial probe round populates the registry
        monitor.tick().await;

        let session = Arc::new(Session::new());
        let lifecycle = Arc::new(LifecycleManager::new(
            cli.socket_path(),
            cli.readiness_timeout(),
            cli.shutdown_grace(),
            session.clone(),
        ));
        let registrar: Arc<dyn Registrar> = match cli.registration_mode {
            RegistrationMode::Passive => Arc::new(PassiveRegistrar::new(
                cli.resource_name.clone(),
                lifecycle.clone(),
                session.clone(),
            )),
            RegistrationMode::Active => Arc::new(ActiveRegistrar::new(
                &cli.kubelet_socket,
                cli.endpoint(),
                cli.resource_name.clone(),
                cli.dial_timeout(),
            )),
        };
        tracing::info!("using {} registration", registrar.mode());

        let service = DevicePluginService::new(registry.clone(), session.clone());
        lifecycle
            .start(service, registrar.registration_service())
            .await
            .change_context(AppError::Start)?;

        let mut registration_error = None;
        tokio::select! {
            result = registrar.register() => match result {
                Ok(()) => {
                    if let Err(e) = session.activate() {
                        tracing::warn!("session not activated: {e}");
                    }
                }
                Err(report) => {
                    session.drain(DrainReason::RegistrationFailed(
                        report.current_context().to_string(),
                    ));
                    registration_error = Some(report);
                }
            },
            name = signals.recv() => {
                tracing::info!("received {name} during registration, shutting down...");
                session.drain(DrainReason::Signal(name.to_string()));
            }
            _ = session.drained() => {}
        }

        // a failed registration ends the run with an error whichever branch saw it first
        if let Some(DrainReason::RegistrationFailed(message)) = session.drain_reason() {
            shutdown(&lifecycle).await;
            let report = match registration_error {
                Some(report) => report.change_context(AppError::Registration),
                None => Report::new(AppError::Registration).attach_printable(message),
            };
            return Err(report);
        }

        let cancellation_token = CancellationToken::new();
        let monitor_task = spawn_health_monitor(monitor, cancellation_token.clone());

        tokio::select! {
            name = signals.recv() => {
                tracing::info!("received {name}, shutting down...");
                session.drain(DrainReason::Signal(name.to_string()));
            }
            _ = session.drained() => {}
        }

        shutdown(&lifecycle).await;

        cancellation_token.cancel();
        if let Err(e) = monitor_task.await {
            tracing::error!("health monitor task failed: {e}");
        }

        let reason = session.drain_reason().unwrap_or(DrainReason::Stopped);
        tracing::info!("session ended: {reason}");
        Ok(reason)
    }
}

fn spawn_health_monitor(
    monitor: Arc<HealthMonitor>,
    cancellation_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Starting health monitor task");
        monitor.run(cancellation_token).await;
        tracing::info!("Health monitor task completed");
    })
}

async fn shutdown(lifecycle: &LifecycleManager) {
    if let Err(e) = lifecycle.stop().await {
        tracing::error!("failed to stop device plugin server: {e:?}");
    }
    lifecycle.wait().await;
}
