//! Ownership of the plugin endpoint: bind, serve, readiness check and stop.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;
use tonic::transport::Server;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::plugin::registration_api::registration_server::RegistrationServer;
use crate::plugin::DevicePluginService;
use crate::plugin::DrainReason;
use crate::plugin::Session;
use crate::registrar::PluginWatcherService;
use crate::transport;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("device plugin server is already running")]
    AlreadyRunning,
    #[error("failed to remove stale socket {}", path.display())]
    RemoveStaleSocket { path: PathBuf },
    #[error("failed to bind {}", path.display())]
    Bind { path: PathBuf },
    #[error("device plugin server at {} is not accepting connections", path.display())]
    NotReady { path: PathBuf },
    #[error("failed to remove socket {}", path.display())]
    RemoveSocket { path: PathBuf },
}

/// How long `stop` waits for the accept loop to release the listener.
const LISTENER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type ServeHandle = JoinHandle<Result<(), tonic::transport::Error>>;

#[derive(Debug)]
struct RunningServer {
    shutdown: CancellationToken,
    /// cancelled once the listener has been dropped
    listener_closed: CancellationToken,
    handle: ServeHandle,
}

/// Sole owner of the gRPC server handle and of the socket file.
///
/// `stop` may be called from the signal path, from inside the registration
/// status RPC and from application shutdown; only the first call finds a
/// running server.
#[derive(Debug)]
pub struct LifecycleManager {
    socket_path: PathBuf,
    readiness_timeout: Duration,
    shutdown_grace: Duration,
    session: Arc<Session>,
    running: Mutex<Option<RunningServer>>,
    /// server task of a stopped server, joined by `wait`
    stopped: Mutex<Option<ServeHandle>>,
}

impl LifecycleManager {
    pub fn new<P: Into<PathBuf>>(
        socket_path: P,
        readiness_timeout: Duration,
        shutdown_grace: Duration,
        session: Arc<Session>,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            readiness_timeout,
            shutdown_grace,
            session,
            running: Mutex::new(None),
            stopped: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// start device plugin server
    ///
    /// Serves the device plugin API, plus the plugin watcher registration API
    /// when `registration` is given, and only returns once the socket accepts
    /// connections.
    #[tracing::instrument(skip_all, fields(socket = %self.socket_path.display()))]
    pub async fn start(
        &self,
        service: DevicePluginService,
        registration: Option<RegistrationServer<PluginWatcherService>>,
    ) -> Result<(), Report<LifecycleError>> {
        {
            let mut running = self.running.lock().await;
            if running.is_some() {
                return Err(Report::new(LifecycleError::AlreadyRunning));
            }

            info!("start device plugin server");

            // clean up old socket file if it exists
            remove_socket(&self.socket_path).change_context(
                LifecycleError::RemoveStaleSocket {
                    path: self.socket_path.clone(),
                },
            )?;

            let listener =
                UnixListener::bind(&self.socket_path).change_context(LifecycleError::Bind {
                    path: self.socket_path.clone(),
                })?;
            info!("gRPC server is bound");

            let shutdown = CancellationToken::new();
            let listener_closed = CancellationToken::new();
            let incoming = incoming(
                listener,
                shutdown.clone(),
                listener_closed.clone().drop_guard(),
            );
            let signal = {
                let listener_closed = listener_closed.clone();
                async move {
                    listener_closed.cancelled().await;
                    info!("shutting down gRPC server");
                }
            };
            let router = Server::builder()
                .add_service(service.into_server())
                .add_optional_service(registration);
            let handle = tokio::spawn(router.serve_with_incoming_shutdown(incoming, signal));

            *running = Some(RunningServer {
                shutdown,
                listener_closed,
                handle,
            });
        }

        if let Err(e) = self.session.bound() {
            warn!("{e}");
        }

        // wait for the server to accept connections before going on
        if let Err(e) = transport::connect_uds(&self.socket_path, self.readiness_timeout).await {
            error!("could not establish connection with gRPC server: {e}");
            if let Err(stop_err) = self.stop().await {
                error!("failed to clean up after readiness failure: {stop_err:?}");
            }
            return Err(Report::new(e).change_context(LifecycleError::NotReady {
                path: self.socket_path.clone(),
            }));
        }

        info!("device plugin server started serving");
        Ok(())
    }

    /// Stops serving, then removes the socket file.
    ///
    /// Idempotent; without a running server it only makes sure the socket
    /// path is absent.
    pub async fn stop(&self) -> Result<(), Report<LifecycleError>> {
        let running = self.running.lock().await.take();

        let Some(server) = running else {
            debug!("no device plugin server running");
            return remove_socket(&self.socket_path).change_context(
                LifecycleError::RemoveSocket {
                    path: self.socket_path.clone(),
                },
            );
        };

        info!("stopping device plugin server");
        self.session.drain(DrainReason::Stopped);
        server.shutdown.cancel();
        *self.stopped.lock().await = Some(server.handle);

        // no new connection may be accepted once the socket file is gone
        if tokio::time::timeout(LISTENER_CLOSE_TIMEOUT, server.listener_closed.cancelled())
            .await
            .is_err()
        {
            warn!(
                "listener still open after {:?}, removing socket anyway",
                LISTENER_CLOSE_TIMEOUT
            );
        }

        remove_socket(&self.socket_path).change_context(LifecycleError::RemoveSocket {
            path: self.socket_path.clone(),
        })?;

        if let Err(e) = self.session.stopped() {
            debug!("{e}");
        }
        info!("device plugin server stopped");
        Ok(())
    }

    /// Joins the server task of a stopped server, giving it the shutdown grace
    /// period to finish open connections.
    pub async fn wait(&self) {
        let Some(mut handle) = self.stopped.lock().await.take() else {
            return;
        };

        match tokio::time::timeout(self.shutdown_grace, &mut handle).await {
            Ok(Ok(Ok(()))) => debug!("gRPC server task finished"),
            Ok(Ok(Err(e))) => error!("gRPC server failed: {e}"),
            Ok(Err(e)) => error!("gRPC server task failed: {e}"),
            Err(_) => {
                warn!(
                    "gRPC server did not finish within {:?}, aborting",
                    self.shutdown_grace
                );
                handle.abort();
            }
        }
    }
}

/// Accepts connections until `shutdown` is cancelled, then drops the listener
/// and fires `closed`.
fn incoming(
    listener: UnixListener,
    shutdown: CancellationToken,
    closed: DropGuard,
) -> impl Stream<Item = io::Result<UnixStream>> + Send {
    futures::stream::unfold(
        (listener, shutdown, closed),
        |(listener, shutdown, closed)| async move {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => None,
                accepted = listener.accept() => Some(accepted),
            };
            accepted.map(|accepted| {
                (
                    accepted.map(|(stream, _)| stream),
                    (listener, shutdown, closed),
                )
            })
        },
    )
}

fn remove_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("removed socket {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
