use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use tokio::sync::watch;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tracing::error;
use tracing::info;

use super::RegistrationError;
use super::RegistrationMode;
use super::Registrar;
use crate::lifecycle::LifecycleManager;
use crate::plugin::registration_api::registration_server::Registration;
use crate::plugin::registration_api::registration_server::RegistrationServer;
use crate::plugin::registration_api::InfoRequest;
use crate::plugin::registration_api::PluginInfo;
use crate::plugin::registration_api::RegistrationStatus;
use crate::plugin::registration_api::RegistrationStatusResponse;
use crate::plugin::DrainReason;
use crate::plugin::Session;
use crate::plugin::API_VERSION;

/// Plugin type reported to the kubelet plugin watcher.
pub const PLUGIN_TYPE: &str = "DevicePlugin";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Pending,
    Registered,
    Failed(String),
}

/// Registers by answering the kubelet plugin watcher.
#[derive(Debug)]
pub struct PassiveRegistrar {
    service: PluginWatcherService,
    outcome: watch::Receiver<Outcome>,
}

impl PassiveRegistrar {
    pub fn new(
        resource_name: String,
        lifecycle: Arc<LifecycleManager>,
        session: Arc<Session>,
    ) -> Self {
        let info = PluginInfo {
            r#type: PLUGIN_TYPE.to_string(),
            name: resource_name,
            endpoint: lifecycle.socket_path().display().to_string(),
            supported_versions: vec![API_VERSION.to_string()],
        };
        let (outcome_tx, outcome) = watch::channel(Outcome::Pending);
        Self {
            service: PluginWatcherService {
                info,
                outcome: Arc::new(outcome_tx),
                lifecycle,
                session,
            },
            outcome,
        }
    }
}

#[async_trait]
impl Registrar for PassiveRegistrar {
    fn mode(&self) -> RegistrationMode {
        RegistrationMode::Passive
    }

    fn registration_service(&self) -> Option<RegistrationServer<PluginWatcherService>> {
        Some(RegistrationServer::new(self.service.clone()))
    }

    /// Resolves once the kubelet reports the registration outcome.
    async fn register(&self) -> Result<(), Report<RegistrationError>> {
        info!("waiting for the kubelet plugin watcher to register the plugin");

        let mut outcome = self.outcome.clone();
        loop {
            match &*outcome.borrow_and_update() {
                Outcome::Pending => {}
                Outcome::Registered => return Ok(()),
                Outcome::Failed(message) => {
                    return Err(Report::new(RegistrationError::Failed {
                        message: message.clone(),
                    }))
                }
            }
            if outcome.changed().await.is_err() {
                return Err(Report::new(RegistrationError::Abandoned));
            }
        }
    }
}

/// `pluginregistration.Registration` implementation served on the plugin
/// socket in passive mode.
#[derive(Debug, Clone)]
pub struct PluginWatcherService {
    info: PluginInfo,
    outcome: Arc<watch::Sender<Outcome>>,
    lifecycle: Arc<LifecycleManager>,
    session: Arc<Session>,
}

#[tonic::async_trait]
impl Registration for PluginWatcherService {
    async fn get_info(&self, _request: Request<InfoRequest>) -> TonicResult<Response<PluginInfo>> {
        info!("kubelet requested plugin info");
        Ok(Response::new(self.info.clone()))
    }

    /// On failure the server is stopped and the socket removed before
    /// answering.
    async fn notify_registration_status(
        &self,
        request: Request<RegistrationStatus>,
    ) -> TonicResult<Response<RegistrationStatusResponse>> {
        let status = request.into_inner();

        if status.plugin_registered {
            info!(
                "plugin {} registered successfully at kubelet",
                self.info.endpoint
            );
            self.outcome.send_replace(Outcome::Registered);
        } else {
            error!(
                "plugin {} failed to register at kubelet: {}; shutting down",
                self.info.endpoint, status.error
            );
            self.session
                .drain(DrainReason::RegistrationFailed(status.error.clone()));
            if let Err(e) = self.lifecycle.stop().await {
                error!("failed to stop device plugin server: {e:?}");
            }
            self.outcome.send_replace(Outcome::Failed(status.error));
        }

        Ok(Response::new(RegistrationStatusResponse {}))
    }
}
