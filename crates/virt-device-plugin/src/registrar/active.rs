use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tonic::Request;
use tracing::info;

use super::RegistrationError;
use super::RegistrationMode;
use super::Registrar;
use crate::plugin::api::registration_client::RegistrationClient;
use crate::plugin::api::RegisterRequest;
use crate::plugin::registration_api::registration_server::RegistrationServer;
use crate::plugin::DevicePluginService;
use crate::plugin::API_VERSION;
use crate::registrar::PluginWatcherService;
use crate::transport;

pub const DEFAULT_KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

/// Registers by calling the kubelet's `Registration/Register` once.
#[derive(Debug, Clone)]
pub struct ActiveRegistrar {
    kubelet_socket: PathBuf,
    request: RegisterRequest,
    dial_timeout: Duration,
}

impl ActiveRegistrar {
    /// `endpoint` is the socket file name relative to the kubelet's device
    /// plugin directory.
    pub fn new<P: Into<PathBuf>>(
        kubelet_socket: P,
        endpoint: String,
        resource_name: String,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            kubelet_socket: kubelet_socket.into(),
            request: RegisterRequest {
                version: API_VERSION.to_string(),
                endpoint,
                resource_name,
                options: Some(DevicePluginService::options()),
            },
            dial_timeout,
        }
    }
}

#[async_trait]
impl Registrar for ActiveRegistrar {
    fn mode(&self) -> RegistrationMode {
        RegistrationMode::Active
    }

    fn registration_service(&self) -> Option<RegistrationServer<PluginWatcherService>> {
        None
    }

    /// register device plugin with kubelet
    async fn register(&self) -> Result<(), Report<RegistrationError>> {
        info!(
            "registering device plugin with kubelet: {}",
            self.kubelet_socket.display()
        );

        let channel = transport::connect_uds(&self.kubelet_socket, self.dial_timeout)
            .await
            .change_context(RegistrationError::Dial)?;
        let mut client = RegistrationClient::new(channel);

        client
            .register(Request::new(self.request.clone()))
            .await
            .change_context(RegistrationError::Rejected)
            .attach_printable_lazy(|| {
                format!(
                    "endpoint {}, resource {}",
                    self.request.endpoint, self.request.resource_name
                )
            })?;

        info!("successfully registered device plugin with kubelet");
        Ok(())
    }
}
