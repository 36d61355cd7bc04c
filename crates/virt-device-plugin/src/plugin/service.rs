use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::allocation;
use super::api;
use super::api::device_plugin_server::DevicePlugin;
use super::api::device_plugin_server::DevicePluginServer;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::ContainerAllocateResponse;
use super::api::ContainerPreferredAllocationResponse;
use super::api::DevicePluginOptions;
use super::api::Empty;
use super::api::ListAndWatchResponse;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use super::session::DrainReason;
use super::session::Session;
use super::ALLOCATION_ENV;
use crate::device::DeviceRegistry;

/// DevicePlugin service implementation
/// advertises the registry and hands bus addresses to containers
#[derive(Debug, Clone)]
pub struct DevicePluginService {
    registry: Arc<DeviceRegistry>,
    session: Arc<Session>,
    options: DevicePluginOptions,
}

impl DevicePluginService {
    pub fn new(registry: Arc<DeviceRegistry>, session: Arc<Session>) -> Self {
        Self {
            registry,
            session,
            options: Self::options(),
        }
    }

    /// Options reported to the kubelet, and sent along an active registration.
    pub fn options() -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }
    }

    pub fn into_server(self) -> DevicePluginServer<Self> {
        DevicePluginServer::new(self)
    }

    fn list_response(registry: &DeviceRegistry) -> ListAndWatchResponse {
        let devices = registry
            .snapshot()
            .into_iter()
            .map(|device| api::Device {
                health: device.health.to_string(),
                id: device.id,
                topology: None,
            })
            .collect();
        ListAndWatchResponse { devices }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    /// get device plugin options
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(self.options))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// send the full device list, then again after every registry change
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        // one pending snapshot at most, a slow kubelet only ever gets the latest
        let (tx, rx) = mpsc::channel(1);
        let registry = self.registry.clone();
        let session = self.session.clone();

        // subscribe before taking the snapshot so no change can fall in between
        let mut changes = registry.subscribe();
        let initial_response = Self::list_response(&registry);
        info!(
            "ListAndWatch: send initial {} devices",
            initial_response.devices.len()
        );
        if tx.send(Ok(initial_response)).await.is_err() {
            return Err(Status::unavailable("device list stream closed"));
        }

        tokio::spawn(async move {
            let drained = session.drain_token();
            loop {
                tokio::select! {
                    _ = drained.cancelled() => {
                        info!("session draining, closing device list stream");
                        break;
                    }
                    _ = tx.closed() => {
                        error!("device list stream closed by the kubelet");
                        session.drain(DrainReason::PeerGone(
                            "ListAndWatch stream closed".to_string(),
                        ));
                        break;
                    }
                    changed = changes.changed() => {
                        if changed.is_err() {
                            debug!("device registry dropped, closing device list stream");
                            break;
                        }

                        let response = Self::list_response(&registry);
                        debug!("ListAndWatch: send devices {:?}", response.devices);
                        tokio::select! {
                            _ = drained.cancelled() => {
                                info!("session draining, closing device list stream");
                                break;
                            }
                            sent = tx.send(Ok(response)) => {
                                if let Err(e) = sent {
                                    error!("cannot update device states: {e}");
                                    session.drain(DrainReason::PeerGone(
                                        "failed to send device list".to_string(),
                                    ));
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            info!("device watch task stopped");
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    /// get preferred device allocation
    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);
        // no preference, one empty answer per container
        let response = PreferredAllocationResponse {
            container_responses: req
                .container_requests
                .iter()
                .map(|_| ContainerPreferredAllocationResponse::default())
                .collect(),
        };
        Ok(Response::new(response))
    }

    /// allocate devices to containers, all or nothing
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocating devices to containers: {:?}", req);

        let values = allocation::allocate(
            &self.registry,
            req.container_requests
                .iter()
                .map(|container| container.devices_ids.as_slice()),
        )
        .map_err(|e| {
            error!("allocation rejected: {e}");
            Status::from(e)
        })?;

        let container_responses = values
            .into_iter()
            .map(|value| {
                info!("PCI addresses allocated: {value}");
                ContainerAllocateResponse {
                    envs: HashMap::from([(ALLOCATION_ENV.to_string(), value)]),
                    ..Default::default()
                }
            })
            .collect();

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    /// pre-start container, nothing to prepare
    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        let req = request.into_inner();
        debug!("pre-start container: {:?}", req.devices_ids);
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
