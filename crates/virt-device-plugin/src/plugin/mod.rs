//! Kubelet device plugin protocol.
//!
//! - [`api`] / [`registration_api`]: generated gRPC types
//! - [`Session`]: the plugin's session state machine
//! - [`DevicePluginService`]: the `v1beta1.DevicePlugin` implementation

#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

pub mod registration_api {
    tonic::include_proto!("pluginregistration");
}

pub mod allocation;
pub mod service;
pub mod session;

pub use allocation::AllocationError;
pub use service::DevicePluginService;
pub use session::DrainReason;
pub use session::Session;
pub use session::SessionState;

/// Device plugin API version this plugin speaks.
pub const API_VERSION: &str = "v1beta1";

/// Environment variable carrying the allocated bus addresses.
pub const ALLOCATION_ENV: &str = "VIRT-PCI-ADDR";
