//! Virtual NIC devices: discovery, the shared registry and health monitoring.
//!
//! The main components are:
//! - [`DeviceDiscoverer`]: finds the interfaces bound to the target driver
//! - [`DeviceRegistry`]: the bus address to health mapping shared by all tasks
//! - [`HealthMonitor`]: periodically re-probes each interface

pub mod discovery;
pub mod health;
pub mod registry;

use derive_more::Display;

pub use discovery::DiscoveredDevices;
pub use discovery::DiscoveryError;
pub use discovery::DeviceDiscoverer;
pub use health::HealthMonitor;
pub use health::HealthPolicy;
pub use health::NotifyPolicy;
pub use registry::DeviceRegistry;
pub use registry::RegistryError;

/// Coarse usability of a device, as reported to the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Health {
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
}

impl Health {
    pub fn is_healthy(self) -> bool {
        matches!(self, Health::Healthy)
    }
}

/// An allocatable network interface, identified by its PCI bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub health: Health,
}

impl Device {
    pub fn new(id: impl Into<String>, health: Health) -> Self {
        Self {
            id: id.into(),
            health,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing;
