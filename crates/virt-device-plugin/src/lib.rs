//! Kubernetes device plugin advertising the host's para-virtualized NICs,
//! identified by PCI bus address, as an allocatable extended resource.

pub mod app;
pub mod config;
pub mod device;
pub mod lifecycle;
pub mod plugin;
pub mod registrar;
pub mod transport;
