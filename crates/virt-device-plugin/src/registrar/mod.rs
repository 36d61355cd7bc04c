//! Registration of the plugin with the kubelet.
//!
//! Two strategies exist because the kubelet protocol evolved between them:
//! - [`PassiveRegistrar`]: the kubelet plugin watcher finds the socket and
//!   calls back into `pluginregistration.Registration`
//! - [`ActiveRegistrar`]: the plugin dials `kubelet.sock` and calls
//!   `v1beta1.Registration/Register`
//!
//! The rest of the plugin only sees the [`Registrar`] trait.

pub mod active;
pub mod passive;

use async_trait::async_trait;
use clap::ValueEnum;
use derive_more::Display;
use error_stack::Report;
use thiserror::Error;

pub use active::ActiveRegistrar;
pub use passive::PassiveRegistrar;
pub use passive::PluginWatcherService;

use crate::plugin::registration_api::registration_server::RegistrationServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Display)]
pub enum RegistrationMode {
    /// wait for the kubelet plugin watcher to call back
    #[display("passive")]
    Passive,
    /// dial the kubelet registration socket
    #[display("active")]
    Active,
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("failed to dial kubelet registration socket")]
    Dial,
    #[error("kubelet rejected the registration request")]
    Rejected,
    #[error("kubelet reported registration failure: {message}")]
    Failed { message: String },
    #[error("registration was abandoned before the kubelet answered")]
    Abandoned,
}

#[async_trait]
pub trait Registrar: Send + Sync + std::fmt::Debug {
    fn mode(&self) -> RegistrationMode;

    /// Service the plugin must serve next to the device plugin API for the
    /// kubelet to complete the handshake.
    fn registration_service(&self) -> Option<RegistrationServer<PluginWatcherService>>;

    /// Completes the handshake; an error is fatal to the session.
    async fn register(&self) -> Result<(), Report<RegistrationError>>;
}
