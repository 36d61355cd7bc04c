use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use utils::version;

use crate::device::discovery::DEFAULT_DRIVER;
use crate::device::discovery::DEFAULT_NET_DIR;
use crate::device::discovery::DEFAULT_ROUTE_TABLE;
use crate::device::HealthPolicy;
use crate::device::NotifyPolicy;
use crate::registrar::active::DEFAULT_KUBELET_SOCKET;
use crate::registrar::RegistrationMode;

/// Plugin directory watched by the kubelet plugin watcher.
pub const PASSIVE_PLUGIN_DIR: &str = "/var/lib/kubelet/plugins";
/// Directory holding the kubelet registration socket.
pub const ACTIVE_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";

/// Advertises the host's virtio_net interfaces to the kubelet.
#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "VIRT_DP_NET_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_NET_DIR,
        help = "Network interface class directory to scan for devices"
    )]
    pub net_dir: PathBuf,

    #[arg(
        long,
        env = "VIRT_DP_DRIVER",
        default_value = DEFAULT_DRIVER,
        help = "Driver the advertised interfaces must be bound to"
    )]
    pub driver: String,

    #[arg(
        long,
        env = "VIRT_DP_EXCLUDE_DEFAULT_ROUTE",
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Never advertise the interface carrying the host's default route"
    )]
    pub exclude_default_route: bool,

    #[arg(
        long,
        env = "VIRT_DP_ROUTE_TABLE",
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_ROUTE_TABLE,
        help = "Route table read when excluding the default route interface"
    )]
    pub route_table: PathBuf,

    #[arg(
        long,
        env = "VIRT_DP_HEALTH_POLICY",
        value_enum,
        default_value_t = HealthPolicy::Operstate,
        help = "How device health is derived"
    )]
    pub health_policy: HealthPolicy,

    #[arg(
        long,
        env = "VIRT_DP_NOTIFY_POLICY",
        value_enum,
        default_value_t = NotifyPolicy::OnChange,
        help = "When open device list streams receive a new snapshot"
    )]
    pub notify_policy: NotifyPolicy,

    #[arg(
        long,
        env = "VIRT_DP_HEALTH_INTERVAL",
        default_value = "10",
        help = "Seconds between health probe rounds, 0 disables monitoring"
    )]
    pub health_interval_secs: u64,

    #[arg(
        long,
        env = "VIRT_DP_REGISTRATION_MODE",
        value_enum,
        default_value_t = RegistrationMode::Passive,
        help = "How the plugin registers with the kubelet"
    )]
    pub registration_mode: RegistrationMode,

    #[arg(
        long,
        env = "VIRT_DP_PLUGIN_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory of the plugin socket, defaults to the kubelet directory of the registration mode"
    )]
    pub plugin_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "VIRT_DP_ENDPOINT_PREFIX",
        default_value = "virtNet",
        help = "File name of the plugin socket without the .sock suffix"
    )]
    pub endpoint_prefix: String,

    #[arg(
        long,
        env = "VIRT_DP_RESOURCE_NAME",
        default_value = "kernel.org/virt",
        help = "Extended resource name the devices are advertised under"
    )]
    pub resource_name: String,

    #[arg(
        long,
        env = "VIRT_DP_KUBELET_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_KUBELET_SOCKET,
        help = "Kubelet registration socket, used in active registration mode"
    )]
    pub kubelet_socket: PathBuf,

    #[arg(
        long,
        env = "VIRT_DP_DIAL_TIMEOUT",
        default_value = "5",
        help = "Seconds to wait for the kubelet registration socket"
    )]
    pub dial_timeout_secs: u64,

    #[arg(
        long,
        env = "VIRT_DP_READINESS_TIMEOUT",
        default_value = "5",
        help = "Seconds to wait for the plugin server to accept connections"
    )]
    pub readiness_timeout_secs: u64,

    #[arg(
        long,
        env = "VIRT_DP_SHUTDOWN_GRACE",
        default_value = "5",
        help = "Seconds open connections get to finish on shutdown"
    )]
    pub shutdown_grace_secs: u64,

    #[arg(
        long,
        env = "VIRT_DP_LOG_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for daily rolling log files, stderr only when unset"
    )]
    pub log_dir: Option<PathBuf>,
}

impl Cli {
    pub fn plugin_dir(&self) -> PathBuf {
        match &self.plugin_dir {
            Some(dir) => dir.clone(),
            None => match self.registration_mode {
                RegistrationMode::Passive => PathBuf::from(PASSIVE_PLUGIN_DIR),
                RegistrationMode::Active => PathBuf::from(ACTIVE_PLUGIN_DIR),
            },
        }
    }

    /// Socket file name, as announced to the kubelet in active mode.
    pub fn endpoint(&self) -> String {
        format!("{}.sock", self.endpoint_prefix)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.plugin_dir().join(self.endpoint())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
