//! Discovery of the network interfaces bound to the para-virtualized driver.

use std::collections::BTreeMap;
use std::fs;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tracing::debug;
use tracing::info;

pub const DEFAULT_NET_DIR: &str = "/sys/class/net";
pub const DEFAULT_ROUTE_TABLE: &str = "/proc/net/route";
pub const DEFAULT_DRIVER: &str = "virtio_net";

/// Errors that make discovery, and therefore startup, fail.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to read network interface directory {}", path.display())]
    ReadNetDir { path: PathBuf },
    #[error("no network interface found in {}", path.display())]
    NoInterfaces { path: PathBuf },
    #[error("failed to read route table {}", path.display())]
    ReadRouteTable { path: PathBuf },
    #[error("no network interface is bound to driver `{driver}`")]
    NoMatchingDevices { driver: String },
}

/// Result of a discovery pass: bus address to interface name, ordered by
/// bus address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredDevices {
    by_address: BTreeMap<String, String>,
}

impl DiscoveredDevices {
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Interface name the bus address was discovered through.
    pub fn interface(&self, bus_address: &str) -> Option<&str> {
        self.by_address.get(bus_address).map(String::as_str)
    }

    pub fn bus_addresses(&self) -> impl Iterator<Item = &str> {
        self.by_address.keys().map(String::as_str)
    }

    /// Iterates `(bus_address, interface)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.by_address
            .iter()
            .map(|(address, interface)| (address.as_str(), interface.as_str()))
    }

    fn insert(&mut self, bus_address: String, interface: String) -> bool {
        if self.by_address.contains_key(&bus_address) {
            return false;
        }
        self.by_address.insert(bus_address, interface);
        true
    }
}

impl FromIterator<(String, String)> for DiscoveredDevices {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut devices = Self::default();
        for (bus_address, interface) in iter {
            devices.insert(bus_address, interface);
        }
        devices
    }
}

/// Scans the net class directory for interfaces bound to `driver`.
#[derive(Debug, Clone)]
pub struct DeviceDiscoverer {
    net_dir: PathBuf,
    driver: String,
    /// route table to read the default route interface from; `None`
    /// disables the default route exclusion
    route_table: Option<PathBuf>,
}

impl DeviceDiscoverer {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(net_dir: P, driver: S) -> Self {
        Self {
            net_dir: net_dir.into(),
            driver: driver.into(),
            route_table: None,
        }
    }

    /// Never report the interface carrying the default route, as read from
    /// `route_table`.
    pub fn with_default_route_exclusion<P: Into<PathBuf>>(mut self, route_table: P) -> Self {
        self.route_table = Some(route_table.into());
        self
    }

    #[tracing::instrument(skip(self), fields(net_dir = %self.net_dir.display(), driver = %self.driver))]
    pub fn discover(&self) -> Result<DiscoveredDevices, Report<DiscoveryError>> {
        let read_dir = fs::read_dir(&self.net_dir).change_context(DiscoveryError::ReadNetDir {
            path: self.net_dir.clone(),
        })?;

        let mut names = read_dir
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.file_name().to_string_lossy().into_owned()),
                Err(e) => {
                    debug!("skipping unreadable directory entry: {e}");
                    None
                }
            })
            .collect::<Vec<_>>();
        names.sort();

        if names.is_empty() {
            return Err(Report::new(DiscoveryError::NoInterfaces {
                path: self.net_dir.clone(),
            }));
        }

        let default_interface = match &self.route_table {
            Some(route_table) => read_default_route_interface(route_table)?,
            None => None,
        };

        let mut devices = DiscoveredDevices::default();
        for name in names {
            if default_interface.as_deref() == Some(name.as_str()) {
                info!("skipping default route interface {name}");
                continue;
            }

            let Some(bus_address) = self.probe_interface(&name) else {
                continue;
            };

            info!("found {} interface {name} at {bus_address}", self.driver);
            if !devices.insert(bus_address.clone(), name.clone()) {
                debug!("bus address {bus_address} already reported, ignoring {name}");
            }
        }

        if devices.is_empty() {
            return Err(Report::new(DiscoveryError::NoMatchingDevices {
                driver: self.driver.clone(),
            }));
        }

        Ok(devices)
    }

    /// Returns the bus address of `name` when it is bound to the target
    /// driver. Every failure here only skips the interface.
    fn probe_interface(&self, name: &str) -> Option<String> {
        let interface_path = self.net_dir.join(name);
        let driver_link = interface_path.join("device").join("driver");

        let driver_target = match fs::read_link(&driver_link) {
            Ok(target) => target,
            Err(e) => {
                debug!(
                    "cannot read driver link {}, skipping: {e}",
                    driver_link.display()
                );
                return None;
            }
        };

        let driver = driver_target.file_name().and_then(|n| n.to_str());
        if driver != Some(self.driver.as_str()) {
            debug!("interface {name} is bound to {driver:?}, skipping");
            return None;
        }

        let device_target = match fs::read_link(&interface_path) {
            Ok(target) => target,
            Err(e) => {
                debug!(
                    "cannot read device link {}, skipping: {e}",
                    interface_path.display()
                );
                return None;
            }
        };

        let bus_address = bus_address_from_link(&device_target);
        if bus_address.is_none() {
            debug!(
                "no bus address in device link {} of {name}, skipping",
                device_target.display()
            );
        }
        bus_address
    }
}

/// Extracts the bus address from an interface link such as
/// `../../devices/pci0000:00/0000:00:03.0/virtio0/net/eth0`: the component
/// following the PCI root bus.
fn bus_address_from_link(target: &Path) -> Option<String> {
    let mut components = target.components().filter_map(|c| match c {
        Component::Normal(s) => s.to_str(),
        _ => None,
    });

    while let Some(component) = components.next() {
        if component == "devices" {
            let root_bus = components.next()?;
            if !root_bus.starts_with("pci") {
                return None;
            }
            return components.next().map(str::to_string);
        }
    }
    None
}

fn read_default_route_interface(
    route_table: &Path,
) -> Result<Option<String>, Report<DiscoveryError>> {
    let table =
        fs::read_to_string(route_table).change_context(DiscoveryError::ReadRouteTable {
            path: route_table.to_path_buf(),
        })?;
    Ok(parse_default_route_interface(&table))
}

/// Interface field of the first data line, after the header line.
fn parse_default_route_interface(table: &str) -> Option<String> {
    table
        .lines()
        .nth(1)
        .and_then(|line| line.split('\t').next())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::device::testing::FakeSysfs;

    const ROUTE_TABLE: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n\
        eth0\t00000000\t0102A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0\n\
        eth2\t0002A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0\n";

    fn addresses(devices: &DiscoveredDevices) -> Vec<&str> {
        devices.bus_addresses().collect()
    }

    #[test]
    fn discovers_only_target_driver() {
        let sysfs = FakeSysfs::new();
        sysfs.add_interface("eth0", "0000:00:03.0", "virtio_net");
        sysfs.add_interface("eth1", "0000:00:04.0", "e1000");

        let devices = DeviceDiscoverer::new(sysfs.net_dir(), DEFAULT_DRIVER)
            .discover()
            .expect("should discover devices");

        assert_eq!(addresses(&devices), vec!["0000:00:03.0"]);
        assert_eq!(devices.interface("0000:00:03.0"), Some("eth0"));
    }

    #[test]
    fn skips_interfaces_without_driver_link() {
        let sysfs = FakeSysfs::new();
        sysfs.add_virtual("lo");
        sysfs.add_interface("eth0", "0000:00:03.0", "virtio_net");
        sysfs.add_interface("eth2", "0000:00:05.0", "virtio_net");

        let devices = DeviceDiscoverer::new(sysfs.net_dir(), DEFAULT_DRIVER)
            .discover()
            .expect("should discover devices");

        assert_eq!(addresses(&devices), vec!["0000:00:03.0", "0000:00:05.0"]);
    }

    #[test]
    fn reports_each_bus_address_once() {
        let sysfs = FakeSysfs::new();
        sysfs.add_interface("eth0", "0000:00:03.0", "virtio_net");
        sysfs.add_interface("eth0v", "0000:00:03.0", "virtio_net");

        let devices = DeviceDiscoverer::new(sysfs.net_dir(), DEFAULT_DRIVER)
            .discover()
            .expect("should discover devices");

        assert_eq!(devices.len(), 1);
        assert_eq!(devices.interface("0000:00:03.0"), Some("eth0"));
    }

    #[test]
    fn excludes_default_route_interface_when_enabled() {
        let sysfs = FakeSysfs::new();
        sysfs.add_interface("eth0", "0000:00:03.0", "virtio_net");
        sysfs.add_interface("eth2", "0000:00:05.0", "virtio_net");
        let route_table = sysfs.write_route_table(ROUTE_TABLE);

        let devices = DeviceDiscoverer::new(sysfs.net_dir(), DEFAULT_DRIVER)
            .with_default_route_exclusion(&route_table)
            .discover()
            .expect("should discover devices");
        assert_eq!(addresses(&devices), vec!["0000:00:05.0"]);

        let devices = DeviceDiscoverer::new(sysfs.net_dir(), DEFAULT_DRIVER)
            .discover()
            .expect("should discover devices");
        assert_eq!(addresses(&devices), vec!["0000:00:03.0", "0000:00:05.0"]);
    }

    #[test]
    fn unreadable_route_table_is_fatal_when_exclusion_enabled() {
        let sysfs = FakeSysfs::new();
        sysfs.add_interface("eth0", "0000:00:03.0", "virtio_net");

        let result = DeviceDiscoverer::new(sysfs.net_dir(), DEFAULT_DRIVER)
            .with_default_route_exclusion(sysfs.root().join("missing-route"))
            .discover();

        let report = result.expect_err("should fail without route table");
        assert!(matches!(
            report.current_context(),
            DiscoveryError::ReadRouteTable { .. }
        ));
    }

    #[test]
    fn missing_net_dir_is_fatal() {
        let sysfs = FakeSysfs::new();
        let result = DeviceDiscoverer::new(sysfs.root().join("nope"), DEFAULT_DRIVER).discover();

        let report = result.expect_err("should fail on missing directory");
        assert!(matches!(
            report.current_context(),
            DiscoveryError::ReadNetDir { .. }
        ));
    }

    #[test]
    fn empty_net_dir_is_fatal() {
        let sysfs = FakeSysfs::new();
        let result = DeviceDiscoverer::new(sysfs.net_dir(), DEFAULT_DRIVER).discover();

        let report = result.expect_err("should fail on empty directory");
        assert!(matches!(
            report.current_context(),
            DiscoveryError::NoInterfaces { .. }
        ));
    }

    #[test]
    fn no_matching_driver_is_fatal() {
        let sysfs = FakeSysfs::new();
        sysfs.add_interface("eth1", "0000:00:04.0", "e1000");

        let result = DeviceDiscoverer::new(sysfs.net_dir(), DEFAULT_DRIVER).discover();

        let report = result.expect_err("should fail without matching devices");
        assert!(matches!(
            report.current_context(),
            DiscoveryError::NoMatchingDevices { .. }
        ));
    }

    #[test]
    fn bus_address_follows_root_bus() {
        let link = Path::new("../../devices/pci0000:00/0000:00:03.0/virtio0/net/eth0");
        assert_eq!(
            bus_address_from_link(link),
            Some("0000:00:03.0".to_string())
        );

        let link = Path::new("../../devices/virtual/net/lo");
        assert_eq!(bus_address_from_link(link), None);

        let link = Path::new("../../devices/pci0000:00");
        assert_eq!(bus_address_from_link(link), None);
    }

    #[test]
    fn default_route_uses_first_data_line() {
        assert_eq!(
            parse_default_route_interface(ROUTE_TABLE),
            Some("eth0".to_string())
        );
        assert_eq!(parse_default_route_interface("Iface\tDestination\n"), None);
        assert_eq!(parse_default_route_interface(""), None);
    }
}
