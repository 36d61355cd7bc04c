//! Fake sysfs trees for discovery and health tests.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::path::PathBuf;

use tempfile::TempDir;

/// Mimics the `/sys/class/net` layout: every interface is a symlink into a
/// `devices/` hierarchy whose `device/driver` link names the bound driver.
pub(crate) struct FakeSysfs {
    dir: TempDir,
}

impl FakeSysfs {
    pub(crate) fn new() -> Self {
        let dir = TempDir::new().expect("should create temp dir");
        fs::create_dir_all(dir.path().join("class/net")).expect("should create net dir");
        Self { dir }
    }

    pub(crate) fn root(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn net_dir(&self) -> PathBuf {
        self.root().join("class/net")
    }

    pub(crate) fn add_interface(&self, name: &str, bus_address: &str, driver: &str) {
        let relative = format!("devices/pci0000:00/{bus_address}/virtio0/net/{name}");
        let device_dir = self.root().join(&relative);
        fs::create_dir_all(device_dir.join("device")).expect("should create device dir");
        symlink(
            format!("../../../../bus/virtio/drivers/{driver}"),
            device_dir.join("device/driver"),
        )
        .expect("should link driver");
        symlink(format!("../../{relative}"), self.net_dir().join(name))
            .expect("should link interface");
        self.set_operstate(name, "up");
    }

    pub(crate) fn add_virtual(&self, name: &str) {
        let relative = format!("devices/virtual/net/{name}");
        fs::create_dir_all(self.root().join(&relative)).expect("should create device dir");
        symlink(format!("../../{relative}"), self.net_dir().join(name))
            .expect("should link interface");
        self.set_operstate(name, "unknown");
    }

    pub(crate) fn set_operstate(&self, name: &str, state: &str) {
        fs::write(self.net_dir().join(name).join("operstate"), format!("{state}\n"))
            .expect("should write operstate");
    }

    pub(crate) fn remove_operstate(&self, name: &str) {
        fs::remove_file(self.net_dir().join(name).join("operstate"))
            .expect("should remove operstate");
    }

    pub(crate) fn write_route_table(&self, content: &str) -> PathBuf {
        let path = self.root().join("route");
        fs::write(&path, content).expect("should write route table");
        path
    }
}
