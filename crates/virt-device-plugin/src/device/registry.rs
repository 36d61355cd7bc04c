use std::collections::BTreeMap;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use thiserror::Error;
use tokio::sync::watch;

use super::Device;
use super::Health;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device {id} is not registered")]
    NotFound { id: String },
}

/// Authoritative bus address to device mapping.
///
/// Discovery fills it, the health monitor updates health in place and every
/// streaming call reads snapshots from it. Writers announce a consistent
/// state with [`DeviceRegistry::publish`]; readers wait for that through
/// [`DeviceRegistry::subscribe`].
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<String, Device>>,
    /// generation counter, bumped on every publish
    changes: watch::Sender<u64>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            devices: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    pub fn from_devices<I: IntoIterator<Item = Device>>(devices: I) -> Self {
        let registry = Self::new();
        {
            let mut map = registry.write();
            for device in devices {
                map.insert(device.id.clone(), device);
            }
        }
        registry
    }

    pub fn get(&self, id: &str) -> Result<Device, RegistryError> {
        self.read_guard()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })
    }

    /// Stores `health` for `id`, inserting the device if it is unknown.
    /// Returns whether the stored value changed.
    pub fn upsert_health(&self, id: &str, health: Health) -> bool {
        let mut devices = self.write();
        match devices.get_mut(id) {
            Some(device) if device.health == health => false,
            Some(device) => {
                device.health = health;
                true
            }
            None => {
                devices.insert(id.to_string(), Device::new(id, health));
                true
            }
        }
    }

    /// All devices ordered by bus address.
    pub fn snapshot(&self) -> Vec<Device> {
        self.read_guard().values().cloned().collect()
    }

    /// Runs `f` against a single consistent view of the devices.
    pub fn read<R>(&self, f: impl FnOnce(&BTreeMap<String, Device>) -> R) -> R {
        f(&self.read_guard())
    }

    pub fn len(&self) -> usize {
        self.read_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_guard().is_empty()
    }

    /// Receiver that is marked changed on every subsequent publish.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Wakes every subscriber so they send a fresh snapshot.
    pub fn publish(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, BTreeMap<String, Device>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Device>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }
}
