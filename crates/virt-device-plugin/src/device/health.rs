use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use derive_more::Display;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::DeviceRegistry;
use super::DiscoveredDevices;
use super::Health;

/// How the health of a device is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Display)]
pub enum HealthPolicy {
    /// read the interface `operstate`, `up` is healthy
    #[display("operstate")]
    Operstate,
    /// report every device healthy without probing
    #[display("always-healthy")]
    AlwaysHealthy,
}

/// When the monitor wakes up the streaming calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Display)]
pub enum NotifyPolicy {
    /// only when at least one device changed health
    #[display("on-change")]
    OnChange,
    /// after every probe round
    #[display("every-tick")]
    EveryTick,
}

/// Reads `<net_dir>/<interface>/operstate`; anything but `up`, including a
/// read failure, is unhealthy.
pub async fn probe_operstate(net_dir: &Path, interface: &str) -> Health {
    let path = net_dir.join(interface).join("operstate");
    match tokio::fs::read_to_string(&path).await {
        Ok(state) if state.trim() == "up" => Health::Healthy,
        Ok(state) => {
            debug!("interface {interface} operstate is {:?}", state.trim());
            Health::Unhealthy
        }
        Err(e) => {
            debug!("cannot read {}: {e}", path.display());
            Health::Unhealthy
        }
    }
}

/// Periodically re-derives the health of every discovered device.
#[derive(Debug)]
pub struct HealthMonitor {
    registry: Arc<DeviceRegistry>,
    net_dir: PathBuf,
    /// `(bus_address, interface)` pairs, fixed after discovery
    devices: Vec<(String, String)>,
    policy: HealthPolicy,
    notify: NotifyPolicy,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new<P: Into<PathBuf>>(
        registry: Arc<DeviceRegistry>,
        net_dir: P,
        devices: &DiscoveredDevices,
        policy: HealthPolicy,
        notify: NotifyPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            net_dir: net_dir.into(),
            devices: devices
                .iter()
                .map(|(address, interface)| (address.to_string(), interface.to_string()))
                .collect(),
            policy,
            notify,
            interval,
        }
    }

    async fn probe(&self, interface: &str) -> Health {
        match self.policy {
            HealthPolicy::Operstate => probe_operstate(&self.net_dir, interface).await,
            HealthPolicy::AlwaysHealthy => Health::Healthy,
        }
    }

    /// Runs one probe round and returns whether any device flipped.
    ///
    /// All devices are updated before subscribers are woken, so a snapshot
    /// taken after the notification reflects the whole round.
    pub async fn tick(&self) -> bool {
        let mut changed = false;
        for (bus_address, interface) in &self.devices {
            let health = self.probe(interface).await;
            if self.registry.upsert_health(bus_address, health) {
                info!("device {bus_address} ({interface}) is now {health}");
                changed = true;
            }
        }

        if changed || self.notify == NotifyPolicy::EveryTick {
            self.registry.publish();
        }
        changed
    }

    #[tracing::instrument(skip(self, cancellation_token), fields(interval = ?self.interval))]
    pub async fn run(&self, cancellation_token: CancellationToken) {
        if self.interval.is_zero() {
            warn!("health interval is zero, health monitoring disabled");
            cancellation_token.cancelled().await;
            return;
        }

        info!(
            "starting health monitor for {} devices, policy {}, notify {}",
            self.devices.len(),
            self.policy,
            self.notify
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately, the registry is already seeded
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("health monitor shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    if self.tick().await {
                        debug!("device health changed, notified watchers");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;
    use tokio::time::timeout;

    use super::*;
    use crate::device::testing::FakeSysfs;
    use crate::device::DeviceDiscoverer;

    const TEST_TIMEOUT: Duration = Duration::from_secs(1);

    fn monitor(
        sysfs: &FakeSysfs,
        policy: HealthPolicy,
        notify: NotifyPolicy,
    ) -> (Arc<DeviceRegistry>, HealthMonitor) {
        let devices = DeviceDiscoverer::new(sysfs.net_dir(), "virtio_net")
            .discover()
            .expect("should discover devices");
        let registry = Arc::new(DeviceRegistry::new());
        let monitor = HealthMonitor::new(
            registry.clone(),
            sysfs.net_dir(),
            &devices,
            policy,
            notify,
            Duration::from_millis(10),
        );
        (registry, monitor)
    }

    fn health_of(registry: &DeviceRegistry, id: &str) -> Health {
        registry.get(id).expect("device should exist").health
    }

    #[test(tokio::test)]
    async fn operstate_up_is_healthy() {
        let sysfs = FakeSysfs::new();
        sysfs.add_interface("eth0", "0000:00:03.0", "virtio_net");

        assert_eq!(
            probe_operstate(&sysfs.net_dir(), "eth0").await,
            Health::Healthy
        );

        sysfs.set_operstate("eth0", "down");
        assert_eq!(
            probe_operstate(&sysfs.net_dir(), "eth0").await,
            Health::Unhealthy
        );

        sysfs.remove_operstate("eth0");
        assert_eq!(
            probe_operstate(&sysfs.net_dir(), "eth0").await,
            Health::Unhealthy
        );
    }

    #[test(tokio::test)]
    async fn flip_to_down_notifies_once() {
        let sysfs = FakeSysfs::new();
        sysfs.add_interface("eth0", "0000:00:03.0", "virtio_net");
        let (registry, monitor) = monitor(&sysfs, HealthPolicy::Operstate, NotifyPolicy::OnChange);

        assert!(monitor.tick().await, "seeding inserts the device");
        assert_eq!(health_of(&registry, "0000:00:03.0"), Health::Healthy);

        let mut rx = registry.subscribe();
        assert!(!monitor.tick().await);
        assert!(!rx.has_changed().expect("sender alive"));

        sysfs.set_operstate("eth0", "down");
        assert!(monitor.tick().await);
        assert_eq!(health_of(&registry, "0000:00:03.0"), Health::Unhealthy);
        timeout(TEST_TIMEOUT, rx.changed())
            .await
            .expect("should be notified")
            .expect("sender alive");
    }

    #[test(tokio::test)]
    async fn every_tick_policy_always_notifies() {
        let sysfs = FakeSysfs::new();
        sysfs.add_interface("eth0", "0000:00:03.0", "virtio_net");
        let (registry, monitor) =
            monitor(&sysfs, HealthPolicy::Operstate, NotifyPolicy::EveryTick);
        monitor.tick().await;

        let mut rx = registry.subscribe();
        assert!(!monitor.tick().await);
        assert!(rx.has_changed().expect("sender alive"));
    }

    #[test(tokio::test)]
    async fn always_healthy_ignores_operstate() {
        let sysfs = FakeSysfs::new();
        sysfs.add_interface("eth0", "0000:00:03.0", "virtio_net");
        sysfs.set_operstate("eth0", "down");
        let (registry, monitor) =
            monitor(&sysfs, HealthPolicy::AlwaysHealthy, NotifyPolicy::OnChange);

        monitor.tick().await;
        assert_eq!(health_of(&registry, "0000:00:03.0"), Health::Healthy);
    }

    #[test(tokio::test)]
    async fn run_picks_up_changes_and_stops_on_cancel() {
        let sysfs = FakeSysfs::new();
        sysfs.add_interface("eth0", "0000:00:03.0", "virtio_net");
        let (registry, monitor) = monitor(&sysfs, HealthPolicy::Operstate, NotifyPolicy::OnChange);
        monitor.tick().await;

        let mut rx = registry.subscribe();
        let token = CancellationToken::new();
        let task = tokio::spawn({
            let token = token.clone();
            async move { monitor.run(token).await }
        });

        sysfs.set_operstate("eth0", "lowerlayerdown");
        timeout(TEST_TIMEOUT, rx.changed())
            .await
            .expect("monitor should publish the flip")
            .expect("sender alive");
        assert_eq!(health_of(&registry, "0000:00:03.0"), Health::Unhealthy);

        token.cancel();
        timeout(TEST_TIMEOUT, task)
            .await
            .expect("monitor should stop")
            .expect("monitor task should not panic");
    }
}
