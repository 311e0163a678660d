/*!
 * Device Registry
 * Snapshot of remote devices derived from the BlueZ object tree
 */

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{Address, Device, DEVICE_INTERFACE};
use crate::bus::{BusClient, ManagedObjects};
use crate::error::Result;

pub type DeviceMap = BTreeMap<Address, Device>;

pub struct DeviceRegistry {
    bus: Arc<dyn BusClient>,
    devices: RwLock<Arc<DeviceMap>>,
    stale: AtomicBool,
}

impl DeviceRegistry {
    pub fn new(bus: Arc<dyn BusClient>) -> Self {
        Self {
            bus,
            devices: RwLock::new(Arc::new(DeviceMap::new())),
            stale: AtomicBool::new(true),
        }
    }

    /// Re-read every device object and swap in the new mapping.
    pub async fn refresh(&self) -> Result<usize> {
        let objects = self.bus.get_all_objects().await?;
        let devices: DeviceMap = devices_in(&objects)
            .map(|device| (device.address.clone(), device))
            .collect();
        let count = devices.len();

        *self.devices.write().await = Arc::new(devices);
        self.stale.store(false, Ordering::Release);
        debug!("Device registry refreshed: {} devices", count);
        Ok(count)
    }

    /// Force the next snapshot read to refresh first.
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Current mapping, refreshed first if it was never loaded or invalidated.
    pub async fn snapshot(&self) -> Result<Arc<DeviceMap>> {
        if self.stale.load(Ordering::Acquire) {
            self.refresh().await?;
        }
        Ok(self.devices.read().await.clone())
    }

    /// Object path for `address`, queried live.
    ///
    /// Absence is a normal outcome: a failed registry query is logged and
    /// reported the same way as an unknown address.
    pub async fn find_path(&self, address: &Address) -> Option<String> {
        let objects = match self.bus.get_all_objects().await {
            Ok(objects) => objects,
            Err(e) => {
                warn!("Registry query failed while resolving {}: {}", address, e);
                return None;
            }
        };

        let path = devices_in(&objects)
            .find(|device| &device.address == address)
            .map(|device| device.path);
        if path.is_none() {
            debug!("Device path not found for {}", address);
        }
        path
    }

    /// Connected devices advertising a service class containing `fragment`.
    pub async fn filter_by_service(&self, fragment: &str) -> Result<BTreeMap<Address, String>> {
        let devices = self.snapshot().await?;
        Ok(names(
            devices
                .values()
                .filter(|d| d.connected && d.has_service(fragment)),
        ))
    }

    pub async fn paired(&self) -> Result<BTreeMap<Address, String>> {
        self.refresh().await?;
        let devices = self.snapshot().await?;
        Ok(names(devices.values().filter(|d| d.paired)))
    }

    pub async fn connected(&self) -> Result<BTreeMap<Address, String>> {
        self.refresh().await?;
        let devices = self.snapshot().await?;
        Ok(names(devices.values().filter(|d| d.connected)))
    }

    pub async fn all(&self) -> Result<BTreeMap<Address, String>> {
        let devices = self.snapshot().await?;
        Ok(names(devices.values()))
    }
}

fn devices_in(objects: &ManagedObjects) -> impl Iterator<Item = Device> + '_ {
    objects.iter().filter_map(|(path, interfaces)| {
        interfaces
            .get(DEVICE_INTERFACE)
            .and_then(|props| Device::from_properties(path, props))
    })
}

fn names<'a>(devices: impl Iterator<Item = &'a Device>) -> BTreeMap<Address, String> {
    devices
        .map(|d| (d.address.clone(), d.name.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::{A2DP_SINK_UUID, A2DP_SOURCE_UUID};
    use crate::bus::fake::FakeBus;

    fn registry() -> (Arc<FakeBus>, DeviceRegistry) {
        let bus = Arc::new(FakeBus::new());
        let registry = DeviceRegistry::new(bus.clone());
        (bus, registry)
    }

    #[tokio::test]
    async fn refresh_replaces_mapping() {
        let (bus, registry) = registry();
        bus.add_device("AA:BB:CC:DD:EE:01", "Speaker", &[A2DP_SINK_UUID], true, true);
        assert_eq!(registry.refresh().await.unwrap(), 1);

        bus.add_device("AA:BB:CC:DD:EE:02", "Phone", &[A2DP_SOURCE_UUID], true, false);
        assert_eq!(registry.refresh().await.unwrap(), 2);
        assert_eq!(registry.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn snapshot_loads_lazily_and_after_invalidate() {
        let (bus, registry) = registry();
        bus.add_device("AA:BB:CC:DD:EE:01", "Speaker", &[], false, false);
        assert_eq!(registry.snapshot().await.unwrap().len(), 1);

        bus.add_device("AA:BB:CC:DD:EE:02", "Phone", &[], false, false);
        assert_eq!(registry.snapshot().await.unwrap().len(), 1);

        registry.invalidate();
        assert_eq!(registry.snapshot().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn find_path_matches_address_case_insensitively() {
        let (bus, registry) = registry();
        let path = bus.add_device("aa:bb:cc:dd:ee:01", "Speaker", &[], false, false);

        let found = registry.find_path(&Address::new("AA:BB:CC:DD:EE:01")).await;
        assert_eq!(found, Some(path));
        assert_eq!(registry.find_path(&Address::new("00:00:00:00:00:00")).await, None);
    }

    #[tokio::test]
    async fn find_path_treats_registry_failure_as_absent() {
        let (bus, registry) = registry();
        bus.add_device("AA:BB:CC:DD:EE:01", "Speaker", &[], false, false);
        bus.take_registry_down();

        assert_eq!(registry.find_path(&Address::new("AA:BB:CC:DD:EE:01")).await, None);
    }

    #[tokio::test]
    async fn filter_by_service_excludes_disconnected() {
        let (bus, registry) = registry();
        bus.add_device("AA:BB:CC:DD:EE:01", "Speaker", &["0000110B-0000-1000-8000-00805F9B34FB"], true, true);
        bus.add_device("AA:BB:CC:DD:EE:02", "Old Speaker", &[A2DP_SINK_UUID], true, false);
        bus.add_device("AA:BB:CC:DD:EE:03", "Phone", &[A2DP_SOURCE_UUID], true, true);

        let sinks = registry.filter_by_service("110b").await.unwrap();
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[&Address::new("AA:BB:CC:DD:EE:01")], "Speaker");
    }

    #[tokio::test]
    async fn paired_and_connected_views() {
        let (bus, registry) = registry();
        bus.add_device("AA:BB:CC:DD:EE:01", "Speaker", &[], true, true);
        bus.add_device("AA:BB:CC:DD:EE:02", "Headset", &[], true, false);
        bus.add_device("AA:BB:CC:DD:EE:03", "Stranger", &[], false, false);

        let paired = registry.paired().await.unwrap();
        assert_eq!(paired.len(), 2);
        assert!(!paired.contains_key(&Address::new("AA:BB:CC:DD:EE:03")));

        let connected = registry.connected().await.unwrap();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[&Address::new("AA:BB:CC:DD:EE:01")], "Speaker");
    }
}
