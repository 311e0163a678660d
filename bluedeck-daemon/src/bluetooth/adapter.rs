/*!
 * Adapter Control
 * Discovery, visibility and device removal on the local controller
 */

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Address, DeviceRegistry, ADAPTER_INTERFACE};
use crate::bus::{set_property, BusClient, Value};
use crate::error::Result;

pub struct AdapterController {
    bus: Arc<dyn BusClient>,
    path: String,
    registry: Arc<DeviceRegistry>,
    max_inquiry: Duration,
}

impl AdapterController {
    /// `name` is the controller interface, e.g. `hci0`.
    pub fn new(bus: Arc<dyn BusClient>, name: &str, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            bus,
            path: format!("/org/bluez/{}", name),
            registry,
            max_inquiry: Duration::from_secs(60),
        }
    }

    pub fn with_max_inquiry(mut self, max_inquiry: Duration) -> Self {
        self.max_inquiry = max_inquiry;
        self
    }

    pub async fn start_discovery(&self) -> Result<()> {
        self.bus
            .call(&self.path, ADAPTER_INTERFACE, "StartDiscovery", vec![])
            .await?;
        info!("Discovery started on {}", self.path);
        Ok(())
    }

    pub async fn stop_discovery(&self) -> Result<()> {
        self.bus
            .call(&self.path, ADAPTER_INTERFACE, "StopDiscovery", vec![])
            .await?;
        info!("Discovery stopped on {}", self.path);
        Ok(())
    }

    /// Discover for `duration` (capped at the configured maximum), then
    /// report every known device.
    pub async fn inquiry(&self, duration: Duration) -> Result<BTreeMap<Address, String>> {
        if duration > self.max_inquiry {
            warn!(
                "Inquiry of {:?} requested, limiting to {:?}",
                duration, self.max_inquiry
            );
        }
        let duration = duration.min(self.max_inquiry);

        self.start_discovery().await?;
        tokio::time::sleep(duration).await;
        if let Err(e) = self.stop_discovery().await {
            warn!("Failed to stop discovery after inquiry: {}", e);
        }

        self.registry.refresh().await?;
        let devices = self.registry.all().await?;
        for (address, name) in &devices {
            debug!("Inquiry result: {} {}", address, name);
        }
        Ok(devices)
    }

    pub async fn set_discoverable(&self, enabled: bool) -> Result<()> {
        set_property(
            self.bus.as_ref(),
            &self.path,
            ADAPTER_INTERFACE,
            "Discoverable",
            Value::Bool(enabled),
        )
        .await?;
        info!(
            "Adapter {} is now {}",
            self.path,
            if enabled { "discoverable" } else { "hidden" }
        );
        Ok(())
    }

    pub async fn power_on(&self) -> Result<()> {
        set_property(
            self.bus.as_ref(),
            &self.path,
            ADAPTER_INTERFACE,
            "Powered",
            Value::Bool(true),
        )
        .await?;
        info!("Adapter {} powered on", self.path);
        Ok(())
    }

    /// Remove a device object, forgetting its pairing.
    pub async fn remove_device(&self, device_path: &str) -> Result<()> {
        self.bus
            .call(
                &self.path,
                ADAPTER_INTERFACE,
                "RemoveDevice",
                vec![Value::path(device_path)],
            )
            .await?;
        self.registry.invalidate();
        info!("Removed device {}", device_path);
        Ok(())
    }
}
