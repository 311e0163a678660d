/*!
 * Connection Control
 * Pair, connect, disconnect and unpair with bounded confirmation
 */

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{
    AdapterController, Address, Confirmation, DeviceRegistry, DeviceState, DEVICE_INTERFACE,
};
use crate::bus::{set_property, BusClient, Value};
use crate::error::{BluetoothError, Result};

const ERROR_ALREADY_EXISTS: &str = "org.bluez.Error.AlreadyExists";

/// How long to wait for an asynchronous state change to show up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            attempts: 20,
        }
    }
}

/// Drives state transitions of remote devices.
///
/// Holds no device state of its own; every operation resolves the device
/// path afresh from the registry.
pub struct ConnectionController {
    bus: Arc<dyn BusClient>,
    registry: Arc<DeviceRegistry>,
    adapter: Arc<AdapterController>,
    pairing: PollPolicy,
    le_profile: String,
    in_flight: Mutex<HashSet<Address>>,
}

/// Marks an address busy until dropped.
struct Attempt<'a> {
    in_flight: &'a Mutex<HashSet<Address>>,
    address: Address,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.address);
    }
}

impl ConnectionController {
    pub fn new(
        bus: Arc<dyn BusClient>,
        registry: Arc<DeviceRegistry>,
        adapter: Arc<AdapterController>,
        pairing: PollPolicy,
        le_profile: String,
    ) -> Self {
        Self {
            bus,
            registry,
            adapter,
            pairing,
            le_profile,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    async fn resolve(&self, address: &Address) -> Result<String> {
        self.registry
            .find_path(address)
            .await
            .ok_or_else(|| BluetoothError::DeviceNotFound(address.clone()))
    }

    fn begin(&self, address: &Address) -> Result<Attempt<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(address.clone()) {
            return Err(BluetoothError::OperationInProgress(address.clone()));
        }
        Ok(Attempt {
            in_flight: &self.in_flight,
            address: address.clone(),
        })
    }

    /// Pair and wait for `Paired` to turn true.
    ///
    /// A rejected `Pair` call is returned as an error straight away; only the
    /// confirmation wait can end as `Unconfirmed`.
    pub async fn pair(&self, address: &Address) -> Result<Confirmation> {
        let path = self.resolve(address).await?;
        let _attempt = self.begin(address)?;

        info!("Initiating pairing with {}", path);
        match self.bus.call(&path, DEVICE_INTERFACE, "Pair", vec![]).await {
            Ok(_) => {}
            Err(e) if e.rejection_name() == Some(ERROR_ALREADY_EXISTS) => {
                info!("Device {} is already paired", address);
                return Ok(Confirmation::Confirmed);
            }
            Err(e) => {
                warn!("Pairing with {} failed: {}", address, e);
                return Err(e);
            }
        }

        let confirmation = poll_flag(self.bus.as_ref(), &path, "Paired", self.pairing).await;
        match confirmation {
            Confirmation::Confirmed => {
                info!("Pairing with {} is successful", address);
                if let Err(e) = self.set_trusted(&path, true).await {
                    warn!("Failed to trust {} after pairing: {}", address, e);
                }
            }
            Confirmation::Unconfirmed => {
                info!("Pairing with {} attempted but not confirmed", address)
            }
        }
        Ok(confirmation)
    }

    /// BR/EDR connect with a single confirmation read.
    pub async fn connect(&self, address: &Address) -> Result<Confirmation> {
        let path = self.resolve(address).await?;
        let _attempt = self.begin(address)?;

        info!("Connecting to {}", address);
        self.bus
            .call(&path, DEVICE_INTERFACE, "Connect", vec![])
            .await?;
        Ok(self.confirm_connected(address, &path).await)
    }

    /// Connect the configured profile only (used for LE HID style devices).
    pub async fn le_connect(&self, address: &Address) -> Result<Confirmation> {
        let path = self.resolve(address).await?;
        let _attempt = self.begin(address)?;

        info!("Connecting profile {} on {}", self.le_profile, address);
        self.bus
            .call(
                &path,
                DEVICE_INTERFACE,
                "ConnectProfile",
                vec![Value::str(self.le_profile.as_str())],
            )
            .await?;
        Ok(self.confirm_connected(address, &path).await)
    }

    async fn confirm_connected(&self, address: &Address, path: &str) -> Confirmation {
        let confirmation = Confirmation::from(read_flag(self.bus.as_ref(), path, "Connected").await);
        if confirmation.is_confirmed() {
            info!("Connection to {} is successful", address);
        } else {
            info!("Connection to {} attempted but not confirmed", address);
        }
        confirmation
    }

    pub async fn disconnect(&self, address: &Address) -> Result<Confirmation> {
        let path = self.resolve(address).await?;

        info!("Disconnecting from {}", address);
        self.bus
            .call(&path, DEVICE_INTERFACE, "Disconnect", vec![])
            .await?;
        Ok(Confirmation::from(
            !read_flag(self.bus.as_ref(), &path, "Connected").await,
        ))
    }

    /// Remove the device from the adapter; confirmed once it no longer resolves.
    pub async fn unpair(&self, address: &Address) -> Result<Confirmation> {
        let path = self.resolve(address).await?;

        info!("Unpairing {}", address);
        self.adapter.remove_device(&path).await?;
        Ok(Confirmation::from(
            self.registry.find_path(address).await.is_none(),
        ))
    }

    pub async fn trust(&self, address: &Address, trusted: bool) -> Result<()> {
        let path = self.resolve(address).await?;
        self.set_trusted(&path, trusted).await?;
        self.registry.invalidate();
        debug!("Device {} trusted={}", address, trusted);
        Ok(())
    }

    async fn set_trusted(&self, path: &str, trusted: bool) -> Result<()> {
        set_property(
            self.bus.as_ref(),
            path,
            DEVICE_INTERFACE,
            "Trusted",
            Value::Bool(trusted),
        )
        .await
    }

    pub async fn is_paired(&self, address: &Address) -> bool {
        match self.registry.find_path(address).await {
            Some(path) => read_flag(self.bus.as_ref(), &path, "Paired").await,
            None => false,
        }
    }

    pub async fn is_connected(&self, address: &Address) -> bool {
        match self.registry.find_path(address).await {
            Some(path) => read_flag(self.bus.as_ref(), &path, "Connected").await,
            None => false,
        }
    }

    pub async fn state(&self, address: &Address) -> DeviceState {
        let Some(path) = self.registry.find_path(address).await else {
            return DeviceState::Unknown;
        };
        if read_flag(self.bus.as_ref(), &path, "Connected").await {
            DeviceState::Connected
        } else if read_flag(self.bus.as_ref(), &path, "Paired").await {
            DeviceState::Paired
        } else {
            DeviceState::Discovered
        }
    }
}

/// Boolean `Device1` property; any read failure counts as false.
async fn read_flag(bus: &dyn BusClient, path: &str, property: &str) -> bool {
    match bus.get_property(path, DEVICE_INTERFACE, property).await {
        Ok(value) => value.as_bool().unwrap_or(false),
        Err(e) => {
            debug!("Reading {} on {} failed: {}", property, path, e);
            false
        }
    }
}

async fn poll_flag(
    bus: &dyn BusClient,
    path: &str,
    property: &str,
    policy: PollPolicy,
) -> Confirmation {
    for attempt in 1..=policy.attempts {
        if read_flag(bus, path, property).await {
            debug!("{} on {} confirmed after {} polls", property, path, attempt);
            return Confirmation::Confirmed;
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Confirmation::Unconfirmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeBus;
    use tokio::time::Instant;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    fn controller() -> (Arc<FakeBus>, ConnectionController) {
        let bus = Arc::new(FakeBus::new());
        let registry = Arc::new(DeviceRegistry::new(bus.clone()));
        let adapter = Arc::new(AdapterController::new(bus.clone(), "hci0", registry.clone()));
        let controller = ConnectionController::new(
            bus.clone(),
            registry,
            adapter,
            PollPolicy::default(),
            "0000110e-0000-1000-8000-00805f9b34fb".to_string(),
        );
        (bus, controller)
    }

    fn addr() -> Address {
        Address::new(ADDR)
    }

    #[tokio::test]
    async fn unknown_address_is_not_found_without_mutation() {
        let (bus, controller) = controller();
        bus.add_device("11:22:33:44:55:66", "Other", &[], true, true);
        let missing = addr();

        assert!(matches!(controller.pair(&missing).await, Err(BluetoothError::DeviceNotFound(_))));
        assert!(matches!(controller.connect(&missing).await, Err(BluetoothError::DeviceNotFound(_))));
        assert!(matches!(controller.le_connect(&missing).await, Err(BluetoothError::DeviceNotFound(_))));
        assert!(matches!(controller.disconnect(&missing).await, Err(BluetoothError::DeviceNotFound(_))));
        assert!(matches!(controller.unpair(&missing).await, Err(BluetoothError::DeviceNotFound(_))));
        assert!(matches!(controller.trust(&missing, true).await, Err(BluetoothError::DeviceNotFound(_))));
        assert!(!controller.is_paired(&missing).await);
        assert!(!controller.is_connected(&missing).await);
        assert_eq!(controller.state(&missing).await, DeviceState::Unknown);

        assert_eq!(bus.mutations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pair_confirms_on_the_poll_that_sees_paired() {
        for k in [1usize, 2, 7, 20] {
            let (bus, controller) = controller();
            let path = bus.add_device(ADDR, "Speaker", &[], false, false);
            let mut script = vec![Value::Bool(false); k - 1];
            script.push(Value::Bool(true));
            bus.script_property(&path, "Paired", script);

            let started = Instant::now();
            let outcome = controller.pair(&addr()).await.unwrap();

            assert_eq!(outcome, Confirmation::Confirmed);
            assert_eq!(bus.reads_of("Paired"), k);
            assert_eq!(started.elapsed(), Duration::from_millis(500) * (k as u32 - 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pair_gives_up_after_twenty_polls() {
        let (bus, controller) = controller();
        bus.add_device(ADDR, "Speaker", &[], false, false);

        let outcome = controller.pair(&addr()).await.unwrap();

        assert_eq!(outcome, Confirmation::Unconfirmed);
        assert_eq!(bus.reads_of("Paired"), 20);
        assert!(bus.calls_to("Set").is_empty());
    }

    #[tokio::test]
    async fn pair_rejection_is_reported_immediately() {
        let (bus, controller) = controller();
        bus.add_device(ADDR, "Speaker", &[], false, false);
        bus.fail_method("Pair", "org.bluez.Error.AuthenticationFailed", "Authentication Failed");

        let err = controller.pair(&addr()).await.unwrap_err();

        assert_eq!(err.rejection_name(), Some("org.bluez.Error.AuthenticationFailed"));
        assert_eq!(bus.reads_of("Paired"), 0);
    }

    #[tokio::test]
    async fn pair_already_paired_counts_as_confirmed() {
        let (bus, controller) = controller();
        bus.add_device(ADDR, "Speaker", &[], true, false);
        bus.fail_method("Pair", ERROR_ALREADY_EXISTS, "Already Exists");

        assert_eq!(controller.pair(&addr()).await.unwrap(), Confirmation::Confirmed);
    }

    #[tokio::test]
    async fn confirmed_pairing_marks_device_trusted() {
        let (bus, controller) = controller();
        let path = bus.add_device(ADDR, "Speaker", &[], true, false);

        controller.pair(&addr()).await.unwrap();

        let set = &bus.calls_to("Set")[0];
        assert_eq!(set.path, path);
        assert_eq!(set.args[1], Value::str("Trusted"));
    }

    #[tokio::test]
    async fn connect_checks_once() {
        let (bus, controller) = controller();
        let path = bus.add_device(ADDR, "Speaker", &[], true, false);
        bus.script_property(&path, "Connected", vec![Value::Bool(false), Value::Bool(true)]);

        assert_eq!(controller.connect(&addr()).await.unwrap(), Confirmation::Unconfirmed);
        assert_eq!(bus.reads_of("Connected"), 1);
        assert_eq!(bus.calls_to("Connect").len(), 1);
    }

    #[tokio::test]
    async fn le_connect_uses_profile() {
        let (bus, controller) = controller();
        bus.add_device(ADDR, "Keyboard", &[], true, true);

        assert_eq!(controller.le_connect(&addr()).await.unwrap(), Confirmation::Confirmed);
        assert_eq!(
            bus.calls_to("ConnectProfile")[0].args,
            vec![Value::str("0000110e-0000-1000-8000-00805f9b34fb")]
        );
    }

    #[tokio::test]
    async fn connect_rejection_propagates() {
        let (bus, controller) = controller();
        bus.add_device(ADDR, "Speaker", &[], true, false);
        bus.fail_method("Connect", "org.bluez.Error.Failed", "br-connection-page-timeout");

        assert!(matches!(
            controller.connect(&addr()).await,
            Err(BluetoothError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn overlapping_attempts_are_refused() {
        let (bus, controller) = controller();
        bus.add_device(ADDR, "Speaker", &[], false, false);

        let held = controller.begin(&addr()).unwrap();
        assert!(matches!(
            controller.connect(&addr()).await,
            Err(BluetoothError::OperationInProgress(_))
        ));
        drop(held);

        assert!(controller.connect(&addr()).await.is_ok());
    }

    #[tokio::test]
    async fn unpair_removes_and_confirms() {
        let (bus, controller) = controller();
        let path = bus.add_device(ADDR, "Speaker", &[], true, false);

        assert_eq!(controller.unpair(&addr()).await.unwrap(), Confirmation::Confirmed);
        let remove = &bus.calls_to("RemoveDevice")[0];
        assert_eq!(remove.path, "/org/bluez/hci0");
        assert_eq!(remove.args, vec![Value::path(path)]);
        assert_eq!(controller.state(&addr()).await, DeviceState::Unknown);
    }

    #[tokio::test]
    async fn disconnect_confirms_when_link_drops() {
        let (bus, controller) = controller();
        bus.add_device(ADDR, "Speaker", &[], true, false);

        assert_eq!(controller.disconnect(&addr()).await.unwrap(), Confirmation::Confirmed);
        assert_eq!(bus.calls_to("Disconnect").len(), 1);
    }

    #[tokio::test]
    async fn state_follows_flags() {
        let (bus, controller) = controller();
        let path = bus.add_device(ADDR, "Speaker", &[], false, false);
        assert_eq!(controller.state(&addr()).await, DeviceState::Discovered);

        bus.script_property(&path, "Connected", vec![Value::Bool(false)]);
        bus.script_property(&path, "Paired", vec![Value::Bool(true)]);
        assert_eq!(controller.state(&addr()).await, DeviceState::Paired);
    }
}
