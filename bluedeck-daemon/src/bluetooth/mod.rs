/*!
 * Bluetooth Device Management
 * Device registry, pairing and connection control via BlueZ D-Bus
 */

pub mod adapter;
pub mod connection;
pub mod registry;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::{BusClient, PropertyMap};
use crate::config::BluetoothConfig;
use crate::error::{BluetoothError, Result};

pub use adapter::AdapterController;
pub use connection::{ConnectionController, PollPolicy};
pub use registry::DeviceRegistry;

pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";

/// A2DP sink service class (the remote device plays audio we send).
pub const A2DP_SINK_UUID: &str = "0000110b-0000-1000-8000-00805f9b34fb";

/// A2DP source service class (the remote device sends audio to us).
pub const A2DP_SOURCE_UUID: &str = "0000110a-0000-1000-8000-00805f9b34fb";

/// Bluetooth device address, normalized to uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Wrap an address without validating it.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into().to_uppercase())
    }

    /// Parse a colon separated MAC address (`AA:BB:CC:DD:EE:FF`).
    pub fn parse(addr: &str) -> Result<Self> {
        let addr = addr.trim();
        let octets: Vec<&str> = addr.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(BluetoothError::InvalidAddress(addr.to_string()));
        }
        Ok(Self::new(addr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The form BlueZ embeds in object paths: `AA_BB_CC_DD_EE_FF`.
    pub fn path_fragment(&self) -> String {
        self.0.replace(':', "_")
    }

    /// The form PulseAudio embeds in sink names: `aa_bb_cc_dd_ee_ff`.
    pub fn sink_fragment(&self) -> String {
        self.path_fragment().to_lowercase()
    }
}

impl FromStr for Address {
    type Err = BluetoothError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = BluetoothError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote device as last reported by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub address: Address,
    pub path: String,
    pub name: String,
    pub alias: Option<String>,
    pub uuids: BTreeSet<String>,
    pub paired: bool,
    pub connected: bool,
    pub trusted: bool,
}

impl Device {
    /// Build from a `Device1` property map; `None` when it carries no address.
    pub fn from_properties(path: &str, props: &PropertyMap) -> Option<Self> {
        let address = props.get("Address").and_then(|v| v.as_str())?;
        let flag = |name: &str| props.get(name).and_then(|v| v.as_bool()).unwrap_or(false);

        Some(Self {
            address: Address::new(address),
            path: path.to_string(),
            name: props
                .get("Name")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown")
                .to_string(),
            alias: props
                .get("Alias")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            uuids: props
                .get("UUIDs")
                .map(|v| v.as_str_list().into_iter().collect())
                .unwrap_or_default(),
            paired: flag("Paired"),
            connected: flag("Connected"),
            trusted: flag("Trusted"),
        })
    }

    /// Case-insensitive substring match against the advertised service classes.
    pub fn has_service(&self, fragment: &str) -> bool {
        let fragment = fragment.to_lowercase();
        self.uuids
            .iter()
            .any(|uuid| uuid.to_lowercase().contains(&fragment))
    }

    pub fn state(&self) -> DeviceState {
        if self.connected {
            DeviceState::Connected
        } else if self.paired {
            DeviceState::Paired
        } else {
            DeviceState::Discovered
        }
    }
}

/// Lifecycle position of a device, derived from its registry flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Unknown,
    Discovered,
    Paired,
    Connected,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Unknown => "unknown",
            DeviceState::Discovered => "discovered",
            DeviceState::Paired => "paired",
            DeviceState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Outcome of an operation confirmed by polling a property.
///
/// `Unconfirmed` means the confirmation window closed, not that the request
/// failed; the stack may still complete it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Unconfirmed,
}

impl Confirmation {
    pub fn is_confirmed(self) -> bool {
        self == Confirmation::Confirmed
    }
}

impl From<bool> for Confirmation {
    fn from(confirmed: bool) -> Self {
        if confirmed {
            Confirmation::Confirmed
        } else {
            Confirmation::Unconfirmed
        }
    }
}

pub struct BluetoothManager {
    pub registry: Arc<DeviceRegistry>,
    pub adapter: Arc<AdapterController>,
    pub connection: ConnectionController,
}

impl BluetoothManager {
    pub fn new(bus: Arc<dyn BusClient>, config: &BluetoothConfig) -> Self {
        let registry = Arc::new(DeviceRegistry::new(bus.clone()));
        let adapter = Arc::new(
            AdapterController::new(bus.clone(), &config.adapter, registry.clone())
                .with_max_inquiry(Duration::from_secs(config.max_inquiry_secs)),
        );
        let pairing = PollPolicy {
            interval: Duration::from_millis(config.pair_poll_interval_ms),
            attempts: config.pair_poll_attempts,
        };
        let connection = ConnectionController::new(
            bus,
            registry.clone(),
            adapter.clone(),
            pairing,
            config.le_profile_uuid.clone(),
        );

        Self {
            registry,
            adapter,
            connection,
        }
    }
}
