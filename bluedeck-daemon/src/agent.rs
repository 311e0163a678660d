/*!
 * Pairing Agent
 * Non-interactive org.bluez.Agent1 object for incoming pairing requests
 */

use std::sync::Arc;

use dbus::channel::MatchingReceiver;
use dbus::message::MatchRule;
use dbus::nonblock::SyncConnection;
use dbus::Path;
use dbus_crossroads::{Crossroads, IfaceBuilder, MethodErr};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{BusClient, Value};
use crate::config::AgentConfig;
use crate::error::Result;

pub const AGENT_PATH: &str = "/org/bluez/agent/bluedeck";
pub const AGENT_INTERFACE: &str = "org.bluez.Agent1";
pub const AGENT_MANAGER_INTERFACE: &str = "org.bluez.AgentManager1";

const REJECTED: &str = "org.bluez.Error.Rejected";

/// A refused agent request, sent back to bluetoothd as `org.bluez.Error.Rejected`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct Rejection(pub String);

impl From<Rejection> for MethodErr {
    fn from(rejection: Rejection) -> Self {
        MethodErr::from((REJECTED, rejection.0))
    }
}

/// Answers to agent requests, decided without user interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPolicy {
    pub auto_accept: bool,
    pub pin_code: Option<String>,
}

impl AgentPolicy {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            auto_accept: config.auto_accept,
            pin_code: config.pin_code.clone(),
        }
    }

    /// Numeric comparison. Accepting replies with nothing; the passkey is
    /// never sent back.
    pub fn confirm(&self, device: &str) -> std::result::Result<(), Rejection> {
        self.accept(device, "Passkey confirmation rejected")
    }

    pub fn authorize(&self, device: &str) -> std::result::Result<(), Rejection> {
        self.accept(device, "Pairing rejected")
    }

    pub fn authorize_service(&self, device: &str, uuid: &str) -> std::result::Result<(), Rejection> {
        debug!("Service {} requested by {}", uuid, device);
        self.accept(device, "Connection rejected")
    }

    pub fn pin_code(&self, device: &str) -> std::result::Result<String, Rejection> {
        match &self.pin_code {
            Some(pin) => {
                info!("Supplying configured PIN code to {}", device);
                Ok(pin.clone())
            }
            None => Err(Rejection("No PIN code configured".to_string())),
        }
    }

    /// Passkeys come from a numeric configured PIN (at most six digits).
    pub fn passkey(&self, device: &str) -> std::result::Result<u32, Rejection> {
        let passkey = self
            .pin_code
            .as_deref()
            .filter(|pin| pin.len() <= 6)
            .and_then(|pin| pin.parse::<u32>().ok())
            .ok_or_else(|| Rejection("No passkey configured".to_string()))?;
        info!("Supplying configured passkey to {}", device);
        Ok(passkey)
    }

    fn accept(&self, device: &str, refusal: &str) -> std::result::Result<(), Rejection> {
        if self.auto_accept {
            info!("Accepted request from {}", device);
            Ok(())
        } else {
            warn!("{} for {}", refusal, device);
            Err(Rejection(refusal.to_string()))
        }
    }
}

/// Serve the agent object on `conn` at [`AGENT_PATH`].
pub fn export(conn: &Arc<SyncConnection>, policy: AgentPolicy) {
    let mut cr = Crossroads::new();
    let iface = cr.register(AGENT_INTERFACE, |b: &mut IfaceBuilder<AgentPolicy>| {
        b.method("Release", (), (), |_, _, _: ()| {
            info!("Agent released by bluetoothd");
            Ok(())
        });
        b.method(
            "RequestPinCode",
            ("device",),
            ("pincode",),
            |_, policy, (device,): (Path<'static>,)| Ok((policy.pin_code(&device)?,)),
        );
        b.method(
            "DisplayPinCode",
            ("device", "pincode"),
            (),
            |_, _, (device, _pincode): (Path<'static>, String)| {
                info!("PIN code shown on {}", device);
                Ok(())
            },
        );
        b.method(
            "RequestPasskey",
            ("device",),
            ("passkey",),
            |_, policy, (device,): (Path<'static>,)| Ok((policy.passkey(&device)?,)),
        );
        b.method(
            "DisplayPasskey",
            ("device", "passkey", "entered"),
            (),
            |_, _, (device, _passkey, entered): (Path<'static>, u32, u16)| {
                debug!("Passkey entry on {}: {} digits", device, entered);
                Ok(())
            },
        );
        b.method(
            "RequestConfirmation",
            ("device", "passkey"),
            (),
            |_, policy, (device, _passkey): (Path<'static>, u32)| {
                policy.confirm(&device)?;
                Ok(())
            },
        );
        b.method(
            "RequestAuthorization",
            ("device",),
            (),
            |_, policy, (device,): (Path<'static>,)| {
                policy.authorize(&device)?;
                Ok(())
            },
        );
        b.method(
            "AuthorizeService",
            ("device", "uuid"),
            (),
            |_, policy, (device, uuid): (Path<'static>, String)| {
                policy.authorize_service(&device, &uuid)?;
                Ok(())
            },
        );
        b.method("Cancel", (), (), |_, _, _: ()| {
            info!("Pairing request cancelled");
            Ok(())
        });
    });
    cr.insert(AGENT_PATH, &[iface], policy);

    conn.start_receive(
        MatchRule::new_method_call(),
        Box::new(move |msg, conn| {
            if cr.handle_message(msg, conn).is_err() {
                debug!("Agent ignored a malformed method call");
            }
            true
        }),
    );
    debug!("Agent object exported at {}", AGENT_PATH);
}

/// Registration of the exported agent with bluetoothd.
pub struct PairingAgent {
    bus: Arc<dyn BusClient>,
    capability: String,
}

impl PairingAgent {
    pub fn new(bus: Arc<dyn BusClient>, capability: impl Into<String>) -> Self {
        Self {
            bus,
            capability: capability.into(),
        }
    }

    /// Register and become the default agent.
    pub async fn register(&self) -> Result<()> {
        self.bus
            .call(
                "/org/bluez",
                AGENT_MANAGER_INTERFACE,
                "RegisterAgent",
                vec![Value::path(AGENT_PATH), Value::str(self.capability.as_str())],
            )
            .await?;
        self.bus
            .call(
                "/org/bluez",
                AGENT_MANAGER_INTERFACE,
                "RequestDefaultAgent",
                vec![Value::path(AGENT_PATH)],
            )
            .await?;
        info!("Agent registered with capability {}", self.capability);
        Ok(())
    }

    pub async fn unregister(&self) -> Result<()> {
        self.bus
            .call(
                "/org/bluez",
                AGENT_MANAGER_INTERFACE,
                "UnregisterAgent",
                vec![Value::path(AGENT_PATH)],
            )
            .await?;
        info!("Agent unregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeBus;

    const DEVICE: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";

    fn policy(auto_accept: bool, pin_code: Option<&str>) -> AgentPolicy {
        AgentPolicy {
            auto_accept,
            pin_code: pin_code.map(str::to_string),
        }
    }

    #[test]
    fn accepting_policy_confirms_without_reply_value() {
        let policy = policy(true, None);
        assert_eq!(policy.confirm(DEVICE), Ok(()));
        assert_eq!(policy.authorize(DEVICE), Ok(()));
        assert_eq!(
            policy.authorize_service(DEVICE, "0000110b-0000-1000-8000-00805f9b34fb"),
            Ok(())
        );
    }

    #[test]
    fn rejecting_policy_refuses_everything() {
        let policy = policy(false, None);
        assert!(policy.confirm(DEVICE).is_err());
        assert!(policy.authorize(DEVICE).is_err());
        assert!(policy.authorize_service(DEVICE, "1105").is_err());
    }

    #[test]
    fn pin_and_passkey_come_from_config() {
        assert!(policy(true, None).pin_code(DEVICE).is_err());
        assert!(policy(true, None).passkey(DEVICE).is_err());

        let numeric = policy(true, Some("001234"));
        assert_eq!(numeric.pin_code(DEVICE), Ok("001234".to_string()));
        assert_eq!(numeric.passkey(DEVICE), Ok(1234));

        let legacy = policy(true, Some("abcd"));
        assert!(legacy.pin_code(DEVICE).is_ok());
        assert!(legacy.passkey(DEVICE).is_err());
    }

    #[test]
    fn rejection_maps_to_bluez_error() {
        let err = MethodErr::from(Rejection("Pairing rejected".to_string()));
        assert_eq!(&**err.errorname(), REJECTED);
        assert_eq!(err.description(), "Pairing rejected");
    }

    #[tokio::test]
    async fn register_requests_default_agent() {
        let bus = Arc::new(FakeBus::new());
        let agent = PairingAgent::new(bus.clone(), "NoInputNoOutput");

        agent.register().await.unwrap();
        agent.unregister().await.unwrap();

        let methods: Vec<String> = bus.calls().into_iter().map(|c| c.method).collect();
        assert_eq!(methods, ["RegisterAgent", "RequestDefaultAgent", "UnregisterAgent"]);
        assert_eq!(
            bus.calls_to("RegisterAgent")[0].args,
            vec![Value::path(AGENT_PATH), Value::str("NoInputNoOutput")]
        );
    }
}
