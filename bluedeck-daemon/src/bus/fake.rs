//! In-memory object registry for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{BusClient, ManagedObjects, PropertyMap, Value, PROPERTIES_INTERFACE};
use crate::bluetooth::{ADAPTER_INTERFACE, DEVICE_INTERFACE};
use crate::error::{BluetoothError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub path: String,
    pub interface: String,
    pub method: String,
    pub args: Vec<Value>,
}

#[derive(Default)]
struct State {
    objects: ManagedObjects,
    calls: Vec<RecordedCall>,
    reads: Vec<(String, String)>,
    scripted: HashMap<(String, String), VecDeque<Value>>,
    failures: HashMap<String, (String, String)>,
    replies: HashMap<String, VecDeque<Vec<Value>>>,
    registry_down: bool,
}

#[derive(Default)]
pub struct FakeBus {
    state: Mutex<State>,
}

pub fn device_path(address: &str) -> String {
    format!("/org/bluez/hci0/dev_{}", address.replace(':', "_"))
}

impl FakeBus {
    pub fn new() -> Self {
        let bus = Self::default();
        bus.insert_interface("/org/bluez/hci0", ADAPTER_INTERFACE, PropertyMap::new());
        bus
    }

    /// Add a device under hci0; returns its object path.
    pub fn add_device(
        &self,
        address: &str,
        name: &str,
        uuids: &[&str],
        paired: bool,
        connected: bool,
    ) -> String {
        let path = device_path(address);
        let mut props = PropertyMap::new();
        props.insert("Address".into(), Value::str(address));
        props.insert("Name".into(), Value::str(name));
        props.insert(
            "UUIDs".into(),
            Value::List(uuids.iter().map(|u| Value::str(*u)).collect()),
        );
        props.insert("Paired".into(), Value::Bool(paired));
        props.insert("Connected".into(), Value::Bool(connected));
        props.insert("Trusted".into(), Value::Bool(false));
        self.insert_interface(&path, DEVICE_INTERFACE, props);
        path
    }

    pub fn insert_interface(&self, path: &str, interface: &str, props: PropertyMap) {
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .entry(path.to_string())
            .or_default()
            .insert(interface.to_string(), props);
    }

    /// Values returned by successive reads of `name` on `path` before
    /// falling back to the object's stored property.
    pub fn script_property(&self, path: &str, name: &str, values: Vec<Value>) {
        let mut state = self.state.lock().unwrap();
        state
            .scripted
            .insert((path.to_string(), name.to_string()), values.into());
    }

    pub fn fail_method(&self, method: &str, error_name: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .failures
            .insert(method.to_string(), (error_name.to_string(), message.to_string()));
    }

    /// Queue a reply for the next call of `method`.
    pub fn reply(&self, method: &str, values: Vec<Value>) {
        let mut state = self.state.lock().unwrap();
        state
            .replies
            .entry(method.to_string())
            .or_default()
            .push_back(values);
    }

    /// Make `get_all_objects` fail.
    pub fn take_registry_down(&self) {
        self.state.lock().unwrap().registry_down = true;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method)
            .collect()
    }

    /// Calls other than property reads.
    pub fn mutations(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| !(c.interface == PROPERTIES_INTERFACE && c.method == "Get"))
            .count()
    }

    pub fn reads_of(&self, name: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.reads.iter().filter(|(_, n)| n == name).count()
    }
}

#[async_trait]
impl BusClient for FakeBus {
    async fn get_all_objects(&self) -> Result<ManagedObjects> {
        let state = self.state.lock().unwrap();
        if state.registry_down {
            return Err(BluetoothError::Bus("registry unavailable".into()));
        }
        Ok(state.objects.clone())
    }

    async fn call(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall {
            path: path.to_string(),
            interface: interface.to_string(),
            method: method.to_string(),
            args: args.clone(),
        });

        if let Some((name, message)) = state.failures.get(method) {
            return Err(BluetoothError::Rejected {
                name: name.clone(),
                message: message.clone(),
            });
        }

        match method {
            "RemoveDevice" | "RemoveSession" => {
                if let Some(target) = args.first().and_then(Value::as_str) {
                    state.objects.remove(target);
                }
            }
            "Set" if interface == PROPERTIES_INTERFACE => {
                if let [iface, name, value] = args.as_slice() {
                    let (iface, name) = (
                        iface.as_str().unwrap_or_default().to_string(),
                        name.as_str().unwrap_or_default().to_string(),
                    );
                    let value = match value {
                        Value::Variant(inner) => (**inner).clone(),
                        other => other.clone(),
                    };
                    if let Some(props) = state
                        .objects
                        .get_mut(path)
                        .and_then(|interfaces| interfaces.get_mut(&iface))
                    {
                        props.insert(name, value);
                    }
                }
            }
            _ => {}
        }

        Ok(state
            .replies
            .get_mut(method)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default())
    }

    async fn get_property(&self, path: &str, interface: &str, name: &str) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        state.reads.push((path.to_string(), name.to_string()));

        let key = (path.to_string(), name.to_string());
        if let Some(value) = state.scripted.get_mut(&key).and_then(VecDeque::pop_front) {
            return Ok(value);
        }

        state
            .objects
            .get(path)
            .and_then(|interfaces| interfaces.get(interface))
            .and_then(|props| props.get(name))
            .cloned()
            .ok_or_else(|| BluetoothError::Rejected {
                name: "org.freedesktop.DBus.Error.UnknownObject".into(),
                message: format!("{} has no {}.{}", path, interface, name),
            })
    }
}
