/*!
 * Object Registry Capability
 * Query/command access to the BlueZ and obexd object trees
 */

pub mod connection;
#[cfg(test)]
pub mod fake;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use crate::error::Result;

pub use self::connection::BusContext;

pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Owned representation of a bus value, independent of the IPC transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    U32(u32),
    U64(u64),
    I64(i64),
    Str(String),
    ObjectPath(String),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Variant(Box<Value>),
    /// A value this layer has no use for; carries its signature.
    Unsupported(String),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn path(p: impl Into<String>) -> Self {
        Value::ObjectPath(p.into())
    }

    pub fn variant(inner: Value) -> Self {
        Value::Variant(Box::new(inner))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Variant(inner) => inner.as_bool(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) => Some(s),
            Value::Variant(inner) => inner.as_str(),
            _ => None,
        }
    }

    /// String elements of a list value; non-string elements are skipped.
    pub fn as_str_list(&self) -> Vec<String> {
        match self {
            Value::List(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Value::Variant(inner) => inner.as_str_list(),
            _ => Vec::new(),
        }
    }
}

/// Property name to value.
pub type PropertyMap = HashMap<String, Value>;

/// Interface name to its properties.
pub type InterfaceMap = HashMap<String, PropertyMap>;

/// Object path to the interfaces it exposes. Ordered so scans are deterministic.
pub type ManagedObjects = BTreeMap<String, InterfaceMap>;

/// Access to a remote object registry.
///
/// Implemented over D-Bus by `connection::DbusBus`; tests use an in-memory registry.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Every managed object with its interfaces and properties.
    async fn get_all_objects(&self) -> Result<ManagedObjects>;

    /// Invoke `interface.method` on the object at `path`.
    async fn call(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>>;

    /// Read a single property.
    async fn get_property(&self, path: &str, interface: &str, name: &str) -> Result<Value>;
}

/// Write a single property through `org.freedesktop.DBus.Properties.Set`.
pub async fn set_property(
    bus: &dyn BusClient,
    path: &str,
    interface: &str,
    name: &str,
    value: Value,
) -> Result<()> {
    bus.call(
        path,
        PROPERTIES_INTERFACE,
        "Set",
        vec![Value::str(interface), Value::str(name), Value::variant(value)],
    )
    .await?;
    Ok(())
}
