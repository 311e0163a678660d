/*!
 * D-Bus Transport
 * BusClient over dbus-tokio connections to bluetoothd and obexd
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbus::arg::{self, ArgType, IterAppend, PropMap, RefArg, Variant};
use dbus::nonblock::stdintf::org_freedesktop_dbus::ObjectManager;
use dbus::nonblock::{MethodReply, Proxy, SyncConnection};
use dbus::Path;
use dbus_tokio::connection::{self, IOResource};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BusClient, ManagedObjects, Value, PROPERTIES_INTERFACE};
use crate::error::{BluetoothError, Result};

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const OBEX_SERVICE: &str = "org.bluez.obex";

/// One connection to a bus, addressed at a single service name.
pub struct DbusBus {
    service: &'static str,
    conn: Arc<SyncConnection>,
    io_task: JoinHandle<()>,
    timeout: Duration,
}

impl DbusBus {
    /// Connect to the system bus (bluetoothd).
    pub fn system(service: &'static str, timeout: Duration) -> Result<Self> {
        let (resource, conn) = connection::new_system_sync().map_err(bus_error)?;
        Ok(Self::start(service, resource, conn, timeout))
    }

    /// Connect to the session bus (obexd).
    pub fn session(service: &'static str, timeout: Duration) -> Result<Self> {
        let (resource, conn) = connection::new_session_sync().map_err(bus_error)?;
        Ok(Self::start(service, resource, conn, timeout))
    }

    fn start(
        service: &'static str,
        resource: IOResource<SyncConnection>,
        conn: Arc<SyncConnection>,
        timeout: Duration,
    ) -> Self {
        let io_task = tokio::spawn(async move {
            let err = resource.await;
            error!("Lost D-Bus connection for {}: {}", service, err);
        });

        debug!("Connected to D-Bus for {}", service);
        Self {
            service,
            conn,
            io_task,
            timeout,
        }
    }

    /// Raw connection, for exporting local objects.
    pub fn connection(&self) -> Arc<SyncConnection> {
        self.conn.clone()
    }

    /// Stop the I/O task. Pending calls fail after this.
    pub fn close(&self) {
        self.io_task.abort();
        debug!("Closed D-Bus connection for {}", self.service);
    }

    fn proxy(&self, path: &str) -> Result<Proxy<'_, Arc<SyncConnection>>> {
        let path = Path::new(path.to_string())
            .map_err(|e| BluetoothError::Bus(format!("Invalid object path: {}", e)))?;
        Ok(Proxy::new(self.service, path, self.timeout, self.conn.clone()))
    }
}

#[async_trait]
impl BusClient for DbusBus {
    async fn get_all_objects(&self) -> Result<ManagedObjects> {
        let objects = self
            .proxy("/")?
            .get_managed_objects()
            .await
            .map_err(rejected)?;

        Ok(objects
            .into_iter()
            .map(|(path, interfaces)| {
                let interfaces = interfaces
                    .into_iter()
                    .map(|(name, props)| (name, props_to_values(&props)))
                    .collect();
                (path.to_string(), interfaces)
            })
            .collect())
    }

    async fn call(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        debug!("{}: {}.{} {:?}", path, interface, method, args);
        let reply: MethodReply<Reply> = {
            let args = Args(args.iter().map(to_refarg).collect::<Result<Vec<_>>>()?);
            self.proxy(path)?.method_call(interface, method, args)
        };
        let Reply(values) = reply.await.map_err(rejected)?;
        debug!("{}: {}.{} -> {:?}", path, interface, method, values);
        Ok(values)
    }

    async fn get_property(&self, path: &str, interface: &str, name: &str) -> Result<Value> {
        let mut values = self
            .call(
                path,
                PROPERTIES_INTERFACE,
                "Get",
                vec![Value::str(interface), Value::str(name)],
            )
            .await?;
        if values.is_empty() {
            return Err(BluetoothError::UnexpectedReply(format!(
                "{}.{} on {}",
                interface, name, path
            )));
        }
        Ok(values.swap_remove(0))
    }
}

/// Connections held for the daemon's lifetime.
pub struct BusContext {
    pub bluez: Arc<DbusBus>,
    pub obex: Option<Arc<DbusBus>>,
}

impl BusContext {
    /// Connect to bluetoothd, and to obexd when `with_obex` is set.
    ///
    /// obexd lives on the session bus, which a system service may not have;
    /// that is logged and leaves `obex` empty rather than failing startup.
    pub fn connect(timeout: Duration, with_obex: bool) -> Result<Self> {
        let bluez = Arc::new(DbusBus::system(BLUEZ_SERVICE, timeout)?);
        info!("Connected to {} on the system bus", BLUEZ_SERVICE);

        let obex = if with_obex {
            match DbusBus::session(OBEX_SERVICE, timeout) {
                Ok(bus) => {
                    info!("Connected to {} on the session bus", OBEX_SERVICE);
                    Some(Arc::new(bus))
                }
                Err(e) => {
                    warn!("Session bus unavailable, OPP sending disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self { bluez, obex })
    }

    pub fn close(&self) {
        self.bluez.close();
        if let Some(obex) = &self.obex {
            obex.close();
        }
    }
}

struct Args(Vec<Box<dyn RefArg>>);

impl arg::AppendAll for Args {
    fn append(&self, ia: &mut IterAppend) {
        for value in &self.0 {
            RefArg::append(&**value, ia);
        }
    }
}

struct Reply(Vec<Value>);

impl arg::ReadAll for Reply {
    fn read(i: &mut arg::Iter) -> std::result::Result<Self, arg::TypeMismatchError> {
        let mut values = Vec::new();
        while let Some(item) = i.get_refarg() {
            values.push(from_refarg(&*item));
            i.next();
        }
        Ok(Reply(values))
    }
}

fn props_to_values(props: &PropMap) -> HashMap<String, Value> {
    props
        .iter()
        .map(|(name, value)| (name.clone(), from_refarg(&*value.0)))
        .collect()
}

/// Convert a received argument. Variants are unwrapped.
fn from_refarg(arg: &dyn RefArg) -> Value {
    match arg.arg_type() {
        ArgType::Boolean => Value::Bool(
            arg.as_u64()
                .or_else(|| arg.as_i64().map(|v| v as u64))
                .unwrap_or(0)
                != 0,
        ),
        ArgType::String | ArgType::Signature => {
            Value::Str(arg.as_str().unwrap_or_default().to_string())
        }
        ArgType::ObjectPath => Value::ObjectPath(arg.as_str().unwrap_or_default().to_string()),
        ArgType::Byte | ArgType::UInt16 | ArgType::UInt32 | ArgType::UInt64 => {
            Value::U64(arg.as_u64().unwrap_or_default())
        }
        ArgType::Int16 | ArgType::Int32 | ArgType::Int64 => {
            Value::I64(arg.as_i64().unwrap_or_default())
        }
        ArgType::Variant => arg
            .as_iter()
            .and_then(|mut inner| inner.next().map(from_refarg))
            .unwrap_or_else(|| Value::Unsupported("v".to_string())),
        ArgType::Array => {
            let signature = arg.signature();
            let items: Vec<&dyn RefArg> = arg.as_iter().map(|it| it.collect()).unwrap_or_default();
            if signature.starts_with("a{") {
                Value::Dict(
                    items
                        .chunks(2)
                        .filter(|pair| pair.len() == 2)
                        .map(|pair| {
                            let key = match from_refarg(pair[0]) {
                                Value::Str(s) | Value::ObjectPath(s) => s,
                                other => format!("{:?}", other),
                            };
                            (key, from_refarg(pair[1]))
                        })
                        .collect(),
                )
            } else {
                Value::List(items.into_iter().map(from_refarg).collect())
            }
        }
        ArgType::Struct => Value::List(
            arg.as_iter()
                .map(|it| it.map(from_refarg).collect())
                .unwrap_or_default(),
        ),
        _ => Value::Unsupported(arg.signature().to_string()),
    }
}

fn to_refarg(value: &Value) -> Result<Box<dyn RefArg>> {
    let arg: Box<dyn RefArg> = match value {
        Value::Bool(b) => Box::new(*b),
        Value::U32(v) => Box::new(*v),
        Value::U64(v) => Box::new(*v),
        Value::I64(v) => Box::new(*v),
        Value::Str(s) => Box::new(s.clone()),
        Value::ObjectPath(p) => Box::new(
            Path::new(p.clone())
                .map_err(|e| BluetoothError::Bus(format!("Invalid object path: {}", e)))?,
        ),
        Value::List(items) => {
            let strings = items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        BluetoothError::Bus(format!("Only string lists can be sent: {:?}", item))
                    })
                })
                .collect::<Result<Vec<String>>>()?;
            Box::new(strings)
        }
        Value::Dict(entries) => {
            let mut map: PropMap = HashMap::new();
            for (key, entry) in entries {
                map.insert(key.clone(), Variant(to_refarg(entry)?));
            }
            Box::new(map)
        }
        Value::Variant(inner) => Box::new(Variant(to_refarg(inner)?)),
        Value::Unsupported(signature) => {
            return Err(BluetoothError::Bus(format!(
                "Cannot send value of type {}",
                signature
            )))
        }
    };
    Ok(arg)
}

fn rejected(err: dbus::Error) -> BluetoothError {
    BluetoothError::Rejected {
        name: err
            .name()
            .unwrap_or("org.freedesktop.DBus.Error.Failed")
            .to_string(),
        message: err.message().unwrap_or_default().to_string(),
    }
}

fn bus_error(err: dbus::Error) -> BluetoothError {
    BluetoothError::Bus(err.message().unwrap_or("connection failed").to_string())
}
