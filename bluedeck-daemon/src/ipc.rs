/*!
 * IPC Server for bluedeck Daemon
 * JSON protocol over Unix socket
 */

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

use crate::bluetooth::{Address, BluetoothManager, Confirmation, DeviceState};
use crate::error::BluetoothError;
use crate::profiles::{
    MediaCommand, ProfileManager, ReceiverInfo, ServiceRole, StreamInfo, TransferStatus,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFilter {
    #[default]
    All,
    Paired,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Pair { address: Address },
    Connect { address: Address },
    LeConnect { address: Address },
    Disconnect { address: Address },
    Unpair { address: Address },
    Trust { address: Address, trusted: bool },
    DeviceState { address: Address },
    ListDevices {
        #[serde(default)]
        filter: DeviceFilter,
    },
    StartDiscovery,
    StopDiscovery,
    Inquiry { seconds: u64 },
    SetDiscoverable { enabled: bool },
    PowerOn,
    ListA2dp { role: ServiceRole },
    StartStream { address: Address, file: PathBuf },
    StopStream,
    MediaControl { address: Address, command: MediaCommand },
    SendFile { address: Address, file: PathBuf },
    StartReceiver {
        #[serde(default)]
        directory: Option<PathBuf>,
    },
    StopReceiver,
    Status,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Confirmation { confirmed: bool },
    NotFound { address: Address },
    Done {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Devices { devices: BTreeMap<Address, String> },
    State { address: Address, state: DeviceState },
    Transfer { status: TransferStatus, message: String },
    Status {
        stream: Option<StreamInfo>,
        receiver: Option<ReceiverInfo>,
    },
    Error { message: String },
}

impl Response {
    fn ok() -> Self {
        Response::Done {
            ok: true,
            message: None,
        }
    }

    fn done(ok: bool, message: impl Into<String>) -> Self {
        Response::Done {
            ok,
            message: Some(message.into()),
        }
    }
}

impl From<BluetoothError> for Response {
    fn from(err: BluetoothError) -> Self {
        match err {
            BluetoothError::DeviceNotFound(address) => Response::NotFound { address },
            err => Response::Error {
                message: err.to_string(),
            },
        }
    }
}

fn confirmation(result: crate::error::Result<Confirmation>) -> Response {
    match result {
        Ok(outcome) => Response::Confirmation {
            confirmed: outcome.is_confirmed(),
        },
        Err(e) => e.into(),
    }
}

fn completed(result: crate::error::Result<()>) -> Response {
    match result {
        Ok(()) => Response::ok(),
        Err(e) => e.into(),
    }
}

fn devices(result: crate::error::Result<BTreeMap<Address, String>>) -> Response {
    match result {
        Ok(devices) => Response::Devices { devices },
        Err(e) => e.into(),
    }
}

/// Dispatches requests to the managers. Cheap to clone, one per client.
#[derive(Clone)]
pub struct RequestHandler {
    bluetooth: Arc<BluetoothManager>,
    profiles: Arc<ProfileManager>,
    shutdown: Arc<Notify>,
}

impl RequestHandler {
    pub fn new(
        bluetooth: Arc<BluetoothManager>,
        profiles: Arc<ProfileManager>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            bluetooth,
            profiles,
            shutdown,
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let bt = &self.bluetooth;
        match request {
            Request::Pair { address } => confirmation(bt.connection.pair(&address).await),
            Request::Connect { address } => confirmation(bt.connection.connect(&address).await),
            Request::LeConnect { address } => {
                confirmation(bt.connection.le_connect(&address).await)
            }
            Request::Disconnect { address } => {
                confirmation(bt.connection.disconnect(&address).await)
            }
            Request::Unpair { address } => confirmation(bt.connection.unpair(&address).await),
            Request::Trust { address, trusted } => {
                completed(bt.connection.trust(&address, trusted).await)
            }
            Request::DeviceState { address } => {
                let state = bt.connection.state(&address).await;
                Response::State { address, state }
            }
            Request::ListDevices { filter } => devices(match filter {
                DeviceFilter::All => match bt.registry.refresh().await {
                    Ok(_) => bt.registry.all().await,
                    Err(e) => Err(e),
                },
                DeviceFilter::Paired => bt.registry.paired().await,
                DeviceFilter::Connected => bt.registry.connected().await,
            }),
            Request::StartDiscovery => completed(bt.adapter.start_discovery().await),
            Request::StopDiscovery => completed(bt.adapter.stop_discovery().await),
            Request::Inquiry { seconds } => {
                devices(bt.adapter.inquiry(Duration::from_secs(seconds)).await)
            }
            Request::SetDiscoverable { enabled } => {
                completed(bt.adapter.set_discoverable(enabled).await)
            }
            Request::PowerOn => completed(bt.adapter.power_on().await),
            Request::ListA2dp { role } => {
                devices(self.profiles.a2dp.lock().await.list_sinks(role).await)
            }
            Request::StartStream { address, file } => {
                match self.profiles.a2dp.lock().await.start(&address, &file).await {
                    Ok(info) => Response::done(
                        true,
                        format!("Streaming {} to {}", info.file.display(), info.sink),
                    ),
                    Err(e) => Response::done(false, e.to_string()),
                }
            }
            Request::StopStream => match self.profiles.a2dp.lock().await.stop().await {
                Ok(stopped) => Response::Done {
                    ok: stopped,
                    message: None,
                },
                Err(e) => e.into(),
            },
            Request::MediaControl { address, command } => {
                match self
                    .profiles
                    .a2dp
                    .lock()
                    .await
                    .media_control(&address, command)
                    .await
                {
                    Ok(sent) => Response::Done {
                        ok: sent,
                        message: None,
                    },
                    Err(e) => e.into(),
                }
            }
            Request::SendFile { address, file } => {
                let report = self.profiles.opp.lock().await.send(&address, &file).await;
                Response::Transfer {
                    status: report.status,
                    message: report.message,
                }
            }
            Request::StartReceiver { directory } => {
                let mut opp = self.profiles.opp.lock().await;
                let directory = directory.unwrap_or_else(|| opp.default_receive_dir().to_path_buf());
                match opp.start_receiver(&directory).await {
                    Ok(info) => Response::done(
                        true,
                        format!("Receiving files to {}", info.directory.display()),
                    ),
                    Err(e) => Response::done(false, e.to_string()),
                }
            }
            Request::StopReceiver => match self.profiles.opp.lock().await.stop_receiver().await {
                Ok(stopped) => Response::Done {
                    ok: stopped,
                    message: None,
                },
                Err(e) => e.into(),
            },
            Request::Status => {
                // Never hold both session locks at once.
                let stream = self.profiles.a2dp.lock().await.status();
                let receiver = self.profiles.opp.lock().await.receiver_status();
                Response::Status { stream, receiver }
            }
            Request::Shutdown => {
                tracing::info!("Shutdown requested over IPC");
                self.shutdown.notify_one();
                Response::ok()
            }
        }
    }
}

pub struct IpcServer {
    listener: UnixListener,
    handler: RequestHandler,
}

impl IpcServer {
    pub fn new(listener: UnixListener, handler: RequestHandler) -> Self {
        Self { listener, handler }
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!("IPC server listening for connections...");

        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    tracing::debug!("New client connected");
                    let handler = self.handler.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handler).await {
                            tracing::error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_client(stream: UnixStream, handler: RequestHandler) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let request = line.trim();
        if request.is_empty() {
            continue;
        }
        tracing::debug!("Received request: {}", request);

        let response = match serde_json::from_str::<Request>(request) {
            Ok(request) => handler.handle(request).await,
            Err(e) => Response::Error {
                message: format!("Invalid request: {}", e),
            },
        };

        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
    }

    tracing::debug!("Client disconnected");
    Ok(())
}

/// One request/response exchange with a running daemon.
pub async fn send_request(socket_path: &str, request: &Request) -> Result<Response> {
    let stream = UnixStream::connect(socket_path).await?;
    let (reader, mut writer) = stream.into_split();

    let mut payload = serde_json::to_string(request)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;

    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    Ok(serde_json::from_str(line.trim())?)
}
