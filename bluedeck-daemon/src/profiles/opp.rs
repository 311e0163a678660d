/*!
 * OPP Session
 * Object push to remote devices through obexd, and a local push receiver
 */

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bluetooth::{Address, PollPolicy};
use crate::bus::{BusClient, Value};
use crate::config::OppConfig;
use crate::error::{BluetoothError, Result};
use crate::process::{ChildProcess, ProcessLauncher};

pub const OBEX_ROOT: &str = "/org/bluez/obex";
pub const OBEX_CLIENT_INTERFACE: &str = "org.bluez.obex.Client1";
pub const OBJECT_PUSH_INTERFACE: &str = "org.bluez.obex.ObjectPush1";
pub const TRANSFER_INTERFACE: &str = "org.bluez.obex.Transfer1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Queued,
    Active,
    Suspended,
    Complete,
    Error,
    Unknown,
}

impl TransferStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "queued" => TransferStatus::Queued,
            "active" => TransferStatus::Active,
            "suspended" => TransferStatus::Suspended,
            "complete" => TransferStatus::Complete,
            "error" => TransferStatus::Error,
            _ => TransferStatus::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Complete | TransferStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Queued => "queued",
            TransferStatus::Active => "active",
            TransferStatus::Suspended => "suspended",
            TransferStatus::Complete => "complete",
            TransferStatus::Error => "error",
            TransferStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of a push. Failures are reported here rather than as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReport {
    pub status: TransferStatus,
    pub message: String,
}

impl TransferReport {
    fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!("{}", message);
        Self {
            status: TransferStatus::Error,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverInfo {
    pub directory: PathBuf,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

struct Receiver {
    info: ReceiverInfo,
    child: Box<dyn ChildProcess>,
}

pub struct OppSession {
    bus: Option<Arc<dyn BusClient>>,
    launcher: Arc<dyn ProcessLauncher>,
    poll: PollPolicy,
    settle: Duration,
    config: OppConfig,
    session: Option<String>,
    receiver: Option<Receiver>,
}

impl OppSession {
    /// `bus` is the obexd connection; without it sending reports an error
    /// while the receiver still works.
    pub fn new(
        bus: Option<Arc<dyn BusClient>>,
        launcher: Arc<dyn ProcessLauncher>,
        config: OppConfig,
    ) -> Self {
        Self {
            bus,
            launcher,
            poll: PollPolicy {
                interval: Duration::from_millis(config.poll_interval_ms),
                attempts: config.poll_attempts,
            },
            settle: Duration::from_millis(config.session_settle_ms),
            config,
            session: None,
            receiver: None,
        }
    }

    pub fn default_receive_dir(&self) -> &Path {
        &self.config.receive_dir
    }

    /// Push `file` to `address` and wait for the transfer to settle.
    pub async fn send(&mut self, address: &Address, file: &Path) -> TransferReport {
        if tokio::fs::metadata(file).await.is_err() {
            return TransferReport::error(format!("File does not exist: {}", file.display()));
        }
        let Some(bus) = self.bus.clone() else {
            return TransferReport::error("OBEX file send failed: obexd is not reachable");
        };

        if let Some(stale) = self.session.take() {
            match remove_session(bus.as_ref(), &stale).await {
                Ok(()) => info!("Removed previous session: {}", stale),
                Err(e) => warn!("Previous session cleanup failed: {}", e),
            }
            tokio::time::sleep(self.settle).await;
        }

        let session = match create_session(bus.as_ref(), address).await {
            Ok(session) => session,
            Err(e) => return TransferReport::error(format!("OBEX file send failed: {}", e)),
        };
        self.session = Some(session.clone());
        info!("Created OBEX session: {}", session);

        let report = self.push(bus.as_ref(), &session, file).await;

        match remove_session(bus.as_ref(), &session).await {
            Ok(()) => debug!("Session removed after transfer"),
            Err(e) => warn!("Error removing session {}: {}", session, e),
        }
        self.session = None;
        report
    }

    async fn push(&self, bus: &dyn BusClient, session: &str, file: &Path) -> TransferReport {
        let transfer = match bus
            .call(
                session,
                OBJECT_PUSH_INTERFACE,
                "SendFile",
                vec![Value::str(file.display().to_string())],
            )
            .await
            .and_then(|reply| first_path(reply, "SendFile"))
        {
            Ok(transfer) => transfer,
            Err(e) => return TransferReport::error(format!("OBEX file send failed: {}", e)),
        };
        info!("Transfer started: {}", transfer);

        let status = self.watch_transfer(bus, &transfer).await;
        TransferReport {
            status,
            message: format!("Transfer finished with status: {}", status),
        }
    }

    async fn watch_transfer(&self, bus: &dyn BusClient, transfer: &str) -> TransferStatus {
        for attempt in 1..=self.poll.attempts {
            let status = match bus.get_property(transfer, TRANSFER_INTERFACE, "Status").await {
                Ok(value) => value
                    .as_str()
                    .map(TransferStatus::parse)
                    .unwrap_or(TransferStatus::Unknown),
                Err(e) => {
                    debug!("Reading status of {} failed: {}", transfer, e);
                    TransferStatus::Unknown
                }
            };
            debug!("Transfer status: {}", status);
            if status.is_terminal() {
                return status;
            }
            if attempt < self.poll.attempts {
                tokio::time::sleep(self.poll.interval).await;
            }
        }
        TransferStatus::Unknown
    }

    /// Start accepting pushes into `dir`, replacing any running receiver.
    pub async fn start_receiver(&mut self, dir: &Path) -> Result<ReceiverInfo> {
        tokio::fs::create_dir_all(dir).await?;
        if self.stop_receiver().await? {
            info!("Previous OPP server stopped");
        }

        let child = self
            .launcher
            .spawn(&self.config.receiver_command(dir))
            .await?;
        let info = ReceiverInfo {
            directory: dir.to_path_buf(),
            pid: child.id(),
            started_at: Utc::now(),
        };
        info!("OPP server started. Receiving files to {}", dir.display());
        self.receiver = Some(Receiver {
            info: info.clone(),
            child,
        });
        Ok(info)
    }

    /// Stop the receiver; `false` when none was running.
    pub async fn stop_receiver(&mut self) -> Result<bool> {
        let Some(mut receiver) = self.receiver.take() else {
            return Ok(false);
        };
        if !receiver.child.is_running() {
            debug!("OPP server had already exited");
            return Ok(false);
        }
        receiver.child.terminate().await?;
        info!("OPP server stopped");
        Ok(true)
    }

    pub fn receiver_status(&mut self) -> Option<ReceiverInfo> {
        let running = self.receiver.as_mut()?.child.is_running();
        if !running {
            self.receiver = None;
            return None;
        }
        self.receiver.as_ref().map(|r| r.info.clone())
    }

    /// Drop any held obexd session; used at shutdown.
    pub async fn close(&mut self) {
        if let (Some(bus), Some(session)) = (self.bus.clone(), self.session.take()) {
            if let Err(e) = remove_session(bus.as_ref(), &session).await {
                warn!("Error removing session {}: {}", session, e);
            }
        }
    }
}

async fn create_session(bus: &dyn BusClient, address: &Address) -> Result<String> {
    let options = BTreeMap::from([("Target".to_string(), Value::str("opp"))]);
    let reply = bus
        .call(
            OBEX_ROOT,
            OBEX_CLIENT_INTERFACE,
            "CreateSession",
            vec![Value::str(address.as_str()), Value::Dict(options)],
        )
        .await?;
    first_path(reply, "CreateSession")
}

async fn remove_session(bus: &dyn BusClient, session: &str) -> Result<()> {
    bus.call(
        OBEX_ROOT,
        OBEX_CLIENT_INTERFACE,
        "RemoveSession",
        vec![Value::path(session)],
    )
    .await?;
    Ok(())
}

fn first_path(reply: Vec<Value>, method: &str) -> Result<String> {
    reply
        .first()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BluetoothError::UnexpectedReply(method.to_string()))
}
