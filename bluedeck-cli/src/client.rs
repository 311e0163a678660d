/*!
 * bluedeck Daemon Client
 * JSON IPC communication with bluedeckd
 */

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Pair { address: String },
    Connect { address: String },
    LeConnect { address: String },
    Disconnect { address: String },
    Unpair { address: String },
    Trust { address: String, trusted: bool },
    DeviceState { address: String },
    ListDevices { filter: String },
    StartDiscovery,
    StopDiscovery,
    Inquiry { seconds: u64 },
    SetDiscoverable { enabled: bool },
    PowerOn,
    ListA2dp { role: String },
    StartStream { address: String, file: PathBuf },
    StopStream,
    MediaControl { address: String, command: String },
    SendFile { address: String, file: PathBuf },
    StartReceiver { directory: Option<PathBuf> },
    StopReceiver,
    Status,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub address: String,
    pub sink: String,
    pub file: PathBuf,
    pub pid: Option<u32>,
    pub started_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverInfo {
    pub directory: PathBuf,
    pub pid: Option<u32>,
    pub started_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Confirmation { confirmed: bool },
    NotFound { address: String },
    Done {
        ok: bool,
        #[serde(default)]
        message: Option<String>,
    },
    Devices { devices: BTreeMap<String, String> },
    State { address: String, state: String },
    Transfer { status: String, message: String },
    Status {
        stream: Option<StreamInfo>,
        receiver: Option<ReceiverInfo>,
    },
    Error { message: String },
}

impl Response {
    /// Whether the command achieved what was asked.
    pub fn succeeded(&self) -> bool {
        match self {
            Response::Confirmation { confirmed } => *confirmed,
            Response::Done { ok, .. } => *ok,
            Response::Transfer { status, .. } => status == "complete",
            Response::NotFound { .. } | Response::Error { .. } => false,
            Response::Devices { .. } | Response::State { .. } | Response::Status { .. } => true,
        }
    }

    /// Human readable rendering for the terminal.
    pub fn render(&self) -> String {
        match self {
            Response::Confirmation { confirmed: true } => "Confirmed".to_string(),
            Response::Confirmation { confirmed: false } => {
                "Requested, but not confirmed yet".to_string()
            }
            Response::NotFound { address } => format!("Device {} not found", address),
            Response::Done { ok, message } => match (ok, message) {
                (_, Some(message)) => message.clone(),
                (true, None) => "OK".to_string(),
                (false, None) => "Nothing to do".to_string(),
            },
            Response::Devices { devices } if devices.is_empty() => "No devices".to_string(),
            Response::Devices { devices } => devices
                .iter()
                .map(|(address, name)| format!("{}  {}", address, name))
                .collect::<Vec<_>>()
                .join("\n"),
            Response::State { address, state } => format!("{}  {}", address, state),
            Response::Transfer { status, message } => format!("[{}] {}", status, message),
            Response::Status { stream, receiver } => {
                let stream = match stream {
                    Some(s) => format!("streaming {} to {} ({})", s.file.display(), s.address, s.sink),
                    None => "idle".to_string(),
                };
                let receiver = match receiver {
                    Some(r) => format!("receiving into {}", r.directory.display()),
                    None => "stopped".to_string(),
                };
                format!("stream:   {}\nreceiver: {}", stream, receiver)
            }
            Response::Error { message } => format!("Error: {}", message),
        }
    }
}

pub struct BluedeckClient {
    socket_path: String,
}

impl BluedeckClient {
    pub fn new(socket_path: String) -> Self {
        Self { socket_path }
    }

    pub async fn send_request(&self, request: &Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (reader, mut writer) = stream.into_split();

        let request_json = serde_json::to_string(request)?;
        writer.write_all(request_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        let mut line = String::new();
        if BufReader::new(reader).read_line(&mut line).await? == 0 {
            bail!("Daemon closed the connection without replying");
        }
        Ok(serde_json::from_str(line.trim())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn parses_daemon_responses() {
        let response: Response = serde_json::from_str(
            r#"{"type":"Devices","devices":{"AA:BB:CC:DD:EE:FF":"Speaker"}}"#,
        )
        .unwrap();
        assert_eq!(response.render(), "AA:BB:CC:DD:EE:FF  Speaker");
        assert!(response.succeeded());

        let response: Response = serde_json::from_str(r#"{"type":"Done","ok":false}"#).unwrap();
        assert!(!response.succeeded());

        let response: Response = serde_json::from_str(
            r#"{"type":"Status","stream":{"address":"AA:BB:CC:DD:EE:FF","sink":"bluez_sink.x","file":"/a.wav","pid":42,"started_at":"2024-01-01T00:00:00Z"},"receiver":null}"#,
        )
        .unwrap();
        assert!(response.render().contains("streaming /a.wav to AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn transfer_success_requires_complete() {
        let done = Response::Transfer {
            status: "complete".into(),
            message: "Transfer finished with status: complete".into(),
        };
        let unknown = Response::Transfer {
            status: "unknown".into(),
            message: "Transfer finished with status: unknown".into(),
        };
        assert!(done.succeeded());
        assert!(!unknown.succeeded());
        assert_eq!(unknown.render(), "[unknown] Transfer finished with status: unknown");
    }

    #[tokio::test]
    async fn request_round_trip_over_socket() {
        let socket = std::env::temp_dir().join(format!("bluedeck-cli-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&socket);
        let listener = UnixListener::bind(&socket).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut line = String::new();
            BufReader::new(reader).read_line(&mut line).await.unwrap();
            let request: Request = serde_json::from_str(line.trim()).unwrap();
            assert_eq!(request, Request::Pair { address: "AA:BB:CC:DD:EE:FF".into() });
            writer
                .write_all(b"{\"type\":\"Confirmation\",\"confirmed\":true}\n")
                .await
                .unwrap();
        });

        let client = BluedeckClient::new(socket.display().to_string());
        let response = client
            .send_request(&Request::Pair { address: "AA:BB:CC:DD:EE:FF".into() })
            .await
            .unwrap();
        server.await.unwrap();
        let _ = std::fs::remove_file(&socket);

        assert_eq!(response, Response::Confirmation { confirmed: true });
    }
}
