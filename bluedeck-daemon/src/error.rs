//! Error types for device and session operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::bluetooth::Address;

/// Errors raised by the registry, controller and session components.
#[derive(Error, Debug)]
pub enum BluetoothError {
    /// The address is not a well-formed MAC address.
    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    /// No object in the registry carries this address.
    #[error("Bluetooth device not found: {0}")]
    DeviceNotFound(Address),

    /// The device exists but a session precondition (path, sink) is unmet.
    #[error("Device {address} is not ready: {reason}")]
    DeviceNotReady { address: Address, reason: String },

    /// Another pair/connect attempt for the same device is still running.
    #[error("Operation already in progress for {0}")]
    OperationInProgress(Address),

    /// The remote daemon refused the request.
    #[error("{name}: {message}")]
    Rejected { name: String, message: String },

    /// The bus connection itself failed.
    #[error("Bus error: {0}")]
    Bus(String),

    /// Input file does not exist.
    #[error("File does not exist: {}", .0.display())]
    FileNotFound(PathBuf),

    /// A helper process could not be launched.
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A helper process ran but exited unsuccessfully.
    #[error("{program} exited with {status}")]
    ProcessFailed { program: String, status: String },

    /// Converting the input to a playable format failed.
    #[error("Transcoding failed: {0}")]
    Transcode(String),

    /// A reply from the bus did not have the expected shape.
    #[error("Unexpected reply from {0}")]
    UnexpectedReply(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BluetoothError {
    /// D-Bus error name when the remote side rejected the call.
    pub fn rejection_name(&self) -> Option<&str> {
        match self {
            Self::Rejected { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Convenience Result type for Bluetooth operations.
pub type Result<T> = std::result::Result<T, BluetoothError>;
