/*!
 * A2DP Session
 * Audio streaming to a connected sink and remote media control
 */

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::sink::SinkResolver;
use crate::bluetooth::{Address, DeviceRegistry};
use crate::bus::BusClient;
use crate::config::AudioConfig;
use crate::error::{BluetoothError, Result};
use crate::process::{ChildProcess, ProcessLauncher, ScratchFile};

pub const MEDIA_CONTROL_INTERFACE: &str = "org.bluez.MediaControl1";

/// Which end of an A2DP link the remote device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    Sink,
    Source,
}

impl ServiceRole {
    pub fn uuid_fragment(self) -> &'static str {
        match self {
            ServiceRole::Sink => "110b",
            ServiceRole::Source => "110a",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCommand {
    Play,
    Pause,
    Next,
    Previous,
    Rewind,
}

impl MediaCommand {
    pub fn method(self) -> &'static str {
        match self {
            MediaCommand::Play => "Play",
            MediaCommand::Pause => "Pause",
            MediaCommand::Next => "Next",
            MediaCommand::Previous => "Previous",
            MediaCommand::Rewind => "Rewind",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub address: Address,
    pub sink: String,
    pub file: PathBuf,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

// Fields drop in order: the player goes before its input file.
struct ActiveStream {
    info: StreamInfo,
    player: Box<dyn ChildProcess>,
    _scratch: Option<ScratchFile>,
}

/// At most one active stream; starting a new one supersedes the old.
pub struct A2dpSession {
    bus: Arc<dyn BusClient>,
    registry: Arc<DeviceRegistry>,
    launcher: Arc<dyn ProcessLauncher>,
    sinks: SinkResolver,
    audio: AudioConfig,
    active: Option<ActiveStream>,
}

impl A2dpSession {
    pub fn new(
        bus: Arc<dyn BusClient>,
        registry: Arc<DeviceRegistry>,
        launcher: Arc<dyn ProcessLauncher>,
        audio: AudioConfig,
    ) -> Self {
        let sinks = SinkResolver::new(launcher.clone(), audio.sink_query_command());
        Self {
            bus,
            registry,
            launcher,
            sinks,
            audio,
            active: None,
        }
    }

    pub async fn start(&mut self, address: &Address, file: &Path) -> Result<StreamInfo> {
        info!("Starting A2DP streaming to {} with file: {}", address, file.display());

        if self.registry.find_path(address).await.is_none() {
            return Err(BluetoothError::DeviceNotReady {
                address: address.clone(),
                reason: "device path not found".to_string(),
            });
        }
        let sink = self
            .sinks
            .resolve(address)
            .await
            .ok_or_else(|| BluetoothError::DeviceNotReady {
                address: address.clone(),
                reason: "no audio sink for device".to_string(),
            })?;
        if tokio::fs::metadata(file).await.is_err() {
            return Err(BluetoothError::FileNotFound(file.to_path_buf()));
        }

        self.stop().await?;

        let scratch = if self.audio.needs_transcode(file) {
            Some(self.transcode(file).await?)
        } else {
            None
        };
        let playable = scratch.as_ref().map(ScratchFile::path).unwrap_or(file);
        let player = self
            .launcher
            .spawn(&self.audio.player_command(playable, &sink))
            .await?;

        let info = StreamInfo {
            address: address.clone(),
            sink,
            file: file.to_path_buf(),
            pid: player.id(),
            started_at: Utc::now(),
        };
        info!("Streaming audio to {} via {}", address, info.sink);
        self.active = Some(ActiveStream {
            info: info.clone(),
            player,
            _scratch: scratch,
        });
        Ok(info)
    }

    async fn transcode(&self, input: &Path) -> Result<ScratchFile> {
        let scratch = ScratchFile::new(&self.audio.scratch_dir, "wav");
        let spec = self.audio.transcode_command(input, scratch.path());
        debug!("Transcoding {} to {}", input.display(), scratch.path().display());

        match self.launcher.output(&spec).await {
            Ok(_) => Ok(scratch),
            Err(e) => Err(BluetoothError::Transcode(format!("{}: {}", input.display(), e))),
        }
    }

    /// Stop the active stream; `false` when nothing was playing.
    pub async fn stop(&mut self) -> Result<bool> {
        let Some(mut stream) = self.active.take() else {
            debug!("No active streaming process");
            return Ok(false);
        };

        stream.player.terminate().await?;
        info!("Streaming to {} stopped", stream.info.address);
        Ok(true)
    }

    /// Send a transport command to the device's media player.
    ///
    /// Best effort: a missing control object or a refused call is logged and
    /// reported as `false`.
    pub async fn media_control(&self, address: &Address, command: MediaCommand) -> Result<bool> {
        let objects = self.bus.get_all_objects().await?;
        let fragment = address.path_fragment();
        let Some(path) = objects
            .iter()
            .find(|(path, interfaces)| {
                interfaces.contains_key(MEDIA_CONTROL_INTERFACE) && path.contains(&fragment)
            })
            .map(|(path, _)| path.clone())
        else {
            warn!("No MediaControl1 interface found for device: {}", address);
            return Ok(false);
        };

        match self
            .bus
            .call(&path, MEDIA_CONTROL_INTERFACE, command.method(), vec![])
            .await
        {
            Ok(_) => {
                info!("Sent {} to {}", command.method(), address);
                Ok(true)
            }
            Err(e) => {
                warn!("Failed to send {} to {}: {}", command.method(), address, e);
                Ok(false)
            }
        }
    }

    /// Connected devices in `role`, read from a fresh registry snapshot.
    pub async fn list_sinks(&self, role: ServiceRole) -> Result<BTreeMap<Address, String>> {
        self.registry.refresh().await?;
        self.registry.filter_by_service(role.uuid_fragment()).await
    }

    /// The active stream, if the player is still running.
    pub fn status(&mut self) -> Option<StreamInfo> {
        let running = self.active.as_mut()?.player.is_running();
        if !running {
            if let Some(stream) = self.active.take() {
                info!("Streaming to {} finished", stream.info.address);
            }
            return None;
        }
        self.active.as_ref().map(|stream| stream.info.clone())
    }
}
