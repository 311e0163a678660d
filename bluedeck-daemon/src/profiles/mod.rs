/*!
 * Profile Sessions
 * A2DP streaming and OPP object push, each serialized behind its own lock
 */

pub mod a2dp;
pub mod opp;
pub mod sink;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bluetooth::DeviceRegistry;
use crate::bus::BusClient;
use crate::config::{AudioConfig, OppConfig};
use crate::process::ProcessLauncher;

pub use a2dp::{A2dpSession, MediaCommand, ServiceRole, StreamInfo};
pub use opp::{OppSession, ReceiverInfo, TransferReport, TransferStatus};

pub struct ProfileManager {
    pub a2dp: Mutex<A2dpSession>,
    pub opp: Mutex<OppSession>,
}

impl ProfileManager {
    pub fn new(
        bluez: Arc<dyn BusClient>,
        obex: Option<Arc<dyn BusClient>>,
        registry: Arc<DeviceRegistry>,
        launcher: Arc<dyn ProcessLauncher>,
        audio: AudioConfig,
        opp: OppConfig,
    ) -> Self {
        Self {
            a2dp: Mutex::new(A2dpSession::new(bluez, registry, launcher.clone(), audio)),
            opp: Mutex::new(OppSession::new(obex, launcher, opp)),
        }
    }

    /// Stop the stream and receiver and drop any obexd session.
    pub async fn shutdown(&self) {
        match self.a2dp.lock().await.stop().await {
            Ok(true) => info!("Stopped active stream"),
            Ok(false) => {}
            Err(e) => warn!("Failed to stop stream: {}", e),
        }

        let mut opp = self.opp.lock().await;
        match opp.stop_receiver().await {
            Ok(true) => info!("Stopped OPP receiver"),
            Ok(false) => {}
            Err(e) => warn!("Failed to stop OPP receiver: {}", e),
        }
        opp.close().await;
    }
}
