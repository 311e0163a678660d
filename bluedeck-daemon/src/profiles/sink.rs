//! Audio-server sink lookup for a Bluetooth device.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bluetooth::Address;
use crate::process::{CommandSpec, ProcessLauncher};

pub struct SinkResolver {
    launcher: Arc<dyn ProcessLauncher>,
    query: CommandSpec,
}

impl SinkResolver {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, query: CommandSpec) -> Self {
        Self { launcher, query }
    }

    /// Sink name for `address`, queried fresh on every call.
    pub async fn resolve(&self, address: &Address) -> Option<String> {
        match self.launcher.output(&self.query).await {
            Ok(listing) => {
                let sink = find_sink(&listing, address);
                debug!("Sink for {}: {:?}", address, sink);
                sink
            }
            Err(e) => {
                warn!("Error getting sink for {}: {}", address, e);
                None
            }
        }
    }
}

/// Second column of the first listing line mentioning the address.
pub fn find_sink(listing: &str, address: &Address) -> Option<String> {
    let fragment = address.sink_fragment();
    listing
        .lines()
        .find(|line| line.to_lowercase().contains(&fragment))
        .and_then(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
}
