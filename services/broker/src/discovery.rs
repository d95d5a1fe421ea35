//! File-backed discovery feed.
//!
//! The hardware probe writes the node's fractional devices as a JSON array:
//!
//! ```json
//! [
//!   {
//!     "id": "0000:03:00.1-0",
//!     "firmware_version": "xilinx_u200_xdma_201830_1",
//!     "last_seen": 1542252769000000000,
//!     "healthy": true,
//!     "nodes": { "mgmt": "/dev/xclmgmt768", "user": "/dev/dri/renderD128" }
//!   }
//! ]
//! ```
//!
//! The refresh loop re-reads the file and hands the set to the inventory,
//! which drops its physical device index when the set changed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::device::{DeviceError, FractionalDevice};
use crate::inventory::DeviceInventory;

/// Inventory document on disk.
#[derive(Debug, Clone)]
pub struct InventoryFile {
    path: PathBuf,
}

impl InventoryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the fractional device list.
    pub async fn load(&self) -> Result<Vec<FractionalDevice>, DeviceError> {
        let path = self.path.display().to_string();
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| DeviceError::InventoryRead {
                path: path.clone(),
                source,
            })?;

        let devices: Vec<FractionalDevice> = serde_json::from_slice(&bytes)
            .map_err(|source| DeviceError::InventoryParse { path, source })?;
        debug!(
            path = %self.path.display(),
            fractional_devices = devices.len(),
            "Loaded inventory"
        );
        Ok(devices)
    }

    /// Load once and install into the inventory. Returns whether it changed.
    pub async fn sync(&self, inventory: &DeviceInventory) -> Result<bool, DeviceError> {
        let devices = self.load().await?;
        Ok(inventory.replace_devices(devices).await)
    }
}

/// Reload the inventory file periodically until shutdown.
pub async fn run_inventory_refresh(
    file: InventoryFile,
    inventory: Arc<DeviceInventory>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        path = %file.path().display(),
        interval_secs = interval.as_secs(),
        "Starting inventory refresh loop"
    );

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                match file.sync(&inventory).await {
                    Ok(changed) => {
                        consecutive_failures = 0;
                        if changed {
                            let generation = inventory.generation().await;
                            info!(generation, "Inventory updated from discovery feed");
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(error = %e, consecutive_failures, "Inventory refresh failed");
                        } else {
                            error!(error = %e, consecutive_failures, "Inventory refresh failed repeatedly");
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Inventory refresh loop shutting down");
                    break;
                }
            }
        }
    }
}
