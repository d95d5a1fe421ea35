//! Node device inventory with a lazily built physical device index.
//!
//! The fractional handle set comes from the discovery feed. Physical devices
//! are aggregated on first use and cached until the feed delivers a different
//! handle set, at which point the cache is dropped and the snapshot
//! generation advances. Indices from one generation must not be compared with
//! indices from another.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::device::{aggregate, FractionalDevice, HandleLayout, PhysicalDevice};

struct InventoryState {
    /// Sorted by handle.
    devices: Vec<FractionalDevice>,
    physical: Option<Arc<[PhysicalDevice]>>,
    generation: u64,
}

/// Fractional devices on this node and their physical aggregates.
pub struct DeviceInventory {
    layout: HandleLayout,
    state: RwLock<InventoryState>,
}

impl DeviceInventory {
    /// Create an empty inventory.
    pub fn new(layout: HandleLayout) -> Self {
        Self::with_devices(layout, Vec::new())
    }

    /// Create an inventory seeded with an initial handle set.
    pub fn with_devices(layout: HandleLayout, mut devices: Vec<FractionalDevice>) -> Self {
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            layout,
            state: RwLock::new(InventoryState {
                devices,
                physical: None,
                generation: 0,
            }),
        }
    }

    pub fn layout(&self) -> HandleLayout {
        self.layout
    }

    /// Install a handle set from the discovery feed.
    ///
    /// Returns true when the set differed and the physical index was dropped.
    pub async fn replace_devices(&self, mut devices: Vec<FractionalDevice>) -> bool {
        devices.sort_by(|a, b| a.id.cmp(&b.id));

        let mut state = self.state.write().await;
        if state.devices == devices {
            debug!(
                fractional_devices = devices.len(),
                "Fractional device set unchanged"
            );
            return false;
        }

        state.generation += 1;
        info!(
            previous = state.devices.len(),
            current = devices.len(),
            generation = state.generation,
            "Fractional device set changed, dropping physical device index"
        );
        state.devices = devices;
        state.physical = None;
        true
    }

    /// Snapshot generation; bumped on every change of the handle set.
    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    pub async fn fractional_count(&self) -> usize {
        self.state.read().await.devices.len()
    }

    /// Physical devices of the current snapshot, building them if needed.
    pub async fn physical_devices(&self) -> Arc<[PhysicalDevice]> {
        {
            let state = self.state.read().await;
            if let Some(physical) = &state.physical {
                return Arc::clone(physical);
            }
        }

        let mut state = self.state.write().await;
        // Another request may have built it while we waited for the write lock.
        if let Some(physical) = &state.physical {
            return Arc::clone(physical);
        }

        let physical: Arc<[PhysicalDevice]> = aggregate(&state.devices, self.layout).into();
        info!(
            generation = state.generation,
            fractional_devices = state.devices.len(),
            physical_devices = physical.len(),
            "Built physical device index"
        );
        for device in physical.iter() {
            debug!(
                index = device.index,
                bus_address = %device.bus_address,
                firmware_version = %device.firmware_version,
                healthy = device.healthy,
                user_node = %device.nodes.user,
                "Physical device"
            );
        }

        state.physical = Some(Arc::clone(&physical));
        physical
    }

    /// Look up a physical device by its index in the current snapshot.
    pub async fn resolve(&self, index: usize) -> Option<PhysicalDevice> {
        self.physical_devices().await.get(index).cloned()
    }
}
