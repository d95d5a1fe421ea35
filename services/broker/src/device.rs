//! Fractional and physical FPGA device model.
//!
//! The discovery feed reports every allocatable sub-unit of a card as its own
//! fractional device. Each handle is the card's PCI bus address followed by a
//! `-` and a fixed-width, zero-padded sub-unit index:
//!
//! ```text
//! 0000:03:00.1-0   0000:03:00.1-1   0000:03:00.1-2
//! └────bus─────┘└┬┘
//!              sub-unit
//! ```
//!
//! Aggregation groups handles back into one [`PhysicalDevice`] per bus
//! address and assigns dense indices in bus-address order. The scheduler
//! extender names devices by that index, so both sides must sort the same way.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Errors from device handle parsing and inventory loading.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("malformed device handle '{handle}': {reason}")]
    MalformedHandle {
        handle: String,
        reason: &'static str,
    },

    #[error("failed to read inventory {path}: {source}")]
    InventoryRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse inventory {path}: {source}")]
    InventoryParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Device node paths exposed by a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNodes {
    /// Management physical function. Empty when only the user function is
    /// passed through (e.g. the node is itself a VM).
    #[serde(default)]
    pub mgmt: String,

    /// User physical function.
    pub user: String,
}

/// One allocatable sub-unit as reported by the discovery feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FractionalDevice {
    /// Fractional handle, `<bus-address>-<sub-index>`.
    pub id: String,

    /// Shell (firmware) version loaded on the card.
    pub firmware_version: String,

    /// Last health observation, Unix nanoseconds.
    #[serde(default)]
    pub last_seen: u64,

    pub healthy: bool,

    pub nodes: DeviceNodes,
}

/// A physical card reconstructed from its fractional handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    /// Dense index within one inventory snapshot.
    pub index: usize,
    pub bus_address: String,
    pub firmware_version: String,
    pub last_seen: u64,
    pub healthy: bool,
    pub nodes: DeviceNodes,
    /// Number of fractional handles folded into this device.
    pub fractional_units: u32,
}

/// How fractional handles encode their sub-unit index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleLayout {
    sub_units_per_device: u32,
}

impl HandleLayout {
    pub fn new(sub_units_per_device: u32) -> Self {
        Self {
            sub_units_per_device: sub_units_per_device.max(1),
        }
    }

    pub fn sub_units_per_device(&self) -> u32 {
        self.sub_units_per_device
    }

    /// Digits in the sub-unit suffix.
    pub fn suffix_width(&self) -> usize {
        (self.sub_units_per_device - 1).to_string().len()
    }

    /// Format the handle for a sub-unit of a card.
    pub fn handle(&self, bus_address: &str, sub_index: u32) -> String {
        format!(
            "{bus_address}-{sub_index:0width$}",
            width = self.suffix_width()
        )
    }

    /// Split a handle into its bus address and sub-unit index.
    pub fn split<'a>(&self, handle: &'a str) -> Result<(&'a str, u32), DeviceError> {
        let malformed = |reason: &'static str| DeviceError::MalformedHandle {
            handle: handle.to_string(),
            reason,
        };

        let suffix_len = self.suffix_width() + 1;
        if handle.len() <= suffix_len {
            return Err(malformed("too short for sub-unit suffix"));
        }

        let split_at = handle.len() - suffix_len;
        if !handle.is_char_boundary(split_at) {
            return Err(malformed("sub-unit suffix is not ASCII"));
        }

        let (bus_address, suffix) = handle.split_at(split_at);
        let digits = suffix
            .strip_prefix('-')
            .ok_or_else(|| malformed("missing '-' before sub-unit index"))?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed("sub-unit index is not numeric"));
        }

        let sub_index: u32 = digits
            .parse()
            .map_err(|_| malformed("sub-unit index overflows"))?;
        if sub_index >= self.sub_units_per_device {
            return Err(malformed("sub-unit index exceeds sub-units per device"));
        }

        Ok((bus_address, sub_index))
    }

    /// Bus address of the card a handle belongs to.
    pub fn bus_address<'a>(&self, handle: &'a str) -> Result<&'a str, DeviceError> {
        self.split(handle).map(|(bus_address, _)| bus_address)
    }
}

struct Group<'a> {
    representative: &'a FractionalDevice,
    sub_index: u32,
    units: u32,
}

/// Fold fractional devices into physical devices, indexed by bus address order.
///
/// The member with the lowest sub-unit index supplies firmware, health and
/// node paths. Malformed handles are skipped.
pub fn aggregate(devices: &[FractionalDevice], layout: HandleLayout) -> Vec<PhysicalDevice> {
    let mut groups: BTreeMap<&str, Group<'_>> = BTreeMap::new();

    for device in devices {
        let (bus_address, sub_index) = match layout.split(&device.id) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "Skipping fractional device");
                continue;
            }
        };

        groups
            .entry(bus_address)
            .and_modify(|group| {
                group.units += 1;
                if sub_index < group.sub_index {
                    group.representative = device;
                    group.sub_index = sub_index;
                }
            })
            .or_insert(Group {
                representative: device,
                sub_index,
                units: 1,
            });
    }

    groups
        .into_iter()
        .enumerate()
        .map(|(index, (bus_address, group))| PhysicalDevice {
            index,
            bus_address: bus_address.to_string(),
            firmware_version: group.representative.firmware_version.clone(),
            last_seen: group.representative.last_seen,
            healthy: group.representative.healthy,
            nodes: group.representative.nodes.clone(),
            fractional_units: group.units,
        })
        .collect()
}
