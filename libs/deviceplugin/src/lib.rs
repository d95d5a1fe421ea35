//! Kubelet device-plugin `Allocate` messages.
//!
//! These mirror the `v1beta1` device-plugin protocol field numbering so the
//! broker's responses can be handed straight to the gRPC layer that hosts it.
//! Only the allocation exchange is modelled here; registration and device
//! listing live with the service scaffolding.

use std::collections::HashMap;

/// Allocation request for a pod, one entry per container.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AllocateRequest {
    #[prost(message, repeated, tag = "1")]
    pub container_requests: Vec<ContainerAllocateRequest>,
}

impl AllocateRequest {
    /// Total fractional units requested across all containers.
    pub fn total_units(&self) -> u64 {
        self.container_requests
            .iter()
            .map(|c| c.devices_ids.len() as u64)
            .sum()
    }
}

/// Device IDs kubelet picked for one container.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerAllocateRequest {
    #[prost(string, repeated, tag = "1")]
    pub devices_ids: Vec<String>,
}

/// Allocation response, one entry per container request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AllocateResponse {
    #[prost(message, repeated, tag = "1")]
    pub container_responses: Vec<ContainerAllocateResponse>,
}

/// Runtime settings applied to a single container.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerAllocateResponse {
    #[prost(map = "string, string", tag = "1")]
    pub envs: HashMap<String, String>,
    #[prost(message, repeated, tag = "2")]
    pub mounts: Vec<Mount>,
    #[prost(message, repeated, tag = "3")]
    pub devices: Vec<DeviceSpec>,
    #[prost(map = "string, string", tag = "4")]
    pub annotations: HashMap<String, String>,
}

impl ContainerAllocateResponse {
    /// Expose a host device node at the same path inside the container,
    /// both in the device cgroup and as a read-write bind mount.
    pub fn bind_device_node(&mut self, path: &str) {
        self.devices.push(DeviceSpec {
            container_path: path.to_string(),
            host_path: path.to_string(),
            permissions: DEVICE_PERMISSIONS_RWM.to_string(),
        });
        self.mounts.push(Mount {
            container_path: path.to_string(),
            host_path: path.to_string(),
            read_only: false,
        });
    }
}

/// A host path bind-mounted into the container.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Mount {
    #[prost(string, tag = "1")]
    pub container_path: String,
    #[prost(string, tag = "2")]
    pub host_path: String,
    #[prost(bool, tag = "3")]
    pub read_only: bool,
}

/// A host device node added to the container's device cgroup.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceSpec {
    #[prost(string, tag = "1")]
    pub container_path: String,
    #[prost(string, tag = "2")]
    pub host_path: String,
    /// cgroup permissions: any of `r`, `w`, `m`.
    #[prost(string, tag = "3")]
    pub permissions: String,
}

/// Read, write and mknod.
pub const DEVICE_PERMISSIONS_RWM: &str = "rwm";
