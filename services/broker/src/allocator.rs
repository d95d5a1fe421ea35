//! Allocation handshake.
//!
//! For each kubelet allocation request the allocator:
//! 1. finds the assumed pod whose FPGA limit matches the request,
//! 2. resolves the device index the scheduler extender recorded on it,
//! 3. builds device and mount bindings for every container request,
//! 4. marks the pod allocated in the state store, retrying once on conflict.
//!
//! Bindings are only returned once the pod has been marked. Steps 1 to 4 run
//! under a single lock so concurrent requests in this process never pick the
//! same pod; the store's version check covers writers in other processes.

use std::sync::Arc;

use fpgashare_deviceplugin::{AllocateRequest, AllocateResponse, ContainerAllocateResponse};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::annotations;
use crate::device::PhysicalDevice;
use crate::inventory::DeviceInventory;
use crate::matcher::CandidateMatcher;
use crate::store::{StoreError, WorkloadStore};
use crate::workload::{Workload, WorkloadKey};

/// Errors returned to the caller of [`Allocator::allocate`].
#[derive(Debug, Error)]
pub enum AllocateError {
    #[error("failed to list candidate pods: {0}")]
    CandidateListUnavailable(#[source] StoreError),

    #[error("invalid allocation request: request for {requested_units} FPGA units can't be satisfied")]
    AllocationUnsatisfiable { requested_units: u64 },

    #[error("pod {workload} has no usable device index annotation")]
    MissingDeviceBinding { workload: WorkloadKey },

    #[error("pod {workload} names device index {index}, which is not present on this node")]
    DeviceResolutionFailed { workload: WorkloadKey, index: i64 },

    #[error("failed to mark pod {workload} as allocated: {source}")]
    AllocationCommitFailed {
        workload: WorkloadKey,
        #[source]
        source: StoreError,
    },
}

/// Binds pre-assigned physical devices to the pods that requested them.
pub struct Allocator {
    matcher: CandidateMatcher,
    inventory: Arc<DeviceInventory>,
    store: Arc<dyn WorkloadStore>,

    /// Serialises candidate selection and commit.
    decisions: Mutex<()>,
}

impl Allocator {
    /// Create an allocator for pods on `node_name` requesting `resource_name`.
    pub fn new(
        store: Arc<dyn WorkloadStore>,
        inventory: Arc<DeviceInventory>,
        node_name: impl Into<String>,
        resource_name: impl Into<String>,
    ) -> Self {
        Self {
            matcher: CandidateMatcher::new(Arc::clone(&store), node_name, resource_name),
            inventory,
            store,
            decisions: Mutex::new(()),
        }
    }

    /// Handle one kubelet allocation request.
    pub async fn allocate(
        &self,
        request: &AllocateRequest,
    ) -> Result<AllocateResponse, AllocateError> {
        let requested_units = request.total_units();
        info!(
            requested_units,
            containers = request.container_requests.len(),
            "Allocation requested"
        );

        let _decision = self.decisions.lock().await;

        let workload = self
            .matcher
            .find_allocation_target(requested_units)
            .await
            .map_err(AllocateError::CandidateListUnavailable)?
            .ok_or(AllocateError::AllocationUnsatisfiable { requested_units })?;
        let key = workload.key();

        let index = annotations::resource_index(&workload);
        if index == annotations::NO_RESOURCE_INDEX {
            return Err(AllocateError::MissingDeviceBinding { workload: key });
        }

        let device = match usize::try_from(index) {
            Ok(position) => self.inventory.resolve(position).await,
            Err(_) => None,
        }
        .ok_or_else(|| AllocateError::DeviceResolutionFailed {
            workload: key.clone(),
            index,
        })?;
        info!(
            workload = %key,
            index,
            bus_address = %device.bus_address,
            healthy = device.healthy,
            "Resolved physical device"
        );

        let response = build_response(request, &device);

        self.commit(&workload).await?;

        info!(
            workload = %key,
            bus_address = %device.bus_address,
            "Allocated successfully"
        );
        Ok(response)
    }

    /// Mark the pod allocated, retrying once against a fresh copy on conflict.
    async fn commit(&self, workload: &Workload) -> Result<(), AllocateError> {
        let key = workload.key();
        let commit_failed = |source: StoreError| AllocateError::AllocationCommitFailed {
            workload: key.clone(),
            source,
        };

        let err = match self
            .store
            .update_workload(&annotations::with_allocated(workload))
            .await
        {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if !err.is_conflict() {
            warn!(workload = %key, error = %err, "Failed to mark pod allocated");
            return Err(commit_failed(err));
        }

        warn!(workload = %key, "Pod modified concurrently, retrying with latest version");
        let fresh = self
            .store
            .get_workload(&key.namespace, &key.name)
            .await
            .map_err(&commit_failed)?;

        if !annotations::is_assumed(&fresh, self.matcher.resource_name()) {
            warn!(workload = %key, "Pod is no longer assumed, refusing to rewrite it");
            return Err(commit_failed(StoreError::Conflict(key.clone())));
        }

        self.store
            .update_workload(&annotations::with_allocated(&fresh))
            .await
            .map_err(|err| {
                warn!(workload = %key, error = %err, "Retry failed to mark pod allocated");
                commit_failed(err)
            })
    }
}

/// One binding set per container request, all pointing at the same card.
fn build_response(request: &AllocateRequest, device: &PhysicalDevice) -> AllocateResponse {
    let container_responses = request
        .container_requests
        .iter()
        .map(|container| {
            debug!(devices_ids = ?container.devices_ids, "Container request");
            let mut response = ContainerAllocateResponse::default();
            // The management node is absent when only the user function is
            // passed through to this host. Shell flashing through it is
            // refused by the driver inside containers.
            if !device.nodes.mgmt.is_empty() {
                response.bind_device_node(&device.nodes.mgmt);
            }
            response.bind_device_node(&device.nodes.user);
            response
        })
        .collect();

    AllocateResponse {
        container_responses,
    }
}
