//! Annotation protocol shared with the scheduler extender.
//!
//! The extender assumes a device for a pending pod by writing the physical
//! device index, an assume timestamp and `PFGA_IS_ASSIGNED=false`. The
//! broker flips the flag to `true` once the device has been handed out.
//! The key names are fixed by the extender and must not change.

use tracing::{debug, warn};

use crate::workload::{Workload, WorkloadPhase};

/// Index of the physical device the extender assumed for the pod.
pub const RESOURCE_INDEX: &str = "PFGA_BIND_IDX";

/// `"false"` while assumed, `"true"` once the broker allocated the device.
pub const ASSIGNED_FLAG: &str = "PFGA_IS_ASSIGNED";

/// Unix nanoseconds of the assumption; rewritten on allocation.
pub const ASSUME_TIMESTAMP: &str = "FPGA_BIND_TIMESTAMP";

/// Returned by [`resource_index`] when no usable index is recorded.
pub const NO_RESOURCE_INDEX: i64 = -1;

/// Whether the pod has a device assumed for it that is not yet allocated.
pub fn is_assumed(workload: &Workload, resource_name: &str) -> bool {
    let key = workload.key();
    let annotations = &workload.metadata.annotations;

    if workload.fpga_units(resource_name) == 0 {
        debug!(workload = %key, "No FPGA limit, not an assumed pod");
        return false;
    }

    if !annotations.contains_key(ASSUME_TIMESTAMP) {
        debug!(workload = %key, "No assume timestamp, not an assumed pod");
        return false;
    }

    match annotations.get(ASSIGNED_FLAG).map(String::as_str) {
        Some("false") => {
            debug!(workload = %key, "Found assumed pod");
            true
        }
        Some(assigned) => {
            debug!(workload = %key, assigned, "Pod already assigned");
            false
        }
        None => {
            warn!(workload = %key, "No assigned flag on pod, not treating it as assumed");
            false
        }
    }
}

/// Physical device index recorded by the extender, or [`NO_RESOURCE_INDEX`].
pub fn resource_index(workload: &Workload) -> i64 {
    let Some(value) = workload.metadata.annotations.get(RESOURCE_INDEX) else {
        warn!(workload = %workload.key(), "No device index annotation");
        return NO_RESOURCE_INDEX;
    };

    match value.trim().parse::<i64>() {
        Ok(index) if index >= 0 => index,
        Ok(index) => {
            warn!(workload = %workload.key(), index, "Negative device index");
            NO_RESOURCE_INDEX
        }
        Err(e) => {
            warn!(
                workload = %workload.key(),
                value = %value,
                error = %e,
                "Failed to parse device index"
            );
            NO_RESOURCE_INDEX
        }
    }
}

/// Assume timestamp in Unix nanoseconds, 0 when absent or unparsable.
pub fn assume_timestamp(workload: &Workload) -> u64 {
    let Some(value) = workload.metadata.annotations.get(ASSUME_TIMESTAMP) else {
        return 0;
    };

    value.trim().parse().unwrap_or_else(|e| {
        warn!(
            workload = %workload.key(),
            value = %value,
            error = %e,
            "Failed to parse assume timestamp"
        );
        0
    })
}

/// Copy of the pod marked as allocated.
///
/// The assume timestamp doubles as the allocation time once the flag is set.
pub fn with_allocated(workload: &Workload) -> Workload {
    let mut allocated = workload.clone();
    let annotations = &mut allocated.metadata.annotations;
    annotations.insert(ASSIGNED_FLAG.to_string(), "true".to_string());
    annotations.insert(ASSUME_TIMESTAMP.to_string(), now_nanos().to_string());
    allocated
}

/// Whether the pod is being deleted or has already finished.
pub fn is_terminating(workload: &Workload) -> bool {
    workload.metadata.deletion_timestamp.is_some()
        || matches!(
            workload.status.phase,
            Some(WorkloadPhase::Succeeded | WorkloadPhase::Failed)
        )
}

fn now_nanos() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .and_then(|nanos| u64::try_from(nanos).ok())
        .unwrap_or_default()
}
