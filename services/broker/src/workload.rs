//! Workload descriptors as served by the Kubernetes API.
//!
//! Only the pod fields the broker reads are modelled. Updates are sent as
//! merge patches, so fields missing here are never overwritten.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Namespace and name of a workload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A pod scheduled to the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub metadata: WorkloadMeta,
    #[serde(default)]
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Opaque version used for optimistic concurrency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

/// Resource quantities keyed by resource name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<WorkloadPhase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Response of a pod list call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkloadList {
    #[serde(default)]
    pub items: Vec<Workload>,
}

impl Workload {
    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Sum of the container limits declared for `resource_name`, saturating.
    pub fn fpga_units(&self, resource_name: &str) -> u64 {
        self.spec
            .containers
            .iter()
            .filter_map(|container| container.resources.limits.get(resource_name))
            .map(|quantity| match parse_units(quantity) {
                Some(units) => units,
                None => {
                    warn!(
                        workload = %self.key(),
                        resource = resource_name,
                        quantity = %quantity,
                        "Ignoring unparsable resource limit"
                    );
                    0
                }
            })
            .fold(0u64, u64::saturating_add)
    }
}

/// Parse an extended-resource quantity as a whole number of units.
///
/// Accepts a plain integer with an optional decimal SI suffix (`k`, `M`, `G`,
/// `T`, `P`, `E`), binary suffix (`Ki` .. `Ei`), decimal exponent (`e3`) or
/// milli suffix (`m`) when the result is integral. Fractions and values that
/// overflow `u64` are rejected.
fn parse_units(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(quantity.len());
    let (digits, suffix) = quantity.split_at(split);
    let value: u64 = digits.parse().ok()?;

    match suffix {
        "" => Some(value),
        "m" => (value % 1000 == 0).then(|| value / 1000),
        _ => value.checked_mul(suffix_multiplier(suffix)?),
    }
}

fn suffix_multiplier(suffix: &str) -> Option<u64> {
    let multiplier = match suffix {
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => {
            let exponent: u32 = suffix.strip_prefix(['e', 'E'])?.parse().ok()?;
            return 10u64.checked_pow(exponent);
        }
    };
    Some(multiplier)
}
