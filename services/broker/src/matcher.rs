//! Candidate discovery for incoming allocation requests.
//!
//! Kubelet's allocation request names fractional handles but not the pod it
//! is for. The pod is recovered by looking for an assumed, not yet allocated
//! pod on this node whose FPGA limit equals the number of handles requested.
//! Among equal demands the earliest assumption wins.

use std::sync::Arc;

use tracing::{debug, info};

use crate::annotations;
use crate::store::{StoreError, WorkloadStore};
use crate::workload::Workload;

/// Finds the pod an allocation request belongs to.
pub struct CandidateMatcher {
    store: Arc<dyn WorkloadStore>,
    node_name: String,
    resource_name: String,
}

impl CandidateMatcher {
    pub fn new(
        store: Arc<dyn WorkloadStore>,
        node_name: impl Into<String>,
        resource_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            node_name: node_name.into(),
            resource_name: resource_name.into(),
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Assumed pods on this node, earliest assumption first.
    ///
    /// Pods with equal timestamps keep the order the store returned them in.
    pub async fn candidates(&self) -> Result<Vec<Workload>, StoreError> {
        let pods = self.store.list_workloads(&self.node_name).await?;
        let listed = pods.len();

        let mut candidates: Vec<(u64, Workload)> = pods
            .into_iter()
            .filter(|pod| !annotations::is_terminating(pod))
            .filter(|pod| annotations::is_assumed(pod, &self.resource_name))
            .map(|pod| (annotations::assume_timestamp(&pod), pod))
            .collect();
        candidates.sort_by_key(|(assumed_at, _)| *assumed_at);

        debug!(
            node = %self.node_name,
            listed,
            candidates = candidates.len(),
            "Collected candidate pods"
        );
        for (assumed_at, pod) in &candidates {
            debug!(
                workload = %pod.key(),
                units = pod.fpga_units(&self.resource_name),
                assumed_at,
                "Candidate pod"
            );
        }

        Ok(candidates.into_iter().map(|(_, pod)| pod).collect())
    }

    /// The pod whose declared FPGA limit equals `requested_units`, if any.
    pub async fn find_allocation_target(
        &self,
        requested_units: u64,
    ) -> Result<Option<Workload>, StoreError> {
        let target = self
            .candidates()
            .await?
            .into_iter()
            .find(|pod| pod.fpga_units(&self.resource_name) == requested_units);

        if let Some(pod) = &target {
            info!(
                workload = %pod.key(),
                requested_units,
                "Found assumed pod"
            );
        }

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::{ASSIGNED_FLAG, ASSUME_TIMESTAMP};
    use crate::store::MemoryStore;
    use crate::workload::{Container, ResourceRequirements, WorkloadPhase};

    const RESOURCE: &str = "xilinx.com/fpga-fraction";
    const NODE: &str = "fpga-node-1";

    fn assumed_pod(name: &str, units: u64, assumed_at: u64) -> Workload {
        let mut resources = ResourceRequirements::default();
        resources
            .limits
            .insert(RESOURCE.to_string(), units.to_string());

        let mut pod = Workload::default();
        pod.metadata.namespace = "default".to_string();
        pod.metadata.name = name.to_string();
        pod.metadata
            .annotations
            .insert(ASSUME_TIMESTAMP.to_string(), assumed_at.to_string());
        pod.metadata
            .annotations
            .insert(ASSIGNED_FLAG.to_string(), "false".to_string());
        pod.spec.node_name = Some(NODE.to_string());
        pod.spec.containers = vec![Container {
            name: "main".to_string(),
            resources,
        }];
        pod
    }

    async fn matcher_with(pods: Vec<Workload>) -> CandidateMatcher {
        let store = MemoryStore::new();
        for pod in pods {
            store.insert(pod).await;
        }
        CandidateMatcher::new(Arc::new(store), NODE, RESOURCE)
    }

    #[tokio::test]
    async fn test_exact_quantity_match() {
        let matcher = matcher_with(vec![assumed_pod("one", 1, 10), assumed_pod("two", 2, 20)]).await;

        let target = matcher.find_allocation_target(2).await.unwrap().unwrap();
        assert_eq!(target.metadata.name, "two");
        assert!(matcher.find_allocation_target(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_earliest_assumption_wins() {
        let matcher = matcher_with(vec![
            assumed_pod("late", 2, 300),
            assumed_pod("early", 2, 100),
            assumed_pod("middle", 2, 200),
        ])
        .await;

        let target = matcher.find_allocation_target(2).await.unwrap().unwrap();
        assert_eq!(target.metadata.name, "early");
    }

    #[tokio::test]
    async fn test_ties_keep_store_order() {
        let matcher =
            matcher_with(vec![assumed_pod("first", 1, 100), assumed_pod("second", 1, 100)]).await;

        let target = matcher.find_allocation_target(1).await.unwrap().unwrap();
        assert_eq!(target.metadata.name, "first");
    }

    #[tokio::test]
    async fn test_skips_allocated_and_terminating_pods() {
        let mut allocated = assumed_pod("allocated", 1, 10);
        allocated
            .metadata
            .annotations
            .insert(ASSIGNED_FLAG.to_string(), "true".to_string());
        let mut finished = assumed_pod("finished", 1, 20);
        finished.status.phase = Some(WorkloadPhase::Failed);
        let mut deleting = assumed_pod("deleting", 1, 30);
        deleting.metadata.deletion_timestamp = Some(chrono::Utc::now());
        let mut elsewhere = assumed_pod("elsewhere", 1, 40);
        elsewhere.spec.node_name = Some("other-node".to_string());

        let matcher = matcher_with(vec![allocated, finished, deleting, elsewhere]).await;

        assert!(matcher.candidates().await.unwrap().is_empty());
        assert!(matcher.find_allocation_target(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_failure_propagates() {
        let store = Arc::new(MemoryStore::new());
        store.fail_lists(true);
        let matcher = CandidateMatcher::new(store, NODE, RESOURCE);

        assert!(matcher.find_allocation_target(1).await.is_err());
    }
}
