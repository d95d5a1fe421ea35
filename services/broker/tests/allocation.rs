//! Integration tests for the allocation handshake.
//!
//! These tests drive `Allocator::allocate` end to end against the in-memory
//! store:
//! 1. Candidate pods are matched by requested quantity
//! 2. The recorded device index resolves to a physical card
//! 3. The pod is marked allocated, retrying once on conflict

use std::sync::Arc;

use fpgashare_broker::annotations::{
    self, ASSIGNED_FLAG, ASSUME_TIMESTAMP, RESOURCE_INDEX,
};
use fpgashare_broker::device::DeviceNodes;
use fpgashare_broker::workload::{Container, ResourceRequirements};
use fpgashare_broker::{
    AllocateError, Allocator, DeviceInventory, FractionalDevice, HandleLayout, MemoryStore,
    StoreError, Workload,
};
use fpgashare_deviceplugin::{AllocateRequest, ContainerAllocateRequest};

const RESOURCE: &str = "xilinx.com/fpga-fraction";
const NODE: &str = "fpga-node-1";

fn card(bus_address: &str, mgmt: &str, user: &str) -> Vec<FractionalDevice> {
    let layout = HandleLayout::new(3);
    (0..3)
        .map(|sub| FractionalDevice {
            id: layout.handle(bus_address, sub),
            firmware_version: "xilinx_u200_xdma_201830_1".to_string(),
            last_seen: 1_542_252_769_000_000_000,
            healthy: true,
            nodes: DeviceNodes {
                mgmt: mgmt.to_string(),
                user: user.to_string(),
            },
        })
        .collect()
}

/// Two cards: index 0 is 0000:03:00.1, index 1 is 0000:86:00.1.
fn test_inventory() -> Arc<DeviceInventory> {
    let mut devices = card("0000:86:00.1", "", "/dev/dri/renderD129");
    devices.extend(card("0000:03:00.1", "/dev/xclmgmt768", "/dev/dri/renderD128"));
    Arc::new(DeviceInventory::with_devices(HandleLayout::new(3), devices))
}

fn test_pod(name: &str, units: &[u64], index: Option<&str>, assumed_at: u64) -> Workload {
    let mut pod = Workload::default();
    pod.metadata.namespace = "batch".to_string();
    pod.metadata.name = name.to_string();
    pod.spec.node_name = Some(NODE.to_string());
    pod.spec.containers = units
        .iter()
        .enumerate()
        .map(|(i, units)| {
            let mut resources = ResourceRequirements::default();
            resources
                .limits
                .insert(RESOURCE.to_string(), units.to_string());
            Container {
                name: format!("c{i}"),
                resources,
            }
        })
        .collect();

    let annotations = &mut pod.metadata.annotations;
    annotations.insert(ASSUME_TIMESTAMP.to_string(), assumed_at.to_string());
    annotations.insert(ASSIGNED_FLAG.to_string(), "false".to_string());
    if let Some(index) = index {
        annotations.insert(RESOURCE_INDEX.to_string(), index.to_string());
    }
    pod
}

fn test_request(per_container: &[usize]) -> AllocateRequest {
    AllocateRequest {
        container_requests: per_container
            .iter()
            .map(|count| ContainerAllocateRequest {
                devices_ids: (0..*count).map(|i| format!("0000:03:00.1-{i}")).collect(),
            })
            .collect(),
    }
}

async fn setup(pods: Vec<Workload>) -> (Arc<MemoryStore>, Allocator) {
    let store = Arc::new(MemoryStore::new());
    for pod in pods {
        store.insert(pod).await;
    }
    let allocator = Allocator::new(store.clone(), test_inventory(), NODE, RESOURCE);
    (store, allocator)
}

async fn assigned_flag(store: &MemoryStore, name: &str) -> String {
    store.snapshot("batch", name).await.unwrap().metadata.annotations[ASSIGNED_FLAG].clone()
}

#[tokio::test]
async fn test_allocate_binds_assumed_device() {
    let (store, allocator) = setup(vec![test_pod("job", &[2], Some("1"), 100)]).await;

    let response = allocator.allocate(&test_request(&[2])).await.unwrap();

    assert_eq!(response.container_responses.len(), 1);
    let container = &response.container_responses[0];
    assert_eq!(container.devices.len(), 1);
    assert_eq!(container.devices[0].host_path, "/dev/dri/renderD129");
    assert_eq!(container.mounts[0].host_path, "/dev/dri/renderD129");

    let stored = store.snapshot("batch", "job").await.unwrap();
    assert_eq!(stored.metadata.annotations[ASSIGNED_FLAG], "true");
    assert!(annotations::assume_timestamp(&stored) > 100);
    assert_eq!(store.update_calls(), 1);
    assert_eq!(store.get_calls(), 0);
}

#[tokio::test]
async fn test_allocate_binds_management_node_for_every_container() {
    let (_store, allocator) = setup(vec![test_pod("job", &[1, 2], Some("0"), 100)]).await;

    let response = allocator.allocate(&test_request(&[1, 2])).await.unwrap();

    assert_eq!(response.container_responses.len(), 2);
    for container in &response.container_responses {
        let hosts: Vec<_> = container
            .devices
            .iter()
            .map(|d| d.host_path.as_str())
            .collect();
        assert_eq!(hosts, vec!["/dev/xclmgmt768", "/dev/dri/renderD128"]);
    }
}

#[tokio::test]
async fn test_unmatched_quantity_is_unsatisfiable() {
    let (store, allocator) = setup(vec![test_pod("job", &[1], Some("0"), 100)]).await;

    let err = allocator.allocate(&test_request(&[2])).await.unwrap_err();

    assert!(matches!(
        err,
        AllocateError::AllocationUnsatisfiable { requested_units: 2 }
    ));
    assert_eq!(store.update_calls(), 0);
    assert_eq!(assigned_flag(&store, "job").await, "false");
}

#[tokio::test]
async fn test_already_allocated_pod_is_not_reused() {
    let (store, allocator) = setup(vec![test_pod("job", &[1], Some("0"), 100)]).await;

    allocator.allocate(&test_request(&[1])).await.unwrap();
    let err = allocator.allocate(&test_request(&[1])).await.unwrap_err();

    assert!(matches!(err, AllocateError::AllocationUnsatisfiable { .. }));
    assert_eq!(store.update_calls(), 1);
}

#[tokio::test]
async fn test_missing_index_fails() {
    let (store, allocator) = setup(vec![test_pod("job", &[1], None, 100)]).await;

    let err = allocator.allocate(&test_request(&[1])).await.unwrap_err();

    assert!(matches!(err, AllocateError::MissingDeviceBinding { .. }));
    assert_eq!(store.update_calls(), 0);
}

#[tokio::test]
async fn test_unknown_index_fails() {
    let (store, allocator) = setup(vec![test_pod("job", &[1], Some("7"), 100)]).await;

    let err = allocator.allocate(&test_request(&[1])).await.unwrap_err();

    match err {
        AllocateError::DeviceResolutionFailed { workload, index } => {
            assert_eq!(workload.to_string(), "batch/job");
            assert_eq!(index, 7);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.update_calls(), 0);
}

#[tokio::test]
async fn test_list_failure_is_reported() {
    let (store, allocator) = setup(vec![test_pod("job", &[1], Some("0"), 100)]).await;
    store.fail_lists(true);

    let err = allocator.allocate(&test_request(&[1])).await.unwrap_err();

    assert!(matches!(err, AllocateError::CandidateListUnavailable(_)));
}

#[tokio::test]
async fn test_single_conflict_retries_once() {
    let (store, allocator) = setup(vec![test_pod("job", &[1], Some("0"), 100)]).await;
    store.inject_conflicts(1);

    let response = allocator.allocate(&test_request(&[1])).await.unwrap();

    assert_eq!(response.container_responses.len(), 1);
    assert_eq!(store.get_calls(), 1);
    assert_eq!(store.update_calls(), 2);
    assert_eq!(assigned_flag(&store, "job").await, "true");
}

#[tokio::test]
async fn test_second_conflict_fails_commit() {
    let (store, allocator) = setup(vec![test_pod("job", &[1], Some("0"), 100)]).await;
    store.inject_conflicts(2);

    let err = allocator.allocate(&test_request(&[1])).await.unwrap_err();

    match err {
        AllocateError::AllocationCommitFailed { workload, source } => {
            assert_eq!(workload.to_string(), "batch/job");
            assert!(source.is_conflict());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.get_calls(), 1);
    assert_eq!(store.update_calls(), 2);
    assert_eq!(assigned_flag(&store, "job").await, "false");
}

#[tokio::test]
async fn test_retry_refuses_pod_allocated_elsewhere() {
    let (store, allocator) = setup(vec![test_pod("job", &[1], Some("0"), 100)]).await;

    // Another broker marks the pod allocated just before our first write.
    let mut winner = test_pod("job", &[1], Some("0"), 100);
    winner
        .metadata
        .annotations
        .insert(ASSIGNED_FLAG.to_string(), "true".to_string());
    store.inject_concurrent_write(winner).await;

    let err = allocator.allocate(&test_request(&[1])).await.unwrap_err();

    assert!(matches!(err, AllocateError::AllocationCommitFailed { .. }));
    assert_eq!(store.get_calls(), 1);
    assert_eq!(store.update_calls(), 1);
}

#[tokio::test]
async fn test_write_error_fails_without_retry() {
    let (store, allocator) = setup(vec![test_pod("job", &[1], Some("0"), 100)]).await;
    store
        .inject_update_error(StoreError::Api {
            status: 500,
            message: "etcdserver: request timed out".to_string(),
        })
        .await;

    let err = allocator.allocate(&test_request(&[1])).await.unwrap_err();

    match err {
        AllocateError::AllocationCommitFailed { workload, source } => {
            assert_eq!(workload.to_string(), "batch/job");
            assert!(matches!(source, StoreError::Api { status: 500, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.get_calls(), 0);
    assert_eq!(store.update_calls(), 1);
    assert_eq!(assigned_flag(&store, "job").await, "false");
}

#[tokio::test]
async fn test_pod_deleted_before_retry_fails_commit() {
    let (store, allocator) = setup(vec![test_pod("job", &[1], Some("0"), 100)]).await;
    store.inject_concurrent_delete("batch", "job").await;

    let err = allocator.allocate(&test_request(&[1])).await.unwrap_err();

    match err {
        AllocateError::AllocationCommitFailed { workload, source } => {
            assert_eq!(workload.to_string(), "batch/job");
            assert!(matches!(source, StoreError::NotFound(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.get_calls(), 1);
    assert_eq!(store.update_calls(), 1);
    assert!(store.snapshot("batch", "job").await.is_none());
}

#[tokio::test]
async fn test_earliest_assumed_pod_is_allocated_first() {
    let (store, allocator) = setup(vec![
        test_pod("later", &[1], Some("1"), 200),
        test_pod("earlier", &[1], Some("0"), 100),
    ])
    .await;

    let response = allocator.allocate(&test_request(&[1])).await.unwrap();
    assert_eq!(
        response.container_responses[0].devices[1].host_path,
        "/dev/dri/renderD128"
    );
    assert_eq!(assigned_flag(&store, "earlier").await, "true");
    assert_eq!(assigned_flag(&store, "later").await, "false");

    let response = allocator.allocate(&test_request(&[1])).await.unwrap();
    assert_eq!(
        response.container_responses[0].devices[0].host_path,
        "/dev/dri/renderD129"
    );
    assert_eq!(assigned_flag(&store, "later").await, "true");
}

#[tokio::test]
async fn test_concurrent_requests_allocate_distinct_pods() {
    let (store, allocator) = setup(vec![
        test_pod("a", &[1], Some("0"), 100),
        test_pod("b", &[1], Some("1"), 200),
    ])
    .await;
    let allocator = Arc::new(allocator);

    let first = tokio::spawn({
        let allocator = Arc::clone(&allocator);
        async move { allocator.allocate(&test_request(&[1])).await }
    });
    let second = tokio::spawn({
        let allocator = Arc::clone(&allocator);
        async move { allocator.allocate(&test_request(&[1])).await }
    });

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    let user_node = |response: &fpgashare_deviceplugin::AllocateResponse| {
        response.container_responses[0]
            .devices
            .last()
            .map(|d| d.host_path.clone())
    };
    assert_ne!(user_node(&first), user_node(&second));
    assert_eq!(assigned_flag(&store, "a").await, "true");
    assert_eq!(assigned_flag(&store, "b").await, "true");
    assert_eq!(store.update_calls(), 2);
}
