//! Cluster state store interface and an in-memory implementation.
//!
//! The store is the only place allocation state lives. Writes are guarded by
//! the workload's resource version: a write carrying a stale version fails
//! with [`StoreError::Conflict`], which is the sole cross-process guarantee
//! that a pod is allocated at most once.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::workload::{Workload, WorkloadKey};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored object changed since it was read.
    #[error("workload {0} has been modified; apply changes to the latest version and try again")]
    Conflict(WorkloadKey),

    #[error("workload not found: {0}")]
    NotFound(WorkloadKey),

    #[error("API server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode API response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid store configuration: {0}")]
    Config(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns true if the write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Access to workload descriptors in the cluster state store.
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// List workloads bound to a node, in store order.
    async fn list_workloads(&self, node_name: &str) -> Result<Vec<Workload>, StoreError>;

    /// Fetch the latest version of a workload.
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Workload, StoreError>;

    /// Write the workload's annotations, guarded by its resource version.
    async fn update_workload(&self, workload: &Workload) -> Result<(), StoreError>;
}

/// In-memory store for tests and local development.
pub struct MemoryStore {
    /// Workloads in insertion order.
    workloads: RwLock<Vec<Workload>>,

    /// Source of resource versions.
    next_version: AtomicU64,

    /// Number of upcoming updates to fail as if another writer got there first.
    pending_conflicts: AtomicU32,

    /// Write applied by "another writer" just before the next update.
    concurrent_write: Mutex<Option<Workload>>,

    /// Workload deleted by "another actor" just before its next update.
    concurrent_delete: Mutex<Option<WorkloadKey>>,

    /// Error returned by the next update instead of writing.
    update_error: Mutex<Option<StoreError>>,

    /// Whether list calls should fail.
    fail_lists: AtomicBool,

    list_calls: AtomicU32,
    get_calls: AtomicU32,
    update_calls: AtomicU32,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            workloads: RwLock::new(Vec::new()),
            next_version: AtomicU64::new(1),
            pending_conflicts: AtomicU32::new(0),
            concurrent_write: Mutex::new(None),
            concurrent_delete: Mutex::new(None),
            update_error: Mutex::new(None),
            fail_lists: AtomicBool::new(false),
            list_calls: AtomicU32::new(0),
            get_calls: AtomicU32::new(0),
            update_calls: AtomicU32::new(0),
        }
    }

    fn next_version(&self) -> String {
        self.next_version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Add or replace a workload, assigning it a fresh resource version.
    pub async fn insert(&self, mut workload: Workload) {
        workload.metadata.resource_version = Some(self.next_version());
        let key = workload.key();

        let mut workloads = self.workloads.write().await;
        match workloads.iter_mut().find(|w| w.key() == key) {
            Some(existing) => *existing = workload,
            None => workloads.push(workload),
        }
    }

    /// Current stored copy of a workload.
    pub async fn snapshot(&self, namespace: &str, name: &str) -> Option<Workload> {
        let key = WorkloadKey::new(namespace, name);
        let workloads = self.workloads.read().await;
        workloads.iter().find(|w| w.key() == key).cloned()
    }

    /// Fail the next `count` updates with a conflict, bumping the stored
    /// version each time as a concurrent writer would.
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Have the next update of this workload lose a race against `workload`.
    pub async fn inject_concurrent_write(&self, workload: Workload) {
        *self.concurrent_write.lock().await = Some(workload);
    }

    /// Have the next update of this workload find it modified, then deleted.
    pub async fn inject_concurrent_delete(&self, namespace: &str, name: &str) {
        *self.concurrent_delete.lock().await = Some(WorkloadKey::new(namespace, name));
    }

    /// Fail the next update with `error` without touching the stored copy.
    pub async fn inject_update_error(&self, error: StoreError) {
        *self.update_error.lock().await = Some(error);
    }

    /// Make list calls fail until reset.
    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> u32 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> u32 {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn take_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkloadStore for MemoryStore {
    async fn list_workloads(&self, node_name: &str) -> Result<Vec<Workload>, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("list failure injected".to_string()));
        }

        let workloads = self.workloads.read().await;
        Ok(workloads
            .iter()
            .filter(|w| w.spec.node_name.as_deref() == Some(node_name))
            .cloned()
            .collect())
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Workload, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.snapshot(namespace, name)
            .await
            .ok_or_else(|| StoreError::NotFound(WorkloadKey::new(namespace, name)))
    }

    async fn update_workload(&self, workload: &Workload) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let key = workload.key();

        if let Some(err) = self.update_error.lock().await.take() {
            debug!(workload = %key, error = %err, "[MOCK] Injected update error");
            return Err(err);
        }

        let mut workloads = self.workloads.write().await;
        let position = workloads
            .iter()
            .position(|w| w.key() == key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        let mut concurrent_delete = self.concurrent_delete.lock().await;
        if concurrent_delete.as_ref() == Some(&key) {
            concurrent_delete.take();
            workloads.remove(position);
            debug!(workload = %key, "[MOCK] Injected concurrent delete");
            return Err(StoreError::Conflict(key));
        }
        drop(concurrent_delete);

        let stored = &mut workloads[position];

        let mut concurrent_write = self.concurrent_write.lock().await;
        if concurrent_write.as_ref().map(Workload::key).as_ref() == Some(&key) {
            if let Some(mut winner) = concurrent_write.take() {
                winner.metadata.resource_version = Some(self.next_version());
                *stored = winner;
                debug!(workload = %key, "[MOCK] Injected concurrent write");
                return Err(StoreError::Conflict(key));
            }
        }
        drop(concurrent_write);

        if self.take_conflict() {
            stored.metadata.resource_version = Some(self.next_version());
            debug!(workload = %key, "[MOCK] Injected update conflict");
            return Err(StoreError::Conflict(key));
        }

        if stored.metadata.resource_version != workload.metadata.resource_version {
            return Err(StoreError::Conflict(key));
        }

        *stored = workload.clone();
        stored.metadata.resource_version = Some(self.next_version());
        Ok(())
    }
}
