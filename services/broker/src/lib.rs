//! fpgashare broker library
//!
//! The broker runs on every FPGA node and answers kubelet's allocation
//! requests for fractional FPGA resources. A scheduler extender has already
//! chosen a physical card for each pending pod and recorded it in the pod's
//! annotations; the broker finds that pod, binds the card's device nodes into
//! its containers and marks the pod allocated.
//!
//! ## Architecture
//!
//! ```text
//! AllocateRequest
//!   └── Allocator
//!       ├── CandidateMatcher ── WorkloadStore (KubeClient | MemoryStore)
//!       ├── DeviceInventory  ── InventoryFile refresh loop
//!       └── commit ─────────── WorkloadStore::update_workload
//! ```
//!
//! ## Modules
//!
//! - `device`: fractional handle layout and physical device aggregation
//! - `inventory`: cached physical device index for the node
//! - `discovery`: file-backed discovery feed
//! - `workload`, `annotations`: pod model and the extender's annotation protocol
//! - `store`, `kube`: state store interface and its Kubernetes implementation
//! - `matcher`, `allocator`: candidate selection and the allocation handshake

pub mod allocator;
pub mod annotations;
pub mod config;
pub mod device;
pub mod discovery;
pub mod inventory;
pub mod kube;
pub mod matcher;
pub mod store;
pub mod workload;

// Re-export commonly used types
pub use allocator::{AllocateError, Allocator};
pub use device::{FractionalDevice, HandleLayout, PhysicalDevice};
pub use inventory::DeviceInventory;
pub use store::{MemoryStore, StoreError, WorkloadStore};
pub use workload::{Workload, WorkloadKey};
