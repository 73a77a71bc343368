//! gpulet-allocator: Preferred-allocation policies for gpulet
//!
//! This crate decides which device ids the kubelet should hand to a container:
//! - Topology-aligned allocation for whole, unshared GPUs
//! - Replica-distributed allocation for shared and MIG devices
//! - Request validation shared by both

pub mod aligned;
pub mod distributed;
pub mod policy;

pub use aligned::AlignedPolicy;
pub use distributed::DistributedPolicy;
pub use policy::{AllocationPolicy, AllocationRequest, Allocator};
