//! Allocation policy selection and request validation

use crate::aligned::AlignedPolicy;
use crate::distributed::DistributedPolicy;
use gpulet_core::{any_has_annotations, Devices, GpuletError, GpuletResult, LinkTopology};
use tracing::debug;

/// A preferred-allocation request for one container
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest<'a> {
    /// Ids the kubelet may choose from
    pub available: &'a [String],
    /// Ids that must be part of the result
    pub required: &'a [String],
    /// Number of ids to return
    pub size: usize,
}

impl<'a> AllocationRequest<'a> {
    pub fn new(available: &'a [String], required: &'a [String], size: usize) -> Self {
        Self {
            available,
            required,
            size,
        }
    }

    /// Check the request against an inventory before any policy runs
    pub fn validate(&self, resource: &str, devices: &Devices) -> GpuletResult<()> {
        if self.size > self.available.len() {
            return Err(GpuletError::Allocation(format!(
                "requested {} devices but only {} are available",
                self.size,
                self.available.len()
            )));
        }
        if self.required.len() > self.size {
            return Err(GpuletError::Allocation(format!(
                "{} devices are required but only {} were requested",
                self.required.len(),
                self.size
            )));
        }
        for id in self.available.iter().chain(self.required) {
            if devices.get_by_id(id).is_none() {
                return Err(GpuletError::UnknownDevice {
                    resource: resource.to_string(),
                    id: id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Available ids that are not already required, in input order
    pub fn candidates(&self) -> Vec<&'a str> {
        self.available
            .iter()
            .filter(|id| !self.required.contains(*id))
            .map(String::as_str)
            .collect()
    }

    /// Number of ids a policy has to pick on top of the required ones
    pub fn needed(&self) -> usize {
        self.size - self.required.len()
    }
}

/// A strategy for choosing which devices satisfy a request.
///
/// Implementations receive validated requests and must return exactly
/// `size` ids with the required ids first.
pub trait AllocationPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn allocate(&self, devices: &Devices, request: &AllocationRequest<'_>) -> GpuletResult<Vec<String>>;
}

/// Per-resource allocator choosing between the aligned and distributed policies
#[derive(Debug, Clone)]
pub struct Allocator {
    resource: String,
    devices: Devices,
    aligned: AlignedPolicy,
    distributed: DistributedPolicy,
}

impl Allocator {
    pub fn new(resource: impl Into<String>, devices: Devices, topology: LinkTopology) -> Self {
        Self {
            resource: resource.into(),
            devices,
            aligned: AlignedPolicy::new(topology),
            distributed: DistributedPolicy,
        }
    }

    pub fn devices(&self) -> &Devices {
        &self.devices
    }

    /// Policy that applies to a request over these devices
    pub fn policy_for(&self, available: &[String]) -> &dyn AllocationPolicy {
        if self.devices.aligned_allocation_supported() && !any_has_annotations(available) {
            &self.aligned
        } else {
            &self.distributed
        }
    }

    /// Pick `size` ids out of `available`, `required` first.
    ///
    /// Fails without a partial result when the request cannot be satisfied.
    pub fn allocate(
        &self,
        available: &[String],
        required: &[String],
        size: usize,
    ) -> GpuletResult<Vec<String>> {
        let request = AllocationRequest::new(available, required, size);
        request.validate(&self.resource, &self.devices)?;

        let policy = self.policy_for(available);
        let ids = policy.allocate(&self.devices, &request)?;
        debug!(
            resource = %self.resource,
            policy = policy.name(),
            size,
            ids = ?ids,
            "Computed preferred allocation"
        );
        if ids.len() != size {
            return Err(GpuletError::Allocation(format!(
                "{} policy returned {} devices, expected {}",
                policy.name(),
                ids.len(),
                size
            )));
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpulet_core::{Device, Health};

    fn device(id: &str, index: &str) -> Device {
        Device {
            id: id.to_string(),
            index: index.to_string(),
            health: Health::Healthy,
            numa_node: None,
            paths: vec![format!("/dev/nvidia{}", index)],
            total_memory: 0,
            compute_capability: "8.0".to_string(),
            replicas: 0,
        }
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn whole_gpus() -> Devices {
        (0..4).map(|i| device(&format!("GPU-{}", i), &i.to_string())).collect()
    }

    #[test]
    fn test_policy_selection() {
        let allocator = Allocator::new("nvidia.com/gpu", whole_gpus(), LinkTopology::new());
        assert_eq!(allocator.policy_for(&ids(&["GPU-0"])).name(), "aligned");

        let shared = whole_gpus().with_replicas(2);
        let allocator = Allocator::new("nvidia.com/gpu", shared, LinkTopology::new());
        assert_eq!(allocator.policy_for(&ids(&["GPU-0::0"])).name(), "distributed");

        let mig: Devices = vec![device("MIG-0", "0:0"), device("MIG-1", "0:1")]
            .into_iter()
            .collect();
        let allocator = Allocator::new("nvidia.com/mig-1g.5gb", mig, LinkTopology::new());
        assert_eq!(allocator.policy_for(&ids(&["MIG-0"])).name(), "distributed");
    }

    #[test]
    fn test_count_exceeding_available_fails_for_both_policies() {
        let aligned = Allocator::new("nvidia.com/gpu", whole_gpus(), LinkTopology::new());
        let result = aligned.allocate(&ids(&["GPU-0", "GPU-1"]), &[], 3);
        assert!(matches!(result, Err(GpuletError::Allocation(_))));

        let distributed = Allocator::new(
            "nvidia.com/gpu",
            whole_gpus().with_replicas(2),
            LinkTopology::new(),
        );
        let result = distributed.allocate(&ids(&["GPU-0::0", "GPU-0::1"]), &[], 3);
        assert!(matches!(result, Err(GpuletError::Allocation(_))));
    }

    #[test]
    fn test_required_exceeding_size_fails() {
        let allocator = Allocator::new("nvidia.com/gpu", whole_gpus(), LinkTopology::new());
        let available = ids(&["GPU-0", "GPU-1", "GPU-2"]);
        let result = allocator.allocate(&available, &ids(&["GPU-0", "GPU-1"]), 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_device_fails() {
        let allocator = Allocator::new("nvidia.com/gpu", whole_gpus(), LinkTopology::new());
        let result = allocator.allocate(&ids(&["GPU-0", "GPU-9"]), &[], 1);
        assert!(matches!(
            result,
            Err(GpuletError::UnknownDevice { ref id, .. }) if id == "GPU-9"
        ));
    }

    #[test]
    fn test_required_ids_come_first() {
        let allocator = Allocator::new("nvidia.com/gpu", whole_gpus(), LinkTopology::new());
        let available = ids(&["GPU-0", "GPU-1", "GPU-2", "GPU-3"]);
        let result = allocator.allocate(&available, &ids(&["GPU-3"]), 2).unwrap();
        assert_eq!(result[0], "GPU-3");
        assert_eq!(result.len(), 2);
    }
}
