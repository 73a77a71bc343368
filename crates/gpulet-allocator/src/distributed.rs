//! Replica-distributed allocation
//!
//! Spreads a request across as many underlying devices as possible. Every
//! pick goes to the base device whose replicas are already the most used by
//! this request (lowest `total - available`), ties broken by input order.

use crate::policy::{AllocationPolicy, AllocationRequest};
use gpulet_core::{AnnotatedId, Devices, GpuletError, GpuletResult};
use std::collections::HashMap;

#[derive(Debug, Default, Clone, Copy)]
struct ReplicaCount {
    total: usize,
    available: usize,
}

impl ReplicaCount {
    fn used(&self) -> usize {
        self.total - self.available
    }
}

/// Least-used-base-first allocation over replica annotated ids
#[derive(Debug, Clone, Copy, Default)]
pub struct DistributedPolicy;

impl AllocationPolicy for DistributedPolicy {
    fn name(&self) -> &'static str {
        "distributed"
    }

    fn allocate(
        &self,
        devices: &Devices,
        request: &AllocationRequest<'_>,
    ) -> GpuletResult<Vec<String>> {
        let mut candidates = request.candidates();
        let needed = request.needed();
        if candidates.len() < needed {
            return Err(GpuletError::Allocation(format!(
                "not enough available devices to satisfy allocation: need {}, have {}",
                needed,
                candidates.len()
            )));
        }

        let mut replicas: HashMap<&str, ReplicaCount> = HashMap::new();
        for device in devices.iter() {
            replicas.entry(device.uuid()).or_default().total += 1;
        }
        for id in &candidates {
            replicas
                .entry(AnnotatedId::new(id).base_id())
                .or_default()
                .available += 1;
        }

        let mut picked: Vec<String> = request.required.to_vec();
        for _ in 0..needed {
            let Some((pos, _)) = candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, id)| replicas[AnnotatedId::new(id).base_id()].used())
            else {
                break;
            };
            let id = candidates.remove(pos);
            if let Some(count) = replicas.get_mut(AnnotatedId::new(id).base_id()) {
                count.available -= 1;
            }
            picked.push(id.to_string());
        }
        Ok(picked)
    }
}
