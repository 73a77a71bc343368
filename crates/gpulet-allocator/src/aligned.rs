//! Topology-aligned allocation
//!
//! Best-effort greedy packing over the link scores captured from the device
//! adapter: the first two picks are the best connected pair, every further
//! pick maximizes its summed score to the devices already chosen. Without
//! any known affinity the result follows the input order.

use crate::policy::{AllocationPolicy, AllocationRequest};
use gpulet_core::{Devices, GpuletError, GpuletResult, LinkTopology};
use std::cmp::Reverse;

/// Link-score driven allocation for whole, unshared GPUs
#[derive(Debug, Clone, Default)]
pub struct AlignedPolicy {
    topology: LinkTopology,
}

impl AlignedPolicy {
    pub fn new(topology: LinkTopology) -> Self {
        Self { topology }
    }

    fn score_to(&self, id: &str, selected: &[String]) -> u32 {
        selected.iter().map(|s| self.topology.score(id, s)).sum()
    }

    fn best_pair(&self, candidates: &[&str]) -> Option<(usize, usize)> {
        let mut best: Option<(u32, usize, usize)> = None;
        for i in 0..candidates.len() {
            for j in (i + 1)..candidates.len() {
                let score = self.topology.score(candidates[i], candidates[j]);
                if best.map_or(true, |(s, _, _)| score > s) {
                    best = Some((score, i, j));
                }
            }
        }
        best.map(|(_, i, j)| (i, j))
    }
}

impl AllocationPolicy for AlignedPolicy {
    fn name(&self) -> &'static str {
        "aligned"
    }

    fn allocate(
        &self,
        devices: &Devices,
        request: &AllocationRequest<'_>,
    ) -> GpuletResult<Vec<String>> {
        let mut candidates: Vec<&str> = request
            .candidates()
            .into_iter()
            .filter(|id| devices.get_by_id(id).is_some())
            .collect();
        let needed = request.needed();
        if candidates.len() < needed {
            return Err(GpuletError::Allocation(format!(
                "not enough available devices to satisfy allocation: need {}, have {}",
                needed,
                candidates.len()
            )));
        }

        let mut selected: Vec<String> = request.required.to_vec();
        if selected.is_empty() && needed >= 2 {
            if let Some((i, j)) = self.best_pair(&candidates) {
                let second = candidates.remove(j);
                let first = candidates.remove(i);
                selected.push(first.to_string());
                selected.push(second.to_string());
            }
        }

        while selected.len() < request.size {
            let Some((pos, _)) = candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, id)| Reverse(self.score_to(id, &selected)))
            else {
                break;
            };
            selected.push(candidates.remove(pos).to_string());
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpulet_core::{Device, Health};

    fn gpus(n: usize) -> Devices {
        (0..n)
            .map(|i| Device {
                id: format!("GPU-{}", i),
                index: i.to_string(),
                health: Health::Healthy,
                numa_node: None,
                paths: vec![format!("/dev/nvidia{}", i)],
                total_memory: 0,
                compute_capability: "8.0".to_string(),
                replicas: 0,
            })
            .collect()
    }

    /// GPU-0/GPU-1 and GPU-2/GPU-3 are NVLink pairs, everything else crosses the host bridge
    fn paired_topology() -> LinkTopology {
        let mut topology = LinkTopology::new();
        for i in 0..4 {
            for j in (i + 1)..4 {
                topology.set_link(&format!("GPU-{}", i), &format!("GPU-{}", j), 30);
            }
        }
        topology.set_link("GPU-0", "GPU-1", 60);
        topology.set_link("GPU-2", "GPU-3", 60);
        topology
    }

    #[test]
    fn test_input_order_without_topology() {
        let devices = gpus(4);
        let available: Vec<String> = vec!["GPU-3".into(), "GPU-1".into(), "GPU-2".into()];
        let request = AllocationRequest::new(&available, &[], 2);

        let picked = AlignedPolicy::default().allocate(&devices, &request).unwrap();
        assert_eq!(picked, vec!["GPU-3", "GPU-1"]);
    }

    #[test]
    fn test_picks_best_connected_pair() {
        let devices = gpus(4);
        let available: Vec<String> =
            vec!["GPU-0".into(), "GPU-2".into(), "GPU-1".into(), "GPU-3".into()];
        let request = AllocationRequest::new(&available, &[], 2);

        let picked = AlignedPolicy::new(paired_topology())
            .allocate(&devices, &request)
            .unwrap();
        assert_eq!(picked, vec!["GPU-0", "GPU-1"]);
    }

    #[test]
    fn test_extends_required_with_closest_device() {
        let devices = gpus(4);
        let available = devices.ids();
        let required = vec!["GPU-2".to_string()];
        let request = AllocationRequest::new(&available, &required, 2);

        let picked = AlignedPolicy::new(paired_topology())
            .allocate(&devices, &request)
            .unwrap();
        assert_eq!(picked, vec!["GPU-2", "GPU-3"]);
    }
}
