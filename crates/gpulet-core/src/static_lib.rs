//! Device adapter backed by a fixed device list
//!
//! Used on hosts without NVML and in tests. Devices are usually declared in
//! the daemon configuration under `[[devices.static]]`.

use crate::devicelib::{
    push_unique, DeviceInfo, DeviceLib, GpuDevice, LinkTopology, MigDevice, MigProfile,
};
use crate::topology::gpu_device_path;
use crate::GpuletResult;
use serde::{Deserialize, Serialize};

const GIB: u64 = 1024 * 1024 * 1024;

/// A GPU declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticGpu {
    pub name: String,
    pub uuid: String,
    /// Minor number of `/dev/nvidia<minor>`
    pub minor: u32,
    /// Total memory in bytes
    #[serde(default)]
    pub memory: u64,
    #[serde(default = "default_compute_capability")]
    pub compute_capability: String,
    #[serde(default)]
    pub numa_node: Option<i64>,
    /// Device nodes, defaults to `/dev/nvidia<minor>`
    #[serde(default)]
    pub paths: Option<Vec<String>>,
    #[serde(default)]
    pub mig_enabled: bool,
    #[serde(default)]
    pub mig_devices: Vec<StaticMig>,
    /// Profiles the GPU supports beyond those of `mig_devices`
    #[serde(default)]
    pub mig_profiles: Vec<String>,
}

fn default_compute_capability() -> String {
    "0.0".to_string()
}

impl StaticGpu {
    pub fn new(name: &str, uuid: &str, minor: u32) -> Self {
        Self {
            name: name.to_string(),
            uuid: uuid.to_string(),
            minor,
            memory: 0,
            compute_capability: default_compute_capability(),
            numa_node: None,
            paths: None,
            mig_enabled: false,
            mig_devices: Vec::new(),
            mig_profiles: Vec::new(),
        }
    }
}

impl DeviceInfo for StaticGpu {
    fn uuid(&self) -> GpuletResult<String> {
        Ok(self.uuid.clone())
    }

    fn paths(&self) -> GpuletResult<Vec<String>> {
        Ok(self
            .paths
            .clone()
            .unwrap_or_else(|| vec![gpu_device_path(self.minor)]))
    }

    fn numa_node(&self) -> GpuletResult<Option<i64>> {
        Ok(self.numa_node.filter(|n| *n >= 0))
    }

    fn total_memory(&self) -> GpuletResult<u64> {
        Ok(self.memory)
    }

    fn compute_capability(&self) -> GpuletResult<String> {
        Ok(self.compute_capability.clone())
    }
}

impl GpuDevice for StaticGpu {
    fn name(&self) -> GpuletResult<String> {
        Ok(self.name.clone())
    }

    fn is_mig_enabled(&self) -> GpuletResult<bool> {
        Ok(self.mig_enabled)
    }

    fn visit_mig_devices(
        &self,
        visit: &mut dyn FnMut(usize, &dyn MigDevice) -> GpuletResult<()>,
    ) -> GpuletResult<()> {
        for (i, mig) in self.mig_devices.iter().enumerate() {
            visit(i, &StaticMigView { parent: self, mig })?;
        }
        Ok(())
    }

    fn mig_profiles(&self) -> GpuletResult<Vec<MigProfile>> {
        let mut profiles = Vec::new();
        for profile in &self.mig_profiles {
            push_unique(&mut profiles, profile.parse()?);
        }
        for mig in &self.mig_devices {
            push_unique(&mut profiles, mig.profile.parse()?);
        }
        Ok(profiles)
    }
}

/// A MIG device declared on a [`StaticGpu`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticMig {
    /// Profile string such as `1g.5gb`
    pub profile: String,
    pub uuid: String,
    /// Total memory in bytes, derived from the profile when absent
    #[serde(default)]
    pub memory: Option<u64>,
    /// Device nodes, defaults to the parent GPU's nodes
    #[serde(default)]
    pub paths: Option<Vec<String>>,
}

impl StaticMig {
    pub fn new(profile: &str, uuid: &str) -> Self {
        Self {
            profile: profile.to_string(),
            uuid: uuid.to_string(),
            memory: None,
            paths: None,
        }
    }
}

/// A MIG device together with its parent, which supplies NUMA and compute capability
struct StaticMigView<'a> {
    parent: &'a StaticGpu,
    mig: &'a StaticMig,
}

impl DeviceInfo for StaticMigView<'_> {
    fn uuid(&self) -> GpuletResult<String> {
        Ok(self.mig.uuid.clone())
    }

    fn paths(&self) -> GpuletResult<Vec<String>> {
        match &self.mig.paths {
            Some(paths) => Ok(paths.clone()),
            None => self.parent.paths(),
        }
    }

    fn numa_node(&self) -> GpuletResult<Option<i64>> {
        self.parent.numa_node()
    }

    fn total_memory(&self) -> GpuletResult<u64> {
        match self.mig.memory {
            Some(memory) => Ok(memory),
            None => Ok(u64::from(self.profile()?.memory_gb) * GIB),
        }
    }

    fn compute_capability(&self) -> GpuletResult<String> {
        self.parent.compute_capability()
    }
}

impl MigDevice for StaticMigView<'_> {
    fn profile(&self) -> GpuletResult<MigProfile> {
        self.mig.profile.parse()
    }
}

/// Interconnect score between two declared GPUs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticLink {
    pub a: String,
    pub b: String,
    pub score: u32,
}

/// [`DeviceLib`] over a fixed device list
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceLib {
    gpus: Vec<StaticGpu>,
    links: Vec<StaticLink>,
}

impl StaticDeviceLib {
    pub fn new(gpus: Vec<StaticGpu>) -> Self {
        Self {
            gpus,
            links: Vec::new(),
        }
    }

    /// Attach interconnect scores used for aligned allocation
    pub fn with_links(mut self, links: Vec<StaticLink>) -> Self {
        self.links = links;
        self
    }

    pub fn gpus(&self) -> &[StaticGpu] {
        &self.gpus
    }
}

impl DeviceLib for StaticDeviceLib {
    fn init(&self) -> GpuletResult<()> {
        Ok(())
    }

    fn shutdown(&self) -> GpuletResult<()> {
        Ok(())
    }

    fn visit_devices(
        &self,
        visit: &mut dyn FnMut(usize, &dyn GpuDevice) -> GpuletResult<()>,
    ) -> GpuletResult<()> {
        for (i, gpu) in self.gpus.iter().enumerate() {
            visit(i, gpu)?;
        }
        Ok(())
    }

    fn link_topology(&self) -> GpuletResult<LinkTopology> {
        let mut topology = LinkTopology::new();
        for link in &self.links {
            topology.set_link(&link.a, &link.b, link.score);
        }
        Ok(topology)
    }
}
