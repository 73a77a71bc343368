//! Device map: resource name to device inventory

use crate::config::SharingConfig;
use crate::device::{Device, Devices};
use crate::devicelib::{DeviceInfo, DeviceLib};
use crate::resource::{MigStrategy, Resource, ResourceName};
use crate::{GpuletError, GpuletResult};
use std::collections::BTreeMap;
use tracing::debug;

/// Inventories keyed by advertised resource name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMap(BTreeMap<ResourceName, Devices>);

impl DeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &ResourceName) -> Option<&Devices> {
        self.0.get(name)
    }

    /// Set the inventory of a resource, replacing any previous one
    pub fn insert(&mut self, name: ResourceName, devices: Devices) {
        self.0.insert(name, devices);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceName, &Devices)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of devices across all resources
    pub fn device_count(&self) -> usize {
        self.0.values().map(Devices::len).sum()
    }

    fn set_entry<D: DeviceInfo + ?Sized>(
        &mut self,
        name: &ResourceName,
        index: &str,
        info: &D,
    ) -> GpuletResult<()> {
        let device = Device::build(index, info)?;
        if self.0.values().any(|devices| devices.get_by_id(&device.id).is_some()) {
            return Err(GpuletError::DuplicateDevice(device.id));
        }
        debug!(resource = %name, id = %device.id, index = %device.index, "Mapped device");
        self.0.entry(name.clone()).or_default().insert(device);
        Ok(())
    }

    /// Expand inventories into replicas, renaming resources when requested
    pub fn with_sharing(self, sharing: &SharingConfig) -> GpuletResult<DeviceMap> {
        if !sharing.enabled() {
            return Ok(self);
        }
        let mut map = BTreeMap::new();
        for (name, devices) in self.0 {
            let name = if sharing.rename_by_default {
                name.default_shared_rename()?
            } else {
                name
            };
            map.insert(name, devices.with_replicas(sharing.replicas));
        }
        Ok(DeviceMap(map))
    }
}

impl IntoIterator for DeviceMap {
    type Item = (ResourceName, Devices);
    type IntoIter = std::collections::btree_map::IntoIter<ResourceName, Devices>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Builds a [`DeviceMap`] by matching every unit against the resource descriptors.
///
/// The adapter must already be initialized. Any property read failure aborts
/// the build and no partial map is returned.
pub struct DeviceMapBuilder<'a> {
    lib: &'a dyn DeviceLib,
    resources: &'a [Resource],
    strategy: MigStrategy,
}

impl<'a> DeviceMapBuilder<'a> {
    pub fn new(lib: &'a dyn DeviceLib, resources: &'a [Resource], strategy: MigStrategy) -> Self {
        Self {
            lib,
            resources,
            strategy,
        }
    }

    pub fn build(&self) -> GpuletResult<DeviceMap> {
        match self.strategy {
            MigStrategy::None | MigStrategy::Single => self.build_gpu_device_map(),
            MigStrategy::Mixed => self.build_mig_device_map(),
        }
    }

    fn matching_resource(&self, unit_name: &str) -> Option<&'a Resource> {
        self.resources.iter().find(|r| r.pattern.matches(unit_name))
    }

    fn build_gpu_device_map(&self) -> GpuletResult<DeviceMap> {
        let mut map = DeviceMap::new();
        self.lib.visit_devices(&mut |i, gpu| {
            let name = gpu.name().map_err(|e| GpuletError::property("product name", e))?;
            let mig_enabled = gpu
                .is_mig_enabled()
                .map_err(|e| GpuletError::property("MIG mode", e))?;
            if mig_enabled && self.strategy != MigStrategy::None {
                debug!(index = i, name = %name, "Skipping MIG-enabled GPU");
                return Ok(());
            }
            let resource = self
                .matching_resource(&name)
                .ok_or_else(|| GpuletError::NoMatchingResource {
                    unit: "GPU name",
                    name: name.clone(),
                })?;
            map.set_entry(&resource.name, &i.to_string(), gpu)
        })?;
        Ok(map)
    }

    fn build_mig_device_map(&self) -> GpuletResult<DeviceMap> {
        let mut map = DeviceMap::new();
        self.lib.visit_devices(&mut |i, gpu| {
            let mig_enabled = gpu
                .is_mig_enabled()
                .map_err(|e| GpuletError::property("MIG mode", e))?;
            if !mig_enabled {
                return Ok(());
            }
            gpu.visit_mig_devices(&mut |j, mig| {
                let profile = mig
                    .profile()
                    .map_err(|e| GpuletError::property("MIG profile", e))?
                    .normalized();
                let resource = self.matching_resource(&profile).ok_or_else(|| {
                    GpuletError::NoMatchingResource {
                        unit: "MIG profile",
                        name: profile.clone(),
                    }
                })?;
                map.set_entry(&resource.name, &format!("{}:{}", i, j), mig)
            })
        })?;
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::resources_for_strategy;
    use crate::static_lib::{StaticDeviceLib, StaticGpu, StaticMig};

    fn mixed_host() -> StaticDeviceLib {
        let mut a100 = StaticGpu::new("A100-SXM4-40GB", "GPU-0", 0);
        a100.mig_enabled = true;
        a100.mig_devices = vec![
            StaticMig::new("1g.5gb", "MIG-0"),
            StaticMig::new("1g.5gb", "MIG-1"),
            StaticMig::new("3g.20gb", "MIG-2"),
        ];
        let t4 = StaticGpu::new("Tesla T4", "GPU-1", 1);
        StaticDeviceLib::new(vec![a100, t4])
    }

    #[test]
    fn test_single_model_wildcard() {
        let lib = StaticDeviceLib::new(vec![
            StaticGpu::new("Model-X", "GPU-a", 0),
            StaticGpu::new("Model-X", "GPU-b", 1),
        ]);
        let resources = vec![Resource::new("*", "gpu").unwrap()];
        let map = DeviceMapBuilder::new(&lib, &resources, MigStrategy::None)
            .build()
            .unwrap();

        assert_eq!(map.len(), 1);
        let name = ResourceName::new("gpu").unwrap();
        let devices = map.get(&name).unwrap();
        assert_eq!(devices.ids(), vec!["GPU-a", "GPU-b"]);
        assert_eq!(devices.get_by_id("GPU-b").unwrap().index, "1");
        assert!(devices.iter().all(Device::is_healthy));
    }

    #[test]
    fn test_first_matching_resource_wins() {
        let lib = StaticDeviceLib::new(vec![
            StaticGpu::new("Tesla V100-SXM2-16GB", "GPU-0", 0),
            StaticGpu::new("Tesla T4", "GPU-1", 1),
        ]);
        let resources = vec![
            Resource::new("*V100*", "v100").unwrap(),
            Resource::new("*", "gpu").unwrap(),
        ];
        let map = DeviceMapBuilder::new(&lib, &resources, MigStrategy::None)
            .build()
            .unwrap();

        let v100 = map.get(&ResourceName::new("v100").unwrap()).unwrap();
        let rest = map.get(&ResourceName::new("gpu").unwrap()).unwrap();
        assert_eq!(v100.ids(), vec!["GPU-0"]);
        assert_eq!(rest.ids(), vec!["GPU-1"]);
    }

    #[test]
    fn test_every_device_matches_its_pattern() {
        let lib = mixed_host();
        for strategy in [MigStrategy::None, MigStrategy::Single, MigStrategy::Mixed] {
            let resources = resources_for_strategy(&lib, strategy).unwrap();
            let map = DeviceMapBuilder::new(&lib, &resources, strategy)
                .build()
                .unwrap();
            for (name, devices) in map.iter() {
                let resource = resources.iter().find(|r| &r.name == name).unwrap();
                for device in devices.iter() {
                    let unit_name = if device.is_mig_device() {
                        let gpu = &lib.gpus()[0];
                        let mig = gpu.mig_devices.iter().find(|m| m.uuid == device.id).unwrap();
                        mig.profile.clone()
                    } else {
                        let gpu = lib.gpus().iter().find(|g| g.uuid == device.id).unwrap();
                        gpu.name.clone()
                    };
                    assert!(resource.pattern.matches(&unit_name));
                }
            }
        }
    }

    #[test]
    fn test_single_strategy_skips_mig_gpus() {
        let lib = mixed_host();
        let resources = resources_for_strategy(&lib, MigStrategy::Single).unwrap();
        let map = DeviceMapBuilder::new(&lib, &resources, MigStrategy::Single)
            .build()
            .unwrap();
        assert_eq!(map.device_count(), 1);

        let resources = resources_for_strategy(&lib, MigStrategy::None).unwrap();
        let map = DeviceMapBuilder::new(&lib, &resources, MigStrategy::None)
            .build()
            .unwrap();
        assert_eq!(map.device_count(), 2);
    }

    #[test]
    fn test_mixed_strategy_maps_mig_devices() {
        let lib = mixed_host();
        let resources = resources_for_strategy(&lib, MigStrategy::Mixed).unwrap();
        let map = DeviceMapBuilder::new(&lib, &resources, MigStrategy::Mixed)
            .build()
            .unwrap();

        let small = map.get(&ResourceName::new("mig-1g.5gb").unwrap()).unwrap();
        assert_eq!(small.ids(), vec!["MIG-0", "MIG-1"]);
        assert_eq!(small.get_by_id("MIG-1").unwrap().index, "0:1");
        assert!(!small.aligned_allocation_supported());

        let large = map.get(&ResourceName::new("mig-3g.20gb").unwrap()).unwrap();
        assert_eq!(large.indices(), vec!["0:2"]);
        assert_eq!(map.device_count(), 3);
    }

    #[test]
    fn test_unmatched_unit_aborts_build() {
        let lib = StaticDeviceLib::new(vec![
            StaticGpu::new("Tesla T4", "GPU-0", 0),
            StaticGpu::new("Model-Y", "GPU-1", 1),
        ]);
        let resources = vec![Resource::new("Tesla*", "tesla").unwrap()];
        let err = DeviceMapBuilder::new(&lib, &resources, MigStrategy::None)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            GpuletError::NoMatchingResource { unit: "GPU name", ref name } if name == "Model-Y"
        ));
    }

    #[test]
    fn test_invalid_mig_profile_aborts_build() {
        let mut gpu = StaticGpu::new("A100", "GPU-0", 0);
        gpu.mig_enabled = true;
        gpu.mig_devices = vec![StaticMig::new("bogus", "MIG-0")];
        let lib = StaticDeviceLib::new(vec![gpu]);
        let resources = vec![Resource::new("*", "mig-any").unwrap()];
        let result = DeviceMapBuilder::new(&lib, &resources, MigStrategy::Mixed).build();
        assert!(matches!(
            result,
            Err(GpuletError::DeviceProperty { property: "MIG profile", .. })
        ));
    }

    #[test]
    fn test_sharing_expands_and_renames() {
        let lib = StaticDeviceLib::new(vec![StaticGpu::new("Model-X", "GPU-a", 0)]);
        let resources = vec![Resource::new("*", "gpu").unwrap()];
        let map = DeviceMapBuilder::new(&lib, &resources, MigStrategy::None)
            .build()
            .unwrap();

        let sharing = SharingConfig {
            replicas: 2,
            rename_by_default: true,
        };
        let shared = map.clone().with_sharing(&sharing).unwrap();
        let devices = shared
            .get(&ResourceName::new("gpu.shared").unwrap())
            .unwrap();
        assert_eq!(devices.ids(), vec!["GPU-a::0", "GPU-a::1"]);

        let unshared = map.clone().with_sharing(&SharingConfig::default()).unwrap();
        assert_eq!(unshared, map);
    }

    #[test]
    fn test_duplicate_device_id_rejected() {
        let lib = StaticDeviceLib::new(vec![
            StaticGpu::new("Tesla T4", "GPU-0", 0),
            StaticGpu::new("Model-X", "GPU-0", 1),
        ]);
        let resources = vec![
            Resource::new("Tesla*", "tesla").unwrap(),
            Resource::new("*", "gpu").unwrap(),
        ];
        let err = DeviceMapBuilder::new(&lib, &resources, MigStrategy::None)
            .build()
            .unwrap_err();
        assert!(matches!(err, GpuletError::DuplicateDevice(id) if id == "GPU-0"));
    }

    #[test]
    fn test_sharing_rename_over_length_limit_fails() {
        let mut map = DeviceMap::new();
        let long = "x".repeat(crate::resource::MAX_RESOURCE_NAME_LENGTH);
        map.insert(ResourceName::new(&long).unwrap(), Devices::new());
        let sharing = SharingConfig {
            replicas: 2,
            rename_by_default: true,
        };
        assert!(matches!(
            map.with_sharing(&sharing),
            Err(GpuletError::InvalidResourceName(_))
        ));
    }
}
