//! NVML-backed device adapter
//!
//! Whole GPUs are read through `nvml-wrapper`. MIG handles are not covered by
//! the safe wrapper, so MIG enumeration goes through the raw symbols of the
//! loaded library and wraps the returned handles back into wrapper devices.

use crate::devicelib::{
    push_unique, DeviceInfo, DeviceLib, GpuDevice, LinkTopology, MigDevice, MigProfile,
    GPU_INSTANCE_PROFILE_COUNT,
};
use crate::topology::{
    gpu_device_paths, is_wsl, mig_capability_device_paths, mig_device_paths, numa_node_from_sysfs,
    CapabilityDevicePaths, NVCAPS_MIG_MINORS_PATH, SYSFS_PCI_DEVICES_PATH,
};
use crate::{GpuletError, GpuletResult};
use nvml_wrapper::enum_wrappers::device::TopologyLevel;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};
use nvml_wrapper_sys::bindings::{
    nvmlDeviceAttributes_t, nvmlDevice_t, nvmlGpuInstanceInfo_t, nvmlGpuInstanceProfileInfo_t,
    nvmlGpuInstance_t, nvmlReturn_enum_NVML_ERROR_INVALID_ARGUMENT,
    nvmlReturn_enum_NVML_ERROR_NOT_SUPPORTED, nvmlReturn_enum_NVML_SUCCESS,
};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const NVML_DEVICE_MIG_ENABLE: u32 = 1;

fn nvml_error(context: &str, e: NvmlError) -> GpuletError {
    match e {
        NvmlError::DriverNotLoaded | NvmlError::LibraryNotFound => {
            GpuletError::DeviceLib(format!("{}: NVML is not available ({:?})", context, e))
        }
        other => GpuletError::DeviceLib(format!("{}: {:?}", context, other)),
    }
}

fn check(context: &str, ret: u32) -> GpuletResult<()> {
    if ret == nvmlReturn_enum_NVML_SUCCESS {
        Ok(())
    } else {
        Err(GpuletError::DeviceLib(format!(
            "{}: NVML return code {}",
            context, ret
        )))
    }
}

/// Affinity score of the closest common ancestor of two GPUs
fn topology_score(level: TopologyLevel) -> u32 {
    match level {
        TopologyLevel::Internal => 60,
        TopologyLevel::Single => 50,
        TopologyLevel::Multiple => 40,
        TopologyLevel::HostBridge => 30,
        TopologyLevel::Node => 20,
        TopologyLevel::System => 10,
    }
}

/// NVML session plus host tables read at init
struct Session {
    nvml: Nvml,
    caps: CapabilityDevicePaths,
    wsl: bool,
}

/// [`DeviceLib`] over the NVIDIA management library
#[derive(Default)]
pub struct NvmlDeviceLib {
    session: Mutex<Option<Session>>,
}

impl NvmlDeviceLib {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self) -> GpuletResult<MutexGuard<'_, Option<Session>>> {
        self.session
            .lock()
            .map_err(|_| GpuletError::Internal("NVML session lock poisoned".to_string()))
    }
}

impl DeviceLib for NvmlDeviceLib {
    fn init(&self) -> GpuletResult<()> {
        let mut session = self.session()?;
        if session.is_some() {
            return Ok(());
        }
        let nvml = Nvml::init().map_err(|e| nvml_error("failed to initialize NVML", e))?;
        let caps = mig_capability_device_paths(Path::new(NVCAPS_MIG_MINORS_PATH))?;
        let wsl = is_wsl();
        info!(wsl, mig_capabilities = caps.len(), "Initialized NVML");
        *session = Some(Session { nvml, caps, wsl });
        Ok(())
    }

    fn shutdown(&self) -> GpuletResult<()> {
        let mut session = self.session()?;
        if let Some(s) = session.take() {
            s.nvml
                .shutdown()
                .map_err(|e| nvml_error("failed to shut down NVML", e))?;
        }
        Ok(())
    }

    fn visit_devices(
        &self,
        visit: &mut dyn FnMut(usize, &dyn GpuDevice) -> GpuletResult<()>,
    ) -> GpuletResult<()> {
        let guard = self.session()?;
        let session = guard
            .as_ref()
            .ok_or_else(|| GpuletError::DeviceLib("NVML is not initialized".to_string()))?;
        let count = session
            .nvml
            .device_count()
            .map_err(|e| nvml_error("error getting device count", e))?;
        for i in 0..count {
            let device = session
                .nvml
                .device_by_index(i)
                .map_err(|e| nvml_error("error getting device handle", e))?;
            visit(i as usize, &NvmlGpu { session, device })?;
        }
        Ok(())
    }

    fn link_topology(&self) -> GpuletResult<LinkTopology> {
        let guard = self.session()?;
        let session = guard
            .as_ref()
            .ok_or_else(|| GpuletError::DeviceLib("NVML is not initialized".to_string()))?;
        let mut topology = LinkTopology::new();
        if session.wsl {
            return Ok(topology);
        }
        let count = session
            .nvml
            .device_count()
            .map_err(|e| nvml_error("error getting device count", e))?;
        let handle = |i: u32| {
            session
                .nvml
                .device_by_index(i)
                .map_err(|e| nvml_error("error getting device handle", e))
        };
        for i in 0..count {
            let a = handle(i)?;
            let uuid_a = a.uuid().map_err(|e| nvml_error("error getting UUID", e))?;
            for j in (i + 1)..count {
                let b = handle(j)?;
                let uuid_b = b.uuid().map_err(|e| nvml_error("error getting UUID", e))?;
                match a.topology_common_ancestor(b) {
                    Ok(level) => topology.set_link(&uuid_a, &uuid_b, topology_score(level)),
                    Err(e) => debug!(a = %uuid_a, b = %uuid_b, error = ?e, "No topology information"),
                }
            }
        }
        Ok(topology)
    }
}

fn device_numa_node(device: &Device<'_>) -> GpuletResult<Option<i64>> {
    let pci = device
        .pci_info()
        .map_err(|e| GpuletError::property("PCI info", format!("{:?}", e)))?;
    numa_node_from_sysfs(Path::new(SYSFS_PCI_DEVICES_PATH), &pci.bus_id)
}

fn device_compute_capability(device: &Device<'_>) -> GpuletResult<String> {
    let cc = device
        .cuda_compute_capability()
        .map_err(|e| GpuletError::property("CUDA compute capability", format!("{:?}", e)))?;
    Ok(format!("{}.{}", cc.major, cc.minor))
}

struct NvmlGpu<'a> {
    session: &'a Session,
    device: Device<'a>,
}

/// A GPU instance profile the driver reports for a GPU
struct GpuInstanceProfile {
    /// Profile index passed to NVML
    index: u32,
    info: nvmlGpuInstanceProfileInfo_t,
}

impl NvmlGpu<'_> {
    fn minor(&self) -> GpuletResult<u32> {
        self.device
            .minor_number()
            .map_err(|e| GpuletError::property("minor number", format!("{:?}", e)))
    }

    /// GPU instance profiles supported by this GPU, in index order
    fn gpu_instance_profiles(&self) -> GpuletResult<Vec<GpuInstanceProfile>> {
        let lib = unsafe { self.session.nvml.lib() };
        let handle = unsafe { self.device.handle() };
        let mut profiles = Vec::new();
        for index in 0..GPU_INSTANCE_PROFILE_COUNT {
            let mut info: nvmlGpuInstanceProfileInfo_t = unsafe { std::mem::zeroed() };
            // SAFETY: out pointer is valid; the struct is plain data.
            let ret = unsafe { lib.nvmlDeviceGetGpuInstanceProfileInfo(handle, index, &mut info) };
            if ret == nvmlReturn_enum_NVML_ERROR_NOT_SUPPORTED
                || ret == nvmlReturn_enum_NVML_ERROR_INVALID_ARGUMENT
            {
                continue;
            }
            check("error getting GPU instance profile info", ret)?;
            profiles.push(GpuInstanceProfile { index, info });
        }
        Ok(profiles)
    }
}

impl DeviceInfo for NvmlGpu<'_> {
    fn uuid(&self) -> GpuletResult<String> {
        self.device
            .uuid()
            .map_err(|e| GpuletError::property("UUID", format!("{:?}", e)))
    }

    fn paths(&self) -> GpuletResult<Vec<String>> {
        Ok(gpu_device_paths(self.minor()?, self.session.wsl))
    }

    fn numa_node(&self) -> GpuletResult<Option<i64>> {
        device_numa_node(&self.device)
    }

    fn total_memory(&self) -> GpuletResult<u64> {
        self.device
            .memory_info()
            .map(|m| m.total)
            .map_err(|e| GpuletError::property("memory info", format!("{:?}", e)))
    }

    fn compute_capability(&self) -> GpuletResult<String> {
        device_compute_capability(&self.device)
    }
}

impl GpuDevice for NvmlGpu<'_> {
    fn name(&self) -> GpuletResult<String> {
        self.device
            .name()
            .map_err(|e| GpuletError::property("product name", format!("{:?}", e)))
    }

    fn is_mig_enabled(&self) -> GpuletResult<bool> {
        let mut current = 0u32;
        let mut pending = 0u32;
        // SAFETY: the handle belongs to the live session and both out pointers are valid.
        let ret = unsafe {
            self.session
                .nvml
                .lib()
                .nvmlDeviceGetMigMode(self.device.handle(), &mut current, &mut pending)
        };
        if ret == nvmlReturn_enum_NVML_ERROR_NOT_SUPPORTED {
            return Ok(false);
        }
        check("error getting MIG mode", ret)?;
        Ok(current == NVML_DEVICE_MIG_ENABLE)
    }

    fn visit_mig_devices(
        &self,
        visit: &mut dyn FnMut(usize, &dyn MigDevice) -> GpuletResult<()>,
    ) -> GpuletResult<()> {
        let lib = unsafe { self.session.nvml.lib() };
        let parent = unsafe { self.device.handle() };
        let mut max = 0u32;
        // SAFETY: out pointer is valid for the duration of the call.
        check("error getting max MIG device count", unsafe {
            lib.nvmlDeviceGetMaxMigDeviceCount(parent, &mut max)
        })?;

        let parent_minor = self.minor()?;
        let mut visited = 0usize;
        for i in 0..max {
            let mut handle: nvmlDevice_t = std::ptr::null_mut();
            // SAFETY: out pointer is valid; a missing slot reports NOT_FOUND.
            let ret = unsafe { lib.nvmlDeviceGetMigDeviceHandleByIndex(parent, i, &mut handle) };
            if ret == nvml_wrapper_sys::bindings::nvmlReturn_enum_NVML_ERROR_NOT_FOUND {
                continue;
            }
            check("error getting MIG device handle", ret)?;
            // SAFETY: NVML returned a valid handle owned by this session.
            let device = unsafe { Device::new(handle, &self.session.nvml) };
            let mig = NvmlMig {
                parent: self,
                parent_minor,
                device,
            };
            visit(visited, &mig)?;
            visited += 1;
        }
        Ok(())
    }

    fn mig_profiles(&self) -> GpuletResult<Vec<MigProfile>> {
        let total = self.total_memory()?;
        let mut profiles = Vec::new();
        for profile in self.gpu_instance_profiles()? {
            push_unique(
                &mut profiles,
                MigProfile::for_gpu_instance(
                    profile.index,
                    profile.info.sliceCount,
                    profile.info.memorySizeMB,
                    total,
                ),
            );
        }
        self.visit_mig_devices(&mut |_, mig| {
            push_unique(&mut profiles, mig.profile()?);
            Ok(())
        })?;
        Ok(profiles)
    }
}

struct NvmlMig<'a> {
    parent: &'a NvmlGpu<'a>,
    parent_minor: u32,
    device: Device<'a>,
}

impl NvmlMig<'_> {
    fn instance_ids(&self) -> GpuletResult<(u32, u32)> {
        let lib = unsafe { self.parent.session.nvml.lib() };
        let handle = unsafe { self.device.handle() };
        let mut gi = 0u32;
        let mut ci = 0u32;
        // SAFETY: out pointers are valid for the duration of each call.
        check("error getting GPU instance id", unsafe {
            lib.nvmlDeviceGetGpuInstanceId(handle, &mut gi)
        })?;
        check("error getting compute instance id", unsafe {
            lib.nvmlDeviceGetComputeInstanceId(handle, &mut ci)
        })?;
        Ok((gi, ci))
    }

    /// Index of the GPU instance profile this MIG device was created from
    fn gpu_instance_profile(&self) -> GpuletResult<GpuInstanceProfile> {
        let (gi, _) = self.instance_ids()?;
        let lib = unsafe { self.parent.session.nvml.lib() };
        let parent = unsafe { self.parent.device.handle() };
        let mut instance: nvmlGpuInstance_t = std::ptr::null_mut();
        // SAFETY: out pointer is valid; the instance handle is owned by NVML.
        check("error getting GPU instance", unsafe {
            lib.nvmlDeviceGetGpuInstanceById(parent, gi, &mut instance)
        })?;
        let mut info: nvmlGpuInstanceInfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: out pointer is valid; the struct is plain data.
        check("error getting GPU instance info", unsafe {
            lib.nvmlGpuInstanceGetInfo(instance, &mut info)
        })?;
        self.parent
            .gpu_instance_profiles()?
            .into_iter()
            .find(|p| p.info.id == info.profileId)
            .ok_or_else(|| {
                GpuletError::DeviceLib(format!(
                    "unknown GPU instance profile id {}",
                    info.profileId
                ))
            })
    }

    fn attributes(&self) -> GpuletResult<nvmlDeviceAttributes_t> {
        let lib = unsafe { self.parent.session.nvml.lib() };
        let mut attrs: nvmlDeviceAttributes_t = unsafe { std::mem::zeroed() };
        // SAFETY: out pointer is valid; the struct is plain data.
        check("error getting MIG device attributes", unsafe {
            lib.nvmlDeviceGetAttributes_v2(self.device.handle(), &mut attrs)
        })?;
        Ok(attrs)
    }
}

impl DeviceInfo for NvmlMig<'_> {
    fn uuid(&self) -> GpuletResult<String> {
        self.device
            .uuid()
            .map_err(|e| GpuletError::property("MIG UUID", format!("{:?}", e)))
    }

    fn paths(&self) -> GpuletResult<Vec<String>> {
        let (gi, ci) = self.instance_ids()?;
        mig_device_paths(&self.parent.session.caps, self.parent_minor, gi, ci)
    }

    fn numa_node(&self) -> GpuletResult<Option<i64>> {
        self.parent.numa_node()
    }

    fn total_memory(&self) -> GpuletResult<u64> {
        self.device
            .memory_info()
            .map(|m| m.total)
            .map_err(|e| GpuletError::property("MIG memory info", format!("{:?}", e)))
    }

    fn compute_capability(&self) -> GpuletResult<String> {
        self.parent.compute_capability()
    }
}

impl MigDevice for NvmlMig<'_> {
    fn profile(&self) -> GpuletResult<MigProfile> {
        let attrs = self.attributes()?;
        let instance = self.gpu_instance_profile()?;
        let mut profile = MigProfile::for_gpu_instance(
            instance.index,
            attrs.gpuInstanceSliceCount,
            attrs.memorySizeMB,
            self.parent.total_memory()?,
        );
        profile.compute_slices = attrs.computeInstanceSliceCount;
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_score_ordering() {
        assert!(topology_score(TopologyLevel::Internal) > topology_score(TopologyLevel::Single));
        assert!(topology_score(TopologyLevel::HostBridge) > topology_score(TopologyLevel::System));
    }

    #[test]
    fn test_uninitialized_lib_errors() {
        let lib = NvmlDeviceLib::new();
        let result = lib.visit_devices(&mut |_, _| Ok(()));
        assert!(result.is_err());
        assert!(lib.shutdown().is_ok());
    }
}
