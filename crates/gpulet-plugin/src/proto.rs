//! Generated kubelet device plugin API and conversions from gpulet types

use gpulet_core::{Device, Devices};

#[allow(clippy::all)]
pub mod v1beta1 {
    tonic::include_proto!("v1beta1");
}

/// Device plugin API version announced at registration
pub const VERSION: &str = "v1beta1";

/// Environment variable read by the NVIDIA container runtime hook
pub const VISIBLE_DEVICES_ENV: &str = "NVIDIA_VISIBLE_DEVICES";

impl From<&Device> for v1beta1::Device {
    fn from(device: &Device) -> Self {
        v1beta1::Device {
            id: device.id.clone(),
            health: device.health.as_str().to_string(),
            topology: device.numa_node.map(|node| v1beta1::TopologyInfo {
                nodes: vec![v1beta1::NumaNode { id: node }],
            }),
        }
    }
}

/// Wire form of a whole inventory, in id order
pub fn plugin_devices(devices: &Devices) -> Vec<v1beta1::Device> {
    devices.iter().map(v1beta1::Device::from).collect()
}

/// Options every gpulet server advertises
pub fn plugin_options() -> v1beta1::DevicePluginOptions {
    v1beta1::DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: true,
    }
}
