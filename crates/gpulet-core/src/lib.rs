//! gpulet-core: Core types for the gpulet device plugin
//!
//! This crate provides the pieces shared by every other gpulet crate:
//! - Configuration types
//! - Error handling
//! - Resource descriptors and MIG strategies
//! - Device records, inventories and the device map builder
//! - The device query adapter seam and its static and NVML backends

pub mod config;
pub mod device;
pub mod device_map;
pub mod devicelib;
pub mod error;
#[cfg(feature = "nvml")]
pub mod nvml;
pub mod resource;
pub mod static_lib;
pub mod topology;

pub use config::*;
pub use device::*;
pub use device_map::*;
pub use devicelib::*;
pub use error::*;
#[cfg(feature = "nvml")]
pub use nvml::NvmlDeviceLib;
pub use resource::*;
pub use static_lib::*;
