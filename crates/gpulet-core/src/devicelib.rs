//! Device query adapter interface
//!
//! The plugin never talks to the driver directly. Everything it needs to know
//! about GPUs and MIG devices is read through [`DeviceLib`], which is
//! implemented on top of NVML (feature `nvml`) or by [`crate::StaticDeviceLib`].

use crate::resource::normalize_profile_name;
use crate::{GpuletError, GpuletResult};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Properties shared by whole GPUs and MIG devices
pub trait DeviceInfo {
    /// Stable identifier reported by the driver
    fn uuid(&self) -> GpuletResult<String>;
    /// Device nodes a container needs to use the device
    fn paths(&self) -> GpuletResult<Vec<String>>;
    /// NUMA node, `None` when the platform reports no affinity
    fn numa_node(&self) -> GpuletResult<Option<i64>>;
    /// Total memory in bytes
    fn total_memory(&self) -> GpuletResult<u64>;
    /// CUDA compute capability as `major.minor`
    fn compute_capability(&self) -> GpuletResult<String>;
}

/// A physical GPU
pub trait GpuDevice: DeviceInfo {
    /// Product name, e.g. `Tesla V100-SXM2-16GB`
    fn name(&self) -> GpuletResult<String>;
    fn is_mig_enabled(&self) -> GpuletResult<bool>;
    /// Visit every MIG device of this GPU, in index order
    fn visit_mig_devices(
        &self,
        visit: &mut dyn FnMut(usize, &dyn MigDevice) -> GpuletResult<()>,
    ) -> GpuletResult<()>;

    /// MIG profiles this GPU supports.
    ///
    /// Backends that cannot list supported profiles report the profiles of
    /// the MIG devices that currently exist.
    fn mig_profiles(&self) -> GpuletResult<Vec<MigProfile>> {
        let mut profiles = Vec::new();
        self.visit_mig_devices(&mut |_, mig| {
            push_unique(&mut profiles, mig.profile()?);
            Ok(())
        })?;
        Ok(profiles)
    }
}

pub(crate) fn push_unique(profiles: &mut Vec<MigProfile>, profile: MigProfile) {
    if !profiles.contains(&profile) {
        profiles.push(profile);
    }
}

/// A MIG device carved out of a GPU
pub trait MigDevice: DeviceInfo {
    fn profile(&self) -> GpuletResult<MigProfile>;
}

/// Entry point of a device query backend.
///
/// `init` and `shutdown` bracket a query session; they are called by whoever
/// drives the queries, never by the visitors themselves.
pub trait DeviceLib: Send + Sync {
    fn init(&self) -> GpuletResult<()>;
    fn shutdown(&self) -> GpuletResult<()>;

    /// Visit every GPU, in index order
    fn visit_devices(
        &self,
        visit: &mut dyn FnMut(usize, &dyn GpuDevice) -> GpuletResult<()>,
    ) -> GpuletResult<()>;

    /// Distinct MIG profiles supported by MIG-enabled GPUs
    fn mig_profiles(&self) -> GpuletResult<Vec<MigProfile>> {
        let mut profiles: Vec<MigProfile> = Vec::new();
        self.visit_devices(&mut |_, gpu| {
            if !gpu.is_mig_enabled()? {
                return Ok(());
            }
            for profile in gpu.mig_profiles()? {
                push_unique(&mut profiles, profile);
            }
            Ok(())
        })?;
        Ok(profiles)
    }

    /// Interconnect affinity between GPUs, keyed by UUID
    fn link_topology(&self) -> GpuletResult<LinkTopology> {
        Ok(LinkTopology::default())
    }
}

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// GPU instance profile index of `1g` with media extensions
pub const GPU_INSTANCE_PROFILE_1_SLICE_REV1: u32 = 7;
/// GPU instance profile index of `2g` with media extensions
pub const GPU_INSTANCE_PROFILE_2_SLICE_REV1: u32 = 8;
/// Number of GPU instance profile indices a driver may report
pub const GPU_INSTANCE_PROFILE_COUNT: u32 = 10;

/// Media extensions attribute, rendered as `+me`
pub const ATTRIBUTE_MEDIA_EXTENSIONS: &str = "me";

/// Memory of a MIG slice in GB, as it appears in the profile name.
///
/// The slice's share of the parent GPU is rounded up to the next eighth and
/// scaled by the parent's size in whole GB, so an `81152` MB slice of an
/// 80 GB GPU is `80gb`.
pub fn mig_memory_size_gb(total_device_memory: u64, mig_memory_mb: u64) -> u32 {
    const FRACTION_DENOMINATOR: f64 = 8.0;
    if total_device_memory == 0 {
        return (mig_memory_mb as f64 / 1024.0).round() as u32;
    }
    let fraction = (mig_memory_mb * MIB) as f64 / total_device_memory as f64;
    let fraction = (fraction * FRACTION_DENOMINATOR).ceil() / FRACTION_DENOMINATOR;
    let total_gb = total_device_memory.div_ceil(GIB) as f64;
    (fraction * total_gb).round() as u32
}

/// Attributes implied by a GPU instance profile index
pub fn gpu_instance_profile_attributes(profile: u32) -> Vec<String> {
    match profile {
        GPU_INSTANCE_PROFILE_1_SLICE_REV1 | GPU_INSTANCE_PROFILE_2_SLICE_REV1 => {
            vec![ATTRIBUTE_MEDIA_EXTENSIONS.to_string()]
        }
        _ => Vec::new(),
    }
}

/// A MIG profile such as `1g.5gb`, `1c.2g.10gb` or `1g.5gb+me`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MigProfile {
    pub compute_slices: u32,
    pub gpu_slices: u32,
    pub memory_gb: u32,
    pub attributes: Vec<String>,
}

impl MigProfile {
    /// Profile of a GPU instance owning all compute of its slices
    pub fn for_gpu_instance(
        profile: u32,
        slices: u32,
        memory_mb: u64,
        total_device_memory: u64,
    ) -> Self {
        Self {
            compute_slices: slices,
            gpu_slices: slices,
            memory_gb: mig_memory_size_gb(total_device_memory, memory_mb),
            attributes: gpu_instance_profile_attributes(profile),
        }
    }

    /// Whether the profile owns all compute of its GPU slices
    pub fn is_full_compute(&self) -> bool {
        self.compute_slices == self.gpu_slices
    }

    /// Profile string as used for matching and naming
    pub fn normalized(&self) -> String {
        normalize_profile_name(&self.to_string())
    }
}

impl fmt::Display for MigProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.compute_slices != self.gpu_slices {
            write!(f, "{}c.", self.compute_slices)?;
        }
        write!(f, "{}g.{}gb", self.gpu_slices, self.memory_gb)?;
        for attr in &self.attributes {
            write!(f, "+{}", attr)?;
        }
        Ok(())
    }
}

impl FromStr for MigProfile {
    type Err = GpuletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GpuletError::DeviceLib(format!("invalid MIG profile '{}'", s));
        let mut parts = s.split('+');
        let base = parts.next().ok_or_else(invalid)?;
        let attributes: Vec<String> = parts.map(str::to_string).collect();
        if attributes.iter().any(|a| a.is_empty()) {
            return Err(invalid());
        }

        let fields: Vec<&str> = base.split('.').collect();
        let (compute, gpu, memory) = match fields.as_slice() {
            [c, g, m] => (Some(*c), *g, *m),
            [g, m] => (None, *g, *m),
            _ => return Err(invalid()),
        };
        let number = |field: &str, suffix: &str| -> Result<u32, GpuletError> {
            field
                .strip_suffix(suffix)
                .and_then(|n| n.parse::<u32>().ok())
                .ok_or_else(invalid)
        };
        let gpu_slices = number(gpu, "g")?;
        let compute_slices = match compute {
            Some(c) => number(c, "c")?,
            None => gpu_slices,
        };
        Ok(Self {
            compute_slices,
            gpu_slices,
            memory_gb: number(memory, "gb")?,
            attributes,
        })
    }
}

/// Pairwise interconnect scores between GPUs; higher means closer
#[derive(Debug, Clone, Default)]
pub struct LinkTopology {
    scores: HashMap<(String, String), u32>,
}

impl LinkTopology {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    /// Record a symmetric link score
    pub fn set_link(&mut self, a: &str, b: &str, score: u32) {
        self.scores.insert(Self::key(a, b), score);
    }

    /// Score between two devices, 0 when unknown
    pub fn score(&self, a: &str, b: &str) -> u32 {
        self.scores.get(&Self::key(a, b)).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}
