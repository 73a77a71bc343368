//! Device node and NUMA resolution helpers
//!
//! MIG devices are exposed through capability device nodes under
//! `/dev/nvidia-caps`. The driver publishes which capability maps to which
//! minor number in `/proc/driver/nvidia-caps/mig-minors`, one entry per line:
//!
//! ```text
//! config 1
//! monitor 2
//! gpu0/gi1/access 12
//! gpu0/gi1/ci0/access 13
//! ```

use crate::device::DXG_DEVICE_PATH;
use crate::{GpuletError, GpuletResult};
use regex::Regex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::OnceLock;
use tracing::warn;

pub const NVIDIA_CAPABILITIES_PATH: &str = "/proc/driver/nvidia/capabilities";
pub const NVCAPS_MIG_MINORS_PATH: &str = "/proc/driver/nvidia-caps/mig-minors";
pub const NVCAPS_DEVICE_PATH: &str = "/dev/nvidia-caps";
pub const SYSFS_PCI_DEVICES_PATH: &str = "/sys/bus/pci/devices";

/// Capability path to capability device node
pub type CapabilityDevicePaths = HashMap<String, String>;

fn line_patterns() -> &'static [(Regex, LineKind); 4] {
    static PATTERNS: OnceLock<[(Regex, LineKind); 4]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).unwrap_or_else(|_| unreachable!("static pattern"));
        [
            (
                re(r"^gpu(\d+)/gi(\d+)/ci(\d+)/access (\d+)$"),
                LineKind::ComputeInstance,
            ),
            (re(r"^gpu(\d+)/gi(\d+)/access (\d+)$"), LineKind::GpuInstance),
            (re(r"^config (\d+)$"), LineKind::Config),
            (re(r"^monitor (\d+)$"), LineKind::Monitor),
        ]
    })
}

#[derive(Debug, Clone, Copy)]
enum LineKind {
    ComputeInstance,
    GpuInstance,
    Config,
    Monitor,
}

/// Capability path of a GPU instance
pub fn gpu_instance_cap_path(gpu: u32, gi: u32) -> String {
    format!("{}/gpu{}/mig/gi{}/access", NVIDIA_CAPABILITIES_PATH, gpu, gi)
}

/// Capability path of a compute instance
pub fn compute_instance_cap_path(gpu: u32, gi: u32, ci: u32) -> String {
    format!(
        "{}/gpu{}/mig/gi{}/ci{}/access",
        NVIDIA_CAPABILITIES_PATH, gpu, gi, ci
    )
}

/// Parse one `mig-minors` line into `(capability path, minor)`
pub fn parse_mig_minors_line(line: &str) -> Option<(String, u32)> {
    let line = line.trim();
    for (regex, kind) in line_patterns() {
        let Some(caps) = regex.captures(line) else {
            continue;
        };
        let n = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
        let entry = match kind {
            LineKind::ComputeInstance => {
                (compute_instance_cap_path(n(1)?, n(2)?, n(3)?), n(4)?)
            }
            LineKind::GpuInstance => (gpu_instance_cap_path(n(1)?, n(2)?), n(3)?),
            LineKind::Config => (format!("{}/mig/config", NVIDIA_CAPABILITIES_PATH), n(1)?),
            LineKind::Monitor => (format!("{}/mig/monitor", NVIDIA_CAPABILITIES_PATH), n(1)?),
        };
        return Some(entry);
    }
    None
}

/// Build the capability table from a `mig-minors` stream; bad lines are skipped
pub fn parse_mig_minors<R: Read>(reader: R) -> GpuletResult<CapabilityDevicePaths> {
    let mut paths = CapabilityDevicePaths::new();
    for line in BufReader::new(reader).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_mig_minors_line(&line) {
            Some((cap_path, minor)) => {
                paths.insert(cap_path, format!("{}/nvidia-cap{}", NVCAPS_DEVICE_PATH, minor));
            }
            None => warn!(line = %line, "Skipping line in MIG minors file"),
        }
    }
    Ok(paths)
}

/// Read the host capability table; a missing file means no MIG support
pub fn mig_capability_device_paths(minors_file: &Path) -> GpuletResult<CapabilityDevicePaths> {
    match std::fs::File::open(minors_file) {
        Ok(file) => parse_mig_minors(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CapabilityDevicePaths::new()),
        Err(e) => Err(GpuletError::DeviceLib(format!(
            "error opening MIG minors file: {}",
            e
        ))),
    }
}

/// Device node of a whole GPU
pub fn gpu_device_path(minor: u32) -> String {
    format!("/dev/nvidia{}", minor)
}

/// Device nodes of a whole GPU, honoring WSL's single `/dev/dxg` node
pub fn gpu_device_paths(minor: u32, is_wsl: bool) -> Vec<String> {
    if is_wsl {
        vec![DXG_DEVICE_PATH.to_string()]
    } else {
        vec![gpu_device_path(minor)]
    }
}

/// Device nodes of a MIG device: parent GPU, GPU instance and compute instance
pub fn mig_device_paths(
    caps: &CapabilityDevicePaths,
    parent_minor: u32,
    gi: u32,
    ci: u32,
) -> GpuletResult<Vec<String>> {
    let gi_cap_path = gpu_instance_cap_path(parent_minor, gi);
    let gi_dev = caps.get(&gi_cap_path).ok_or_else(|| {
        GpuletError::property(
            "paths",
            format!("missing MIG GPU instance capability path: {}", gi_cap_path),
        )
    })?;

    let ci_cap_path = compute_instance_cap_path(parent_minor, gi, ci);
    let ci_dev = caps.get(&ci_cap_path).ok_or_else(|| {
        GpuletError::property(
            "paths",
            format!("missing MIG compute instance capability path: {}", ci_cap_path),
        )
    })?;

    Ok(vec![
        gpu_device_path(parent_minor),
        gi_dev.clone(),
        ci_dev.clone(),
    ])
}

/// Normalize an NVML bus id (`00000000:3B:00.0`) to its sysfs name (`0000:3b:00.0`)
pub fn sysfs_bus_id(bus_id: &str) -> String {
    let trimmed = bus_id.trim_end_matches('\0');
    let trimmed = trimmed.strip_prefix("0000").unwrap_or(trimmed);
    trimmed.to_lowercase()
}

/// NUMA node of a PCI device from sysfs.
///
/// An unreadable file or a negative node means the platform reports no
/// affinity. Only unparsable content is an error.
pub fn numa_node_from_sysfs(sysfs_root: &Path, bus_id: &str) -> GpuletResult<Option<i64>> {
    let path = sysfs_root.join(sysfs_bus_id(bus_id)).join("numa_node");
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return Ok(None),
    };
    let node: i64 = content.trim().parse().map_err(|e| {
        GpuletError::property("NUMA node", format!("error parsing value for NUMA node: {}", e))
    })?;
    Ok((node >= 0).then_some(node))
}

/// Whether we are running under WSL2
pub fn is_wsl() -> bool {
    Path::new(DXG_DEVICE_PATH).exists()
}
