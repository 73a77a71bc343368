//! Device records and per-resource device inventories

use crate::devicelib::DeviceInfo;
use crate::GpuletResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Device node that rules out topology-aligned allocation (WSL2)
pub const DXG_DEVICE_PATH: &str = "/dev/dxg";

/// Separator between a device id and its replica number
pub const REPLICA_SEPARATOR: &str = "::";

/// Device health as reported to the kubelet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    /// Wire representation used by the device plugin API
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schedulable device: a whole GPU, a MIG device, or a replica of either
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Device id advertised to the kubelet, possibly replica annotated
    pub id: String,
    /// `i` for GPU `i`, `i:j` for MIG device `j` on GPU `i`
    pub index: String,
    pub health: Health,
    pub numa_node: Option<i64>,
    pub paths: Vec<String>,
    /// Total memory in bytes
    pub total_memory: u64,
    pub compute_capability: String,
    /// Total number of replicas of the underlying device, 0 or 1 when not shared
    pub replicas: u32,
}

impl Device {
    /// Read every property of `info` into a new healthy device
    pub fn build<D: DeviceInfo + ?Sized>(index: &str, info: &D) -> GpuletResult<Self> {
        let id = info.uuid()?;
        let paths = info.paths()?;
        let numa_node = info.numa_node()?;
        let total_memory = info.total_memory()?;
        let compute_capability = info.compute_capability()?;

        Ok(Self {
            id,
            index: index.to_string(),
            health: Health::Healthy,
            numa_node,
            paths,
            total_memory,
            compute_capability,
            replicas: 0,
        })
    }

    pub fn is_mig_device(&self) -> bool {
        self.index.contains(':')
    }

    /// Whether the device can take part in topology-aligned allocation
    pub fn aligned_allocation_supported(&self) -> bool {
        if self.is_mig_device() {
            return false;
        }
        !self.paths.iter().any(|p| p == DXG_DEVICE_PATH)
    }

    /// Id of the underlying device, without replica annotation
    pub fn uuid(&self) -> &str {
        AnnotatedId::new(&self.id).base_id()
    }

    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }
}

/// Devices of one resource, keyed and ordered by id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Devices(BTreeMap<String, Device>);

impl Devices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device: Device) {
        self.0.insert(device.id.clone(), device);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.0.values()
    }

    /// Whether every id is part of this inventory
    pub fn contains<S: AsRef<str>>(&self, ids: &[S]) -> bool {
        ids.iter().all(|id| self.0.contains_key(id.as_ref()))
    }

    pub fn get_by_id(&self, id: &str) -> Option<&Device> {
        self.0.get(id)
    }

    pub fn get_by_id_mut(&mut self, id: &str) -> Option<&mut Device> {
        self.0.get_mut(id)
    }

    pub fn get_by_index(&self, index: &str) -> Option<&Device> {
        self.0.values().find(|d| d.index == index)
    }

    /// Devices whose ids appear in `ids`; unknown ids are ignored
    pub fn subset<S: AsRef<str>>(&self, ids: &[S]) -> Devices {
        let mut res = Devices::new();
        for id in ids {
            if let Some(d) = self.0.get(id.as_ref()) {
                res.insert(d.clone());
            }
        }
        res
    }

    /// Devices in `self` that are not in `other`
    pub fn difference(&self, other: &Devices) -> Devices {
        Devices(
            self.0
                .iter()
                .filter(|(id, _)| !other.0.contains_key(*id))
                .map(|(id, d)| (id.clone(), d.clone()))
                .collect(),
        )
    }

    pub fn ids(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Ids of the underlying devices, each listed once
    pub fn uuids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.0
            .values()
            .map(|d| d.uuid().to_string())
            .filter(|u| seen.insert(u.clone()))
            .collect()
    }

    pub fn paths(&self) -> Vec<String> {
        self.0.values().flat_map(|d| d.paths.iter().cloned()).collect()
    }

    pub fn indices(&self) -> Vec<String> {
        self.0.values().map(|d| d.index.clone()).collect()
    }

    pub fn aligned_allocation_supported(&self) -> bool {
        self.0.values().all(Device::aligned_allocation_supported)
    }

    /// Expand every device into `replicas` annotated copies
    pub fn with_replicas(&self, replicas: u32) -> Devices {
        let mut res = Devices::new();
        for device in self.0.values() {
            for i in 0..replicas {
                let mut replica = device.clone();
                replica.id = AnnotatedId::compose(device.uuid(), i).into_string();
                replica.replicas = replicas;
                res.insert(replica);
            }
        }
        res
    }
}

impl FromIterator<Device> for Devices {
    fn from_iter<I: IntoIterator<Item = Device>>(iter: I) -> Self {
        let mut res = Devices::new();
        for d in iter {
            res.insert(d);
        }
        res
    }
}

/// A device id that may carry a `::<replica>` annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnotatedId<'a>(&'a str);

impl<'a> AnnotatedId<'a> {
    pub fn new(id: &'a str) -> Self {
        Self(id)
    }

    /// Build `id::replica`
    pub fn compose(id: &str, replica: u32) -> AnnotatedIdBuf {
        AnnotatedIdBuf(format!("{}{}{}", id, REPLICA_SEPARATOR, replica))
    }

    pub fn has_annotations(&self) -> bool {
        self.0.contains(REPLICA_SEPARATOR)
    }

    /// Split into base id and replica number, the replica defaults to 0
    pub fn split(&self) -> (&'a str, u32) {
        match self.0.split_once(REPLICA_SEPARATOR) {
            Some((id, replica)) => (id, replica.parse().unwrap_or(0)),
            None => (self.0, 0),
        }
    }

    pub fn base_id(&self) -> &'a str {
        self.split().0
    }
}

/// Owned form of [`AnnotatedId`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnnotatedIdBuf(String);

impl AnnotatedIdBuf {
    pub fn as_annotated(&self) -> AnnotatedId<'_> {
        AnnotatedId(&self.0)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for AnnotatedIdBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether any id in the list is replica annotated
pub fn any_has_annotations<S: AsRef<str>>(ids: &[S]) -> bool {
    ids.iter()
        .any(|id| AnnotatedId::new(id.as_ref()).has_annotations())
}

/// Base ids of a list of possibly annotated ids, in input order
pub fn base_ids<S: AsRef<str>>(ids: &[S]) -> Vec<String> {
    ids.iter()
        .map(|id| AnnotatedId::new(id.as_ref()).base_id().to_string())
        .collect()
}
