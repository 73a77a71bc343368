//! Resource descriptors: which devices are advertised under which name

use crate::devicelib::DeviceLib;
use crate::{GpuletError, GpuletResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Domain every advertised resource lives under
pub const RESOURCE_NAME_PREFIX: &str = "nvidia.com";

/// Suffix appended to shared resources when renaming by default
pub const DEFAULT_SHARED_RESOURCE_NAME_SUFFIX: &str = ".shared";

/// Kubernetes limit on the name part of an extended resource
pub const MAX_RESOURCE_NAME_LENGTH: usize = 63;

/// How MIG-capable GPUs are exposed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigStrategy {
    /// Expose every GPU whole, MIG mode is ignored
    #[default]
    None,
    /// Expose whole GPUs, skipping GPUs with MIG enabled
    Single,
    /// Expose each MIG device under a per-profile resource
    Mixed,
}

impl fmt::Display for MigStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigStrategy::None => write!(f, "none"),
            MigStrategy::Single => write!(f, "single"),
            MigStrategy::Mixed => write!(f, "mixed"),
        }
    }
}

impl FromStr for MigStrategy {
    type Err = GpuletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(MigStrategy::None),
            "single" => Ok(MigStrategy::Single),
            "mixed" => Ok(MigStrategy::Mixed),
            other => Err(GpuletError::InvalidMigStrategy(other.to_string())),
        }
    }
}

/// A namespaced extended resource name such as `nvidia.com/gpu`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(String);

impl ResourceName {
    /// Create a resource name, prepending `nvidia.com/` when no prefix is given
    pub fn new(name: &str) -> GpuletResult<Self> {
        let full = if name.starts_with(&format!("{}/", RESOURCE_NAME_PREFIX)) {
            name.to_string()
        } else {
            format!("{}/{}", RESOURCE_NAME_PREFIX, name)
        };
        let rn = ResourceName(full);
        let short = rn.short_name();
        if short.is_empty() || short.len() > MAX_RESOURCE_NAME_LENGTH {
            return Err(GpuletError::InvalidResourceName(rn.0));
        }
        Ok(rn)
    }

    /// Split into `(prefix, name)` at the first `/`
    pub fn split(&self) -> (&str, &str) {
        match self.0.split_once('/') {
            Some((prefix, name)) => (prefix, name),
            None => ("", self.0.as_str()),
        }
    }

    /// Name without the domain prefix
    pub fn short_name(&self) -> &str {
        self.split().1
    }

    pub fn prefix(&self) -> &str {
        self.split().0
    }

    /// Name applied when sharing renames resources by default
    pub fn default_shared_rename(&self) -> GpuletResult<ResourceName> {
        ResourceName::new(&format!("{}{}", self.0, DEFAULT_SHARED_RESOURCE_NAME_SUFFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Convert a wildcard pattern to an anchored regular expression.
///
/// `*` matches any substring (newlines included), every other character is
/// matched literally.
pub fn wildcard_to_regex(pattern: &str) -> String {
    let literals: Vec<String> = pattern.split('*').map(regex::escape).collect();
    format!("(?s)^{}$", literals.join(".*"))
}

/// A resource pattern compiled for matching
#[derive(Debug, Clone)]
pub struct ResourcePattern {
    raw: String,
    matcher: Regex,
}

impl ResourcePattern {
    pub fn new(pattern: &str) -> GpuletResult<Self> {
        let matcher =
            Regex::new(&wildcard_to_regex(pattern)).map_err(|e| GpuletError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            raw: pattern.to_string(),
            matcher,
        })
    }

    /// Whether the whole of `name` matches the pattern
    pub fn matches(&self, name: &str) -> bool {
        self.matcher.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Maps devices matching a pattern to an advertised resource name
#[derive(Debug, Clone)]
pub struct Resource {
    pub pattern: ResourcePattern,
    pub name: ResourceName,
}

impl Resource {
    pub fn new(pattern: &str, name: &str) -> GpuletResult<Self> {
        Ok(Self {
            pattern: ResourcePattern::new(pattern)?,
            name: ResourceName::new(name)?,
        })
    }
}

/// Build the resource descriptors for a MIG strategy.
///
/// Under `mixed` the adapter is queried for MIG profiles, so it must already
/// be initialized by the caller.
pub fn resources_for_strategy(
    lib: &dyn DeviceLib,
    strategy: MigStrategy,
) -> GpuletResult<Vec<Resource>> {
    match strategy {
        MigStrategy::None | MigStrategy::Single => Ok(vec![Resource::new("*", "gpu")?]),
        MigStrategy::Mixed => {
            let mut resources: Vec<Resource> = Vec::new();
            for profile in lib.mig_profiles()? {
                if !profile.is_full_compute() {
                    continue;
                }
                let pattern = profile.normalized();
                let name = format!("mig-{}", pattern);
                if resources.iter().any(|r| r.pattern.as_str() == pattern) {
                    continue;
                }
                debug!(profile = %profile, resource = %name, "Adding MIG resource");
                resources.push(Resource::new(&pattern, &name)?);
            }
            Ok(resources)
        }
    }
}

/// Profile string with `+` rewritten to `.`, usable inside a resource name
pub fn normalize_profile_name(profile: &str) -> String {
    profile.replace('+', ".")
}
