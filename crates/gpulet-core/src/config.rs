//! Configuration types for gpulet

use crate::resource::MigStrategy;
use crate::static_lib::{StaticGpu, StaticLink};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory the kubelet scans for device plugin sockets
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

/// File name of the kubelet registration socket inside [`DEVICE_PLUGIN_PATH`]
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

/// Prefix for environment overrides, e.g. `GPULET__PLUGIN__MIG_STRATEGY=mixed`
pub const ENV_PREFIX: &str = "GPULET";

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP control surface
    pub api: ApiConfig,
    /// Device plugin settings
    pub plugin: PluginConfig,
    /// Device sharing (replicas)
    pub sharing: SharingConfig,
    /// Device query backend
    pub devices: DevicesConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from an optional TOML file, then apply `GPULET__*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self, crate::GpuletError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let config: DaemonConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, crate::GpuletError> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the plugin cannot run with
    pub fn validate(&self) -> Result<(), crate::GpuletError> {
        if self.sharing.replicas == 1 {
            return Err(crate::GpuletError::Config(
                "sharing.replicas must be 0 (disabled) or at least 2".to_string(),
            ));
        }
        if self.plugin.restart_backoff_secs == 0 {
            return Err(crate::GpuletError::Config(
                "plugin.restart_backoff_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP control surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the HTTP server
    pub address: String,
    /// Port for the HTTP server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9002,
        }
    }
}

/// Device plugin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// How MIG-capable GPUs are exposed
    pub mig_strategy: MigStrategy,
    /// Directory holding plugin sockets
    pub plugin_dir: PathBuf,
    /// Kubelet registration socket, defaults to `<plugin_dir>/kubelet.sock`
    pub kubelet_socket: Option<PathBuf>,
    /// Delay before retrying after a failed start pass
    pub restart_backoff_secs: u64,
    /// Timeout for dialing sockets and registering
    pub dial_timeout_secs: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            mig_strategy: MigStrategy::None,
            plugin_dir: PathBuf::from(DEVICE_PLUGIN_PATH),
            kubelet_socket: None,
            restart_backoff_secs: 30,
            dial_timeout_secs: 5,
        }
    }
}

impl PluginConfig {
    /// Build a config rooted at a different plugin directory
    pub fn with_plugin_dir(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            ..Self::default()
        }
    }

    /// Resolved kubelet registration socket
    pub fn kubelet_socket(&self) -> PathBuf {
        self.kubelet_socket
            .clone()
            .unwrap_or_else(|| self.plugin_dir.join(KUBELET_SOCKET_NAME))
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// Replica sharing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Number of replicas advertised per device, 0 disables sharing
    pub replicas: u32,
    /// Advertise shared resources as `<name>.shared`
    pub rename_by_default: bool,
}

impl SharingConfig {
    pub fn enabled(&self) -> bool {
        self.replicas > 1
    }
}

/// Which device query adapter to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackend {
    /// Query NVML (requires the `nvml` feature)
    #[default]
    Nvml,
    /// Devices listed in the configuration file
    Static,
}

/// Device query configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Adapter selection
    pub backend: DeviceBackend,
    /// Devices for the static backend
    #[serde(rename = "static")]
    pub static_devices: Vec<StaticGpu>,
    /// Interconnect scores between static devices
    pub links: Vec<StaticLink>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.api.port, 9002);
        assert_eq!(config.plugin.mig_strategy, MigStrategy::None);
        assert_eq!(config.plugin.restart_backoff(), Duration::from_secs(30));
        assert_eq!(
            config.plugin.kubelet_socket(),
            PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock")
        );
    }

    #[test]
    fn test_config_parse() {
        let toml_str = r#"
[plugin]
mig_strategy = "mixed"
plugin_dir = "/tmp/plugins"

[sharing]
replicas = 4

[devices]
backend = "static"

[[devices.static]]
name = "Tesla T4"
uuid = "GPU-1"
minor = 0
memory = 16106127360
compute_capability = "7.5"
"#;
        let config = DaemonConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.plugin.mig_strategy, MigStrategy::Mixed);
        assert_eq!(
            config.plugin.kubelet_socket(),
            PathBuf::from("/tmp/plugins/kubelet.sock")
        );
        assert!(config.sharing.enabled());
        assert_eq!(config.devices.backend, DeviceBackend::Static);
        assert_eq!(config.devices.static_devices.len(), 1);
        assert_eq!(config.devices.static_devices[0].uuid, "GPU-1");
    }

    #[test]
    fn test_single_replica_rejected() {
        let result = DaemonConfig::from_toml_str("[sharing]\nreplicas = 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_strategy_rejected() {
        let result = DaemonConfig::from_toml_str("[plugin]\nmig_strategy = \"bogus\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpulet.toml");
        std::fs::write(&path, "[api]\nport = 9100\n").unwrap();

        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.api.port, 9100);
        assert_eq!(config.logging.level, "info");
    }
}
