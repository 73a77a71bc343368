//! Error types for gpulet

use thiserror::Error;

/// Main error type for gpulet
#[derive(Error, Debug)]
pub enum GpuletError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device query adapter failure (NVML or equivalent)
    #[error("Device library error: {0}")]
    DeviceLib(String),

    /// A device property could not be read while building a device
    #[error("error getting device {property}: {reason}")]
    DeviceProperty {
        property: &'static str,
        reason: String,
    },

    /// No resource pattern matched an enumerated unit
    #[error("{unit} '{name}' does not match any resource patterns")]
    NoMatchingResource { unit: &'static str, name: String },

    /// A resource pattern could not be turned into a matcher
    #[error("Invalid resource pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Unknown partition strategy
    #[error("Invalid MIG strategy: {0}")]
    InvalidMigStrategy(String),

    /// Resource name rejected
    #[error("Invalid resource name: {0}")]
    InvalidResourceName(String),

    /// Listening endpoint could not be opened
    #[error("Listen error: {0}")]
    Listen(String),

    /// Registration with the kubelet failed
    #[error("Registration error: {0}")]
    Registration(String),

    /// Allocation could not be satisfied
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// The same device id was enumerated twice
    #[error("Duplicate device id '{0}'")]
    DuplicateDevice(String),

    /// Requested device id is not part of the resource
    #[error("Unknown device '{id}' for resource {resource}")]
    UnknownDevice { resource: String, id: String },

    /// gRPC server crashed too often
    #[error("Crash loop: {0}")]
    CrashLoop(String),

    /// Filesystem watch error
    #[error("Watch error: {0}")]
    Watch(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpulet operations
pub type GpuletResult<T> = Result<T, GpuletError>;

impl GpuletError {
    /// Wrap a property read failure
    pub fn property(property: &'static str, reason: impl std::fmt::Display) -> Self {
        GpuletError::DeviceProperty {
            property,
            reason: reason.to_string(),
        }
    }
}

impl From<toml::de::Error> for GpuletError {
    fn from(err: toml::de::Error) -> Self {
        GpuletError::Config(err.to_string())
    }
}

impl From<config::ConfigError> for GpuletError {
    fn from(err: config::ConfigError) -> Self {
        GpuletError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for GpuletError {
    fn from(err: serde_json::Error) -> Self {
        GpuletError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GpuletError::Config("invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid config");
    }

    #[test]
    fn test_no_matching_resource_display() {
        let err = GpuletError::NoMatchingResource {
            unit: "GPU name",
            name: "Tesla T4".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "GPU name 'Tesla T4' does not match any resource patterns"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GpuletError = io_err.into();
        assert!(matches!(err, GpuletError::Io(_)));
    }
}
