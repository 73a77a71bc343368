//! gpulet-plugin: Kubernetes device plugin servers for gpulet
//!
//! This crate provides:
//! - The kubelet device plugin API (v1beta1) generated with tonic
//! - One gRPC server per advertised resource, served over a unix socket
//! - Crash-loop protection for the serving loop
//! - The plugin manager that loads, starts and restarts every server

pub mod crashloop;
pub mod manager;
pub mod proto;
pub mod readiness;
pub mod server;
pub mod uds;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use crashloop::CrashLoopGuard;
pub use manager::{ManagerHandle, ManagerStatus, PluginManager, ResourceStatus};
pub use readiness::Readiness;
pub use server::{socket_name, HealthReporter, PluginServer, ServerFailure, ServerState};
pub use watcher::{FsEvent, PluginDirWatcher};
