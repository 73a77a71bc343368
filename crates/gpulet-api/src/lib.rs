//! gpulet-api: HTTP control surface for gpulet
//!
//! This crate provides a small REST API next to the device plugins:
//! - Liveness and readiness
//! - Restart requests
//! - Advertised resource status

pub mod rest;

pub use rest::create_router;
