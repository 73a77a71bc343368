//! Unix domain socket plumbing for tonic

use gpulet_core::{GpuletError, GpuletResult};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Remove a stale socket file and listen on `path`
pub fn bind(path: &Path) -> GpuletResult<UnixListener> {
    remove_socket(path)?;
    UnixListener::bind(path)
        .map_err(|e| GpuletError::Listen(format!("{}: {}", path.display(), e)))
}

/// Remove a socket file, a missing file is not an error
pub fn remove_socket(path: &Path) -> GpuletResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Open a gRPC channel over a unix socket, failing after `timeout`
pub async fn dial(path: &Path, timeout: Duration) -> GpuletResult<Channel> {
    let path: PathBuf = path.to_path_buf();
    let display = path.display().to_string();
    // The authority is ignored, every connection goes to the socket.
    let endpoint = Endpoint::try_from("http://[::]:50051")
        .map_err(|e| GpuletError::Internal(e.to_string()))?;
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let path = path.clone();
        async move { UnixStream::connect(path).await }
    }));
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(GpuletError::Listen(format!("failed to dial {}: {}", display, e))),
        Err(_) => Err(GpuletError::Listen(format!(
            "timed out dialing {} after {}s",
            display,
            timeout.as_secs()
        ))),
    }
}

/// Resolves once the stop flag is set or its sender is gone
pub async fn stopped(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
