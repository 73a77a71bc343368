//! Test doubles shared by the plugin tests

use crate::proto::v1beta1::registration_server::{Registration, RegistrationServer};
use crate::proto::v1beta1::{Empty, RegisterRequest};
use crate::uds;
use gpulet_core::{Device, Health};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{Request, Response, Status};

pub fn device(id: &str, index: usize) -> Device {
    Device {
        id: id.to_string(),
        index: index.to_string(),
        health: Health::Healthy,
        numa_node: None,
        paths: vec![format!("/dev/nvidia{}", index)],
        total_memory: 0,
        compute_capability: "8.0".to_string(),
        replicas: 0,
    }
}

#[derive(Default)]
struct Recorder {
    requests: Mutex<Vec<RegisterRequest>>,
}

#[tonic::async_trait]
impl Registration for Arc<Recorder> {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        self.requests.lock().await.push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

/// Kubelet registration endpoint that records every request
pub struct FakeKubelet {
    recorder: Arc<Recorder>,
    _stop: watch::Sender<bool>,
}

impl FakeKubelet {
    pub async fn start(socket: &Path) -> Self {
        let listener = uds::bind(socket).unwrap();
        let recorder = Arc::new(Recorder::default());
        let (stop, stop_rx) = watch::channel(false);
        let service = RegistrationServer::new(recorder.clone());
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(
                    UnixListenerStream::new(listener),
                    uds::stopped(stop_rx),
                )
                .await
                .unwrap();
        });
        Self {
            recorder,
            _stop: stop,
        }
    }

    pub async fn requests(&self) -> Vec<RegisterRequest> {
        self.recorder.requests.lock().await.clone()
    }
}
