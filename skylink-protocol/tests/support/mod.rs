//! Shared test fixtures
#![allow(dead_code)]

pub mod ftp_server;

use async_trait::async_trait;
use skylink_protocol::{
    Backend, BackendCapabilities, BackendType, ConnectionRequest, Device, DeviceConnection,
    Result, SdkError,
};
use std::sync::Arc;

/// Backend stub for tests that never connect
pub struct NullBackend;

#[async_trait]
impl Backend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }
    fn backend_type(&self) -> BackendType {
        BackendType::Net
    }
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }
    async fn start_device_conn(
        &self,
        _device: &skylink_protocol::backend::DeviceAddr,
        _req: &ConnectionRequest,
    ) -> Result<DeviceConnection> {
        Err(SdkError::io_failed(-1, "null backend"))
    }
    async fn stop_device_conn(&self, _conn: &DeviceConnection) -> Result<()> {
        Ok(())
    }
}

/// A loopback device whose tcp-proxy resolves to 127.0.0.1
pub async fn loopback_device() -> Device {
    use skylink_protocol::{Controller, Discovery};

    let (ctrl, _events) = Controller::new();
    let backend: Arc<dyn Backend> = Arc::new(NullBackend);
    let discovery = Discovery::new("test", backend.clone(), ctrl.clone(), Vec::new())
        .await
        .unwrap();
    discovery
        .add_device(skylink_protocol::DiscoveredDevice {
            name: "test-device".to_string(),
            device_type: 0x0914,
            addr: "127.0.0.1".to_string(),
            port: 44444,
            id: "PI000".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    ctrl.devices().await.into_iter().next().unwrap()
}
