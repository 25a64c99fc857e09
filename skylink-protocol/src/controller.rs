//! Controller
//!
//! Process-wide registry: owns every device, backend and discovery of one
//! SDK instance, allocates device handles and fans out device add/remove
//! events. All other objects hold weak links upwards (names and handles),
//! never ownership.

use crate::backend::Backend;
use crate::device::{Device, DeviceInfo};
use crate::{Result, SdkError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

/// Device registry event
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Fires exactly once per device, before any interface on it is usable
    DeviceAdded(Device),
    /// Fires exactly once per device, before the device is freed
    DeviceRemoved(Device),
}

struct CtrlInner {
    /// Ordered: newest devices first
    devices: RwLock<Vec<Device>>,
    backends: RwLock<HashMap<String, Arc<dyn Backend>>>,
    discoveries: RwLock<HashSet<String>>,
    event_tx: mpsc::UnboundedSender<ControllerEvent>,
    rng: Mutex<StdRng>,
}

/// Top-level registry of one SDK instance
#[derive(Clone)]
pub struct Controller {
    inner: Arc<CtrlInner>,
}

impl Controller {
    /// Create a controller and its event stream
    ///
    /// The event receiver is fixed for the controller's lifetime; it stands
    /// in for the added/removed callback pair and must be consumed while
    /// discoveries are running.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(CtrlInner {
                    devices: RwLock::new(Vec::new()),
                    backends: RwLock::new(HashMap::new()),
                    discoveries: RwLock::new(HashSet::new()),
                    event_tx,
                    rng: Mutex::new(StdRng::from_entropy()),
                }),
            },
            event_rx,
        )
    }

    /// Register a backend under its name
    pub async fn register_backend(&self, backend: Arc<dyn Backend>) -> Result<()> {
        let mut backends = self.inner.backends.write().await;
        let name = backend.name().to_string();
        if backends.contains_key(&name) {
            return Err(SdkError::Busy(format!("backend '{name}' already registered")));
        }
        info!("controller: backend '{}' registered", name);
        backends.insert(name, backend);
        Ok(())
    }

    /// Unregister a backend; every device it produced is destroyed
    pub async fn unregister_backend(&self, name: &str) -> Result<()> {
        let backend = self
            .inner
            .backends
            .write()
            .await
            .remove(name)
            .ok_or_else(|| SdkError::NotFound(format!("backend '{name}'")))?;

        let doomed: Vec<Device> = {
            let devices = self.inner.devices.read().await;
            devices
                .iter()
                .filter(|d| d.backend().name() == backend.name())
                .cloned()
                .collect()
        };
        for device in doomed {
            self.destroy_device(device.handle()).await.ok();
        }
        info!("controller: backend '{}' unregistered", name);
        Ok(())
    }

    pub async fn backend(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.inner.backends.read().await.get(name).cloned()
    }

    /// Register a discovery name; duplicate registration is `Busy`
    pub async fn register_discovery(&self, name: &str) -> Result<()> {
        let mut discoveries = self.inner.discoveries.write().await;
        if !discoveries.insert(name.to_string()) {
            return Err(SdkError::Busy(format!(
                "discovery '{name}' already registered"
            )));
        }
        info!("controller: discovery '{}' registered", name);
        Ok(())
    }

    /// Unregister a discovery; its devices survive with the link cleared
    pub async fn unregister_discovery(&self, name: &str) -> Result<()> {
        if !self.inner.discoveries.write().await.remove(name) {
            return Err(SdkError::NotFound(format!("discovery '{name}'")));
        }
        let devices = self.inner.devices.read().await.clone();
        for device in devices {
            if device.discovery_name().await.as_deref() == Some(name) {
                device.clear_discovery().await;
            }
        }
        info!("controller: discovery '{}' unregistered", name);
        Ok(())
    }

    /// Create a device reported by a discovery
    ///
    /// Allocates a fresh random nonzero handle unique among live devices,
    /// prepends the device and emits [`ControllerEvent::DeviceAdded`].
    pub async fn create_device(
        &self,
        discovery: &str,
        runid: u32,
        backend: Arc<dyn Backend>,
        info: DeviceInfo,
        raw_json: Option<Value>,
    ) -> Result<Device> {
        if info.name.is_empty() {
            return Err(SdkError::invalid_argument("device name is empty"));
        }

        let mut devices = self.inner.devices.write().await;
        let handle = {
            let mut rng = self.inner.rng.lock().await;
            loop {
                let candidate: u16 = rng.gen();
                // Handle 0 is reserved.
                if candidate != 0 && !devices.iter().any(|d| d.handle() == candidate) {
                    break candidate;
                }
            }
        };

        let device = Device::new(
            handle,
            backend,
            info,
            Some(discovery.to_string()),
            runid,
            raw_json,
        );
        devices.insert(0, device.clone());
        drop(devices);

        info!("controller: device {:#06x} added", handle);
        let _ = self
            .inner
            .event_tx
            .send(ControllerEvent::DeviceAdded(device.clone()));
        Ok(device)
    }

    /// Destroy a device: force-disconnect, emit removed, drop it
    pub async fn destroy_device(&self, handle: u16) -> Result<()> {
        let device = self
            .get_device(handle)
            .await
            .ok_or_else(|| SdkError::NotFound(format!("device {handle:#06x}")))?;

        device.mark_removing().await;
        if device.disconnect().await.is_ok() {
            warn!("controller: device {:#06x} was connected, forced disconnect", handle);
        }

        // Removed is guaranteed to fire before the device is dropped.
        let _ = self
            .inner
            .event_tx
            .send(ControllerEvent::DeviceRemoved(device.clone()));

        let mut devices = self.inner.devices.write().await;
        devices.retain(|d| d.handle() != handle);
        info!("controller: device {:#06x} removed", handle);
        Ok(())
    }

    /// Look a device up by handle
    pub async fn get_device(&self, handle: u16) -> Option<Device> {
        self.inner
            .devices
            .read()
            .await
            .iter()
            .find(|d| d.handle() == handle)
            .cloned()
    }

    /// Snapshot of all live devices, newest first
    pub async fn devices(&self) -> Vec<Device> {
        self.inner.devices.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendCapabilities, BackendType, ConnectionRequest, DeviceAddr, DeviceConnection,
    };
    use async_trait::async_trait;

    struct NullBackend {
        name: String,
    }

    #[async_trait]
    impl Backend for NullBackend {
        fn name(&self) -> &str {
            &self.name
        }
        fn backend_type(&self) -> BackendType {
            BackendType::Net
        }
        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities::default()
        }
        async fn start_device_conn(
            &self,
            _device: &DeviceAddr,
            _req: &ConnectionRequest,
        ) -> Result<DeviceConnection> {
            Err(SdkError::io_failed(-1, "null backend"))
        }
        async fn stop_device_conn(&self, _conn: &DeviceConnection) -> Result<()> {
            Ok(())
        }
    }

    fn null_backend(name: &str) -> Arc<dyn Backend> {
        Arc::new(NullBackend {
            name: name.to_string(),
        })
    }

    fn device_info(name: &str) -> DeviceInfo {
        DeviceInfo {
            name: name.to_string(),
            device_type: 0x0914,
            addr: "127.0.0.1".to_string(),
            port: 44444,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_duplicate_backend_registration() {
        let (ctrl, _events) = Controller::new();
        ctrl.register_backend(null_backend("net")).await.unwrap();
        assert!(matches!(
            ctrl.register_backend(null_backend("net")).await,
            Err(SdkError::Busy(_))
        ));
    }

    #[tokio::test]
    async fn test_device_lifecycle_events() {
        let (ctrl, mut events) = Controller::new();
        let backend = null_backend("net");
        ctrl.register_backend(backend.clone()).await.unwrap();
        ctrl.register_discovery("disc").await.unwrap();

        let device = ctrl
            .create_device("disc", 1, backend, device_info("anafi"), None)
            .await
            .unwrap();
        assert_ne!(device.handle(), 0);

        match events.recv().await.unwrap() {
            ControllerEvent::DeviceAdded(d) => assert_eq!(d.handle(), device.handle()),
            other => panic!("unexpected event {other:?}"),
        }

        ctrl.destroy_device(device.handle()).await.unwrap();
        match events.recv().await.unwrap() {
            ControllerEvent::DeviceRemoved(d) => {
                assert_eq!(d.handle(), device.handle());
                assert!(d.is_deleted());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(ctrl.get_device(device.handle()).await.is_none());
    }

    #[tokio::test]
    async fn test_handles_are_unique() {
        let (ctrl, _events) = Controller::new();
        let backend = null_backend("net");
        let mut handles = std::collections::HashSet::new();
        for i in 0..32 {
            let device = ctrl
                .create_device("disc", 1, backend.clone(), device_info(&format!("d{i}")), None)
                .await
                .unwrap();
            assert!(handles.insert(device.handle()));
        }
    }

    #[tokio::test]
    async fn test_unregister_backend_destroys_devices() {
        let (ctrl, mut events) = Controller::new();
        let backend = null_backend("net");
        ctrl.register_backend(backend.clone()).await.unwrap();
        let device = ctrl
            .create_device("disc", 1, backend, device_info("anafi"), None)
            .await
            .unwrap();
        let _ = events.recv().await;

        ctrl.unregister_backend("net").await.unwrap();
        assert!(ctrl.get_device(device.handle()).await.is_none());
        assert!(matches!(
            ctrl.unregister_backend("net").await,
            Err(SdkError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister_discovery_keeps_devices() {
        let (ctrl, _events) = Controller::new();
        let backend = null_backend("net");
        ctrl.register_discovery("disc").await.unwrap();
        let device = ctrl
            .create_device("disc", 1, backend, device_info("anafi"), None)
            .await
            .unwrap();

        ctrl.unregister_discovery("disc").await.unwrap();
        let device = ctrl.get_device(device.handle()).await.unwrap();
        assert!(device.discovery_name().await.is_none());
    }
}
