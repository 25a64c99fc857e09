//! Device discovery
//!
//! A discovery is a named source of device add/remove events bound to one
//! backend. The core in this module tracks a monotonically increasing *run
//! id* and ages devices out: every (re)start bumps the run id, every report
//! of a device refreshes it, and a periodic sweep removes stale devices,
//! meaning those reported by an earlier run or unseen for the whole
//! quiescence interval.
//!
//! Three variants feed the core: `net` (TCP JSON pushed by the device),
//! `mdns` (service browsing) and `mux` (discovery channel on a tethered
//! link).

pub mod mdns;
pub mod mux;
pub mod net;

use crate::backend::Backend;
use crate::controller::Controller;
use crate::device::{ApiCapability, Device, DeviceInfo};
use crate::{Result, SdkError};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub use mdns::MdnsDiscovery;
pub use mux::MuxDiscovery;
pub use net::NetDiscovery;

/// Quiescence interval after which an unseen device is removed
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sweep period of the aging task
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// One device report from a discovery source
#[derive(Debug, Clone, Default)]
pub struct DiscoveredDevice {
    /// Human-readable device name
    pub name: String,

    /// 16-bit product family tag
    pub device_type: u16,

    /// Address the device can be reached at; empty over mux
    pub addr: String,

    /// Connection handshake port; unused over mux
    pub port: u16,

    /// Opaque device id; devices without one are matched by name
    pub id: String,

    /// API surface the device advertises
    pub api: ApiCapability,

    /// Raw discovery payload, kept on the device verbatim
    pub raw_json: Option<Value>,
}

struct DiscoveryInner {
    name: String,
    ctrl: Controller,
    backend: Arc<dyn Backend>,
    /// Device-type codes to accept; empty accepts everything
    filter: Vec<u16>,
    runid: AtomicU32,
    started: AtomicBool,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

/// Run-id tracking core shared by every discovery variant
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

impl Discovery {
    /// Create and register a discovery
    pub async fn new(
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
        ctrl: Controller,
        filter: Vec<u16>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(SdkError::invalid_argument("discovery name is empty"));
        }
        ctrl.register_discovery(&name).await?;
        Ok(Self {
            inner: Arc::new(DiscoveryInner {
                name,
                ctrl,
                backend,
                filter,
                runid: AtomicU32::new(0),
                started: AtomicBool::new(false),
                sweep: Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn runid(&self) -> u32 {
        self.inner.runid.load(Ordering::SeqCst)
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.inner.backend.clone()
    }

    /// Start a run: bump the run id and arm the aging sweep
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SdkError::Busy(format!(
                "discovery '{}' already started",
                self.inner.name
            )));
        }
        self.inner.runid.fetch_add(1, Ordering::SeqCst);
        info!(
            "discovery '{}': start (run {})",
            self.inner.name,
            self.runid()
        );

        let this = self.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                this.sweep_stale().await;
            }
        });
        *self.inner.sweep.lock().await = Some(task);
        Ok(())
    }

    /// Stop the current run; already-known devices keep aging state frozen
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return Err(SdkError::NotFound(format!(
                "discovery '{}' is not started",
                self.inner.name
            )));
        }
        if let Some(task) = self.inner.sweep.lock().await.take() {
            task.abort();
        }
        info!("discovery '{}': stop", self.inner.name);
        Ok(())
    }

    /// Unregister from the controller; devices survive with the link cleared
    pub async fn destroy(&self) -> Result<()> {
        self.stop().await.ok();
        self.inner.ctrl.unregister_discovery(&self.inner.name).await
    }

    async fn sweep_stale(&self) {
        let runid = self.runid();
        for device in self.devices_of_this_discovery().await {
            let stale_run = device.discovery_runid() != runid;
            let quiet = device.last_seen().await.elapsed() >= DISCOVERY_TIMEOUT;
            if stale_run || quiet {
                let info = device.info().await;
                info!(
                    "discovery '{}': remove device on timeout name='{}' id='{}'",
                    self.inner.name, info.name, info.id
                );
                self.inner.ctrl.destroy_device(device.handle()).await.ok();
            }
        }
    }

    async fn devices_of_this_discovery(&self) -> Vec<Device> {
        let mut out = Vec::new();
        for device in self.inner.ctrl.devices().await {
            if device.discovery_name().await.as_deref() == Some(self.inner.name.as_str()) {
                out.push(device);
            }
        }
        out
    }

    async fn find_device(&self, info: &DiscoveredDevice) -> Option<Device> {
        for device in self.devices_of_this_discovery().await {
            let dev_info = device.info().await;
            if dev_info.device_type != info.device_type {
                continue;
            }
            // Compare ids when valid, names otherwise.
            let matches = if !info.id.is_empty() {
                dev_info.id == info.id
            } else {
                dev_info.name == info.name
            };
            if matches {
                return Some(device);
            }
        }
        None
    }

    /// Report a device as present
    ///
    /// A known device has its run id and last-seen time refreshed; an
    /// unknown one is created in the controller, which emits `DeviceAdded`.
    pub async fn add_device(&self, info: DiscoveredDevice) -> Result<()> {
        if !self.inner.filter.is_empty() && !self.inner.filter.contains(&info.device_type) {
            debug!(
                "discovery '{}': device type {:#06x} filtered out",
                self.inner.name, info.device_type
            );
            return Ok(());
        }

        let runid = self.runid();
        if let Some(device) = self.find_device(&info).await {
            debug!(
                "discovery '{}': device name='{}' id='{}' already added",
                self.inner.name, info.name, info.id
            );
            device.refresh_discovery(runid, info.raw_json).await;
            return Ok(());
        }

        info!(
            "discovery '{}': add device name='{}' id='{}'",
            self.inner.name, info.name, info.id
        );
        let device_info = DeviceInfo {
            name: info.name,
            device_type: info.device_type,
            addr: info.addr,
            port: info.port,
            id: info.id,
            api: info.api,
        };
        self.inner
            .ctrl
            .create_device(
                &self.inner.name,
                runid,
                self.inner.backend.clone(),
                device_info,
                info.raw_json,
            )
            .await?;
        Ok(())
    }

    /// Report a device as gone
    pub async fn remove_device(&self, info: &DiscoveredDevice) -> Result<()> {
        let device = self.find_device(info).await.ok_or_else(|| {
            SdkError::NotFound(format!(
                "device name='{}' id='{}' not seen by discovery '{}'",
                info.name, info.id, self.inner.name
            ))
        })?;
        info!(
            "discovery '{}': remove device name='{}' id='{}'",
            self.inner.name, info.name, info.id
        );
        self.inner.ctrl.destroy_device(device.handle()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendCapabilities, BackendType, ConnectionRequest, DeviceAddr, DeviceConnection,
    };
    use async_trait::async_trait;

    struct NullBackend;

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
            _device: &DeviceAddr,
            _req: &ConnectionRequest,
        ) -> Result<DeviceConnection> {
            Err(SdkError::io_failed(-1, "null backend"))
        }
        async fn stop_device_conn(&self, _conn: &DeviceConnection) -> Result<()> {
            Ok(())
        }
    }

    fn report(name: &str, id: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            name: name.to_string(),
            device_type: 0x0914,
            addr: "192.168.42.1".to_string(),
            port: 44444,
            id: id.to_string(),
            ..Default::default()
        }
    }

    async fn discovery(filter: Vec<u16>) -> (Discovery, Controller) {
        let (ctrl, _events) = Controller::new();
        let disc = Discovery::new("disc", Arc::new(NullBackend), ctrl.clone(), filter)
            .await
            .unwrap();
        (disc, ctrl)
    }

    #[tokio::test]
    async fn test_add_is_idempotent_per_run() {
        let (disc, ctrl) = discovery(Vec::new()).await;
        disc.start().await.unwrap();
        disc.add_device(report("anafi", "PI000")).await.unwrap();
        disc.add_device(report("anafi", "PI000")).await.unwrap();
        assert_eq!(ctrl.devices().await.len(), 1);
    }

    #[tokio::test]
    async fn test_double_start_is_busy() {
        let (disc, _ctrl) = discovery(Vec::new()).await;
        disc.start().await.unwrap();
        assert!(matches!(disc.start().await, Err(SdkError::Busy(_))));
        disc.stop().await.unwrap();
        assert!(matches!(disc.stop().await, Err(SdkError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_type_filter() {
        let (disc, ctrl) = discovery(vec![0x0920]).await;
        disc.add_device(report("anafi", "PI000")).await.unwrap();
        assert!(ctrl.devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_is_not_found() {
        let (disc, _ctrl) = discovery(Vec::new()).await;
        assert!(matches!(
            disc.remove_device(&report("anafi", "PI000")).await,
            Err(SdkError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiescence_removal() {
        let (disc, ctrl) = discovery(Vec::new()).await;
        disc.start().await.unwrap();
        disc.add_device(report("anafi", "PI000")).await.unwrap();

        // Refresh at 2 s: survives the 5 s mark measured from the start.
        tokio::time::sleep(Duration::from_secs(2)).await;
        disc.add_device(report("anafi", "PI000")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(ctrl.devices().await.len(), 1);

        // No refresh past the quiescence interval: removed.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(ctrl.devices().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_ages_out_previous_run() {
        let (disc, ctrl) = discovery(Vec::new()).await;
        disc.start().await.unwrap();
        disc.add_device(report("anafi", "PI000")).await.unwrap();
        disc.stop().await.unwrap();

        disc.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        // Stale run id: removed even though it was seen recently.
        assert!(ctrl.devices().await.is_empty());
    }
}
