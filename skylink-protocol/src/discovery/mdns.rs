//! mDNS discovery
//!
//! Browses `_arsdk-<type>._udp.local.` services, one service type per
//! device-type code in the filter. Resolved services become device reports;
//! removal events and the run-id sweep both retire devices.

use super::{DiscoveredDevice, Discovery};
use crate::device::ApiCapability;
use crate::{Result, SdkError};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Service-type string for one device-type code
pub fn service_type(device_type: u16) -> String {
    format!("_arsdk-{device_type:04x}._udp.local.")
}

/// Device-type code back out of a service-type string
fn device_type_of(service: &str) -> Option<u16> {
    let hex = service.strip_prefix("_arsdk-")?.get(..4)?;
    u16::from_str_radix(hex, 16).ok()
}

/// mDNS service browser feeding a discovery core
pub struct MdnsDiscovery {
    core: Discovery,
    device_types: Vec<u16>,
    daemon: Mutex<Option<ServiceDaemon>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MdnsDiscovery {
    /// `device_types` must name at least one type to browse for
    pub fn new(core: Discovery, device_types: Vec<u16>) -> Result<Arc<Self>> {
        if device_types.is_empty() {
            return Err(SdkError::invalid_argument(
                "mdns discovery needs at least one device type",
            ));
        }
        Ok(Arc::new(Self {
            core,
            device_types,
            daemon: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn core(&self) -> &Discovery {
        &self.core
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.core.start().await?;

        let daemon = ServiceDaemon::new()
            .map_err(|e| SdkError::io_failed(-1, format!("mdns daemon: {e}")))?;

        let mut tasks = self.tasks.lock().await;
        for &device_type in &self.device_types {
            let service = service_type(device_type);
            let receiver = daemon
                .browse(&service)
                .map_err(|e| SdkError::io_failed(-1, format!("mdns browse: {e}")))?;
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Ok(event) = receiver.recv_async().await {
                    this.handle_event(event).await;
                }
            }));
        }
        *self.daemon.lock().await = Some(daemon);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(daemon) = self.daemon.lock().await.take() {
            daemon.shutdown().ok();
        }
        self.core.stop().await
    }

    async fn handle_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some(device_type) = device_type_of(&info.ty_domain) else {
                    warn!("mdns: unparsable service type '{}'", info.ty_domain);
                    return;
                };
                let Some(addr) = info.get_addresses().iter().next().cloned() else {
                    debug!("mdns: service '{}' has no address", info.get_fullname());
                    return;
                };
                let name = info
                    .get_fullname()
                    .split('.')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let id = info
                    .get_property_val_str("device_id")
                    .unwrap_or_default()
                    .to_string();
                let report = DiscoveredDevice {
                    name,
                    device_type,
                    addr: addr.to_string(),
                    port: info.get_port(),
                    id,
                    api: ApiCapability::Full,
                    raw_json: None,
                };
                if let Err(e) = self.core.add_device(report).await {
                    warn!("mdns: add device failed: {}", e);
                }
            }
            ServiceEvent::ServiceRemoved(service, fullname) => {
                let Some(device_type) = device_type_of(&service) else {
                    return;
                };
                let name = fullname.split('.').next().unwrap_or_default().to_string();
                let report = DiscoveredDevice {
                    name,
                    device_type,
                    ..Default::default()
                };
                // Not-found is normal here: the sweep may have won the race.
                self.core.remove_device(&report).await.ok();
            }
            other => debug!("mdns: ignoring event {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_roundtrip() {
        let service = service_type(0x0914);
        assert_eq!(service, "_arsdk-0914._udp.local.");
        assert_eq!(device_type_of(&service), Some(0x0914));
        assert_eq!(device_type_of("_http._tcp.local."), None);
    }
}
