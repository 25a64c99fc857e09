//! Net discovery
//!
//! Polls a device's discovery port over TCP. The device pushes one JSON
//! object per connection:
//!
//! ```json
//! {
//!     "device_type": "0x0914",
//!     "device_id": "PI040384...",
//!     "device_name": "ANAFI-0000000",
//!     "device_port": 44444
//! }
//! ```
//!
//! Extra fields are kept verbatim on the device. The poll repeats every few
//! seconds; the run-id core ages the device out once it stops answering.

use super::{DiscoveredDevice, Discovery};
use crate::device::ApiCapability;
use crate::{Result, SdkError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default TCP port a device answers discovery on
pub const DISCOVERY_PORT: u16 = 44444;

/// Delay between two discovery polls
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// TCP JSON discovery towards one device address
pub struct NetDiscovery {
    core: Discovery,
    addr: String,
    port: u16,
    poll: Mutex<Option<JoinHandle<()>>>,
}

impl NetDiscovery {
    pub fn new(core: Discovery, addr: impl Into<String>, port: u16) -> Arc<Self> {
        Arc::new(Self {
            core,
            addr: addr.into(),
            port,
            poll: Mutex::new(None),
        })
    }

    pub fn core(&self) -> &Discovery {
        &self.core
    }

    /// Start the run and the poll loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.core.start().await?;
        let this = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match this.poll_once().await {
                    Ok(()) => {}
                    Err(e) => debug!(
                        "discovery '{}': poll of {}:{} failed: {}",
                        this.core.name(),
                        this.addr,
                        this.port,
                        e
                    ),
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });
        *self.poll.lock().await = Some(task);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(task) = self.poll.lock().await.take() {
            task.abort();
        }
        self.core.stop().await
    }

    async fn poll_once(&self) -> Result<()> {
        let mut stream = TcpStream::connect((self.addr.as_str(), self.port))
            .await
            .map_err(|e| SdkError::from_io_error(e, "connecting discovery socket"))?;

        let mut bytes = Vec::new();
        let json: Value = loop {
            let mut buf = [0u8; 4096];
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| SdkError::from_io_error(e, "reading discovery data"))?;
            if n == 0 {
                if bytes.is_empty() {
                    return Err(SdkError::io_failed(-1, "device closed without data"));
                }
                break serde_json::from_slice(&bytes)?;
            }
            bytes.extend_from_slice(&buf[..n]);
            let trimmed: Vec<u8> = bytes.iter().copied().filter(|&b| b != 0).collect();
            if let Ok(value) = serde_json::from_slice::<Value>(&trimmed) {
                break value;
            }
        };

        let report = match parse_device_json(&json, &self.addr) {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    "discovery '{}': bad device json from {}: {}",
                    self.core.name(),
                    self.addr,
                    e
                );
                return Err(e);
            }
        };
        self.core.add_device(report).await
    }
}

/// Parse the device-pushed discovery object
fn parse_device_json(json: &Value, addr: &str) -> Result<DiscoveredDevice> {
    let type_str = json
        .get("device_type")
        .and_then(Value::as_str)
        .ok_or_else(|| SdkError::invalid_argument("missing device_type"))?;
    let device_type = parse_hex_u16(type_str)?;

    let name = json
        .get("device_name")
        .and_then(Value::as_str)
        .ok_or_else(|| SdkError::invalid_argument("missing device_name"))?
        .to_string();
    let id = json
        .get("device_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let port = json
        .get("device_port")
        .and_then(Value::as_u64)
        .filter(|&p| p > 0 && p <= u16::MAX as u64)
        .ok_or_else(|| SdkError::invalid_argument("missing device_port"))? as u16;

    Ok(DiscoveredDevice {
        name,
        device_type,
        addr: addr.to_string(),
        port,
        id,
        api: ApiCapability::Full,
        raw_json: Some(json.clone()),
    })
}

fn parse_hex_u16(s: &str) -> Result<u16> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u16::from_str_radix(digits, 16)
        .map_err(|_| SdkError::invalid_argument(format!("bad device_type '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_device_json() {
        let json = json!({
            "device_type": "0x0914",
            "device_id": "PI000",
            "device_name": "ANAFI-0000000",
            "device_port": 44444,
            "vendor_field": true,
        });
        let report = parse_device_json(&json, "192.168.42.1").unwrap();
        assert_eq!(report.device_type, 0x0914);
        assert_eq!(report.name, "ANAFI-0000000");
        assert_eq!(report.port, 44444);
        assert_eq!(report.addr, "192.168.42.1");
        // Vendor fields survive in the raw blob.
        assert_eq!(report.raw_json.unwrap()["vendor_field"], true);
    }

    #[test]
    fn test_parse_hex_without_prefix() {
        assert_eq!(parse_hex_u16("0914").unwrap(), 0x0914);
        assert!(parse_hex_u16("zz").is_err());
    }

    #[test]
    fn test_missing_fields_rejected() {
        let json = json!({"device_type": "0x0914"});
        assert!(parse_device_json(&json, "1.2.3.4").is_err());
    }
}
