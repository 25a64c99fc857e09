//! Flight-log retrieval
//!
//! Downloads `log-*.bin` files from the device's log folder, one at a time:
//! fetch to `<name>_tmp`, atomically rename to the final path, then delete
//! the remote file. Stale `_tmp` entries are swept before every run.

use super::{status_to_result, sweep_stale_tmp, SessionSlot, TMP_SUFFIX};
use crate::device::Device;
use crate::ftp::{FtpConfig, FtpEntryKind, FtpItf, FTP_PORT_MEDIA};
use crate::Result;
use std::path::Path;
use tracing::{debug, info};

/// Remote folder holding flight logs
pub const FLIGHT_LOG_DIR: &str = "/internal_000/flight_logs";

/// File-name pattern of a flight log
pub fn is_flight_log_name(name: &str) -> bool {
    name.starts_with("log-") && name.ends_with(".bin")
}

/// Flight-log retrieval interface of one device
pub struct FlightLogItf {
    device: Device,
    ftp: FtpItf,
    server_port: u16,
    slot: SessionSlot,
}

impl FlightLogItf {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            ftp: FtpItf::new(FtpConfig::default()),
            server_port: FTP_PORT_MEDIA,
            slot: SessionSlot::default(),
        }
    }

    /// Use a non-standard server port
    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    /// Fetch every flight log into `local_dir`; returns the count
    pub async fn download(&self, local_dir: &Path) -> Result<u32> {
        let _session = self.slot.acquire("flight-log download")?;
        sweep_stale_tmp(local_dir).await?;
        tokio::fs::create_dir_all(local_dir).await?;

        let device_type = self.device.info().await.device_type;
        let proxy = self.device.tcp_proxy(device_type, self.server_port).await?;
        let (addr, port) = (proxy.addr, proxy.port);

        let result = self.ftp.list(&addr, port, FLIGHT_LOG_DIR).wait().await;
        status_to_result(result.status)?;

        let mut count = 0;
        for entry in result.entries.unwrap_or_default() {
            if entry.kind != FtpEntryKind::File || !is_flight_log_name(&entry.name) {
                debug!("flight-log: skipping '{}'", entry.name);
                continue;
            }
            let remote = format!("{FLIGHT_LOG_DIR}/{}", entry.name);
            let tmp = local_dir.join(format!("{}{TMP_SUFFIX}", entry.name));
            let final_path = local_dir.join(&entry.name);

            let result = self
                .ftp
                .get(&addr, port, &remote, Some(tmp.clone()), false)
                .wait()
                .await;
            status_to_result(result.status)?;
            tokio::fs::rename(&tmp, &final_path).await?;

            let result = self.ftp.delete(&addr, port, &remote).wait().await;
            status_to_result(result.status)?;
            info!("flight-log: fetched '{}'", entry.name);
            count += 1;
        }
        Ok(count)
    }

    pub async fn cancel_all(&self) {
        self.ftp.cancel_all().await;
    }

    pub async fn stop(&self) {
        self.ftp.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flight_log_name_pattern() {
        assert!(is_flight_log_name("log-000123.bin"));
        assert!(!is_flight_log_name("log-000123.tmp"));
        assert!(!is_flight_log_name("notes.bin"));
    }
}
