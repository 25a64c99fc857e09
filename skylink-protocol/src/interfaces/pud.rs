//! PUD retrieval
//!
//! Same sweep-fetch-rename-delete cycle as flight logs, for the piloting
//! usage data files the device accumulates per flight.

use super::{status_to_result, sweep_stale_tmp, SessionSlot, TMP_SUFFIX};
use crate::device::Device;
use crate::ftp::{FtpConfig, FtpEntryKind, FtpItf, FTP_PORT_MEDIA};
use crate::Result;
use std::path::Path;
use tracing::info;

/// Remote folder holding PUD files
pub const PUD_DIR: &str = "/internal_000/pud";

/// PUD retrieval interface of one device
pub struct PudItf {
    device: Device,
    ftp: FtpItf,
    server_port: u16,
    slot: SessionSlot,
}

impl PudItf {
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

    /// Fetch every PUD into `local_dir`; returns the count
    pub async fn download(&self, local_dir: &Path) -> Result<u32> {
        let _session = self.slot.acquire("pud download")?;
        sweep_stale_tmp(local_dir).await?;
        tokio::fs::create_dir_all(local_dir).await?;

        let device_type = self.device.info().await.device_type;
        let proxy = self.device.tcp_proxy(device_type, self.server_port).await?;
        let (addr, port) = (proxy.addr, proxy.port);

        let result = self.ftp.list(&addr, port, PUD_DIR).wait().await;
        status_to_result(result.status)?;

        let mut count = 0;
        for entry in result.entries.unwrap_or_default() {
            if entry.kind != FtpEntryKind::File || !entry.name.ends_with(".pud") {
                continue;
            }
            let remote = format!("{PUD_DIR}/{}", entry.name);
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
            info!("pud: fetched '{}'", entry.name);
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
