//! CrashML retrieval
//!
//! Fetches crash reports from the device and deletes them remotely once
//! safely on disk. Reports exist in two remote forms: a directory of files,
//! or a single `.tar.gz` archive. Downloads land next to their final path
//! with a `_tmp` suffix and are renamed atomically on success; stale `_tmp`
//! leftovers are swept before every run.

use super::{status_to_result, sweep_stale_tmp, SessionSlot, TMP_SUFFIX};
use crate::device::Device;
use crate::ftp::{FtpConfig, FtpEntryKind, FtpItf, FTP_PORT_MEDIA};
use crate::Result;
use std::path::Path;
use tracing::{debug, info};

/// Remote folder holding crash reports
pub const CRASHML_DIR: &str = "/internal_000/crash";

/// Which remote report forms to fetch
#[derive(Debug, Clone, Copy)]
pub struct CrashmlFilter {
    pub dir: bool,
    pub targz: bool,
}

impl Default for CrashmlFilter {
    fn default() -> Self {
        Self {
            dir: true,
            targz: true,
        }
    }
}

impl CrashmlFilter {
    pub fn targz_only() -> Self {
        Self {
            dir: false,
            targz: true,
        }
    }
}

/// Crash report retrieval interface of one device
pub struct CrashmlItf {
    device: Device,
    ftp: FtpItf,
    server_port: u16,
    slot: SessionSlot,
}

impl CrashmlItf {
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

    async fn server(&self) -> Result<(String, u16)> {
        let device_type = self.device.info().await.device_type;
        let proxy = self.device.tcp_proxy(device_type, self.server_port).await?;
        Ok((proxy.addr, proxy.port))
    }

    /// Fetch every matching report into `local_dir`, deleting remotely
    ///
    /// Returns the number of reports downloaded.
    pub async fn download(&self, local_dir: &Path, filter: CrashmlFilter) -> Result<u32> {
        let _session = self.slot.acquire("crashml download")?;
        sweep_stale_tmp(local_dir).await?;
        tokio::fs::create_dir_all(local_dir).await?;
        let (addr, port) = self.server().await?;

        let result = self.ftp.list(&addr, port, CRASHML_DIR).wait().await;
        status_to_result(result.status)?;
        let entries = result.entries.unwrap_or_default();

        let mut count = 0;
        for entry in entries {
            match entry.kind {
                FtpEntryKind::Dir if filter.dir => {
                    self.fetch_report_dir(&addr, port, &entry.name, local_dir)
                        .await?;
                    count += 1;
                }
                FtpEntryKind::File
                    if filter.targz && entry.name.ends_with(".tar.gz") =>
                {
                    self.fetch_report_file(&addr, port, &entry.name, local_dir)
                        .await?;
                    count += 1;
                }
                _ => debug!("crashml: skipping '{}'", entry.name),
            }
        }
        Ok(count)
    }

    async fn fetch_report_file(
        &self,
        addr: &str,
        port: u16,
        name: &str,
        local_dir: &Path,
    ) -> Result<()> {
        let remote = format!("{CRASHML_DIR}/{name}");
        let tmp = local_dir.join(format!("{name}{TMP_SUFFIX}"));
        let final_path = local_dir.join(name);

        let result = self
            .ftp
            .get(addr, port, &remote, Some(tmp.clone()), false)
            .wait()
            .await;
        status_to_result(result.status)?;
        tokio::fs::rename(&tmp, &final_path).await?;

        let result = self.ftp.delete(addr, port, &remote).wait().await;
        status_to_result(result.status)?;
        info!("crashml: fetched '{}'", name);
        Ok(())
    }

    async fn fetch_report_dir(
        &self,
        addr: &str,
        port: u16,
        name: &str,
        local_dir: &Path,
    ) -> Result<()> {
        let remote_dir = format!("{CRASHML_DIR}/{name}");
        let tmp_dir = local_dir.join(format!("{name}{TMP_SUFFIX}"));
        let final_dir = local_dir.join(name);
        tokio::fs::create_dir_all(&tmp_dir).await?;

        let result = self.ftp.list(addr, port, &remote_dir).wait().await;
        status_to_result(result.status)?;
        for entry in result.entries.unwrap_or_default() {
            if entry.kind != FtpEntryKind::File {
                continue;
            }
            let remote = format!("{remote_dir}/{}", entry.name);
            let local = tmp_dir.join(&entry.name);
            let result = self
                .ftp
                .get(addr, port, &remote, Some(local), false)
                .wait()
                .await;
            status_to_result(result.status)?;
            let result = self.ftp.delete(addr, port, &remote).wait().await;
            status_to_result(result.status)?;
        }

        tokio::fs::rename(&tmp_dir, &final_dir).await?;
        // Trailing slash selects directory deletion.
        let result = self
            .ftp
            .delete(addr, port, &format!("{remote_dir}/"))
            .wait()
            .await;
        status_to_result(result.status)?;
        info!("crashml: fetched report directory '{}'", name);
        Ok(())
    }

    pub async fn cancel_all(&self) {
        self.ftp.cancel_all().await;
    }

    pub async fn stop(&self) {
        self.ftp.stop().await;
    }
}
