//! Ephemeris upload
//!
//! Pushes GNSS ephemeris data to the device so it can fix faster. The
//! remote copy carries an `.md5` sidecar; when the sidecar matches the
//! local file's digest the upload is skipped entirely.

use super::{status_to_result, SessionSlot};
use crate::device::Device;
use crate::ftp::{FtpConfig, FtpItf, FtpStatus, PutSource, FTP_PORT_MEDIA};
use crate::Result;
use bytes::Bytes;
use md5::{Digest, Md5};
use std::path::Path;
use tracing::{debug, info};

/// Remote folder holding ephemeris data
pub const EPHEMERIS_DIR: &str = "/internal_000/ephemeris";

/// What an upload ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EphemerisOutcome {
    Uploaded,
    /// The remote sidecar already matches the local file
    UpToDate,
}

/// Ephemeris upload interface of one device
pub struct EphemerisItf {
    device: Device,
    ftp: FtpItf,
    server_port: u16,
    slot: SessionSlot,
}

impl EphemerisItf {
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

    /// Upload `local` unless the device already holds the same bytes
    pub async fn upload(&self, local: &Path) -> Result<EphemerisOutcome> {
        let _session = self.slot.acquire("ephemeris upload")?;

        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| crate::SdkError::invalid_argument("bad ephemeris path"))?
            .to_string();
        let digest = md5_of_file(local).await?;

        let device_type = self.device.info().await.device_type;
        let proxy = self.device.tcp_proxy(device_type, self.server_port).await?;
        let (addr, port) = (proxy.addr, proxy.port);

        let remote = format!("{EPHEMERIS_DIR}/{file_name}");
        let remote_md5 = format!("{remote}.md5");

        // Compare against the remote sidecar first.
        let result = self.ftp.get(&addr, port, &remote_md5, None, false).wait().await;
        if result.status == FtpStatus::Ok {
            let remote_digest = result
                .data
                .map(|d| String::from_utf8_lossy(&d).trim().to_string())
                .unwrap_or_default();
            if remote_digest == digest {
                info!("ephemeris: '{}' already up to date", file_name);
                return Ok(EphemerisOutcome::UpToDate);
            }
            debug!(
                "ephemeris: digest mismatch (remote {}, local {})",
                remote_digest, digest
            );
        }

        let result = self
            .ftp
            .put(
                &addr,
                port,
                &remote,
                PutSource::File(local.to_path_buf()),
                false,
            )
            .wait()
            .await;
        status_to_result(result.status)?;

        let result = self
            .ftp
            .put(
                &addr,
                port,
                &remote_md5,
                PutSource::Buffer(Bytes::from(digest.into_bytes())),
                false,
            )
            .wait()
            .await;
        status_to_result(result.status)?;

        info!("ephemeris: uploaded '{}'", file_name);
        Ok(EphemerisOutcome::Uploaded)
    }

    pub async fn cancel_all(&self) {
        self.ftp.cancel_all().await;
    }

    pub async fn stop(&self) {
        self.ftp.stop().await;
    }
}

/// Hex MD5 digest of a file, read in chunks
pub async fn md5_of_file(path: &Path) -> Result<String> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut chunk = vec![0u8; 128 * 1024];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_md5_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eph.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();
        assert_eq!(
            md5_of_file(&path).await.unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }
}
