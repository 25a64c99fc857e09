//! Firmware update
//!
//! Uploads a firmware image to the device over one of two transports:
//!
//! - **ftp**: MD5 sidecar first, then the image to `<name>.tmp`, renamed to
//!   its final name only once fully transferred;
//! - **mux**: an update request on the update channel, then sequentially
//!   numbered 128 KiB chunks, each acknowledged by id before the next one
//!   leaves, closed by a final status message.
//!
//! Firmware-image parsing itself is external; callers hand in a
//! [`FirmwareInfo`] and the interface refuses images that do not match the
//! target device.

use super::{status_to_result, SessionSlot};
use crate::device::Device;
use crate::ftp::{FtpConfig, FtpItf, PutSource, FTP_PORT_UPDATE};
use crate::mux::{MuxEvent, MuxMsg, CHANNEL_UPDATE};
use crate::{Result, SdkError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::json;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// Update request: `{name, md5, size}` JSON body
pub const MSG_UPDATE_REQ: u32 = 1;
/// Update response: `{status}` JSON body
pub const MSG_UPDATE_RESP: u32 = 2;
/// One firmware chunk: u32 chunk id + bytes
pub const MSG_UPDATE_CHUNK: u32 = 3;
/// Ack of one chunk: u32 chunk id
pub const MSG_UPDATE_CHUNK_ACK: u32 = 4;
/// Final update status: `{result}` JSON body
pub const MSG_UPDATE_STATUS: u32 = 5;

/// Firmware chunk size on the mux transport
pub const UPDATE_CHUNK_SIZE: usize = 128 * 1024;

/// Remote folder the ftp transport uploads into
pub const UPDATE_DIR: &str = "/internal_000/update";

/// Pre-parsed description of a firmware image
#[derive(Debug, Clone)]
pub struct FirmwareInfo {
    /// Firmware version string, e.g. `1.8.0`
    pub version: String,

    /// Device-type code the image is built for
    pub device_type: u16,

    /// Hex MD5 of the image bytes
    pub md5_hex: String,

    /// Image size in bytes
    pub size: u64,
}

/// Firmware update interface of one device
pub struct UpdaterItf {
    device: Device,
    ftp: FtpItf,
    server_port: u16,
    slot: SessionSlot,
}

impl UpdaterItf {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            ftp: FtpItf::new(FtpConfig::default()),
            server_port: FTP_PORT_UPDATE,
            slot: SessionSlot::default(),
        }
    }

    /// Use a non-standard update server port
    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    async fn check_compatible(&self, info: &FirmwareInfo) -> Result<()> {
        let device_type = self.device.info().await.device_type;
        if info.device_type != device_type {
            return Err(SdkError::invalid_argument(format!(
                "firmware targets type {:#06x}, device is {:#06x}",
                info.device_type, device_type
            )));
        }
        Ok(())
    }

    /// Upload over FTP: sidecar, `.tmp` image, atomic rename
    pub async fn upload_ftp(&self, image: &Path, info: &FirmwareInfo) -> Result<()> {
        let _session = self.slot.acquire("firmware upload")?;
        self.check_compatible(info).await?;

        let file_name = image
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SdkError::invalid_argument("bad firmware path"))?
            .to_string();
        let device_type = self.device.info().await.device_type;
        let proxy = self.device.tcp_proxy(device_type, self.server_port).await?;
        let (addr, port) = (proxy.addr, proxy.port);

        let final_path = format!("{UPDATE_DIR}/{file_name}");
        let tmp_path = format!("{final_path}.tmp");

        let result = self
            .ftp
            .put(
                &addr,
                port,
                &format!("{final_path}.md5"),
                PutSource::Buffer(Bytes::from(info.md5_hex.clone().into_bytes())),
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
                &tmp_path,
                PutSource::File(image.to_path_buf()),
                false,
            )
            .wait()
            .await;
        status_to_result(result.status)?;

        let result = self
            .ftp
            .rename(&addr, port, &tmp_path, &file_name)
            .wait()
            .await;
        status_to_result(result.status)?;

        info!("updater: uploaded '{}' over ftp", file_name);
        Ok(())
    }

    /// Upload over the mux update channel
    pub async fn upload_mux(&self, image: &Path, info: &FirmwareInfo) -> Result<()> {
        let _session = self.slot.acquire("firmware upload")?;
        self.check_compatible(info).await?;

        let mux = self
            .device
            .backend()
            .mux_context()
            .ok_or_else(|| SdkError::Unsupported("device has no mux link".into()))?;
        let file_name = image
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SdkError::invalid_argument("bad firmware path"))?;

        let mut channel = mux.open_channel(CHANNEL_UPDATE).await?;
        let teardown = |mux: std::sync::Arc<crate::mux::MuxContext>| async move {
            mux.close_channel(CHANNEL_UPDATE).await.ok();
        };

        let request = json!({
            "name": file_name,
            "md5": info.md5_hex,
            "size": info.size,
        });
        let msg = MuxMsg::new(MSG_UPDATE_REQ, Bytes::from(serde_json::to_vec(&request)?));
        mux.send(CHANNEL_UPDATE, &msg.to_bytes()).await?;

        // The peer must accept before the first chunk leaves.
        let accept = recv_msg(&mut channel).await?;
        if accept.msg_id != MSG_UPDATE_RESP {
            teardown(mux).await;
            return Err(SdkError::io_failed(-1, "unexpected update message"));
        }
        let status = serde_json::from_slice::<serde_json::Value>(&accept.payload)?
            .get("status")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(-1);
        if status != 0 {
            teardown(mux).await;
            return Err(SdkError::Rejected(status as i32));
        }

        let mut file = tokio::fs::File::open(image).await?;
        let mut chunk = vec![0u8; UPDATE_CHUNK_SIZE];
        let mut chunk_id: u32 = 0;
        let mut sent: u64 = 0;
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            let mut payload = BytesMut::with_capacity(4 + n);
            payload.put_u32_le(chunk_id);
            payload.extend_from_slice(&chunk[..n]);
            let msg = MuxMsg::new(MSG_UPDATE_CHUNK, payload.freeze());
            mux.send(CHANNEL_UPDATE, &msg.to_bytes()).await?;
            sent += n as u64;
            debug!("updater: sent chunk {} ({} bytes)", chunk_id, n);

            // Per-chunk ack carries the same id; a mismatch aborts.
            let ack = recv_msg(&mut channel).await?;
            if ack.msg_id != MSG_UPDATE_CHUNK_ACK || ack.payload.len() < 4 {
                teardown(mux).await;
                return Err(SdkError::io_failed(-1, "bad chunk ack"));
            }
            let mut acked_bytes = &ack.payload[..4];
            let acked = acked_bytes.get_u32_le();
            if acked != chunk_id {
                teardown(mux).await;
                return Err(SdkError::io_failed(
                    -1,
                    format!("chunk id mismatch: {acked} != {chunk_id}"),
                ));
            }
            chunk_id += 1;
        }

        let status_msg = recv_msg(&mut channel).await?;
        teardown(mux).await;
        if status_msg.msg_id != MSG_UPDATE_STATUS {
            return Err(SdkError::io_failed(-1, "missing final update status"));
        }
        let result = serde_json::from_slice::<serde_json::Value>(&status_msg.payload)?
            .get("result")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(-1);
        if result != 0 {
            return Err(SdkError::io_failed(result as i32, "update refused by device"));
        }

        info!(
            "updater: uploaded '{}' over mux ({} bytes, {} chunks)",
            file_name, sent, chunk_id
        );
        Ok(())
    }

    pub async fn cancel_all(&self) {
        self.ftp.cancel_all().await;
    }

    pub async fn stop(&self) {
        self.ftp.stop().await;
    }
}

async fn recv_msg(channel: &mut crate::mux::MuxChannel) -> Result<MuxMsg> {
    match channel.recv().await {
        Some(MuxEvent::Data(data)) => MuxMsg::from_bytes(&data),
        Some(MuxEvent::Reset) | None => Err(SdkError::Canceled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::MuxContext;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    async fn linked_pair() -> (Arc<MuxContext>, Arc<MuxContext>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, client) = tokio::join!(listener.accept(), client);
        (
            MuxContext::new(server.unwrap().0),
            MuxContext::new(client.unwrap()),
        )
    }

    /// Device side of the mux update dialogue, checking chunk sequencing
    async fn spawn_update_peer(ctx: Arc<MuxContext>, expected_size: u64) {
        let mut channel = ctx.open_channel(CHANNEL_UPDATE).await.unwrap();
        tokio::spawn(async move {
            let req = match channel.recv().await {
                Some(MuxEvent::Data(data)) => MuxMsg::from_bytes(&data).unwrap(),
                other => panic!("expected update request, got {other:?}"),
            };
            assert_eq!(req.msg_id, MSG_UPDATE_REQ);
            let body: serde_json::Value = serde_json::from_slice(&req.payload).unwrap();
            assert_eq!(body["size"].as_u64(), Some(expected_size));

            let resp = MuxMsg::new(
                MSG_UPDATE_RESP,
                Bytes::from(serde_json::to_vec(&json!({"status": 0})).unwrap()),
            );
            ctx.send(CHANNEL_UPDATE, &resp.to_bytes()).await.unwrap();

            let mut received: u64 = 0;
            let mut expected_id: u32 = 0;
            while received < expected_size {
                let chunk = match channel.recv().await {
                    Some(MuxEvent::Data(data)) => MuxMsg::from_bytes(&data).unwrap(),
                    other => panic!("expected chunk, got {other:?}"),
                };
                assert_eq!(chunk.msg_id, MSG_UPDATE_CHUNK);
                let mut id_bytes = &chunk.payload[..4];
                let id = id_bytes.get_u32_le();
                assert_eq!(id, expected_id);
                received += (chunk.payload.len() - 4) as u64;

                let mut ack = BytesMut::new();
                ack.put_u32_le(id);
                let msg = MuxMsg::new(MSG_UPDATE_CHUNK_ACK, ack.freeze());
                ctx.send(CHANNEL_UPDATE, &msg.to_bytes()).await.unwrap();
                expected_id += 1;
            }

            let done = MuxMsg::new(
                MSG_UPDATE_STATUS,
                Bytes::from(serde_json::to_vec(&json!({"result": 0})).unwrap()),
            );
            ctx.send(CHANNEL_UPDATE, &done.to_bytes()).await.unwrap();
        });
    }

    #[tokio::test]
    async fn test_mux_upload_chunked() {
        use crate::backend::{BackendCapabilities, MuxBackend};
        use crate::device::{Device, DeviceInfo};

        let (device_ctx, ctl_ctx) = linked_pair().await;

        // Firmware bigger than one chunk to exercise sequencing.
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("anafi_1.8.0.puf");
        let bytes = vec![0x5a; UPDATE_CHUNK_SIZE + 1000];
        tokio::fs::write(&image, &bytes).await.unwrap();

        spawn_update_peer(device_ctx, bytes.len() as u64).await;

        let backend = Arc::new(MuxBackend::new(
            "mux",
            BackendCapabilities::default(),
            ctl_ctx,
        ));
        let device = Device::new(
            1,
            backend,
            DeviceInfo {
                name: "anafi".to_string(),
                device_type: 0x0914,
                ..Default::default()
            },
            None,
            0,
            None,
        );

        let updater = UpdaterItf::new(device);
        let info = FirmwareInfo {
            version: "1.8.0".to_string(),
            device_type: 0x0914,
            md5_hex: "00".repeat(16),
            size: bytes.len() as u64,
        };
        updater.upload_mux(&image, &info).await.unwrap();
    }

    #[tokio::test]
    async fn test_incompatible_firmware_is_refused() {
        let (_device_ctx, ctl_ctx) = linked_pair().await;
        use crate::backend::{BackendCapabilities, MuxBackend};
        use crate::device::{Device, DeviceInfo};

        let backend = Arc::new(MuxBackend::new(
            "mux",
            BackendCapabilities::default(),
            ctl_ctx,
        ));
        let device = Device::new(
            1,
            backend,
            DeviceInfo {
                device_type: 0x0914,
                name: "anafi".to_string(),
                ..Default::default()
            },
            None,
            0,
            None,
        );
        let updater = UpdaterItf::new(device);
        let info = FirmwareInfo {
            version: "1.8.0".to_string(),
            device_type: 0x0920,
            md5_hex: String::new(),
            size: 0,
        };
        assert!(matches!(
            updater.upload_mux(Path::new("/nonexistent"), &info).await,
            Err(SdkError::InvalidArgument(_))
        ));
    }
}
