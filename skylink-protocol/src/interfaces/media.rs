//! Media interface
//!
//! Browses the device's media store over FTP, parses media file names into
//! structured records, downloads by resource and deletes whole medias.
//!
//! ## Naming convention
//!
//! Media files are named `<product>_<datetime>_<runid>.<ext>`, with the
//! datetime as `%Y-%m-%dT%H%M%S` plus an optional `+hhmm` timezone suffix,
//! e.g. `ANAFI_2019-07-15T130415+0200_8657F0A2.jpg`. Every media carries a
//! thumbnail resource whose path is synthesised from the media name under
//! the thumbnail folder.

use super::{status_to_result, SessionSlot};
use crate::device::Device;
use crate::ftp::{FtpConfig, FtpEntryKind, FtpItf, FtpStatus, FTP_PORT_MEDIA};
use crate::Result;
use bytes::Bytes;
use chrono::NaiveDateTime;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Root folder of the on-device media store
pub const MEDIA_DIR: &str = "/internal_000/media";
/// Folder holding pre-computed thumbnails
pub const THUMB_DIR: &str = "/internal_000/thumb";

/// Broad media classification derived from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Photo,
    Video,
    Unknown,
}

impl MediaType {
    fn from_ext(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "dng" => MediaType::Photo,
            "mp4" | "mov" => MediaType::Video,
            _ => MediaType::Unknown,
        }
    }
}

/// Role of a resource within a media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaResKind {
    Media,
    Thumbnail,
}

/// One downloadable resource of a media
#[derive(Debug, Clone)]
pub struct MediaResource {
    pub kind: MediaResKind,
    /// Remote path on the media server
    pub path: String,
    pub size: u64,
}

/// One media with its resources
#[derive(Debug, Clone)]
pub struct Media {
    /// Full media file name
    pub name: String,

    /// Run id encoded in the file name
    pub runid: String,

    /// Classification derived from the file extension
    pub media_type: MediaType,

    /// Capture time parsed from the file name, when well-formed
    pub date: Option<NaiveDateTime>,

    /// Downloadable resources, the media itself first
    pub resources: Vec<MediaResource>,
}

/// Parsed pieces of a media file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaName {
    /// Product prefix, e.g. `ANAFI`
    pub product: String,

    /// Capture time, when the datetime part parsed
    pub date: Option<NaiveDateTime>,

    /// Run id part
    pub runid: String,

    /// File extension, without the dot
    pub ext: String,
}

/// Parse `<product>_<datetime>_<runid>.<ext>`
pub fn parse_media_name(name: &str) -> Option<MediaName> {
    let (stem, ext) = name.rsplit_once('.')?;
    let mut parts = stem.splitn(3, '_');
    let product = parts.next()?;
    let date_str = parts.next()?;
    let runid = parts.next()?;
    if product.is_empty() || runid.is_empty() {
        return None;
    }
    Some(MediaName {
        product: product.to_string(),
        date: parse_media_date(date_str),
        runid: runid.to_string(),
        ext: ext.to_string(),
    })
}

/// Parse the datetime part, tolerating a missing timezone suffix
fn parse_media_date(s: &str) -> Option<NaiveDateTime> {
    // With timezone: 2019-07-15T130415+0200 (offset dropped, local time kept)
    for sign in ['+', '-'] {
        if let Some(pos) = s.rfind(sign) {
            if pos > 10 {
                if let Ok(date) = NaiveDateTime::parse_from_str(&s[..pos], "%Y-%m-%dT%H%M%S") {
                    return Some(date);
                }
            }
        }
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H%M%S").ok()
}

/// Media request interface of one device
pub struct MediaItf {
    device: Device,
    ftp: FtpItf,
    server_port: u16,
    list_slot: SessionSlot,
    download_slot: SessionSlot,
    delete_slot: SessionSlot,
}

impl MediaItf {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            ftp: FtpItf::new(FtpConfig::default()),
            server_port: FTP_PORT_MEDIA,
            list_slot: SessionSlot::default(),
            download_slot: SessionSlot::default(),
            delete_slot: SessionSlot::default(),
        }
    }

    /// Use a non-standard media server port
    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    async fn server(&self) -> Result<(String, u16)> {
        let device_type = self.device.info().await.device_type;
        let proxy = self.device.tcp_proxy(device_type, self.server_port).await?;
        Ok((proxy.addr, proxy.port))
    }

    /// List medias on the device
    pub async fn list(&self) -> Result<Vec<Media>> {
        let _session = self.list_slot.acquire("media list")?;
        let (addr, port) = self.server().await?;

        let result = self.ftp.list(&addr, port, MEDIA_DIR).wait().await;
        status_to_result(result.status)?;
        let entries = result.entries.unwrap_or_default();

        let mut medias = Vec::new();
        for entry in entries {
            if entry.kind != FtpEntryKind::File {
                continue;
            }
            let Some(parsed) = parse_media_name(&entry.name) else {
                debug!("media: skipping unrecognized file '{}'", entry.name);
                continue;
            };
            medias.push(Media {
                name: entry.name.clone(),
                runid: parsed.runid,
                media_type: MediaType::from_ext(&parsed.ext),
                date: parsed.date,
                resources: vec![
                    MediaResource {
                        kind: MediaResKind::Media,
                        path: format!("{MEDIA_DIR}/{}", entry.name),
                        size: entry.size,
                    },
                    MediaResource {
                        kind: MediaResKind::Thumbnail,
                        path: format!("{THUMB_DIR}/{}.jpg", entry.name),
                        size: 0,
                    },
                ],
            });
        }
        Ok(medias)
    }

    /// Download one resource, to a file or into memory
    pub async fn download(
        &self,
        resource: &MediaResource,
        dest: Option<PathBuf>,
    ) -> Result<Option<Bytes>> {
        let _session = self.download_slot.acquire("media download")?;
        let (addr, port) = self.server().await?;
        let result = self
            .ftp
            .get(&addr, port, &resource.path, dest, false)
            .wait()
            .await;
        status_to_result(result.status)?;
        Ok(result.data)
    }

    /// Delete a media: one FTP delete per resource
    ///
    /// A missing thumbnail is not an error; the media resource itself must
    /// delete cleanly.
    pub async fn delete(&self, media: &Media) -> Result<()> {
        let _session = self.delete_slot.acquire("media delete")?;
        let (addr, port) = self.server().await?;
        for resource in &media.resources {
            let result = self.ftp.delete(&addr, port, &resource.path).wait().await;
            match (resource.kind, result.status) {
                (_, FtpStatus::Ok) => {}
                (MediaResKind::Thumbnail, FtpStatus::Failed(code)) => {
                    warn!(
                        "media: thumbnail delete failed with {} for '{}'",
                        code, resource.path
                    );
                }
                (_, status) => return status_to_result(status),
            }
        }
        Ok(())
    }

    /// Cancel in-flight media requests
    pub async fn cancel_all(&self) {
        self.ftp.cancel_all().await;
    }

    /// Abort everything; pending requests report `Aborted`
    pub async fn stop(&self) {
        self.ftp.stop().await;
    }
}
