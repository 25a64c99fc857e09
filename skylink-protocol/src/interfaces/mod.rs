//! Request interfaces
//!
//! Higher-level sub-services composed from the FTP engine and mux
//! primitives: media browsing, crash and flight-log retrieval, PUD
//! retrieval, ephemeris upload, firmware update and blackbox telemetry.
//!
//! They all share one pattern: a single session of a given kind per device
//! at a time (a second concurrent session of the same kind fails with
//! `Busy`), and completion reported exactly once per request.

pub mod blackbox;
pub mod crashml;
pub mod ephemeris;
pub mod flight_log;
pub mod media;
pub mod pud;
pub mod updater;

use crate::ftp::FtpStatus;
use crate::{Result, SdkError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use blackbox::{BlackboxEvent, BlackboxItf, RcPilotingInfo};
pub use crashml::{CrashmlFilter, CrashmlItf};
pub use ephemeris::{EphemerisItf, EphemerisOutcome};
pub use flight_log::FlightLogItf;
pub use media::{Media, MediaItf, MediaResKind, MediaResource, MediaType};
pub use pud::PudItf;
pub use updater::{FirmwareInfo, UpdaterItf};

/// Suffix of in-progress local downloads, renamed away on success
pub const TMP_SUFFIX: &str = "_tmp";

/// One-session-per-kind guard
///
/// Acquiring returns an RAII token; a second acquisition while the token
/// lives fails with `Busy`.
#[derive(Debug, Default)]
pub(crate) struct SessionSlot {
    active: Arc<AtomicBool>,
}

pub(crate) struct SessionToken {
    active: Arc<AtomicBool>,
}

impl SessionSlot {
    pub fn acquire(&self, kind: &str) -> Result<SessionToken> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(SdkError::Busy(format!("{kind} session already active")));
        }
        Ok(SessionToken {
            active: self.active.clone(),
        })
    }
}

impl Drop for SessionToken {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Map a request completion status onto the error taxonomy
pub(crate) fn status_to_result(status: FtpStatus) -> Result<()> {
    match status {
        FtpStatus::Ok => Ok(()),
        FtpStatus::Failed(code) => Err(SdkError::io_failed(code, "ftp request failed")),
        FtpStatus::Canceled => Err(SdkError::Canceled),
        FtpStatus::Aborted => Err(SdkError::Aborted),
    }
}

/// Remove stale `_tmp` leftovers from an interrupted earlier run
pub(crate) async fn sweep_stale_tmp(dir: &std::path::Path) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return Ok(()), // nothing downloaded there yet
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(TMP_SUFFIX) {
            continue;
        }
        let path = entry.path();
        let meta = entry.metadata().await?;
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        if removed.is_ok() {
            tracing::debug!("swept stale download leftover {:?}", path);
        }
    }
    Ok(())
}
