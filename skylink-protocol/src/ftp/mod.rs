//! FTP engine
//!
//! Drives a classical command-and-response FTP dialogue over TCP with
//! pooled control connections and per-request command sequences. Requests
//! are spawned onto the runtime and hand back a handle carrying a cancel
//! switch, a progress stream and a one-shot completion result.
//!
//! Connections are pooled by `(address, port)` and kept indefinitely while
//! idle; exactly one request uses a given connection at a time. A connection
//! that errors mid-request is dropped instead of returned.

pub mod cmd;
pub mod conn;
pub mod seq;

use crate::{Result, SdkError};
use bytes::Bytes;
use conn::FtpConn;
use seq::{DataEndpoint, FtpStep, SeqOutcome};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

/// Default FTP port of the media server
pub const FTP_PORT_MEDIA: u16 = 21;
/// Default FTP port of the update server
pub const FTP_PORT_UPDATE: u16 = 51;
/// Default FTP port of the flight-plan server
pub const FTP_PORT_FLIGHT_PLAN: u16 = 61;

/// Terminal status of a request, reported exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpStatus {
    /// The whole sequence, data phase included, completed
    Ok,

    /// Unexpected reply or I/O failure; carries the reply code or -1
    Failed(i32),

    /// User cancellation
    Canceled,

    /// Engine teardown
    Aborted,
}

/// Kind of a listed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpEntryKind {
    File,
    Dir,
    Link,
}

/// One entry of a LIST reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpEntry {
    /// File, directory or link name; symlink targets are stripped
    pub name: String,

    /// Size in bytes as listed
    pub size: u64,

    /// Entry kind derived from the mode column
    pub kind: FtpEntryKind,
}

/// Completion value of a request
#[derive(Debug)]
pub struct FtpResult {
    /// Terminal status, delivered exactly once
    pub status: FtpStatus,

    /// Received bytes of a buffer-destination get
    pub data: Option<Bytes>,

    /// Parsed entries of a list
    pub entries: Option<Vec<FtpEntry>>,

    /// Size reported by the server
    pub size: Option<u64>,
}

impl FtpResult {
    fn status_only(status: FtpStatus) -> Self {
        Self {
            status,
            data: None,
            entries: None,
            size: None,
        }
    }
}

/// Cancel/abort switches shared between a request handle and its task
#[derive(Debug, Default)]
pub struct RequestCtl {
    canceled: AtomicBool,
    aborted: AtomicBool,
}

impl RequestCtl {
    pub(crate) fn stop_requested(&self) -> bool {
        self.canceled.load(Ordering::SeqCst) || self.aborted.load(Ordering::SeqCst)
    }

    fn final_cancel_status(&self) -> FtpStatus {
        if self.aborted.load(Ordering::SeqCst) {
            FtpStatus::Aborted
        } else {
            FtpStatus::Canceled
        }
    }
}

/// Handle to one in-flight request
pub struct FtpRequest {
    ctl: Arc<RequestCtl>,
    done: oneshot::Receiver<FtpResult>,
    progress: mpsc::UnboundedReceiver<f32>,
}

impl FtpRequest {
    /// Request cancellation; the completion callback still fires, once
    pub fn cancel(&self) {
        self.ctl.canceled.store(true, Ordering::SeqCst);
    }

    /// Next progress percentage, `None` once the request completed
    pub async fn next_progress(&mut self) -> Option<f32> {
        self.progress.recv().await
    }

    /// Wait for the completion result
    pub async fn wait(self) -> FtpResult {
        self.done
            .await
            .unwrap_or_else(|_| FtpResult::status_only(FtpStatus::Aborted))
    }
}

/// Source of an upload
#[derive(Debug, Clone)]
pub enum PutSource {
    File(PathBuf),
    Buffer(Bytes),
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub user: String,
    pub pass: String,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            user: "anonymous".to_string(),
            pass: String::new(),
        }
    }
}

struct FtpInner {
    config: FtpConfig,
    /// Idle connections; busy ones are checked out entirely
    pool: Mutex<Vec<FtpConn>>,
    active: Mutex<Vec<Arc<RequestCtl>>>,
    stopped: AtomicBool,
}

/// FTP request engine with a pooled connection set
#[derive(Clone)]
pub struct FtpItf {
    inner: Arc<FtpInner>,
}

impl FtpItf {
    pub fn new(config: FtpConfig) -> Self {
        Self {
            inner: Arc::new(FtpInner {
                config,
                pool: Mutex::new(Vec::new()),
                active: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Tear the engine down: every active request reports `Aborted`
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        for ctl in self.inner.active.lock().await.iter() {
            ctl.aborted.store(true, Ordering::SeqCst);
        }
        self.inner.pool.lock().await.clear();
    }

    /// Cancel every active request; each reports `Canceled` exactly once
    pub async fn cancel_all(&self) {
        for ctl in self.inner.active.lock().await.iter() {
            ctl.canceled.store(true, Ordering::SeqCst);
        }
    }

    async fn acquire(&self, addr: &str, port: u16) -> Result<FtpConn> {
        let key = (addr.to_string(), port);
        {
            let mut pool = self.inner.pool.lock().await;
            if let Some(pos) = pool.iter().position(|c| c.key() == key) {
                debug!("ftp pool: reusing connection to {}:{}", addr, port);
                return Ok(pool.swap_remove(pos));
            }
        }
        FtpConn::open(addr, port, &self.inner.config.user, &self.inner.config.pass).await
    }

    async fn release(&self, conn: FtpConn) {
        if !self.inner.stopped.load(Ordering::SeqCst) {
            self.inner.pool.lock().await.push(conn);
        }
    }

    fn spawn<F, Fut>(&self, body: F) -> FtpRequest
    where
        F: FnOnce(FtpItf, Arc<RequestCtl>, mpsc::UnboundedSender<f32>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<FtpResult>> + Send + 'static,
    {
        let ctl = Arc::new(RequestCtl::default());
        let (done_tx, done_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let request = FtpRequest {
            ctl: ctl.clone(),
            done: done_rx,
            progress: progress_rx,
        };

        let itf = self.clone();
        tokio::spawn(async move {
            if itf.inner.stopped.load(Ordering::SeqCst) {
                let _ = done_tx.send(FtpResult::status_only(FtpStatus::Aborted));
                return;
            }
            itf.inner.active.lock().await.push(ctl.clone());

            let result = match body(itf.clone(), ctl.clone(), progress_tx).await {
                Ok(result) => result,
                Err(SdkError::Canceled) => FtpResult::status_only(ctl.final_cancel_status()),
                Err(SdkError::IoFailed { code, msg }) => {
                    warn!("ftp request failed: {} (code {})", msg, code);
                    FtpResult::status_only(FtpStatus::Failed(code))
                }
                Err(e) => {
                    warn!("ftp request failed: {}", e);
                    FtpResult::status_only(FtpStatus::Failed(-1))
                }
            };

            itf.inner
                .active
                .lock()
                .await
                .retain(|c| !Arc::ptr_eq(c, &ctl));
            let _ = done_tx.send(result);
        });
        request
    }

    /// Run one sequence on a pooled connection, returning it only on success
    async fn run_on_conn(
        &self,
        addr: &str,
        port: u16,
        steps: Vec<FtpStep>,
        endpoint: DataEndpoint,
        progress: Option<mpsc::UnboundedSender<f32>>,
        ctl: &RequestCtl,
    ) -> Result<SeqOutcome> {
        let mut conn = self.acquire(addr, port).await?;
        match seq::run_seq(&mut conn, &steps, endpoint, progress.as_ref(), ctl).await {
            Ok(outcome) => {
                self.release(conn).await;
                Ok(outcome)
            }
            // The connection may be mid-dialogue; drop it instead of pooling.
            Err(e) => Err(e),
        }
    }

    /// Download `remote_path`; into `local` when given, else into a buffer
    pub fn get(
        &self,
        addr: &str,
        port: u16,
        remote_path: &str,
        local: Option<PathBuf>,
        resume: bool,
    ) -> FtpRequest {
        let addr = addr.to_string();
        let remote_path = remote_path.to_string();
        self.spawn(move |itf, ctl, progress| async move {
            let offset = match (&local, resume) {
                (Some(path), true) => match tokio::fs::metadata(path).await {
                    Ok(meta) => meta.len(),
                    Err(_) => 0,
                },
                _ => 0,
            };

            let mut steps = vec![
                FtpStep::new(&cmd::EPSV, ""),
                FtpStep::new(&cmd::TYPE, "I"),
                FtpStep::new(&cmd::SIZE, remote_path.clone()),
            ];
            if offset > 0 {
                steps.push(FtpStep::new(&cmd::REST, offset.to_string()));
            }
            steps.push(FtpStep::new(&cmd::RETR, remote_path.clone()));

            let endpoint = match local {
                Some(path) => DataEndpoint::ToFile {
                    path,
                    append: offset > 0,
                },
                None => DataEndpoint::ToBuffer,
            };
            let outcome = itf
                .run_on_conn(&addr, port, steps, endpoint, Some(progress), &ctl)
                .await?;
            Ok(FtpResult {
                status: FtpStatus::Ok,
                data: outcome.data,
                entries: None,
                size: outcome.size,
            })
        })
    }

    /// Upload to `remote_path` from a file or buffer
    pub fn put(
        &self,
        addr: &str,
        port: u16,
        remote_path: &str,
        src: PutSource,
        resume: bool,
    ) -> FtpRequest {
        let addr = addr.to_string();
        let remote_path = remote_path.to_string();
        self.spawn(move |itf, ctl, progress| async move {
            // Resume asks the server how much it already has.
            let offset = if resume {
                let steps = vec![FtpStep::new(&cmd::SIZE, remote_path.clone())];
                match itf
                    .run_on_conn(&addr, port, steps, DataEndpoint::None, None, &ctl)
                    .await
                {
                    Ok(outcome) => outcome.size.unwrap_or(0),
                    Err(SdkError::Canceled) => return Err(SdkError::Canceled),
                    Err(_) => 0,
                }
            } else {
                0
            };

            let mut steps = vec![
                FtpStep::new(&cmd::EPSV, ""),
                FtpStep::new(&cmd::TYPE, "I"),
            ];
            if offset > 0 {
                steps.push(FtpStep::new(&cmd::REST, offset.to_string()));
                steps.push(FtpStep::new(&cmd::APPE, remote_path.clone()));
            } else {
                steps.push(FtpStep::new(&cmd::STOR, remote_path.clone()));
            }

            let endpoint = match src {
                PutSource::File(path) => DataEndpoint::FromFile { path, offset },
                PutSource::Buffer(data) => DataEndpoint::FromBuffer(data),
            };
            itf.run_on_conn(&addr, port, steps, endpoint, Some(progress), &ctl)
                .await?;
            Ok(FtpResult::status_only(FtpStatus::Ok))
        })
    }

    /// List a remote directory
    pub fn list(&self, addr: &str, port: u16, path: &str) -> FtpRequest {
        let addr = addr.to_string();
        let path = path.to_string();
        self.spawn(move |itf, ctl, _progress| async move {
            let steps = vec![
                FtpStep::new(&cmd::EPSV, ""),
                FtpStep::new(&cmd::TYPE, "A"),
                FtpStep::new(&cmd::LIST, path),
            ];
            let outcome = itf
                .run_on_conn(&addr, port, steps, DataEndpoint::ToBuffer, None, &ctl)
                .await?;
            let text = String::from_utf8_lossy(outcome.data.as_deref().unwrap_or_default())
                .into_owned();
            Ok(FtpResult {
                status: FtpStatus::Ok,
                data: None,
                entries: Some(parse_list(&text)),
                size: None,
            })
        })
    }

    /// Rename within a directory
    pub fn rename(&self, addr: &str, port: u16, src: &str, dst: &str) -> FtpRequest {
        let addr = addr.to_string();
        let (dir, src_name) = split_path(src);
        let dst = dst.to_string();
        self.spawn(move |itf, ctl, _progress| async move {
            let steps = vec![
                FtpStep::new(&cmd::CWD, dir),
                FtpStep::new(&cmd::RNFR, src_name),
                FtpStep::new(&cmd::RNTO, dst),
            ];
            itf.run_on_conn(&addr, port, steps, DataEndpoint::None, None, &ctl)
                .await?;
            Ok(FtpResult::status_only(FtpStatus::Ok))
        })
    }

    /// Delete a file, or a directory when the path ends in `/`
    pub fn delete(&self, addr: &str, port: u16, path: &str) -> FtpRequest {
        let addr = addr.to_string();
        let path = path.to_string();
        self.spawn(move |itf, ctl, _progress| async move {
            let step = if let Some(dir) = path.strip_suffix('/') {
                FtpStep::new(&cmd::RMD, dir)
            } else {
                FtpStep::new(&cmd::DELE, path)
            };
            itf.run_on_conn(&addr, port, vec![step], DataEndpoint::None, None, &ctl)
                .await?;
            Ok(FtpResult::status_only(FtpStatus::Ok))
        })
    }

    /// Ask the size of a remote file
    pub fn size(&self, addr: &str, port: u16, path: &str) -> FtpRequest {
        let addr = addr.to_string();
        let path = path.to_string();
        self.spawn(move |itf, ctl, _progress| async move {
            let steps = vec![FtpStep::new(&cmd::SIZE, path)];
            let outcome = itf
                .run_on_conn(&addr, port, steps, DataEndpoint::None, None, &ctl)
                .await?;
            Ok(FtpResult {
                status: FtpStatus::Ok,
                data: None,
                entries: None,
                size: outcome.size,
            })
        })
    }
}

/// Split a path into `(parent_dir, file_name)`
fn split_path(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(pos) => (path[..pos].to_string(), path[pos + 1..].to_string()),
        None => (".".to_string(), path.to_string()),
    }
}

/// Parse a UNIX `ls -l` style listing
///
/// A leading `total` line is skipped; unparsable lines are dropped.
pub fn parse_list(text: &str) -> Vec<FtpEntry> {
    text.lines().filter_map(parse_list_line).collect()
}

fn parse_list_line(line: &str) -> Option<FtpEntry> {
    if line.starts_with("total") {
        return None;
    }
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }
    let kind = match fields[0].chars().next()? {
        '-' => FtpEntryKind::File,
        'd' => FtpEntryKind::Dir,
        'l' => FtpEntryKind::Link,
        _ => return None,
    };
    let size: u64 = fields[4].parse().ok()?;
    // perms links uid gid size month day time, then the name (may hold
    // spaces); symlinks keep only the link name.
    let mut name = fields[8..].join(" ");
    if kind == FtpEntryKind::Link {
        if let Some(pos) = name.find(" -> ") {
            name.truncate(pos);
        }
    }
    Some(FtpEntry { name, size, kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_line_file() {
        let entry = parse_list_line("-rw-r--r-- 1 0 0 12345 Jan 01 00:00 foo.bin").unwrap();
        assert_eq!(
            entry,
            FtpEntry {
                name: "foo.bin".to_string(),
                size: 12345,
                kind: FtpEntryKind::File,
            }
        );
    }

    #[test]
    fn test_parse_list_kinds() {
        let listing = "total 16\n\
                       drwxr-xr-x 2 0 0 4096 Jan 01 00:00 media\n\
                       lrwxrwxrwx 1 0 0 11 Jan 01 00:00 latest -> media/x.jpg\n\
                       -rw-r--r-- 1 0 0 500 Jan 01 00:00 two words.bin\n\
                       garbage line\n";
        let entries = parse_list(listing);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, FtpEntryKind::Dir);
        assert_eq!(entries[0].name, "media");
        assert_eq!(entries[1].kind, FtpEntryKind::Link);
        assert_eq!(entries[1].name, "latest");
        assert_eq!(entries[2].name, "two words.bin");
    }

    #[test]
    fn test_split_path() {
        assert_eq!(
            split_path("/log/a.bin"),
            ("/log".to_string(), "a.bin".to_string())
        );
        assert_eq!(split_path("/a.bin"), ("/".to_string(), "a.bin".to_string()));
        assert_eq!(split_path("a.bin"), (".".to_string(), "a.bin".to_string()));
    }
}
