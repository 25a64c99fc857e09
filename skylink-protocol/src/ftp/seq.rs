//! Per-request command sequences
//!
//! A request is a list of `(command, parameter)` steps executed in order on
//! one control connection, each gated on the command's expected reply code,
//! plus at most one data phase. The engine advances deterministically on
//! each reply; the first mismatch fails the request with the received code.

use super::cmd::{self, FtpCmdDesc, FtpDataDirection};
use super::conn::FtpConn;
use super::RequestCtl;
use crate::{Result, SdkError};
use bytes::{Bytes, BytesMut};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// Disk and socket transfer chunk size
pub const CHUNK_SIZE: usize = 128 * 1024;

/// One step of a request sequence
#[derive(Debug, Clone)]
pub struct FtpStep {
    pub desc: &'static FtpCmdDesc,
    pub param: String,
}

impl FtpStep {
    pub fn new(desc: &'static FtpCmdDesc, param: impl Into<String>) -> Self {
        Self {
            desc,
            param: param.into(),
        }
    }
}

/// Where the data phase reads from or writes to
#[derive(Debug, Clone)]
pub enum DataEndpoint {
    None,
    /// Write received bytes to a file
    ToFile { path: PathBuf, append: bool },
    /// Grow a buffer with received bytes, sized from the SIZE reply
    ToBuffer,
    /// Send a file's bytes starting at `offset`
    FromFile { path: PathBuf, offset: u64 },
    /// Send a buffer's bytes
    FromBuffer(Bytes),
}

/// Results accumulated while running a sequence
#[derive(Debug, Default)]
pub struct SeqOutcome {
    /// Buffer filled by a `ToBuffer` data phase
    pub data: Option<Bytes>,
    /// Size reported by a SIZE step
    pub size: Option<u64>,
}

/// Run a request sequence on a connection
pub async fn run_seq(
    conn: &mut FtpConn,
    steps: &[FtpStep],
    endpoint: DataEndpoint,
    progress: Option<&mpsc::UnboundedSender<f32>>,
    ctl: &RequestCtl,
) -> Result<SeqOutcome> {
    let mut outcome = SeqOutcome::default();
    let mut data_stream: Option<TcpStream> = None;

    for step in steps {
        if ctl.stop_requested() {
            return Err(SdkError::Canceled);
        }

        let resp = conn.send_cmd(step.desc, &step.param).await?;

        match step.desc.verb {
            "EPSV" => {
                let port = cmd::parse_epsv_port(&resp.text)?;
                data_stream = Some(conn.open_data(port).await?);
            }
            "SIZE" => {
                outcome.size = Some(cmd::parse_size(&resp.text)?);
            }
            _ => {}
        }

        match step.desc.data {
            FtpDataDirection::None => {}
            FtpDataDirection::In => {
                let stream = data_stream
                    .take()
                    .ok_or_else(|| SdkError::not_permitted("data step without EPSV"))?;
                let data = read_data_phase(stream, &endpoint, outcome.size, progress, ctl).await?;
                outcome.data = data;
                expect_data_close(conn).await?;
            }
            FtpDataDirection::Out => {
                let stream = data_stream
                    .take()
                    .ok_or_else(|| SdkError::not_permitted("data step without EPSV"))?;
                write_data_phase(stream, &endpoint, progress, ctl).await?;
                expect_data_close(conn).await?;
            }
        }
    }

    Ok(outcome)
}

/// The 226 closing the data phase; whichever of data-end and 226 comes
/// first, the request completes only once both have been seen.
async fn expect_data_close(conn: &mut FtpConn) -> Result<()> {
    let resp = conn.read_response().await?;
    if resp.code != cmd::DATA_CLOSE_CODE {
        return Err(SdkError::io_failed(
            resp.code as i32,
            format!("expected {}, got {}", cmd::DATA_CLOSE_CODE, resp.code),
        ));
    }
    Ok(())
}

async fn read_data_phase(
    mut stream: TcpStream,
    endpoint: &DataEndpoint,
    expected_size: Option<u64>,
    progress: Option<&mpsc::UnboundedSender<f32>>,
    ctl: &RequestCtl,
) -> Result<Option<Bytes>> {
    let mut file = match endpoint {
        DataEndpoint::ToFile { path, append } => {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(*append)
                .write(true)
                .truncate(!*append)
                .open(path)
                .await?;
            Some(file)
        }
        _ => None,
    };
    let mut buffer = match endpoint {
        DataEndpoint::ToBuffer => Some(BytesMut::with_capacity(
            expected_size.unwrap_or(0) as usize
        )),
        _ => None,
    };

    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut received: u64 = 0;
    loop {
        if ctl.stop_requested() {
            return Err(SdkError::Canceled);
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| SdkError::from_io_error(e, "reading ftp data"))?;
        if n == 0 {
            break;
        }
        received += n as u64;
        if let Some(file) = file.as_mut() {
            file.write_all(&chunk[..n]).await?;
        }
        if let Some(buffer) = buffer.as_mut() {
            buffer.extend_from_slice(&chunk[..n]);
        }
        if let (Some(progress), Some(total)) = (progress, expected_size) {
            if total > 0 {
                let _ = progress.send((received as f32 / total as f32) * 100.0);
            }
        }
    }
    if let Some(mut file) = file {
        file.flush().await?;
    }
    debug!("ftp data phase: received {} bytes", received);
    Ok(buffer.map(BytesMut::freeze))
}

async fn write_data_phase(
    mut stream: TcpStream,
    endpoint: &DataEndpoint,
    progress: Option<&mpsc::UnboundedSender<f32>>,
    ctl: &RequestCtl,
) -> Result<()> {
    match endpoint {
        DataEndpoint::FromBuffer(data) => {
            let total = data.len() as u64;
            let mut sent: u64 = 0;
            for chunk in data.chunks(CHUNK_SIZE) {
                if ctl.stop_requested() {
                    return Err(SdkError::Canceled);
                }
                stream
                    .write_all(chunk)
                    .await
                    .map_err(|e| SdkError::from_io_error(e, "writing ftp data"))?;
                sent += chunk.len() as u64;
                if let Some(progress) = progress {
                    if total > 0 {
                        let _ = progress.send((sent as f32 / total as f32) * 100.0);
                    }
                }
            }
        }
        DataEndpoint::FromFile { path, offset } => {
            let mut file = tokio::fs::File::open(path).await?;
            let total = file.metadata().await?.len();
            if *offset > 0 {
                file.seek(std::io::SeekFrom::Start(*offset)).await?;
            }
            let mut sent: u64 = *offset;
            let mut chunk = vec![0u8; CHUNK_SIZE];
            // Each chunk is read from disk only once the previous socket
            // write completed, keeping disk I/O interleaved with the loop.
            loop {
                if ctl.stop_requested() {
                    return Err(SdkError::Canceled);
                }
                let n = file.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                stream
                    .write_all(&chunk[..n])
                    .await
                    .map_err(|e| SdkError::from_io_error(e, "writing ftp data"))?;
                sent += n as u64;
                if let Some(progress) = progress {
                    if total > 0 {
                        let _ = progress.send((sent as f32 / total as f32) * 100.0);
                    }
                }
            }
        }
        _ => {
            return Err(SdkError::not_permitted("write data phase without source"));
        }
    }
    stream
        .shutdown()
        .await
        .map_err(|e| SdkError::from_io_error(e, "closing ftp data"))?;
    Ok(())
}
