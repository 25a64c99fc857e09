//! FTP control connections
//!
//! One TCP control stream per `(address, port)` key. A connection is logged
//! in once, right after the stream opens, and then reused: the pool hands it
//! to one request at a time.

use super::cmd::{self, FtpCmdDesc, FtpResponse};
use crate::{Result, SdkError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Greeting code sent by the server on connect
const GREETING_CODE: u16 = 220;
/// Intermediate reply asking for a password
const NEED_PASSWORD_CODE: u16 = 331;

/// One logged-in FTP control connection
pub struct FtpConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    addr: String,
    port: u16,
}

impl FtpConn {
    /// Open the control stream and authenticate
    ///
    /// The login sequence is USER then PASS; both must end in 230, with 331
    /// accepted as the intermediate reply to USER.
    pub async fn open(addr: &str, port: u16, user: &str, pass: &str) -> Result<Self> {
        let stream = TcpStream::connect((addr, port))
            .await
            .map_err(|e| SdkError::from_io_error(e, "connecting ftp control"))?;
        let (read_half, write_half) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            addr: addr.to_string(),
            port,
        };

        let greeting = conn.read_response().await?;
        if greeting.code != GREETING_CODE {
            return Err(SdkError::io_failed(
                greeting.code as i32,
                format!("unexpected ftp greeting: {}", greeting.text),
            ));
        }

        let user_resp = conn.send_raw(&cmd::USER, user).await?;
        match user_resp.code {
            NEED_PASSWORD_CODE => {
                let pass_resp = conn.send_raw(&cmd::PASS, pass).await?;
                if pass_resp.code != cmd::PASS.resp_code {
                    return Err(SdkError::io_failed(
                        pass_resp.code as i32,
                        "ftp login refused",
                    ));
                }
            }
            code if code == cmd::USER.resp_code => {
                // Anonymous servers may accept USER outright; PASS is still
                // sent to keep the dialogue uniform.
                let pass_resp = conn.send_raw(&cmd::PASS, pass).await?;
                if pass_resp.code != cmd::PASS.resp_code {
                    return Err(SdkError::io_failed(
                        pass_resp.code as i32,
                        "ftp login refused",
                    ));
                }
            }
            code => {
                return Err(SdkError::io_failed(code as i32, "ftp login refused"));
            }
        }

        info!("ftp: connected to {}:{}", addr, port);
        Ok(conn)
    }

    pub fn key(&self) -> (String, u16) {
        (self.addr.clone(), self.port)
    }

    /// Send a command and read its reply, without code checking
    pub async fn send_raw(&mut self, desc: &FtpCmdDesc, param: &str) -> Result<FtpResponse> {
        let line = cmd::encode(desc, param);
        debug!("ftp {}:{} >> {}", self.addr, self.port, line.trim_end());
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SdkError::from_io_error(e, "sending ftp command"))?;
        self.read_response().await
    }

    /// Send a command and require the descriptor's reply code
    pub async fn send_cmd(&mut self, desc: &FtpCmdDesc, param: &str) -> Result<FtpResponse> {
        let resp = self.send_raw(desc, param).await?;
        if resp.code != desc.resp_code {
            return Err(SdkError::io_failed(
                resp.code as i32,
                format!("{} expected {}, got {}", desc.verb, desc.resp_code, resp.code),
            ));
        }
        Ok(resp)
    }

    /// Read one complete reply, skipping `ddd-` continuation lines
    pub async fn read_response(&mut self) -> Result<FtpResponse> {
        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| SdkError::from_io_error(e, "reading ftp reply"))?;
            if n == 0 {
                return Err(SdkError::io_failed(-1, "ftp control closed"));
            }
            let trimmed = line.trim_end();
            debug!("ftp {}:{} << {}", self.addr, self.port, trimmed);
            if cmd::is_final_line(trimmed) {
                return cmd::parse_response_line(trimmed);
            }
        }
    }

    /// Open the data stream to the port announced by EPSV
    pub async fn open_data(&self, data_port: u16) -> Result<TcpStream> {
        TcpStream::connect((self.addr.as_str(), data_port))
            .await
            .map_err(|e| SdkError::from_io_error(e, "connecting ftp data"))
    }
}
