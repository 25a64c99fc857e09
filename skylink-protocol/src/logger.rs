//! Command-trace logger
//!
//! A tamper-resistant binary sink for command traffic. Every record carries a
//! tag, a one-byte chunk id and a v3 header `{event, instance_id, type, seq,
//! count, size}` of six little-endian `u32`s, followed by the (anonymised)
//! command bytes. Records are length-prefixed in the sink so a reader can
//! walk the stream without trusting payload contents.
//!
//! ## Anonymisation
//!
//! Payloads are anonymised *before* they reach the sink:
//!
//! - wifi security commands: key replaced by `"********"`
//! - user-storage encryption password commands (v1 and v2): password replaced
//! - generic custom commands whose service/message pair is the security
//!   token registration: not logged at all
//! - generic custom commands when generic decoding is disabled: not logged
//! - any decode failure: the original command is logged and a warning emitted
//!
//! ## Tags
//!
//! The current tag is `arsdk-3`. Earlier builds shipped with the literal tag
//! `arsdk-ARSDK_LOG_VERSION` due to a stringification bug; that tag must be
//! parsed as v3. The v1 textual tags `arsdk-1-<id>-pushed|popped` are still
//! accepted for old traces.

use crate::command::{
    well_known, BufferType, CmdSendStatus, Command, PackRecvStatus, PackSendStatus,
};
use crate::{Result, SdkError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Current log format version
pub const LOG_VERSION: u32 = 3;
/// Tag written on every record
pub const LOG_TAG: &str = "arsdk-3";
/// Buggy legacy tag that must be treated as v3
pub const LOG_TAG_LEGACY: &str = "arsdk-ARSDK_LOG_VERSION";

const V3_HEADER_SIZE: usize = 24;

/// Event codes of the v3 format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogEvent {
    CmdPushed = 1,
    CmdPopped = 2,
    CmdPacked = 3,
    CmdAck = 4,
    CmdAborted = 5,
    PackSent = 6,
    PackAckRecv = 7,
    PackAborted = 8,
    PackRecv = 9,
    PackAckSent = 10,
}

impl LogEvent {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(LogEvent::CmdPushed),
            2 => Some(LogEvent::CmdPopped),
            3 => Some(LogEvent::CmdPacked),
            4 => Some(LogEvent::CmdAck),
            5 => Some(LogEvent::CmdAborted),
            6 => Some(LogEvent::PackSent),
            7 => Some(LogEvent::PackAckRecv),
            8 => Some(LogEvent::PackAborted),
            9 => Some(LogEvent::PackRecv),
            10 => Some(LogEvent::PackAckSent),
            _ => None,
        }
    }
}

/// Direction of a logged command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdDir {
    Tx,
    Rx,
}

/// Parsed fields of one log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEventInfo {
    /// Decoded event code; `None` on continuation chunks
    pub event: Option<LogEvent>,

    /// Controller instance that wrote the record
    pub instance_id: u32,

    /// Raw buffer-type code of the logged command
    pub buffer_type: u32,

    /// Sequence number attached to the record
    pub seq: u32,

    /// Event-dependent counter (1 flags partial packs, timeouts, ignores)
    pub count: u32,

    /// Frame length for pack records, 0 otherwise
    pub size: u32,

    /// 0 for the leading chunk; continuation chunks carry no header
    pub chunk_id: u8,

    /// Anonymised command bytes, or empty for header-only records
    pub payload: Bytes,
}

struct V3Header {
    event: LogEvent,
    instance_id: u32,
    buffer_type: u32,
    seq: u32,
    count: u32,
    size: u32,
}

impl V3Header {
    fn encode(&self) -> [u8; V3_HEADER_SIZE] {
        let mut buf = [0u8; V3_HEADER_SIZE];
        let mut cur = &mut buf[..];
        cur.put_u32_le(self.event as u32);
        cur.put_u32_le(self.instance_id);
        cur.put_u32_le(self.buffer_type);
        cur.put_u32_le(self.seq);
        cur.put_u32_le(self.count);
        cur.put_u32_le(self.size);
        buf
    }
}

/// Binary command-trace sink
///
/// One logger per controller instance is typical; `instance_id`
/// disambiguates multiple controllers sharing one process (and one trace).
pub struct CommandLogger {
    instance_id: u32,
    /// When false every generic custom command is treated as sensitive
    decode_generic: bool,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl CommandLogger {
    /// Open a trace file, truncating any previous content
    pub fn create(path: impl AsRef<Path>, instance_id: u32) -> Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::from_writer(Box::new(file), instance_id))
    }

    pub fn from_writer(writer: Box<dyn Write + Send>, instance_id: u32) -> Self {
        Self {
            instance_id,
            decode_generic: true,
            sink: Mutex::new(writer),
        }
    }

    /// Treat every generic custom command as sensitive
    pub fn without_generic_decoding(mut self) -> Self {
        self.decode_generic = false;
        self
    }

    /// Log one command with its direction
    pub fn log_cmd(&self, dir: CmdDir, cmd: &Command) -> Result<()> {
        let event = match dir {
            CmdDir::Tx => LogEvent::CmdPushed,
            CmdDir::Rx => LogEvent::CmdPopped,
        };
        let header = V3Header {
            event,
            instance_id: self.instance_id,
            buffer_type: cmd.buffer_type as u32,
            seq: 0,
            count: 0,
            size: 0,
        };
        match self.anonymize(cmd) {
            Some(anonymized) => self.write_record(&header, &anonymized.to_bytes()),
            None => Ok(()),
        }
    }

    /// Log a send-status transition of a command
    pub fn log_cmd_send_status(
        &self,
        cmd: &Command,
        buffer_type: BufferType,
        status: CmdSendStatus,
        seq: u16,
    ) -> Result<()> {
        let mut count = 0;
        let event = match status {
            CmdSendStatus::PartiallyPacked => {
                count = 1;
                LogEvent::CmdPacked
            }
            CmdSendStatus::Packed => LogEvent::CmdPacked,
            CmdSendStatus::AckReceived => LogEvent::CmdAck,
            CmdSendStatus::Timeout => {
                count = 1;
                LogEvent::CmdAborted
            }
            CmdSendStatus::Canceled | CmdSendStatus::Aborted => LogEvent::CmdAborted,
            CmdSendStatus::Sent => {
                return Err(SdkError::invalid_argument(
                    "sent is not a loggable command status",
                ))
            }
        };
        let header = V3Header {
            event,
            instance_id: self.instance_id,
            buffer_type: buffer_type as u32,
            seq: seq as u32,
            count,
            size: 0,
        };
        match self.anonymize(cmd) {
            Some(anonymized) => self.write_record(&header, &anonymized.to_bytes()),
            None => Ok(()),
        }
    }

    /// Log a send-status transition of a packed frame (header-only record)
    pub fn log_pack_send_status(
        &self,
        seq: u32,
        buffer_type: BufferType,
        len: usize,
        status: PackSendStatus,
        count: u32,
    ) -> Result<()> {
        let mut count = count;
        let event = match status {
            PackSendStatus::Sent => LogEvent::PackSent,
            PackSendStatus::AckReceived => LogEvent::PackAckRecv,
            PackSendStatus::Timeout => {
                count = 1;
                LogEvent::PackAborted
            }
            PackSendStatus::Canceled => {
                count = 0;
                LogEvent::PackAborted
            }
        };
        let header = V3Header {
            event,
            instance_id: self.instance_id,
            buffer_type: buffer_type as u32,
            seq,
            count,
            size: len as u32,
        };
        self.write_record(&header, &[])
    }

    /// Log a receive-status transition of an incoming frame (header-only)
    pub fn log_pack_recv_status(
        &self,
        seq: u32,
        buffer_type: BufferType,
        len: usize,
        status: PackRecvStatus,
    ) -> Result<()> {
        let mut count = 0;
        let event = match status {
            PackRecvStatus::Ignored => {
                count = 1;
                LogEvent::PackRecv
            }
            PackRecvStatus::Processed => LogEvent::PackRecv,
            PackRecvStatus::AckSent => LogEvent::PackAckSent,
        };
        let header = V3Header {
            event,
            instance_id: self.instance_id,
            buffer_type: buffer_type as u32,
            seq,
            count,
            size: len as u32,
        };
        self.write_record(&header, &[])
    }

    fn write_record(&self, header: &V3Header, payload: &[u8]) -> Result<()> {
        // Record: tag (NUL terminated), u32 body length, body.
        // Body: chunk_id byte, v3 header, payload.
        let tag = LOG_TAG.as_bytes();
        let body_len = 1 + V3_HEADER_SIZE + payload.len();
        let mut buf = BytesMut::with_capacity(tag.len() + 1 + 4 + body_len);
        buf.extend_from_slice(tag);
        buf.put_u8(0);
        buf.put_u32_le(body_len as u32);
        buf.put_u8(0); // chunk_id, single-chunk records only
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(payload);

        let mut sink = self.sink.lock().expect("logger sink poisoned");
        sink.write_all(&buf)?;
        Ok(())
    }

    /// Anonymise a command before logging
    ///
    /// Returns `None` when the command must not be logged at all.
    fn anonymize(&self, cmd: &Command) -> Option<Command> {
        const HIDDEN: &str = "********";
        let id = (cmd.project_id, cmd.class_id, cmd.command_id);

        if id == well_known::DRONE_WIFI_SECURITY
            || id == well_known::DRONE_WIFI_SECURITY_STATE
            || id == well_known::WIFI_SET_SECURITY
            || id == well_known::WIFI_SECURITY_CHANGED
        {
            return match well_known::dec_wifi_security(cmd) {
                Ok(mut args) => {
                    args.key = HIDDEN.to_string();
                    let redacted = match id {
                        _ if id == well_known::DRONE_WIFI_SECURITY => {
                            well_known::enc_drone_wifi_security(&args)
                        }
                        _ if id == well_known::DRONE_WIFI_SECURITY_STATE => {
                            well_known::enc_drone_wifi_security_state(&args)
                        }
                        _ if id == well_known::WIFI_SET_SECURITY => {
                            well_known::enc_wifi_set_security(&args)
                        }
                        _ => well_known::enc_wifi_security_changed(&args),
                    };
                    Some(redacted)
                }
                Err(_) => {
                    warn!("unable to anonymize command {}", cmd);
                    Some(cmd.clone())
                }
            };
        }

        if id == well_known::USER_STORAGE_ENCRYPTION_PASSWORD {
            return match well_known::dec_user_storage_password(cmd) {
                Ok((_, password_type)) => {
                    Some(well_known::enc_user_storage_password(HIDDEN, password_type))
                }
                Err(_) => {
                    warn!("unable to anonymize command {}", cmd);
                    Some(cmd.clone())
                }
            };
        }

        if id == well_known::USER_STORAGE_V2_ENCRYPTION_PASSWORD {
            return match well_known::dec_user_storage_v2_password(cmd) {
                Ok((storage_id, _, password_type)) => Some(
                    well_known::enc_user_storage_v2_password(storage_id, HIDDEN, password_type),
                ),
                Err(_) => {
                    warn!("unable to anonymize command {}", cmd);
                    Some(cmd.clone())
                }
            };
        }

        if id == well_known::GENERIC_CUSTOM_CMD || id == well_known::GENERIC_CUSTOM_CMD_NON_ACK {
            if self.is_generic_command_sensitive(cmd) {
                debug!("command {} not logged", cmd);
                return None;
            }
            return Some(cmd.clone());
        }

        Some(cmd.clone())
    }

    fn is_generic_command_sensitive(&self, cmd: &Command) -> bool {
        if !self.decode_generic {
            return true;
        }
        match well_known::dec_generic_custom(cmd) {
            Ok((service_id, msg_num, _)) => {
                service_id == well_known::SECURITY_SERVICE_ID
                    && msg_num == well_known::SECURITY_MSG_REGISTER_APC_TOKEN
            }
            // Do not log on decode error, in case the command is sensitive.
            Err(_) => true,
        }
    }
}

/// Parse one log record given its tag and body
///
/// Accepts the v3 tag, the buggy legacy v3 tag and v1 textual tags. Unknown
/// tags fail with `invalid-argument` and no side effects.
pub fn parse_event(tag: &str, payload: &[u8]) -> Result<LogEventInfo> {
    if tag == LOG_TAG || tag == LOG_TAG_LEGACY {
        if payload.len() < V3_HEADER_SIZE + 1 {
            return Err(SdkError::invalid_argument("v3 record too short"));
        }
        let chunk_id = payload[0];
        if chunk_id > 0 {
            // Continuation chunks carry no header.
            return Ok(LogEventInfo {
                event: None,
                instance_id: 0,
                buffer_type: 0,
                seq: 0,
                count: 0,
                size: 0,
                chunk_id,
                payload: Bytes::copy_from_slice(&payload[1..]),
            });
        }
        let mut buf = &payload[1..];
        let event_raw = buf.get_u32_le();
        let event = LogEvent::from_u32(event_raw)
            .ok_or_else(|| SdkError::invalid_argument(format!("unknown event {event_raw}")))?;
        let instance_id = buf.get_u32_le();
        let buffer_type = buf.get_u32_le();
        let seq = buf.get_u32_le();
        let count = buf.get_u32_le();
        let size = buf.get_u32_le();
        return Ok(LogEventInfo {
            event: Some(event),
            instance_id,
            buffer_type,
            seq,
            count,
            size,
            chunk_id,
            payload: Bytes::copy_from_slice(buf),
        });
    }

    // v1 fallback: "arsdk-1-<id>-pushed|popped"
    let mut parts = tag.splitn(4, '-');
    let (prefix, version, id, kind) = (
        parts.next().unwrap_or(""),
        parts.next().unwrap_or(""),
        parts.next().unwrap_or(""),
        parts.next().unwrap_or(""),
    );
    if prefix != "arsdk" || version != "1" {
        return Err(SdkError::invalid_argument(format!("unknown log tag {tag}")));
    }
    let instance_id: u32 = id
        .parse()
        .map_err(|_| SdkError::invalid_argument(format!("bad v1 instance id in {tag}")))?;
    let event = match kind {
        "pushed" => LogEvent::CmdPushed,
        "popped" => LogEvent::CmdPopped,
        _ => return Err(SdkError::invalid_argument(format!("bad v1 kind in {tag}"))),
    };
    Ok(LogEventInfo {
        event: Some(event),
        instance_id,
        buffer_type: 0,
        seq: 0,
        count: 0,
        size: 0,
        chunk_id: 0,
        payload: Bytes::copy_from_slice(payload),
    })
}

/// Read records `(tag, body)` back from a trace produced by [`CommandLogger`]
pub fn read_records(mut data: &[u8]) -> Result<Vec<(String, Bytes)>> {
    let mut records = Vec::new();
    while !data.is_empty() {
        let nul = data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| SdkError::invalid_argument("trace truncated in tag"))?;
        let tag = std::str::from_utf8(&data[..nul])
            .map_err(|_| SdkError::invalid_argument("trace tag is not UTF-8"))?
            .to_string();
        data = &data[nul + 1..];
        if data.len() < 4 {
            return Err(SdkError::invalid_argument("trace truncated in length"));
        }
        let mut len_bytes = &data[..4];
        let len = len_bytes.get_u32_le() as usize;
        data = &data[4..];
        if data.len() < len {
            return Err(SdkError::invalid_argument("trace truncated in body"));
        }
        records.push((tag, Bytes::copy_from_slice(&data[..len])));
        data = &data[len..];
    }
    Ok(records)
}
