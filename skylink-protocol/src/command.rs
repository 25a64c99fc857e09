//! Typed command messages
//!
//! A [`Command`] is the unit of traffic on the command interface: a
//! `(project, class, command)` identifier triple followed by the encoded
//! argument buffer. The concrete argument layout of most commands is produced
//! by generated code; this module carries the raw buffer plus the small
//! hand-written codecs for the commands the SDK itself needs to understand
//! (connection smoke tests and log anonymisation).
//!
//! ## Wire layout
//!
//! ```text
//! +--------+--------+-----------------+=============+
//! | prj u8 | cls u8 | cmd u16 (LE)    | args ...    |
//! +--------+--------+-----------------+=============+
//! ```
//!
//! Argument scalars are little-endian; strings are NUL-terminated UTF-8.

use crate::{Result, SdkError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Transmit queue class of a command
///
/// Selected by the command's definition, not by the caller; it decides which
/// transmit queue the command interface uses and therefore the reliability
/// contract the command gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BufferType {
    /// Fire-and-forget, newest overwrites oldest (periodic piloting commands)
    NoAck = 0,
    /// Acknowledged with bounded retries
    WithAck = 1,
    /// Acknowledged, retried until canceled
    HighPrio = 2,
    /// Acknowledged stream data
    StreamAck = 3,
}

impl BufferType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(BufferType::NoAck),
            1 => Some(BufferType::WithAck),
            2 => Some(BufferType::HighPrio),
            3 => Some(BufferType::StreamAck),
            _ => None,
        }
    }

    /// Whether the peer must acknowledge frames of this class
    pub fn needs_ack(&self) -> bool {
        !matches!(self, BufferType::NoAck)
    }
}

/// Terminal and intermediate send statuses reported for a command
///
/// For every command accepted into an ack-bearing queue exactly one of
/// `AckReceived`, `Timeout`, `Canceled` is reported with `done == true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdSendStatus {
    /// Frame handed to the transport
    Sent,
    /// Part of the command was packed into an outgoing frame
    PartiallyPacked,
    /// Whole command packed into an outgoing frame
    Packed,
    /// Peer acknowledged the sequence number
    AckReceived,
    /// Retry budget exhausted
    Timeout,
    /// Dropped by user action (queue overwrite, cancel_all)
    Canceled,
    /// Dropped by interface teardown
    Aborted,
}

impl CmdSendStatus {
    /// Whether this status terminates the command's lifetime
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CmdSendStatus::AckReceived
                | CmdSendStatus::Timeout
                | CmdSendStatus::Canceled
                | CmdSendStatus::Aborted
        )
    }
}

/// Send statuses for a packed frame (a "pack" groups one or more commands)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackSendStatus {
    Sent,
    AckReceived,
    Timeout,
    Canceled,
}

/// Receive statuses for an incoming frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackRecvStatus {
    /// Frame dispatched to the receiver
    Processed,
    /// Duplicate or out-of-order frame, dropped
    Ignored,
    /// Ack frame emitted for a received sequence number
    AckSent,
}

/// A typed command message
///
/// Immutable once enqueued; the command interface attaches sequence numbers
/// at the frame level, never by mutating the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Feature or project the command belongs to
    pub project_id: u8,

    /// Class within the project; 0 for class-less features
    pub class_id: u8,

    /// Command within the class
    pub command_id: u16,

    /// Encoded arguments, excluding the identifier header
    pub args: Bytes,

    /// Transmit queue class the command rides
    pub buffer_type: BufferType,
}

impl Command {
    pub fn new(
        project_id: u8,
        class_id: u8,
        command_id: u16,
        args: Bytes,
        buffer_type: BufferType,
    ) -> Self {
        Self {
            project_id,
            class_id,
            command_id,
            args,
            buffer_type,
        }
    }

    /// Identifier triple packed into a single comparable value
    pub fn full_id(&self) -> u32 {
        ((self.project_id as u32) << 24)
            | ((self.class_id as u32) << 16)
            | self.command_id as u32
    }

    /// Encode header + arguments into a single buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.args.len());
        buf.put_u8(self.project_id);
        buf.put_u8(self.class_id);
        buf.put_u16_le(self.command_id);
        buf.extend_from_slice(&self.args);
        buf.freeze()
    }

    /// Decode a command from an encoded buffer
    ///
    /// The buffer type cannot be recovered from the wire; the caller supplies
    /// it from the queue the frame arrived on.
    pub fn from_bytes(data: &[u8], buffer_type: BufferType) -> Result<Self> {
        if data.len() < 4 {
            return Err(SdkError::invalid_argument(format!(
                "command too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = data;
        let project_id = buf.get_u8();
        let class_id = buf.get_u8();
        let command_id = buf.get_u16_le();
        Ok(Self {
            project_id,
            class_id,
            command_id,
            args: Bytes::copy_from_slice(buf),
            buffer_type,
        })
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.project_id, self.class_id, self.command_id
        )
    }
}

/// Incremental writer for command arguments
#[derive(Debug, Default)]
pub struct ArgWriter {
    buf: BytesMut,
}

impl ArgWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(mut self, v: u8) -> Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_u16(mut self, v: u16) -> Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn put_i32(mut self, v: i32) -> Self {
        self.buf.put_i32_le(v);
        self
    }

    pub fn put_u32(mut self, v: u32) -> Self {
        self.buf.put_u32_le(v);
        self
    }

    /// NUL-terminated UTF-8 string
    pub fn put_str(mut self, v: &str) -> Self {
        self.buf.extend_from_slice(v.as_bytes());
        self.buf.put_u8(0);
        self
    }

    pub fn put_bytes(mut self, v: &[u8]) -> Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Sequential reader for command arguments
#[derive(Debug)]
pub struct ArgReader<'a> {
    buf: &'a [u8],
}

impl<'a> ArgReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.len() < n {
            return Err(SdkError::invalid_argument(format!(
                "argument buffer truncated: need {n} bytes, have {}",
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    /// NUL-terminated UTF-8 string
    pub fn get_str(&mut self) -> Result<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| SdkError::invalid_argument("unterminated string argument"))?;
        let s = std::str::from_utf8(&self.buf[..end])
            .map_err(|_| SdkError::invalid_argument("string argument is not UTF-8"))?
            .to_string();
        self.buf = &self.buf[end + 1..];
        Ok(s)
    }

    /// Remaining bytes of the buffer
    pub fn get_rest(&mut self) -> Bytes {
        let rest = Bytes::copy_from_slice(self.buf);
        self.buf = &self.buf[self.buf.len()..];
        rest
    }
}

/// Well-known commands the SDK needs to encode or decode itself
///
/// Everything else goes through the generated codecs of the product's command
/// set; these are the commands used by the connection smoke test and by the
/// trace logger's anonymisation pass.
pub mod well_known {
    use super::*;

    /// Common settings class: request every setting to be sent back
    pub const ALL_SETTINGS: (u8, u8, u16) = (0, 2, 0);

    /// Drone network settings: set wifi security (outbound)
    pub const DRONE_WIFI_SECURITY: (u8, u8, u16) = (1, 9, 2);
    /// Drone network settings state: wifi security changed (inbound)
    pub const DRONE_WIFI_SECURITY_STATE: (u8, u8, u16) = (1, 10, 2);
    /// Wifi feature: set security
    pub const WIFI_SET_SECURITY: (u8, u8, u16) = (36, 0, 7);
    /// Wifi feature: security changed
    pub const WIFI_SECURITY_CHANGED: (u8, u8, u16) = (36, 0, 8);

    /// User storage: set encryption password
    pub const USER_STORAGE_ENCRYPTION_PASSWORD: (u8, u8, u16) = (33, 0, 10);
    /// User storage v2: set encryption password (adds storage id)
    pub const USER_STORAGE_V2_ENCRYPTION_PASSWORD: (u8, u8, u16) = (60, 0, 10);

    /// Generic feature: custom acknowledged command
    pub const GENERIC_CUSTOM_CMD: (u8, u8, u16) = (133, 0, 1);
    /// Generic feature: custom non-acknowledged command
    pub const GENERIC_CUSTOM_CMD_NON_ACK: (u8, u8, u16) = (133, 0, 2);

    /// Service id of the security message service carried by generic commands
    pub const SECURITY_SERVICE_ID: u16 = 0x0143;
    /// Message number of the APC token registration message
    pub const SECURITY_MSG_REGISTER_APC_TOKEN: u16 = 3;

    /// Wifi security arguments shared by all four security command variants
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct WifiSecurityArgs {
        pub security_type: i32,
        pub key: String,
        pub key_type: i32,
    }

    pub fn enc_all_settings() -> Command {
        let (p, c, i) = ALL_SETTINGS;
        Command::new(p, c, i, Bytes::new(), BufferType::WithAck)
    }

    fn enc_wifi_security_with_id(id: (u8, u8, u16), args: &WifiSecurityArgs) -> Command {
        let (p, c, i) = id;
        Command::new(
            p,
            c,
            i,
            ArgWriter::new()
                .put_i32(args.security_type)
                .put_str(&args.key)
                .put_i32(args.key_type)
                .finish(),
            BufferType::WithAck,
        )
    }

    pub fn enc_drone_wifi_security(args: &WifiSecurityArgs) -> Command {
        enc_wifi_security_with_id(DRONE_WIFI_SECURITY, args)
    }

    pub fn enc_drone_wifi_security_state(args: &WifiSecurityArgs) -> Command {
        enc_wifi_security_with_id(DRONE_WIFI_SECURITY_STATE, args)
    }

    pub fn enc_wifi_set_security(args: &WifiSecurityArgs) -> Command {
        enc_wifi_security_with_id(WIFI_SET_SECURITY, args)
    }

    pub fn enc_wifi_security_changed(args: &WifiSecurityArgs) -> Command {
        enc_wifi_security_with_id(WIFI_SECURITY_CHANGED, args)
    }

    pub fn dec_wifi_security(cmd: &Command) -> Result<WifiSecurityArgs> {
        let mut r = ArgReader::new(&cmd.args);
        Ok(WifiSecurityArgs {
            security_type: r.get_i32()?,
            key: r.get_str()?,
            key_type: r.get_i32()?,
        })
    }

    pub fn enc_user_storage_password(password: &str, password_type: i32) -> Command {
        let (p, c, i) = USER_STORAGE_ENCRYPTION_PASSWORD;
        Command::new(
            p,
            c,
            i,
            ArgWriter::new()
                .put_str(password)
                .put_i32(password_type)
                .finish(),
            BufferType::WithAck,
        )
    }

    pub fn dec_user_storage_password(cmd: &Command) -> Result<(String, i32)> {
        let mut r = ArgReader::new(&cmd.args);
        Ok((r.get_str()?, r.get_i32()?))
    }

    pub fn enc_user_storage_v2_password(
        storage_id: u8,
        password: &str,
        password_type: i32,
    ) -> Command {
        let (p, c, i) = USER_STORAGE_V2_ENCRYPTION_PASSWORD;
        Command::new(
            p,
            c,
            i,
            ArgWriter::new()
                .put_u8(storage_id)
                .put_str(password)
                .put_i32(password_type)
                .finish(),
            BufferType::WithAck,
        )
    }

    pub fn dec_user_storage_v2_password(cmd: &Command) -> Result<(u8, String, i32)> {
        let mut r = ArgReader::new(&cmd.args);
        Ok((r.get_u8()?, r.get_str()?, r.get_i32()?))
    }

    pub fn enc_generic_custom(
        service_id: u16,
        msg_num: u16,
        payload: &[u8],
        ack: bool,
    ) -> Command {
        let ((p, c, i), buffer_type) = if ack {
            (GENERIC_CUSTOM_CMD, BufferType::WithAck)
        } else {
            (GENERIC_CUSTOM_CMD_NON_ACK, BufferType::NoAck)
        };
        Command::new(
            p,
            c,
            i,
            ArgWriter::new()
                .put_u16(service_id)
                .put_u16(msg_num)
                .put_bytes(payload)
                .finish(),
            buffer_type,
        )
    }

    /// Decode `(service_id, msg_num, payload)` of a generic custom command
    pub fn dec_generic_custom(cmd: &Command) -> Result<(u16, u16, Bytes)> {
        let mut r = ArgReader::new(&cmd.args);
        Ok((r.get_u16()?, r.get_u16()?, r.get_rest()))
    }
}

#[cfg(test)]
mod tests {
    use super::well_known::*;
    use super::*;

    #[test]
    fn test_command_roundtrip() {
        let cmd = Command::new(
            1,
            4,
            0x0102,
            Bytes::from_static(b"\x01\x02\x03"),
            BufferType::WithAck,
        );
        let bytes = cmd.to_bytes();
        let back = Command::from_bytes(&bytes, BufferType::WithAck).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_command_too_short() {
        assert!(Command::from_bytes(&[1, 2], BufferType::NoAck).is_err());
    }

    #[test]
    fn test_arg_string_roundtrip() {
        let args = ArgWriter::new()
            .put_i32(-3)
            .put_str("wpa2")
            .put_u16(77)
            .finish();
        let mut r = ArgReader::new(&args);
        assert_eq!(r.get_i32().unwrap(), -3);
        assert_eq!(r.get_str().unwrap(), "wpa2");
        assert_eq!(r.get_u16().unwrap(), 77);
    }

    #[test]
    fn test_unterminated_string() {
        let mut r = ArgReader::new(b"abc");
        assert!(r.get_str().is_err());
    }

    #[test]
    fn test_wifi_security_codec() {
        let args = WifiSecurityArgs {
            security_type: 1,
            key: "p@ss".to_string(),
            key_type: 0,
        };
        let cmd = enc_wifi_set_security(&args);
        assert_eq!(
            (cmd.project_id, cmd.class_id, cmd.command_id),
            WIFI_SET_SECURITY
        );
        assert_eq!(dec_wifi_security(&cmd).unwrap(), args);
    }

    #[test]
    fn test_generic_custom_codec() {
        let cmd = enc_generic_custom(SECURITY_SERVICE_ID, 9, b"payload", true);
        assert_eq!(cmd.buffer_type, BufferType::WithAck);
        let (svc, msg, payload) = dec_generic_custom(&cmd).unwrap();
        assert_eq!(svc, SECURITY_SERVICE_ID);
        assert_eq!(msg, 9);
        assert_eq!(&payload[..], b"payload");

        let cmd = enc_generic_custom(7, 1, b"", false);
        assert_eq!(cmd.buffer_type, BufferType::NoAck);
    }

    #[test]
    fn test_buffer_type_from_u32() {
        assert_eq!(BufferType::from_u32(0), Some(BufferType::NoAck));
        assert_eq!(BufferType::from_u32(2), Some(BufferType::HighPrio));
        assert_eq!(BufferType::from_u32(9), None);
    }
}
